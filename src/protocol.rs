//! Line protocol spoken with the relay/input controller.
//!
//! Inbound lines are parsed into [`HardwareEvent`]; parsing never fails,
//! anything unrecognised becomes [`HardwareEvent::Unknown`]. Outbound
//! [`Command`]s render to newline-terminated ASCII.

use std::fmt;

/// One line received from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    /// `RELAY:<i>:<0|1>`
    Relay { index: usize, on: bool },
    /// `INPUT:<i>:<0|1>`
    Input { index: usize, level: u8 },
    /// The configured completion token, `DONE` by default.
    Completion,
    /// `INFO:` and `STATE:` chatter.
    Info(String),
    Unknown(String),
}

impl HardwareEvent {
    /// Parses a single line. `done_token` is compared exactly after trimming.
    pub fn parse(line: &str, done_token: &str) -> Self {
        let line = line.trim();
        if line == done_token.trim() {
            return HardwareEvent::Completion;
        }

        let Some((tag, rest)) = line.split_once(':') else {
            return HardwareEvent::Unknown(line.to_string());
        };
        match tag.trim().to_ascii_uppercase().as_str() {
            "RELAY" => match parse_indexed_level(rest) {
                Some((index, level)) => HardwareEvent::Relay {
                    index,
                    on: level == 1,
                },
                None => HardwareEvent::Unknown(line.to_string()),
            },
            "INPUT" => match parse_indexed_level(rest) {
                Some((index, level)) => HardwareEvent::Input { index, level },
                None => HardwareEvent::Unknown(line.to_string()),
            },
            "INFO" | "STATE" => HardwareEvent::Info(rest.trim().to_string()),
            _ => HardwareEvent::Unknown(line.to_string()),
        }
    }
}

// "<index>:<0|1>"
fn parse_indexed_level(rest: &str) -> Option<(usize, u8)> {
    let (index, level) = rest.split_once(':')?;
    let index = index.trim().parse::<usize>().ok()?;
    match level.trim() {
        "0" => Some((index, 0)),
        "1" => Some((index, 1)),
        _ => None,
    }
}

/// Commands sent to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetRelay { index: usize, on: bool },
    Pulse { index: usize, ms: u64 },
    SimulateInput { index: usize, level: u8 },
    GetState,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetRelay { index, on } => write!(f, "RSET {index} {}", u8::from(*on)),
            Command::Pulse { index, ms } => write!(f, "PULSE {index} {ms}"),
            Command::SimulateInput { index, level } => {
                write!(f, "SIMI {index} {}", u8::from(*level != 0))
            }
            Command::GetState => write!(f, "GETSTATE"),
        }
    }
}

impl Command {
    /// Wire form including the trailing newline.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

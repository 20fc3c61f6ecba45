//! Outbound side of the hardware link.

use std::fmt;
use std::io::{self, Write};

use crate::config::RelayConfig;
use crate::protocol::Command;

/// Sink for controller commands. Implementations must not block waiting for
/// a reply.
pub trait Actuator {
    fn send(&mut self, command: &Command) -> io::Result<()>;
}

/// Writes one command per line to any byte sink (a serial port, stdout).
pub struct LineActuator<W: Write> {
    writer: W,
}

impl<W: Write> LineActuator<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Actuator for LineActuator<W> {
    fn send(&mut self, command: &Command) -> io::Result<()> {
        self.writer.write_all(command.to_line().as_bytes())?;
        self.writer.flush()
    }
}

/// Relays the session drives, looked up by their configured names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    AutoFocus,
    Air,
    Start,
    DoorLock,
    StackLight,
}

impl RelayRole {
    pub fn name(self) -> &'static str {
        match self {
            RelayRole::AutoFocus => "Auto Focus",
            RelayRole::Air => "Air",
            RelayRole::Start => "Start",
            RelayRole::DoorLock => "Door Lock",
            RelayRole::StackLight => "Stack Light",
        }
    }
}

impl fmt::Display for RelayRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves relay roles to controller indices and pulse lengths.
#[derive(Debug, Clone)]
pub struct RelayMap {
    config: RelayConfig,
}

impl RelayMap {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    pub fn len(&self) -> usize {
        self.config.names.len()
    }

    /// Index of the relay, or `None` when it is absent or disabled.
    pub fn index_of(&self, role: RelayRole) -> Option<usize> {
        let index = self
            .config
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(role.name()))?;
        let disabled = self.config.disabled.get(index).copied().unwrap_or(false);
        (!disabled).then_some(index)
    }

    pub fn set(&self, role: RelayRole, on: bool) -> Option<Command> {
        self.index_of(role)
            .map(|index| Command::SetRelay { index, on })
    }

    /// Pulse command for the role; relays with no pulse length are skipped.
    pub fn pulse(&self, role: RelayRole) -> Option<Command> {
        let index = self.index_of(role)?;
        let ms = self.config.pulse_ms.get(index).copied().unwrap_or(0);
        (ms > 0).then_some(Command::Pulse { index, ms })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records every command instead of writing it.
    #[derive(Debug, Default)]
    pub struct RecordingActuator {
        pub sent: Vec<Command>,
        pub fail: bool,
    }

    impl Actuator for RecordingActuator {
        fn send(&mut self, command: &Command) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
            }
            self.sent.push(*command);
            Ok(())
        }
    }
}

//! Job-select sensors and the door interlock.
//!
//! The hardware reports raw input levels one line at a time. [`InputMirror`]
//! keeps the latest level of every input and relay, and
//! [`SensorPatternDecoder`] turns the job-select inputs into a debounced
//! pattern string such as `"100"`.

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::SensorConfig;

/// A debounced job-select pattern. All zeros means no job is selected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SensorPattern(String);

impl SensorPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the all-zero pattern.
    pub fn is_no_selection(&self) -> bool {
        self.0.chars().all(|c| c == '0')
    }
}

impl fmt::Display for SensorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Latest known level of every input and relay on the controller.
#[derive(Debug, Clone)]
pub struct InputMirror {
    inputs: Vec<u8>,
    relays: Vec<u8>,
    interlock_input: usize,
    interlock_closed_level: u8,
}

impl InputMirror {
    /// Starts with every job sensor inactive and the door open until the
    /// hardware reports otherwise.
    pub fn new(config: &SensorConfig, relay_count: usize) -> Self {
        let inactive = u8::from(config.active_low);
        let mut inputs = vec![inactive; config.input_count];
        if let Some(level) = inputs.get_mut(config.interlock_input) {
            *level = u8::from(config.interlock_closed_level == 0);
        }
        Self {
            inputs,
            relays: vec![0; relay_count],
            interlock_input: config.interlock_input,
            interlock_closed_level: config.interlock_closed_level,
        }
    }

    /// Records an input level. Returns false for an unknown index.
    pub fn set_input(&mut self, index: usize, level: u8) -> bool {
        match self.inputs.get_mut(index) {
            Some(slot) => {
                *slot = u8::from(level != 0);
                true
            }
            None => false,
        }
    }

    /// Records a relay level. Returns false for an unknown index.
    pub fn set_relay(&mut self, index: usize, on: bool) -> bool {
        match self.relays.get_mut(index) {
            Some(slot) => {
                *slot = u8::from(on);
                true
            }
            None => false,
        }
    }

    pub fn inputs(&self) -> &[u8] {
        &self.inputs
    }

    pub fn relays(&self) -> &[u8] {
        &self.relays
    }

    pub fn interlock_closed(&self) -> bool {
        self.inputs.get(self.interlock_input) == Some(&self.interlock_closed_level)
    }
}

/// Debounces job-select inputs into a stable pattern.
///
/// A pattern is reported only after it has been observed unchanged for the
/// cooldown. Any change restarts the timer, so sensor chatter never reaches
/// the session.
#[derive(Debug, Clone)]
pub struct SensorPatternDecoder {
    bits: Vec<usize>,
    active_low: bool,
    cooldown: Duration,
    last_observed: Option<String>,
    changed_at: Option<Instant>,
}

impl SensorPatternDecoder {
    pub fn new(bits: Vec<usize>, active_low: bool, cooldown: Duration) -> Self {
        Self {
            bits,
            active_low,
            cooldown,
            last_observed: None,
            changed_at: None,
        }
    }

    pub fn from_config(config: &SensorConfig) -> Self {
        Self::new(
            config.job_inputs.clone(),
            config.active_low,
            Duration::from_millis(config.cooldown_ms),
        )
    }

    /// Renders the configured bits of `levels` as a pattern string.
    /// Missing inputs read as inactive.
    pub fn pattern_of(&self, levels: &[u8]) -> String {
        self.bits
            .iter()
            .map(|&bit| {
                let raw = levels.get(bit).copied().unwrap_or(u8::from(self.active_low));
                let active = (raw != 0) != self.active_low;
                if active { '1' } else { '0' }
            })
            .collect()
    }

    /// Feeds one sample. Returns the pattern once it has been stable for the
    /// cooldown, `None` while it is still settling.
    pub fn observe(&mut self, levels: &[u8], now: Instant) -> Option<SensorPattern> {
        let pattern = self.pattern_of(levels);
        if self.last_observed.as_deref() != Some(pattern.as_str()) {
            tracing::trace!(%pattern, "sensor pattern changed, restarting debounce");
            self.last_observed = Some(pattern);
            self.changed_at = Some(now);
            return None;
        }

        let changed_at = self.changed_at?;
        if now.saturating_duration_since(changed_at) >= self.cooldown {
            Some(SensorPattern::new(pattern))
        } else {
            None
        }
    }
}

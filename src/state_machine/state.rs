use std::fmt;

use serde::{Deserialize, Serialize};

/// The five states of an engraving station.
///
/// A run flows through: IDLE → SELECTED → QUEUED → RUNNING → COMPLETING → IDLE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Selected,
    Queued,
    Running,
    Completing,
}

impl SessionState {
    /// True while a committed batch owns the station.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Queued | SessionState::Running | SessionState::Completing
        )
    }

    /// Computes the state that follows `trigger`, or `None` when the trigger
    /// is not valid here.
    ///
    /// - Selection moves between `Idle` and `Selected` only.
    /// - A start is accepted only from `Selected`.
    /// - `Running` loops on partial completions until the batch is done.
    /// - Abort is accepted everywhere and always lands in `Idle`.
    pub fn on(self, trigger: Trigger) -> Option<SessionState> {
        use SessionState::*;
        match (self, trigger) {
            (_, Trigger::Abort) => Some(Idle),
            (Idle | Selected, Trigger::JobMatched) => Some(Selected),
            (Idle | Selected, Trigger::SelectionLost) => Some(Idle),
            (Selected, Trigger::StartAccepted) => Some(Queued),
            (Queued, Trigger::DwellElapsed) => Some(Running),
            (Running, Trigger::ItemDone) => Some(Running),
            (Running, Trigger::BatchDone) => Some(Completing),
            (Completing, Trigger::Settled) => Some(Idle),
            (Idle, Trigger::Restored) => Some(Running),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Selected => write!(f, "SELECTED"),
            SessionState::Queued => write!(f, "QUEUED"),
            SessionState::Running => write!(f, "RUNNING"),
            SessionState::Completing => write!(f, "COMPLETING"),
        }
    }
}

/// What moved the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A stable pattern matched a configured job.
    JobMatched,
    /// The pattern went to all zeros or matched nothing.
    SelectionLost,
    StartAccepted,
    /// The air-on dwell before the start pulse has passed.
    DwellElapsed,
    /// A completion left items in the queue.
    ItemDone,
    /// A completion emptied the queue.
    BatchDone,
    /// Completion side effects are done.
    Settled,
    Abort,
    /// A batch left on disk by a previous process was picked up.
    Restored,
}

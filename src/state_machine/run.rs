use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::SessionState;
use crate::registry::Job;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed,
    Aborted,
}

/// Per-job relay timing, taken from the job at start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunTiming {
    /// Air-on dwell before the start pulse.
    pub air_before: Duration,
    /// Delay after the start pulse before the door lock is pulsed.
    pub job_delay: Duration,
    /// How long air stays on after the batch.
    pub air_after: Duration,
}

impl RunTiming {
    pub fn from_job(job: &Job) -> Self {
        Self {
            air_before: seconds(job.air_before_sec),
            job_delay: seconds(job.job_delay_sec),
            air_after: seconds(job.air_after_sec),
        }
    }
}

// Negative or non-finite settings mean "no delay".
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

/// One committed batch being engraved.
#[derive(Debug, Clone)]
pub struct EngraveRun {
    pub id: Uuid,
    pub job_key: String,
    pub part_number: String,
    pub items: usize,
    pub completed: usize,
    pub timing: RunTiming,
    pub state_history: Vec<SessionState>,
    pub started_at: NaiveDateTime,
    /// When the start pulse is due (end of the air dwell).
    pub start_due: Option<Instant>,
    /// When the door lock pulse is due.
    pub door_release_due: Option<Instant>,
}

impl EngraveRun {
    pub fn new(job_key: &str, part_number: &str, items: usize, timing: RunTiming, started_at: NaiveDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_key: job_key.to_string(),
            part_number: part_number.to_string(),
            items,
            completed: 0,
            timing,
            state_history: Vec::new(),
            started_at,
            start_due: None,
            door_release_due: None,
        }
    }
}

/// Structured audit record produced when a run ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub job_key: String,
    pub part_number: String,
    pub outcome: RunOutcome,
    pub items: usize,
    pub completed: usize,
    pub state_transitions: Vec<SessionState>,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub duration_ms: i64,
}

impl RunRecord {
    pub fn from_run(run: &EngraveRun, outcome: RunOutcome, finished_at: NaiveDateTime) -> Self {
        Self {
            run_id: run.id,
            job_key: run.job_key.clone(),
            part_number: run.part_number.clone(),
            outcome,
            items: run.items,
            completed: run.completed,
            state_transitions: run.state_history.clone(),
            started_at: run.started_at,
            finished_at,
            duration_ms: (finished_at - run.started_at).num_milliseconds(),
        }
    }
}

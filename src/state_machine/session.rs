//! One engraving station driven through an explicit command API.
//!
//! Everything happens on the caller's thread: hardware lines, operator
//! commands and ticks are applied in the order they arrive, and the
//! resulting [`SessionEvent`]s are collected for the front end to drain.

use std::time::Instant;

use uuid::Uuid;

use super::run::{EngraveRun, RunOutcome, RunRecord, RunTiming};
use super::state::{SessionState, Trigger};
use crate::actuator::{Actuator, RelayMap, RelayRole};
use crate::batch::{BatchQueue, IssueContext, Preview, SerializedItem};
use crate::clock::Clock;
use crate::config::{CompletionPolicy, LasermarkConfig};
use crate::error::{LasermarkError, Result, StartRejection};
use crate::ledger::{LedgerEntry, LedgerOptions, LedgerResult, ProductionLedger};
use crate::protocol::{Command, HardwareEvent};
use crate::registry::{Job, JobRegistry};
use crate::sensor::{InputMirror, SensorPattern, SensorPatternDecoder};
use crate::serial::{SerialNumberAllocator, date_code};

/// Something the operator should see.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    JobSelected {
        job_key: String,
        job_name: String,
    },
    SelectionCleared,
    UnmatchedPattern(SensorPattern),
    AutofocusRequested {
        job_key: Option<String>,
        focus_height: f64,
    },
    PreviewUpdated {
        codes: Vec<String>,
    },
    RunStarted {
        run_id: Uuid,
        job_key: String,
        items: usize,
    },
    ItemCompleted {
        full_code: String,
        result: LedgerResult,
        remaining: usize,
    },
    BatchCompleted(RunRecord),
    Aborted {
        discarded: usize,
        record: Option<RunRecord>,
    },
    DateRolledOver {
        from: String,
        to: String,
    },
    /// A side effect failed without stopping the session.
    Fault(String),
}

struct SessionSettings {
    completion: CompletionPolicy,
    simulate: bool,
    done_token: String,
    machine_code: Option<String>,
}

pub struct EngraveSession<A, C> {
    state: SessionState,
    registry: JobRegistry,
    queue: BatchQueue,
    ledger: ProductionLedger,
    decoder: SensorPatternDecoder,
    mirror: InputMirror,
    relays: RelayMap,
    actuator: A,
    clock: C,
    settings: SessionSettings,
    /// Key of the job currently selected by the sensors.
    selected: Option<String>,
    /// Last job an autofocus was requested for.
    last_selected: Option<String>,
    /// Last stable pattern acted on.
    last_pattern: Option<SensorPattern>,
    batch_size: u32,
    preview: Preview,
    run: Option<EngraveRun>,
    air_off_due: Option<Instant>,
    today_code: String,
    events: Vec<SessionEvent>,
}

impl<A: Actuator, C: Clock> EngraveSession<A, C> {
    /// Opens the station's files, applies retention and resumes any batch
    /// left by a previous process.
    pub fn new(config: &LasermarkConfig, actuator: A, clock: C) -> Result<Self> {
        let paths = config.paths();
        let queue = BatchQueue::open(&paths.working_dir, &paths.handoff_dir)?;
        let mut ledger = ProductionLedger::new(LedgerOptions::from_config(config));

        let today = clock.today();
        let today_code = date_code(today);
        ledger.prune(today);
        ledger.filter_rolling_to_today(&today_code)?;

        let relays = RelayMap::new(config.relays.clone());
        let mut session = Self {
            state: SessionState::Idle,
            registry: JobRegistry::new(config.jobs.clone()),
            queue,
            ledger,
            decoder: SensorPatternDecoder::from_config(&config.sensor),
            mirror: InputMirror::new(&config.sensor, relays.len()),
            relays,
            actuator,
            clock,
            settings: SessionSettings {
                completion: config.run.completion,
                simulate: config.run.simulate,
                done_token: config.serial.done_token.clone(),
                machine_code: config.machine.effective_code(),
            },
            selected: None,
            last_selected: None,
            last_pattern: None,
            batch_size: 1,
            preview: Preview::default(),
            run: None,
            air_off_due: None,
            today_code,
            events: Vec::new(),
        };
        if session.queue.is_armed() {
            session.restore_run();
        }
        Ok(session)
    }

    fn restore_run(&mut self) {
        let Some(head) = self.queue.head().cloned() else {
            return;
        };
        let timing = self
            .registry
            .get(&head.job_key)
            .map(RunTiming::from_job)
            .unwrap_or_default();
        if self.registry.get(&head.job_key).is_some() {
            self.selected = Some(head.job_key.clone());
            self.last_selected = Some(head.job_key.clone());
        }
        let run = EngraveRun::new(
            &head.job_key,
            &head.part_number,
            self.queue.len(),
            timing,
            self.clock.now(),
        );
        tracing::info!(
            run_id = %run.id,
            job = %head.job_key,
            pending = run.items,
            "resuming interrupted batch"
        );
        self.run = Some(run);
        self.apply(Trigger::Restored);
    }

    /// Feeds one line from the controller.
    pub fn handle_line(&mut self, line: &str, now: Instant) -> Result<()> {
        match HardwareEvent::parse(line, &self.settings.done_token) {
            HardwareEvent::Relay { index, on } => {
                if !self.mirror.set_relay(index, on) {
                    tracing::debug!(index, "relay report out of range");
                }
            }
            HardwareEvent::Input { index, level } => {
                if !self.mirror.set_input(index, level) {
                    tracing::debug!(index, "input report out of range");
                }
            }
            HardwareEvent::Completion => return self.completion_event(now),
            HardwareEvent::Info(text) => tracing::debug!(%text, "controller info"),
            HardwareEvent::Unknown(text) => tracing::debug!(%text, "ignored controller line"),
        }
        Ok(())
    }

    /// Periodic work: date rollover, run timers, then sensor debounce.
    pub fn tick(&mut self, now: Instant) {
        self.check_date_rollover();
        self.poll_timers(now);
        if let Some(pattern) = self.decoder.observe(self.mirror.inputs(), now) {
            self.select(&pattern);
        }
    }

    /// Applies a stable sensor pattern. Ignored while a batch is active.
    pub fn select(&mut self, pattern: &SensorPattern) {
        if self.state.is_active() || self.last_pattern.as_ref() == Some(pattern) {
            return;
        }
        self.last_pattern = Some(pattern.clone());

        if pattern.is_no_selection() {
            self.clear_selection();
            return;
        }
        let Some(job) = self.registry.find_by_pattern(pattern.as_str()).cloned() else {
            tracing::warn!(%pattern, "sensor pattern matches no configured job");
            self.events.push(SessionEvent::UnmatchedPattern(pattern.clone()));
            self.clear_selection();
            return;
        };

        self.selected = Some(job.key.clone());
        self.batch_size = job.default_batch_size.max(1);
        self.apply(Trigger::JobMatched);
        tracing::info!(job = %job.key, %pattern, "job selected");
        self.events.push(SessionEvent::JobSelected {
            job_key: job.key.clone(),
            job_name: job.name().to_string(),
        });
        if self.last_selected.as_deref() != Some(job.key.as_str()) {
            self.request_autofocus();
        }
        self.last_selected = Some(job.key);
        self.refresh_preview();
    }

    fn clear_selection(&mut self) {
        let had_selection = self.selected.take().is_some();
        self.last_selected = None;
        self.apply(Trigger::SelectionLost);
        if had_selection {
            self.events.push(SessionEvent::SelectionCleared);
            self.refresh_preview();
        }
    }

    /// Recomputes the preview for the selected job and rewrites the hand-off
    /// file. Does nothing while a batch is active.
    pub fn refresh_preview(&mut self) {
        if self.state.is_active() {
            return;
        }
        let preview = match self.build_preview() {
            Ok(preview) => preview.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to build preview");
                self.fault(format!("preview unavailable: {e}"));
                return;
            }
        };
        if let Err(e) = self.queue.write_handoff(&preview.codes) {
            tracing::warn!(error = %e, "failed to write hand-off file");
            self.fault(format!("hand-off file not written: {e}"));
        }
        self.events.push(SessionEvent::PreviewUpdated {
            codes: preview.codes.clone(),
        });
        self.preview = preview;
    }

    fn build_preview(&self) -> Result<Option<Preview>> {
        let Some(job) = self.selected_job() else {
            return Ok(None);
        };
        let allocator = SerialNumberAllocator::new(&self.ledger);
        let issue = IssueContext {
            today: self.clock.today(),
            machine_code: self.settings.machine_code.as_deref(),
        };
        BatchQueue::build_preview(&allocator, job, self.batch_size, issue).map(Some)
    }

    /// Commits the preview as the active batch and starts the air dwell.
    ///
    /// Rejections leave everything untouched, as does a failure to persist
    /// the queue.
    pub fn start_run(&mut self, now: Instant) -> Result<()> {
        if self.state.is_active() {
            return Err(StartRejection::AlreadyRunning.into());
        }
        let Some(job) = self.selected_job().cloned() else {
            return Err(StartRejection::NoJobSelected.into());
        };
        if !self.mirror.interlock_closed() {
            return Err(StartRejection::InterlockOpen.into());
        }
        let preview = self.build_preview()?.unwrap_or_default();
        if preview.is_empty() {
            return Err(StartRejection::EmptyBatch.into());
        }

        self.queue.commit(preview.items.clone())?;
        let started_at = self.clock.now();
        if let Err(e) = self.ledger.append_planned(&preview.items, started_at) {
            tracing::warn!(error = %e, "failed to write planned rows");
            self.fault(format!("planned rows not written: {e}"));
        }
        if let Some(fault) = self.ledger.take_index_fault() {
            self.fault(fault);
        }
        if let Err(e) = self.queue.write_handoff(&preview.codes) {
            tracing::warn!(error = %e, "failed to write hand-off file");
            self.fault(format!("hand-off file not written: {e}"));
        }

        let mut run = EngraveRun::new(
            &job.key,
            &job.part_number,
            preview.items.len(),
            RunTiming::from_job(&job),
            started_at,
        );
        run.start_due = Some(now + run.timing.air_before);
        tracing::info!(run_id = %run.id, job = %job.key, items = run.items, "batch committed");
        self.run = Some(run);
        self.preview = preview;
        self.air_off_due = None;
        self.apply(Trigger::StartAccepted);
        self.set_relay(RelayRole::Air, true);
        self.poll_timers(now);
        Ok(())
    }

    fn poll_timers(&mut self, now: Instant) {
        if self.state == SessionState::Queued
            && let Some(due) = self.run.as_ref().and_then(|run| run.start_due)
            && now >= due
        {
            self.begin_engraving(now);
        }
        if self.state == SessionState::Running
            && let Some(run) = self.run.as_mut()
            && run.door_release_due.is_some_and(|due| now >= due)
        {
            run.door_release_due = None;
            self.pulse_relay(RelayRole::DoorLock);
        }
        if let Some(due) = self.air_off_due
            && now >= due
        {
            self.air_off_due = None;
            self.set_relay(RelayRole::Air, false);
        }
    }

    fn begin_engraving(&mut self, now: Instant) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.start_due = None;
        run.door_release_due = Some(now + run.timing.job_delay);
        let started = SessionEvent::RunStarted {
            run_id: run.id,
            job_key: run.job_key.clone(),
            items: run.items,
        };

        self.pulse_relay(RelayRole::Start);
        self.set_relay(RelayRole::DoorLock, true);
        self.set_relay(RelayRole::StackLight, true);
        self.apply(Trigger::DwellElapsed);
        self.events.push(started);
    }

    /// Hardware reported a finished engraving.
    pub fn completion_event(&mut self, now: Instant) -> Result<()> {
        let result = if self.settings.simulate {
            LedgerResult::Sim
        } else {
            LedgerResult::Ok
        };
        self.complete(result, now)
    }

    /// Operator stand-in for the hardware completion; ledgered as `SIM`.
    pub fn simulate_completion(&mut self, now: Instant) -> Result<()> {
        self.complete(LedgerResult::Sim, now)
    }

    fn complete(&mut self, result: LedgerResult, now: Instant) -> Result<()> {
        if self.state != SessionState::Running {
            tracing::debug!(state = %self.state, "completion ignored, no batch running");
            return Ok(());
        }
        match self.settings.completion {
            CompletionPolicy::WholeBatch => self.complete_all(result, now),
            CompletionPolicy::PerItem => self.complete_one(result, now),
        }
    }

    fn complete_one(&mut self, result: LedgerResult, now: Instant) -> Result<()> {
        let Some(head) = self.queue.head().cloned() else {
            return self.finish_batch(now);
        };
        let snapshot = self.queue.items().to_vec();
        let empty = self.queue.advance()?;
        let entries = self.ledger_or_reinstate(std::slice::from_ref(&head), result, snapshot)?;
        self.record_history(&entries);
        if let Some(run) = self.run.as_mut() {
            run.completed += 1;
        }
        self.events.push(SessionEvent::ItemCompleted {
            full_code: head.full_code,
            result,
            remaining: self.queue.len(),
        });

        if empty {
            return self.finish_batch(now);
        }
        let codes: Vec<String> = self
            .queue
            .items()
            .iter()
            .map(|item| item.full_code.clone())
            .collect();
        if let Err(e) = self.queue.write_handoff(&codes) {
            tracing::warn!(error = %e, "failed to write hand-off file");
            self.fault(format!("hand-off file not written: {e}"));
        }
        self.apply(Trigger::ItemDone);
        Ok(())
    }

    fn complete_all(&mut self, result: LedgerResult, now: Instant) -> Result<()> {
        let items = self.queue.items().to_vec();
        self.queue.clear()?;
        let entries = self.ledger_or_reinstate(&items, result, items.clone())?;
        self.record_history(&entries);
        if let Some(run) = self.run.as_mut() {
            run.completed += items.len();
        }
        let total = items.len();
        for (done, item) in items.into_iter().enumerate() {
            self.events.push(SessionEvent::ItemCompleted {
                full_code: item.full_code,
                result,
                remaining: total - done - 1,
            });
        }
        self.finish_batch(now)
    }

    /// Ledgers `items` after the queue has already let go of them. When the
    /// ledger write fails the queue gets `snapshot` back, so a retry sees the
    /// same items and nothing is recorded twice.
    fn ledger_or_reinstate(
        &mut self,
        items: &[SerializedItem],
        result: LedgerResult,
        snapshot: Vec<SerializedItem>,
    ) -> Result<Vec<LedgerEntry>> {
        match self.ledger.append(items, result, self.clock.now()) {
            Ok(entries) => {
                if let Some(fault) = self.ledger.take_index_fault() {
                    self.fault(fault);
                }
                Ok(entries)
            }
            Err(e) => {
                if let Err(restore) = self.queue.reinstate(snapshot) {
                    tracing::error!(error = %restore, "failed to restore queue file");
                    self.fault(format!("queue file not restored: {restore}"));
                }
                Err(e)
            }
        }
    }

    fn record_history(&mut self, entries: &[LedgerEntry]) {
        if let Err(e) = self.ledger.append_history(entries) {
            tracing::warn!(error = %e, "failed to append to history");
            self.fault(format!("history not written: {e}"));
        }
    }

    fn finish_batch(&mut self, now: Instant) -> Result<()> {
        self.apply(Trigger::BatchDone);
        self.set_relay(RelayRole::DoorLock, false);
        self.set_relay(RelayRole::StackLight, false);
        let air_after = self
            .run
            .as_ref()
            .map(|run| run.timing.air_after)
            .unwrap_or_default();
        if air_after.is_zero() {
            self.set_relay(RelayRole::Air, false);
        } else {
            self.air_off_due = Some(now + air_after);
        }

        if let Some(run) = self.run.take() {
            let record = RunRecord::from_run(&run, RunOutcome::Completed, self.clock.now());
            tracing::info!(
                run_id = %record.run_id,
                completed = record.completed,
                duration_ms = record.duration_ms,
                "batch complete"
            );
            self.events.push(SessionEvent::BatchCompleted(record));
        }
        self.apply(Trigger::Settled);
        // Engraved codes never stay in the hand-off file.
        self.preview = Preview::default();
        if let Err(e) = self.queue.write_handoff(&[]) {
            tracing::warn!(error = %e, "failed to clear hand-off file");
            self.fault(format!("hand-off file not cleared: {e}"));
        }
        self.events.push(SessionEvent::PreviewUpdated { codes: Vec::new() });
        // Start selection over so the next tick re-reads the sensors and
        // previews from the new next serial.
        self.selected = None;
        self.last_pattern = None;
        Ok(())
    }

    /// Cancels whatever is in progress. Queued items are discarded without
    /// being ledgered. A no-op when idle.
    pub fn abort(&mut self) -> Result<()> {
        if self.state == SessionState::Idle && !self.queue.is_armed() {
            tracing::debug!("abort with nothing to cancel");
            return Ok(());
        }
        self.set_relay(RelayRole::Air, false);
        self.set_relay(RelayRole::DoorLock, false);
        self.set_relay(RelayRole::StackLight, false);
        self.air_off_due = None;

        let discarded = self.queue.len();
        self.queue.clear()?;
        let record = self
            .run
            .take()
            .map(|run| RunRecord::from_run(&run, RunOutcome::Aborted, self.clock.now()));
        self.preview = Preview::default();
        self.selected = None;
        self.last_pattern = None;
        self.apply(Trigger::Abort);
        if let Err(e) = self.queue.write_handoff(&[]) {
            tracing::warn!(error = %e, "failed to clear hand-off file");
            self.fault(format!("hand-off file not cleared: {e}"));
        }
        tracing::warn!(discarded, "batch aborted");
        self.events.push(SessionEvent::Aborted { discarded, record });
        Ok(())
    }

    /// Sets the preview size (at least one) for the selected job.
    pub fn set_batch_size(&mut self, count: u32) {
        self.batch_size = count.max(1);
        self.refresh_preview();
    }

    /// Pulses the autofocus relay. Not allowed while a batch is active.
    pub fn autofocus(&mut self) -> Result<()> {
        if self.state.is_active() {
            return Err(LasermarkError::AutofocusBusy);
        }
        self.request_autofocus();
        Ok(())
    }

    fn request_autofocus(&mut self) {
        let (job_key, focus_height) = self
            .selected_job()
            .map(|job| (Some(job.key.clone()), job.focus_height))
            .unwrap_or((None, 0.0));
        self.pulse_relay(RelayRole::AutoFocus);
        self.events.push(SessionEvent::AutofocusRequested {
            job_key,
            focus_height,
        });
    }

    /// Next serial for the selected job today, `None` without a selection.
    pub fn next_serial(&self) -> Result<Option<u32>> {
        let Some(job) = self.selected_job() else {
            return Ok(None);
        };
        self.next_serial_for(&job.part_number).map(Some)
    }

    pub fn next_serial_for(&self, part_number: &str) -> Result<u32> {
        SerialNumberAllocator::new(&self.ledger)
            .next_serial(part_number, &date_code(self.clock.today()))
    }

    /// Asks the controller to report every relay and input.
    pub fn request_state(&mut self) {
        self.drive(Some(Command::GetState));
    }

    /// Forces an input on the controller, for bench testing without sensors.
    pub fn simulate_input(&mut self, index: usize, level: u8) {
        self.drive(Some(Command::SimulateInput { index, level }));
    }

    fn check_date_rollover(&mut self) {
        let today = self.clock.today();
        let code = date_code(today);
        if code == self.today_code {
            return;
        }
        let from = std::mem::replace(&mut self.today_code, code.clone());
        tracing::info!(%from, to = %code, "date code rolled over");
        if let Err(e) = self.ledger.filter_rolling_to_today(&code) {
            tracing::warn!(error = %e, "failed to filter rolling completed file");
            self.fault(format!("rolling file not filtered: {e}"));
        }
        self.ledger.prune(today);
        self.events.push(SessionEvent::DateRolledOver { from, to: code });
        self.refresh_preview();
    }

    fn apply(&mut self, trigger: Trigger) {
        let from = self.state;
        let Some(to) = from.on(trigger) else {
            tracing::debug!(state = %from, ?trigger, "trigger not valid in this state");
            return;
        };
        if from == to {
            return;
        }
        tracing::info!(%from, %to, "session state changed");
        self.state = to;
        if let Some(run) = self.run.as_mut() {
            run.state_history.push(to);
        }
        self.events.push(SessionEvent::StateChanged { from, to });
    }

    fn set_relay(&mut self, role: RelayRole, on: bool) {
        let command = self.relays.set(role, on);
        self.drive(command);
    }

    fn pulse_relay(&mut self, role: RelayRole) {
        let command = self.relays.pulse(role);
        self.drive(command);
    }

    fn drive(&mut self, command: Option<Command>) {
        let Some(command) = command else {
            return;
        };
        if let Err(e) = self.actuator.send(&command) {
            tracing::warn!(%command, error = %e, "failed to send controller command");
            self.fault(format!("controller link: {e}"));
        }
    }

    fn fault(&mut self, message: String) {
        self.events.push(SessionEvent::Fault(message));
    }

    /// Takes every event produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn selected_job(&self) -> Option<&Job> {
        self.selected.as_deref().and_then(|key| self.registry.get(key))
    }

    pub fn preview(&self) -> &Preview {
        &self.preview
    }

    pub fn queue(&self) -> &BatchQueue {
        &self.queue
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &ProductionLedger {
        &self.ledger
    }

    /// Last known controller inputs and relays.
    pub fn mirror(&self) -> &InputMirror {
        &self.mirror
    }

    pub fn interlock_closed(&self) -> bool {
        self.mirror.interlock_closed()
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    #[cfg(test)]
    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    #[cfg(test)]
    pub fn actuator_mut(&mut self) -> &mut A {
        &mut self.actuator
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::actuator::testing::RecordingActuator;
    use crate::clock::testing::FixedClock;

    type TestSession = EngraveSession<RecordingActuator, FixedClock>;

    const AIR: usize = 1;
    const START: usize = 2;
    const DOOR_LOCK: usize = 3;
    const STACK_LIGHT: usize = 4;

    fn config(root: &Path) -> LasermarkConfig {
        let mut idler = Job::new("Job 8", "PN123", "100");
        idler.display_name = "Idler".to_string();
        idler.default_batch_size = 3;
        idler.focus_height = 12.5;
        let mut pulley = Job::new("Job 9", "PN456", "010");
        pulley.default_batch_size = 2;
        LasermarkConfig {
            root: root.to_path_buf(),
            jobs: vec![idler, pulley],
            ..LasermarkConfig::default()
        }
    }

    struct Bench {
        dir: TempDir,
        clock: FixedClock,
        session: TestSession,
        now: Instant,
    }

    impl Bench {
        fn new() -> Self {
            Self::with(|_| {})
        }

        fn with(adjust: impl FnOnce(&mut LasermarkConfig)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = config(dir.path());
            adjust(&mut config);
            let clock = FixedClock::at(2025, 6, 14);
            let session =
                EngraveSession::new(&config, RecordingActuator::default(), clock.clone()).unwrap();
            Self {
                dir,
                clock,
                session,
                now: Instant::now(),
            }
        }

        fn reopen(&self, adjust: impl FnOnce(&mut LasermarkConfig)) -> TestSession {
            let mut config = config(self.dir.path());
            adjust(&mut config);
            EngraveSession::new(&config, RecordingActuator::default(), self.clock.clone()).unwrap()
        }

        fn line(&mut self, line: &str) -> Result<()> {
            self.session.handle_line(line, self.now)
        }

        fn wait(&mut self, ms: u64) {
            self.now += Duration::from_millis(ms);
            self.session.tick(self.now);
        }

        /// Presents a pattern on the active-low job inputs and lets it settle.
        fn show(&mut self, pattern: &str) {
            for (index, bit) in pattern.chars().enumerate() {
                let level = if bit == '1' { 0 } else { 1 };
                self.line(&format!("INPUT:{index}:{level}")).unwrap();
            }
            self.wait(0);
            self.wait(600);
        }

        fn close_door(&mut self) {
            self.line("INPUT:3:0").unwrap();
        }

        fn select_and_start(&mut self) {
            self.show("100");
            self.close_door();
            self.session.start_run(self.now).unwrap();
        }

        fn sent(&self) -> &[Command] {
            &self.session.actuator().sent
        }

        fn ledgered(&self, dc: &str) -> Vec<LedgerEntry> {
            self.session.ledger().completed_entries(dc).unwrap()
        }
    }

    fn codes(serials: &[&str]) -> Vec<String> {
        serials
            .iter()
            .map(|s| format!("PN123-250614-{s}"))
            .collect()
    }

    #[test]
    fn stable_pattern_selects_job_and_previews() {
        let mut bench = Bench::new();
        bench.show("100");

        assert_eq!(bench.session.state(), SessionState::Selected);
        assert_eq!(bench.session.preview().codes, codes(&["0001", "0002", "0003"]));
        assert_eq!(bench.sent(), &[Command::Pulse { index: 0, ms: 250 }]);
        assert_eq!(bench.session.next_serial().unwrap(), Some(1));

        let events = bench.session.drain_events();
        assert!(events.contains(&SessionEvent::JobSelected {
            job_key: "Job 8".to_string(),
            job_name: "Idler".to_string(),
        }));
        assert!(events.contains(&SessionEvent::AutofocusRequested {
            job_key: Some("Job 8".to_string()),
            focus_height: 12.5,
        }));

        let handoff = std::fs::read_to_string(bench.session.queue().handoff_file()).unwrap();
        assert_eq!(
            handoff,
            "CODE\r\nPN123-250614-0001\r\nPN123-250614-0002\r\nPN123-250614-0003\r\n"
        );

        // The same stable pattern does not select again.
        bench.wait(200);
        assert!(bench.session.drain_events().is_empty());
    }

    #[test]
    fn switching_jobs_requests_autofocus_again() {
        let mut bench = Bench::new();
        bench.show("100");
        bench.show("010");
        assert_eq!(bench.session.selected_job().unwrap().key, "Job 9");
        assert_eq!(bench.sent().len(), 2);
        assert_eq!(bench.session.preview().codes.len(), 2);
    }

    #[test]
    fn chatter_inside_cooldown_selects_nothing() {
        let mut bench = Bench::new();
        bench.line("INPUT:0:0").unwrap();
        bench.wait(0);
        bench.line("INPUT:0:1").unwrap();
        bench.wait(100);
        bench.line("INPUT:0:0").unwrap();
        bench.wait(100);
        assert_eq!(bench.session.state(), SessionState::Idle);
        bench.wait(600);
        assert_eq!(bench.session.state(), SessionState::Selected);
    }

    #[test]
    fn zero_and_unmatched_patterns_clear_selection() {
        let mut bench = Bench::new();
        bench.show("100");
        bench.show("000");
        assert_eq!(bench.session.state(), SessionState::Idle);
        assert!(bench.session.preview().is_empty());
        assert!(bench.session.drain_events().contains(&SessionEvent::SelectionCleared));

        bench.show("111");
        assert_eq!(bench.session.state(), SessionState::Idle);
        assert!(
            bench
                .session
                .drain_events()
                .contains(&SessionEvent::UnmatchedPattern(SensorPattern::new("111")))
        );
    }

    #[test]
    fn start_rejections_are_distinct() {
        let mut bench = Bench::new();
        let rejected = |result: Result<()>| match result {
            Err(LasermarkError::StartRejected(reason)) => reason,
            other => panic!("expected rejection, got {other:?}"),
        };

        assert_eq!(
            rejected(bench.session.start_run(bench.now)),
            StartRejection::NoJobSelected
        );
        bench.show("100");
        assert_eq!(
            rejected(bench.session.start_run(bench.now)),
            StartRejection::InterlockOpen
        );
        assert_eq!(bench.session.state(), SessionState::Selected);
        assert!(!bench.session.queue().is_armed());

        bench.close_door();
        bench.session.start_run(bench.now).unwrap();
        assert_eq!(
            rejected(bench.session.start_run(bench.now)),
            StartRejection::AlreadyRunning
        );
    }

    #[test]
    fn whole_batch_completion_ledgers_everything() {
        let mut bench = Bench::new();
        bench.select_and_start();
        assert_eq!(bench.session.state(), SessionState::Running);
        assert_eq!(bench.session.queue().len(), 3);
        assert_eq!(
            bench.sent()[1..],
            [
                Command::SetRelay { index: AIR, on: true },
                Command::Pulse { index: START, ms: 250 },
                Command::SetRelay { index: DOOR_LOCK, on: true },
                Command::SetRelay { index: STACK_LIGHT, on: true },
                Command::Pulse { index: DOOR_LOCK, ms: 250 },
            ]
        );

        bench.line("DONE").unwrap();
        assert_eq!(bench.session.state(), SessionState::Idle);
        assert!(bench.session.queue().is_empty());
        assert!(bench.session.queue().read_persisted().unwrap().is_empty());

        let ledgered = bench.ledgered("250614");
        assert_eq!(ledgered.len(), 3);
        assert!(ledgered.iter().all(|e| e.result == LedgerResult::Ok));
        assert_eq!(bench.session.next_serial_for("PN123").unwrap(), 4);

        let events = bench.session.drain_events();
        let record = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::BatchCompleted(record) => Some(record.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(record.completed, 3);
        assert_eq!(
            record.state_transitions,
            vec![SessionState::Queued, SessionState::Running, SessionState::Completing]
        );

        // Relays are released and the next tick previews from 0004 without
        // another autofocus.
        let sent = bench.sent();
        assert!(sent.contains(&Command::SetRelay { index: AIR, on: false }));
        assert!(sent.contains(&Command::SetRelay { index: STACK_LIGHT, on: false }));
        bench.wait(200);
        assert_eq!(bench.session.state(), SessionState::Selected);
        assert_eq!(bench.session.preview().codes, codes(&["0004", "0005", "0006"]));
        let autofocus_pulses = bench
            .sent()
            .iter()
            .filter(|c| **c == Command::Pulse { index: 0, ms: 250 })
            .count();
        assert_eq!(autofocus_pulses, 1);
    }

    #[test]
    fn per_item_completion_keeps_commit_order() {
        let mut bench = Bench::with(|c| c.run.completion = CompletionPolicy::PerItem);
        bench.select_and_start();
        let committed = bench.session.queue().items().to_vec();

        bench.line("DONE").unwrap();
        assert_eq!(bench.session.state(), SessionState::Running);
        assert_eq!(bench.session.queue().len(), 2);
        let handoff = std::fs::read_to_string(bench.session.queue().handoff_file()).unwrap();
        assert_eq!(handoff.lines().count(), 3);

        bench.line("DONE").unwrap();
        bench.line("DONE").unwrap();
        assert_eq!(bench.session.state(), SessionState::Idle);

        let ledgered: Vec<String> = bench.ledgered("250614").into_iter().map(|e| e.full_code).collect();
        let expected: Vec<String> = committed.into_iter().map(|i| i.full_code).collect();
        assert_eq!(ledgered, expected);

        // Further completions are ignored.
        bench.line("DONE").unwrap();
        assert_eq!(bench.ledgered("250614").len(), 3);
    }

    #[test]
    fn simulated_completion_is_marked_sim() {
        let mut bench = Bench::new();
        bench.select_and_start();
        bench.session.simulate_completion(bench.now).unwrap();
        assert!(
            bench
                .ledgered("250614")
                .iter()
                .all(|e| e.result == LedgerResult::Sim)
        );
    }

    #[test]
    fn abort_discards_queue_without_ledgering() {
        let mut bench = Bench::new();
        assert!(bench.session.abort().is_ok());
        assert!(bench.session.drain_events().is_empty());

        bench.select_and_start();
        bench.session.drain_events();
        bench.session.abort().unwrap();

        assert_eq!(bench.session.state(), SessionState::Idle);
        assert!(bench.session.queue().is_empty());
        assert!(bench.ledgered("250614").is_empty());
        assert_eq!(bench.session.next_serial_for("PN123").unwrap(), 1);
        let events = bench.session.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Aborted { discarded: 3, record: Some(r) } if r.outcome == RunOutcome::Aborted
        )));
        let sent = bench.sent();
        assert!(sent.contains(&Command::SetRelay { index: DOOR_LOCK, on: false }));
    }

    #[test]
    fn air_dwell_and_door_delay_follow_the_job() {
        let mut bench = Bench::with(|c| {
            c.jobs[0].air_before_sec = 2.0;
            c.jobs[0].job_delay_sec = 1.0;
            c.jobs[0].air_after_sec = 5.0;
        });
        bench.select_and_start();
        assert_eq!(bench.session.state(), SessionState::Queued);
        assert_eq!(bench.sent().last(), Some(&Command::SetRelay { index: AIR, on: true }));

        bench.wait(1000);
        assert_eq!(bench.session.state(), SessionState::Queued);
        // Completions before the start pulse are not accepted.
        bench.line("DONE").unwrap();
        assert!(bench.ledgered("250614").is_empty());

        bench.wait(1000);
        assert_eq!(bench.session.state(), SessionState::Running);
        assert!(bench.sent().contains(&Command::Pulse { index: START, ms: 250 }));
        assert!(!bench.sent().contains(&Command::Pulse { index: DOOR_LOCK, ms: 250 }));

        bench.wait(1000);
        assert!(bench.sent().contains(&Command::Pulse { index: DOOR_LOCK, ms: 250 }));

        bench.line("DONE").unwrap();
        let air_off = Command::SetRelay { index: AIR, on: false };
        assert!(!bench.sent().contains(&air_off));
        bench.wait(5000);
        assert!(bench.sent().contains(&air_off));
    }

    #[test]
    fn opening_door_mid_run_does_not_abort() {
        let mut bench = Bench::new();
        bench.select_and_start();
        bench.line("INPUT:3:1").unwrap();
        assert!(!bench.session.interlock_closed());
        bench.wait(200);
        assert_eq!(bench.session.state(), SessionState::Running);
        bench.line("DONE").unwrap();
        assert_eq!(bench.ledgered("250614").len(), 3);
    }

    #[test]
    fn selection_is_frozen_during_a_run() {
        let mut bench = Bench::new();
        bench.select_and_start();
        bench.show("010");
        assert_eq!(bench.session.selected_job().unwrap().key, "Job 8");
        assert_eq!(bench.session.state(), SessionState::Running);
        assert!(matches!(
            bench.session.autofocus(),
            Err(LasermarkError::AutofocusBusy)
        ));
    }

    #[test]
    fn completion_outside_a_run_is_ignored() {
        let mut bench = Bench::new();
        bench.show("100");
        bench.line("DONE").unwrap();
        assert_eq!(bench.session.state(), SessionState::Selected);
        assert!(bench.ledgered("250614").is_empty());
    }

    #[test]
    fn failed_ledger_write_leaves_run_intact() {
        let mut bench = Bench::new();
        bench.select_and_start();
        // A directory where the rolling file should be makes the append fail.
        std::fs::create_dir_all(bench.session.ledger().rolling_file()).unwrap();

        assert!(bench.line("DONE").is_err());
        assert_eq!(bench.session.state(), SessionState::Running);
        assert_eq!(bench.session.queue().len(), 3);
        assert_eq!(bench.session.queue().read_persisted().unwrap().len(), 3);
    }

    #[test]
    fn failed_per_item_ledger_write_puts_the_item_back() {
        let mut bench = Bench::with(|c| c.run.completion = CompletionPolicy::PerItem);
        bench.select_and_start();
        std::fs::create_dir_all(bench.session.ledger().rolling_file()).unwrap();

        assert!(bench.line("DONE").is_err());
        assert_eq!(bench.session.state(), SessionState::Running);
        assert_eq!(bench.session.queue().len(), 3);
        assert_eq!(bench.session.queue().read_persisted().unwrap().len(), 3);
    }

    #[test]
    fn failed_queue_write_ledgers_nothing() {
        let mut bench = Bench::new();
        bench.select_and_start();
        let blocker = bench.dir.path().join("Working/CurrentBatch.csv.tmp");
        std::fs::create_dir_all(&blocker).unwrap();

        assert!(bench.line("DONE").is_err());
        assert_eq!(bench.session.state(), SessionState::Running);
        assert_eq!(bench.session.queue().len(), 3);
        assert!(bench.ledgered("250614").is_empty());

        std::fs::remove_dir(&blocker).unwrap();
        bench.line("DONE").unwrap();
        let serials: Vec<String> = bench.ledgered("250614").into_iter().map(|e| e.serial4).collect();
        assert_eq!(serials, vec!["0001", "0002", "0003"]);
        assert_eq!(bench.session.state(), SessionState::Idle);
    }

    #[test]
    fn handoff_is_emptied_after_a_batch_even_without_a_selection() {
        let mut bench = Bench::new();
        bench.select_and_start();
        bench.show("000");
        bench.line("DONE").unwrap();
        bench.wait(0);
        bench.wait(600);

        assert_eq!(bench.session.state(), SessionState::Idle);
        assert!(bench.session.preview().is_empty());
        let handoff = std::fs::read_to_string(bench.session.queue().handoff_file()).unwrap();
        assert_eq!(handoff, "CODE\r\n");
    }

    #[test]
    fn interrupted_batch_resumes_on_restart() {
        let mut bench = Bench::new();
        bench.select_and_start();
        let committed = bench.session.queue().items().to_vec();

        let mut resumed = bench.reopen(|_| {});
        assert_eq!(resumed.state(), SessionState::Running);
        assert_eq!(resumed.queue().items(), committed.as_slice());
        assert_eq!(resumed.selected_job().unwrap().key, "Job 8");

        resumed.handle_line("DONE", bench.now).unwrap();
        assert_eq!(resumed.state(), SessionState::Idle);
        assert_eq!(resumed.ledger().completed_entries("250614").unwrap().len(), 3);
    }

    #[test]
    fn date_rollover_filters_and_repreviews() {
        let mut bench = Bench::new();
        bench.select_and_start();
        bench.line("DONE").unwrap();
        bench.wait(200);
        bench.session.drain_events();

        bench.clock.advance(chrono::Duration::days(1));
        bench.wait(200);

        let events = bench.session.drain_events();
        assert!(events.contains(&SessionEvent::DateRolledOver {
            from: "250614".to_string(),
            to: "250615".to_string(),
        }));
        assert!(bench.ledgered("250614").is_empty());
        assert_eq!(bench.session.preview().codes[0], "PN123-250615-0001");
    }

    #[test]
    fn actuator_failures_are_faults_not_errors() {
        let mut bench = Bench::new();
        bench.show("100");
        bench.close_door();
        bench.session.actuator_mut().fail = true;
        bench.session.start_run(bench.now).unwrap();
        assert_eq!(bench.session.state(), SessionState::Running);
        assert!(
            bench
                .session
                .drain_events()
                .iter()
                .any(|e| matches!(e, SessionEvent::Fault(_)))
        );
    }

    #[test]
    fn operator_commands() {
        let mut bench = Bench::new();
        bench.show("100");
        bench.session.set_batch_size(5);
        assert_eq!(bench.session.preview().codes.len(), 5);
        bench.session.set_batch_size(0);
        assert_eq!(bench.session.batch_size(), 1);
        assert_eq!(bench.session.preview().codes.len(), 1);

        bench.session.autofocus().unwrap();
        bench.session.request_state();
        bench.session.simulate_input(2, 1);
        let sent = bench.sent();
        assert_eq!(
            sent[sent.len() - 3..],
            [
                Command::Pulse { index: 0, ms: 250 },
                Command::GetState,
                Command::SimulateInput { index: 2, level: 1 },
            ]
        );

        // Out-of-range and garbage lines are tolerated.
        bench.line("INPUT:9:1").unwrap();
        bench.line("RELAY:x:1").unwrap();
        bench.line("").unwrap();
        assert_eq!(bench.session.state(), SessionState::Selected);
    }

    #[test]
    fn planned_rows_written_when_archiving() {
        let mut bench = Bench::with(|c| c.ledger.retain_mode = crate::config::RetainMode::TodayOnly);
        bench.select_and_start();
        let planned = bench.dir.path().join("Logs/2025/250614/Planned.csv");
        let raw = std::fs::read_to_string(planned).unwrap();
        assert_eq!(raw.lines().count(), 4);
    }
}

mod actuator;
mod batch;
mod cli;
mod clock;
mod config;
mod error;
mod ledger;
mod logging;
mod protocol;
mod registry;
mod sensor;
mod serial;
mod state_machine;
mod ui;

use std::io;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{self, MissedTickBehavior};

use actuator::{Actuator, LineActuator};
use batch::{BatchQueue, IssueContext};
use cli::{Cli, Command, OPERATOR_HELP, OperatorCommand};
use clock::{Clock, LocalClock};
use config::LasermarkConfig;
use error::LasermarkError;
use ledger::{LedgerOptions, ProductionLedger};
use registry::JobRegistry;
use serial::{SerialNumberAllocator, date_code, date_from_code, serial4};
use state_machine::EngraveSession;
use ui::SessionView;

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);
    let config = LasermarkConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run => run_station(&config),
        Command::Preview { job, count } => preview(&config, &job, count),
        Command::NextSerial { part, date_code } => next_serial(&config, &part, date_code),
        Command::Prune => prune(&config),
        Command::Status => status(&config),
        Command::CheckConfig => {
            let registry = JobRegistry::new(config.jobs.clone());
            println!(
                "{} jobs, retention {}, data in {}",
                registry.len(),
                config.ledger.retention(),
                config.root.display()
            );
            Ok(())
        }
    }
}

fn run_station(config: &LasermarkConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    let result = runtime.block_on(station_loop(config));
    // The stdin reader may still be parked on a blocking read.
    runtime.shutdown_background();
    result
}

/// Drives one station until the controller link closes or Ctrl-C.
///
/// Controller lines arrive on stdin and are applied on each poll tick;
/// the sensor tick runs the decoder and the run timers. Commands for the
/// controller are written to stdout.
async fn station_loop(config: &LasermarkConfig) -> Result<()> {
    let mut session = EngraveSession::new(config, LineActuator::new(io::stdout()), LocalClock)?;
    let mut view = SessionView::new();
    session.request_state();
    session.refresh_preview();
    drain(&mut session, &mut view);
    tracing::info!(root = %config.root.display(), "station ready");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut poll = time::interval(Duration::from_millis(config.serial.poll_ms.max(1)));
    let mut sensor_tick = time::interval(Duration::from_millis(config.sensor.tick_ms.max(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    sensor_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = poll.tick() => loop {
                match rx.try_recv() {
                    Ok(line) => handle_input(&mut session, &view, &line),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        drain(&mut session, &mut view);
                        tracing::info!("controller link closed");
                        return Ok(());
                    }
                }
            },
            _ = sensor_tick.tick() => session.tick(Instant::now()),
            _ = &mut ctrl_c => {
                tracing::info!("interrupted");
                break;
            }
        }
        drain(&mut session, &mut view);
    }
    Ok(())
}

fn drain<A: Actuator, C: Clock>(session: &mut EngraveSession<A, C>, view: &mut SessionView) {
    for event in session.drain_events() {
        view.render(&event);
    }
}

fn handle_input<A: Actuator, C: Clock>(session: &mut EngraveSession<A, C>, view: &SessionView, line: &str) {
    let now = Instant::now();
    let outcome = match OperatorCommand::parse(line) {
        None => session.handle_line(line, now),
        Some(Err(message)) => {
            view.error(&message);
            return;
        }
        Some(Ok(command)) => operator_command(session, view, command, now),
    };
    if let Err(e) = outcome {
        tracing::warn!(error = %e, "command failed");
        view.error(&e.to_string());
    }
}

fn operator_command<A: Actuator, C: Clock>(
    session: &mut EngraveSession<A, C>,
    view: &SessionView,
    command: OperatorCommand,
    now: Instant,
) -> error::Result<()> {
    match command {
        OperatorCommand::Start => session.start_run(now),
        OperatorCommand::Abort => session.abort(),
        OperatorCommand::Done => session.simulate_completion(now),
        OperatorCommand::Batch(count) => {
            session.set_batch_size(count);
            Ok(())
        }
        OperatorCommand::Autofocus => session.autofocus(),
        OperatorCommand::NextSerial => {
            match session.next_serial()? {
                Some(next) => view.info(&format!(
                    "Next serial: {} (batch of {})",
                    serial4(next),
                    session.batch_size()
                )),
                None => view.info("No job selected"),
            }
            Ok(())
        }
        OperatorCommand::SimulateInput { index, level } => {
            session.simulate_input(index, level);
            Ok(())
        }
        OperatorCommand::Io => {
            let job = session
                .selected_job()
                .map_or_else(|| "-".to_string(), |job| job.key.clone());
            let queue = session.queue();
            let queued = if queue.is_empty() {
                "nothing queued".to_string()
            } else {
                format!("{} queued", queue.len())
            };
            view.info(&format!(
                "{} job {job}, {queued}, preview {} of batch {}",
                session.state(),
                session.preview().codes.len(),
                session.batch_size()
            ));
            let mirror = session.mirror();
            view.info(&format!(
                "inputs {:?}  relays {:?}  door {}",
                mirror.inputs(),
                mirror.relays(),
                if session.interlock_closed() { "closed" } else { "open" }
            ));
            Ok(())
        }
        OperatorCommand::Help => {
            view.info(OPERATOR_HELP);
            Ok(())
        }
    }
}

fn preview(config: &LasermarkConfig, job_key: &str, count: Option<u32>) -> Result<()> {
    let registry = JobRegistry::new(config.jobs.clone());
    let job = registry
        .get(job_key)
        .ok_or_else(|| LasermarkError::JobNotFound(job_key.to_string()))?;
    let ledger = ProductionLedger::new(LedgerOptions::from_config(config));
    let allocator = SerialNumberAllocator::new(&ledger);
    let machine_code = config.machine.effective_code();
    let issue = IssueContext {
        today: LocalClock.today(),
        machine_code: machine_code.as_deref(),
    };
    let preview = BatchQueue::build_preview(
        &allocator,
        job,
        count.unwrap_or(job.default_batch_size),
        issue,
    )?;
    ui::print_preview(job.name(), &preview);
    Ok(())
}

fn next_serial(config: &LasermarkConfig, part: &str, code: Option<String>) -> Result<()> {
    let code = code.unwrap_or_else(|| date_code(LocalClock.today()));
    if date_from_code(&code).is_none() {
        bail!("invalid date code `{code}`, expected yymmdd");
    }
    let ledger = ProductionLedger::new(LedgerOptions::from_config(config));
    let next = SerialNumberAllocator::new(&ledger).next_serial(part, &code)?;
    println!("{}", serial4(next));
    Ok(())
}

fn prune(config: &LasermarkConfig) -> Result<()> {
    let mut ledger = ProductionLedger::new(LedgerOptions::from_config(config));
    let today = LocalClock.today();
    let report = ledger.prune(today);
    let filtered = ledger.filter_rolling_to_today(&date_code(today))?;
    for dir in &report.removed {
        println!("removed {}", dir.display());
    }
    println!(
        "{} directories removed, {filtered} stale rolling rows dropped ({})",
        report.removed.len(),
        ledger.policy()
    );
    Ok(())
}

fn status(config: &LasermarkConfig) -> Result<()> {
    let paths = config.paths();
    let queue = BatchQueue::open(&paths.working_dir, &paths.handoff_dir)?;
    let ledger = ProductionLedger::new(LedgerOptions::from_config(config));
    let today = date_code(LocalClock.today());

    match queue.head() {
        Some(head) => println!(
            "pending batch: {} parts of {} starting at {}",
            queue.len(),
            head.job_key,
            head.full_code
        ),
        None => println!("no pending batch"),
    }
    let completed = ledger.completed_entries(&today)?;
    println!(
        "completed today ({today}): {} parts, retention {}",
        completed.len(),
        ledger.policy()
    );

    let registry = JobRegistry::new(config.jobs.clone());
    let allocator = SerialNumberAllocator::new(&ledger);
    for job in registry.jobs() {
        let next = allocator.next_serial(&job.part_number, &today)?;
        println!(
            "  {:<12} {:<12} pattern {}  next {}",
            job.key,
            job.part_number,
            job.select_pattern,
            serial4(next)
        );
    }
    Ok(())
}

//! Interface de terminal do LASERMARK: spinner e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de execução e `console` para
//! estilização com cores. O [`SessionView`] mostra os eventos da sessão de
//! gravação em stderr, deixando stdout livre para os comandos do controlador.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::batch::Preview;
use crate::ledger::LedgerResult;
use crate::state_machine::{RunOutcome, RunRecord, SessionEvent, SessionState};

/// Visualização dos eventos de uma sessão de gravação no terminal.
///
/// Exibe um spinner animado enquanto um lote está ativo e mensagens
/// coloridas para seleção (verde), avisos (amarelo) e falhas (vermelho).
pub struct SessionView {
    // Spinner presente apenas enquanto um lote está em execução.
    spinner: Option<ProgressBar>,
    green: Style,
    red: Style,
    yellow: Style,
    cyan: Style,
    dim: Style,
}

impl Default for SessionView {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionView {
    pub fn new() -> Self {
        Self {
            spinner: None,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            cyan: Style::new().cyan(),
            dim: Style::new().dim(),
        }
    }

    /// Mostra um evento da sessão.
    pub fn render(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged { from, to } => {
                self.println(format!("{}", self.dim.apply_to(format!("{from} → {to}"))));
                match to {
                    SessionState::Queued | SessionState::Running => self.start_spinner(*to),
                    SessionState::Idle | SessionState::Selected => self.stop_spinner(),
                    SessionState::Completing => {}
                }
            }
            SessionEvent::JobSelected { job_key, job_name } => {
                self.println(format!(
                    "  {} Job selected: {job_name} ({job_key})",
                    self.green.apply_to("●")
                ));
            }
            SessionEvent::SelectionCleared => {
                self.println(format!("  {}", self.dim.apply_to("No job selected")));
            }
            SessionEvent::UnmatchedPattern(pattern) => {
                self.println(format!(
                    "  {} Sensor pattern {pattern} matches no job",
                    self.yellow.apply_to("!")
                ));
            }
            SessionEvent::AutofocusRequested { focus_height, .. } => {
                self.println(format!(
                    "  {} Autofocus requested, check height is {focus_height}",
                    self.cyan.apply_to("◎")
                ));
            }
            SessionEvent::PreviewUpdated { codes } => match (codes.first(), codes.last()) {
                (Some(first), Some(last)) => self.println(format!(
                    "  Next batch: {} … {} ({} parts)",
                    self.cyan.apply_to(first),
                    self.cyan.apply_to(last),
                    codes.len()
                )),
                _ => self.println(format!("  {}", self.dim.apply_to("No preview"))),
            },
            SessionEvent::RunStarted { run_id, job_key, items } => {
                self.set_spinner_message(format!("RUNNING {job_key}: {items} parts"));
                self.println(format!(
                    "  {} Run {run_id} started ({items} parts)",
                    self.green.apply_to("▶")
                ));
            }
            SessionEvent::ItemCompleted {
                full_code,
                result,
                remaining,
            } => {
                let mark = match result {
                    LedgerResult::Ok => self.green.apply_to("✓"),
                    LedgerResult::Sim => self.yellow.apply_to("✓"),
                };
                self.println(format!("  {mark} {full_code} {}", result.as_str()));
                self.set_spinner_message(format!("RUNNING: {remaining} left"));
            }
            SessionEvent::BatchCompleted(record) => {
                self.stop_spinner();
                println_err(format!(
                    "  {} Batch complete: {} parts",
                    self.green.apply_to("✓"),
                    record.completed
                ));
                self.print_record(record);
            }
            SessionEvent::Aborted { discarded, record } => {
                self.stop_spinner();
                println_err(format!(
                    "  {} Batch aborted, {discarded} queued parts discarded",
                    self.red.apply_to("✗")
                ));
                if let Some(record) = record {
                    self.print_record(record);
                }
            }
            SessionEvent::DateRolledOver { from, to } => {
                self.println(format!(
                    "  {} Date code {from} → {to}",
                    self.cyan.apply_to("⟳")
                ));
            }
            SessionEvent::Fault(message) => {
                self.println(format!("  {} {message}", self.red.apply_to("✗")));
            }
        }
    }

    /// Mensagem de erro de um comando do operador.
    pub fn error(&self, message: &str) {
        self.println(format!("  {} {message}", self.red.apply_to("✗")));
    }

    /// Mensagem informativa simples.
    pub fn info(&self, message: &str) {
        self.println(format!("  {message}"));
    }

    /// Imprime o registro de auditoria do lote em JSON com estilo colorido.
    fn print_record(&self, record: &RunRecord) {
        let style = match record.outcome {
            RunOutcome::Completed => &self.green,
            RunOutcome::Aborted => &self.red,
        };
        println_err(format!("{}", style.apply_to("─── Run Record ───")));
        println_err(serde_json::to_string_pretty(record).unwrap_or_default());
    }

    fn start_spinner(&mut self, state: SessionState) {
        if let Some(pb) = &self.spinner {
            pb.set_message(state.to_string());
            return;
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg} {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(state.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(pb);
    }

    fn set_spinner_message(&self, message: String) {
        if let Some(pb) = &self.spinner {
            pb.set_message(message);
        }
    }

    fn stop_spinner(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }

    // Imprime acima do spinner quando ele está ativo.
    fn println(&self, line: String) {
        match &self.spinner {
            Some(pb) => pb.println(line),
            None => println_err(line),
        }
    }
}

fn println_err(line: String) {
    eprintln!("{line}");
}

/// Imprime uma prévia de lote em stdout, um código por linha.
pub fn print_preview(job_name: &str, preview: &Preview) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to(format!("{job_name}: {} parts", preview.codes.len())));
    for code in &preview.codes {
        println!("{code}");
    }
}

//! Interface de linha de comando do LASERMARK baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, preview,
//! next-serial, prune, status, check-config) e flags globais (--config,
//! --verbose). Também interpreta os comandos do operador digitados durante
//! o modo `run` ([`OperatorCommand`]).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// LASERMARK: controlador de estação de gravação a laser.
#[derive(Debug, Parser)]
#[command(name = "lasermark", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./lasermark.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Conduz a estação: lê o controlador pela entrada padrão e envia
    /// comandos pela saída padrão.
    Run,

    /// Mostra os códigos do próximo lote de um job sem gravar nada.
    Preview {
        /// Chave do job, como em `[[jobs]] key`.
        job: String,

        /// Quantidade de peças (padrão: o lote padrão do job).
        #[arg(long)]
        count: Option<u32>,
    },

    /// Mostra o próximo serial livre de um part number.
    NextSerial {
        part: String,

        /// Código de data `aammdd` (padrão: hoje).
        #[arg(long)]
        date_code: Option<String>,
    },

    /// Aplica a política de retenção ao arquivo diário.
    Prune,

    /// Mostra o lote pendente e o resumo do ledger de hoje.
    Status,

    /// Valida a configuração e sai.
    CheckConfig,
}

/// Comando do operador digitado no modo `run`, sempre prefixado por `:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Start,
    Abort,
    /// Conclusão simulada (registrada como `SIM`).
    Done,
    Batch(u32),
    Autofocus,
    NextSerial,
    /// Força uma entrada no controlador: `:simi <entrada> <0|1>`.
    SimulateInput { index: usize, level: u8 },
    /// Estado da sessão e espelho das entradas e relés.
    Io,
    Help,
}

pub const OPERATOR_HELP: &str =
    ":start  :abort  :done  :batch <n>  :af  :next  :simi <entrada> <0|1>  :io  :help";

impl OperatorCommand {
    /// Retorna `None` para linhas sem `:` (que vão para o protocolo do
    /// controlador) e `Some(Err(..))` para comandos inválidos.
    pub fn parse(line: &str) -> Option<Result<Self, String>> {
        let body = line.trim().strip_prefix(':')?;
        let mut words = body.split_whitespace();
        let name = words.next().unwrap_or_default().to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        let command = match (name.as_str(), args.as_slice()) {
            ("start", []) => Ok(OperatorCommand::Start),
            ("abort", []) => Ok(OperatorCommand::Abort),
            ("done", []) => Ok(OperatorCommand::Done),
            ("af", []) => Ok(OperatorCommand::Autofocus),
            ("next", []) => Ok(OperatorCommand::NextSerial),
            ("io", []) => Ok(OperatorCommand::Io),
            ("help", []) => Ok(OperatorCommand::Help),
            ("batch", [n]) => n
                .parse::<u32>()
                .map(OperatorCommand::Batch)
                .map_err(|_| format!("invalid batch size `{n}`")),
            ("simi", [index, level]) => match (index.parse::<usize>(), *level) {
                (Ok(index), "0") => Ok(OperatorCommand::SimulateInput { index, level: 0 }),
                (Ok(index), "1") => Ok(OperatorCommand::SimulateInput { index, level: 1 }),
                _ => Err(format!("invalid input `{index} {level}`")),
            },
            _ => Err(format!("unknown command `:{body}`")),
        };
        Some(command)
    }
}

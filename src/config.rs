//! Configuração do LASERMARK carregada a partir de `lasermark.toml`.
//!
//! A struct [`LasermarkConfig`] contém todos os parâmetros configuráveis.
//! Cada seção e cada campo tem um default tipado, então um arquivo parcial é
//! mesclado campo a campo com os defaults. A variável de ambiente
//! `LASERMARK_ROOT` tem precedência sobre o arquivo para o diretório de dados.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::ledger::RetentionPolicy;
use crate::registry::Job;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "lasermark.toml";

/// Configuração de nível superior carregada de `lasermark.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct LasermarkConfig {
    /// Diretório raiz onde ficam `Working/`, `Handoff/`, `Logs/` e `History/`.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default)]
    pub serial: SerialLinkConfig,

    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub machine: MachineConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub relays: RelayConfig,

    /// Jobs na ordem do arquivo; a ordem define o desempate de padrões.
    #[serde(default)]
    pub jobs: Vec<Job>,
}

// Valor padrão para o diretório de dados: "./lasermark-data".
fn default_root() -> PathBuf {
    PathBuf::from("lasermark-data")
}

/// Link serial com o controlador de relés/entradas.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SerialLinkConfig {
    /// Linha enviada pelo hardware quando uma gravação termina.
    pub done_token: String,
    /// Intervalo de leitura do link, em milissegundos.
    pub poll_ms: u64,
}

impl Default for SerialLinkConfig {
    fn default() -> Self {
        Self {
            done_token: "DONE".to_string(),
            poll_ms: 10,
        }
    }
}

/// Mapeamento das entradas digitais para seleção de job e intertravamento.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Índices das entradas que formam o padrão de seleção, na ordem do padrão.
    pub job_inputs: Vec<usize>,
    /// Índice da entrada da porta (intertravamento).
    pub interlock_input: usize,
    /// Quantidade total de entradas espelhadas.
    pub input_count: usize,
    /// Sensores de job ativos em nível baixo.
    pub active_low: bool,
    /// Nível lido quando a porta está fechada.
    pub interlock_closed_level: u8,
    /// Tempo que um padrão precisa ficar estável antes de valer.
    pub cooldown_ms: u64,
    /// Intervalo de reavaliação do decodificador.
    pub tick_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            job_inputs: vec![0, 1, 2],
            interlock_input: 3,
            input_count: 4,
            active_low: true,
            interlock_closed_level: 0,
            cooldown_ms: 500,
            tick_ms: 200,
        }
    }
}

/// Modo de retenção do arquivo diário.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetainMode {
    Off,
    TodayOnly,
    Days,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub retain_mode: RetainMode,
    /// Dias mantidos quando `retain_mode = "days"`.
    pub retain_days: u32,
    /// Máximo de linhas por arquivo antes de abrir um novo pedaço.
    pub daily_max_rows: usize,
    /// Grava `Planned.csv` ao iniciar uma execução.
    pub write_planned: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retain_mode: RetainMode::Off,
            retain_days: 7,
            daily_max_rows: 20_000,
            write_planned: true,
        }
    }
}

impl LedgerConfig {
    /// Converte o modo configurado na política usada pelo ledger.
    pub fn retention(&self) -> RetentionPolicy {
        match self.retain_mode {
            RetainMode::Off => RetentionPolicy::Off,
            RetainMode::TodayOnly => RetentionPolicy::TodayOnly,
            RetainMode::Days => RetentionPolicy::Days(self.retain_days.max(1)),
        }
    }
}

/// Histórico permanente (nunca rotacionado, nunca podado).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    /// Caminho do CSV; quando ausente usa `<root>/History/All_Jobs_History.csv`.
    pub path: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

/// Código de máquina opcional inserido no código completo.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub enabled: bool,
    pub code: String,
}

impl MachineConfig {
    /// Código efetivo: até dois caracteres em maiúsculas, ou `None` se desativado.
    pub fn effective_code(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let code: String = self.code.trim().to_uppercase().chars().take(2).collect();
        if code.is_empty() { None } else { Some(code) }
    }
}

/// Granularidade de conclusão: um evento fecha o lote inteiro ou um item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    #[default]
    WholeBatch,
    PerItem,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub completion: CompletionPolicy,
    /// Modo simulado: conclusões são registradas como `SIM`.
    pub simulate: bool,
}

/// Relés do controlador, indexados pela posição na lista.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub names: Vec<String>,
    pub pulse_ms: Vec<u64>,
    pub disabled: Vec<bool>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            names: ["Auto Focus", "Air", "Start", "Door Lock", "Stack Light"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            pulse_ms: vec![250, 250, 250, 250, 0],
            disabled: vec![false; 5],
        }
    }
}

/// Caminhos derivados do diretório raiz.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub working_dir: PathBuf,
    pub handoff_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub history_file: PathBuf,
}

impl Default for LasermarkConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            serial: SerialLinkConfig::default(),
            sensor: SensorConfig::default(),
            ledger: LedgerConfig::default(),
            history: HistoryConfig::default(),
            machine: MachineConfig::default(),
            run: RunConfig::default(),
            relays: RelayConfig::default(),
            jobs: Vec::new(),
        }
    }
}

impl LasermarkConfig {
    /// Carrega a configuração de `path` (ou de `lasermark.toml` no diretório atual).
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o diretório raiz.
        if let Ok(root) = std::env::var("LASERMARK_ROOT")
            && !root.is_empty()
        {
            config.root = PathBuf::from(root);
        }

        config.validate()?;
        Ok(config)
    }

    /// Interpreta um documento TOML sem validar.
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str::<LasermarkConfig>(contents)?)
    }

    /// Caminhos de trabalho derivados de `root`.
    pub fn paths(&self) -> DataPaths {
        DataPaths {
            working_dir: self.root.join("Working"),
            handoff_dir: self.root.join("Handoff"),
            logs_dir: self.root.join("Logs"),
            history_file: self
                .history
                .path
                .clone()
                .unwrap_or_else(|| self.root.join("History").join("All_Jobs_History.csv")),
        }
    }

    /// Verifica regras que o deserializador não consegue expressar.
    ///
    /// Padrões duplicados são rejeitados aqui em vez de deixar o registro
    /// desempatar silenciosamente pela ordem de inserção.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let sensor = &self.sensor;
        for &index in sensor.job_inputs.iter().chain([&sensor.interlock_input]) {
            if index >= sensor.input_count {
                return Err(ConfigError::InputOutOfRange {
                    index,
                    count: sensor.input_count,
                });
            }
        }
        if sensor.job_inputs.contains(&sensor.interlock_input) {
            return Err(ConfigError::InterlockIsJobInput(sensor.interlock_input));
        }
        if self.ledger.daily_max_rows == 0 {
            return Err(ConfigError::ZeroLimit("ledger.daily_max_rows"));
        }
        if self.ledger.retain_days == 0 {
            return Err(ConfigError::ZeroLimit("ledger.retain_days"));
        }

        let width = sensor.job_inputs.len();
        let mut keys = HashSet::new();
        for (i, job) in self.jobs.iter().enumerate() {
            if !keys.insert(job.key.as_str()) {
                return Err(ConfigError::DuplicateJobKey(job.key.clone()));
            }
            if job.part_number.trim().is_empty() {
                return Err(ConfigError::EmptyPartNumber(job.key.clone()));
            }
            let pattern = &job.select_pattern;
            if pattern.len() != width || !pattern.chars().all(|c| c == '0' || c == '1') {
                return Err(ConfigError::InvalidPattern {
                    key: job.key.clone(),
                    pattern: pattern.clone(),
                    expected: width,
                });
            }
            if pattern.chars().all(|c| c == '0') {
                return Err(ConfigError::ZeroPattern(job.key.clone()));
            }
            if let Some(earlier) = self.jobs[..i]
                .iter()
                .find(|other| other.select_pattern == *pattern)
            {
                return Err(ConfigError::DuplicatePattern {
                    pattern: pattern.clone(),
                    first: earlier.key.clone(),
                    second: job.key.clone(),
                });
            }
        }
        Ok(())
    }
}

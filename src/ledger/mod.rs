//! Durable record of engraved parts.
//!
//! Three kinds of file are written, always as whole-record appends:
//! - completed rows, either in the rolling `Working/Completed_Today.csv`
//!   (retention `off`) or in `Logs/<yyyy>/<yymmdd>/Completed*.csv` chunks;
//! - planned rows (`Planned*.csv`), one per item when a run starts;
//! - the permanent history CSV, never rotated or pruned.

pub mod csv_file;
mod retention;
mod shard;

use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub use retention::{PruneReport, RetentionPolicy, prune_archive};
pub use shard::{ShardIndex, ShardKind};

use crate::batch::{QUEUE_HEADER, SerializedItem};
use crate::config::LasermarkConfig;
use crate::error::Result;
use crate::serial::{date_code, date_from_code};
use csv_file::RowView;

pub const COMPLETED_HEADER: [&str; 7] = [
    "Time",
    "JobName",
    "PartNumber",
    "DateCode",
    "Serial4",
    "Serial Number",
    "Result",
];

pub const HISTORY_HEADER: [&str; 6] = [
    "Time",
    "JobName",
    "PartNumber",
    "DateCode",
    "Serial Number",
    "Result",
];

/// Outcome recorded for an engraved part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerResult {
    /// Reported done by the hardware.
    Ok,
    /// Completed by a simulated event.
    Sim,
}

impl LedgerResult {
    /// Anything other than a spelling of `SIM` reads as `OK`.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "SIM" | "Sim" | "sim" => LedgerResult::Sim,
            _ => LedgerResult::Ok,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LedgerResult::Ok => "OK",
            LedgerResult::Sim => "SIM",
        }
    }
}

/// One completed part. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub time: String,
    pub job_name: String,
    pub part_number: String,
    pub date_code: String,
    pub serial4: String,
    pub full_code: String,
    pub result: LedgerResult,
}

impl LedgerEntry {
    pub fn from_item(item: &SerializedItem, result: LedgerResult, now: NaiveDateTime) -> Self {
        Self {
            time: now.format("%H:%M:%S").to_string(),
            job_name: item.job_name.clone(),
            part_number: item.part_number.clone(),
            date_code: item.date_code.clone(),
            serial4: item.serial4.clone(),
            full_code: item.full_code.clone(),
            result,
        }
    }

    fn completed_row(&self) -> Vec<&str> {
        vec![
            self.time.as_str(),
            self.job_name.as_str(),
            self.part_number.as_str(),
            self.date_code.as_str(),
            self.serial4.as_str(),
            self.full_code.as_str(),
            self.result.as_str(),
        ]
    }

    fn history_row(&self) -> Vec<&str> {
        vec![
            self.time.as_str(),
            self.job_name.as_str(),
            self.part_number.as_str(),
            self.date_code.as_str(),
            self.full_code.as_str(),
            self.result.as_str(),
        ]
    }

    fn from_row(row: &RowView<'_>) -> Self {
        Self {
            time: row.text("Time"),
            job_name: row.text("JobName"),
            part_number: row.text("PartNumber"),
            date_code: row.text("DateCode"),
            serial4: row.text("Serial4"),
            full_code: row.text("Serial Number"),
            result: LedgerResult::parse(row.get("Result").unwrap_or_default()),
        }
    }
}

/// Where and how the ledger writes.
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    pub logs_dir: PathBuf,
    pub rolling_file: PathBuf,
    /// `None` disables the permanent history.
    pub history_file: Option<PathBuf>,
    pub policy: RetentionPolicy,
    pub daily_max_rows: usize,
    pub write_planned: bool,
}

impl LedgerOptions {
    pub fn from_config(config: &LasermarkConfig) -> Self {
        let paths = config.paths();
        Self {
            logs_dir: paths.logs_dir,
            rolling_file: paths.working_dir.join("Completed_Today.csv"),
            history_file: config.history.enabled.then_some(paths.history_file),
            policy: config.ledger.retention(),
            daily_max_rows: config.ledger.daily_max_rows.max(1),
            write_planned: config.ledger.write_planned,
        }
    }
}

pub struct ProductionLedger {
    options: LedgerOptions,
    // Index of the day currently being written.
    active_day: Option<ShardIndex>,
    // Index write that failed after its rows were already on disk.
    index_fault: Option<String>,
}

impl ProductionLedger {
    pub fn new(options: LedgerOptions) -> Self {
        Self {
            options,
            active_day: None,
            index_fault: None,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.options.policy
    }

    #[cfg(test)]
    pub fn rolling_file(&self) -> &std::path::Path {
        &self.options.rolling_file
    }

    /// `Logs/<yyyy>/<yymmdd>` for a valid date code.
    pub fn day_dir(&self, date_code: &str) -> Option<PathBuf> {
        let day = date_from_code(date_code)?;
        Some(
            self.options
                .logs_dir
                .join(day.format("%Y").to_string())
                .join(date_code),
        )
    }

    fn index_for(&mut self, day: NaiveDate) -> Result<&mut ShardIndex> {
        let code = date_code(day);
        let day_dir = self
            .day_dir(&code)
            .unwrap_or_else(|| self.options.logs_dir.join(&code));
        let index = match self.active_day.take() {
            Some(index) if index.day_dir() == day_dir => index,
            _ => ShardIndex::open(&day_dir)?,
        };
        Ok(self.active_day.insert(index))
    }

    /// Appends completed rows for `items` and returns the entries written.
    /// Nothing is recorded when the write fails.
    pub fn append(
        &mut self,
        items: &[SerializedItem],
        result: LedgerResult,
        now: NaiveDateTime,
    ) -> Result<Vec<LedgerEntry>> {
        let entries: Vec<LedgerEntry> = items
            .iter()
            .map(|item| LedgerEntry::from_item(item, result, now))
            .collect();
        if entries.is_empty() {
            return Ok(entries);
        }
        let rows: Vec<Vec<&str>> = entries.iter().map(LedgerEntry::completed_row).collect();

        if self.options.policy == RetentionPolicy::Off {
            csv_file::append_rows(&self.options.rolling_file, &COMPLETED_HEADER, &rows)?;
        } else {
            self.append_shard(ShardKind::Completed, &COMPLETED_HEADER, &rows, now.date())?;
        }
        tracing::debug!(count = entries.len(), result = result.as_str(), "ledgered completed items");
        Ok(entries)
    }

    /// Appends to the permanent history, when enabled.
    pub fn append_history(&self, entries: &[LedgerEntry]) -> Result<()> {
        let Some(path) = &self.options.history_file else {
            return Ok(());
        };
        if entries.is_empty() {
            return Ok(());
        }
        let rows: Vec<Vec<&str>> = entries.iter().map(LedgerEntry::history_row).collect();
        csv_file::append_rows(path, &HISTORY_HEADER, &rows)
    }

    /// Records the items of a run that is about to start. Skipped when the
    /// archive is off or planned logging is disabled; returns whether rows
    /// were written.
    pub fn append_planned(&mut self, items: &[SerializedItem], now: NaiveDateTime) -> Result<bool> {
        if self.options.policy == RetentionPolicy::Off || !self.options.write_planned || items.is_empty() {
            return Ok(false);
        }
        let rows: Vec<Vec<&str>> = items.iter().map(SerializedItem::row).collect();
        self.append_shard(ShardKind::Planned, &QUEUE_HEADER, &rows, now.date())?;
        Ok(true)
    }

    /// Appends to the day's active chunk of `kind`. Once the rows are on
    /// disk the append counts as done; a failed index write is kept for
    /// [`take_index_fault`](Self::take_index_fault) instead of failing it.
    fn append_shard(
        &mut self,
        kind: ShardKind,
        header: &[&str],
        rows: &[Vec<&str>],
        day: NaiveDate,
    ) -> Result<()> {
        let max_rows = self.options.daily_max_rows;
        let index = self.index_for(day)?;
        let target = index.target_for_append(kind, max_rows);
        csv_file::append_rows(&target.path, header, rows)?;
        if let Err(e) = index.record_append(kind, &target, rows.len()) {
            tracing::warn!(error = %e, kind = kind.stem(), "rows written but day index not updated");
            self.index_fault = Some(format!("day index not updated: {e}"));
        }
        Ok(())
    }

    /// Takes the last index write failure, if any.
    pub fn take_index_fault(&mut self) -> Option<String> {
        self.index_fault.take()
    }

    /// Applies the retention policy to the day archive.
    pub fn prune(&mut self, today: NaiveDate) -> PruneReport {
        let report = prune_archive(&self.options.logs_dir, self.options.policy, today);
        if let Some(index) = &self.active_day
            && report
                .removed
                .iter()
                .any(|removed| index.day_dir().starts_with(removed))
        {
            self.active_day = None;
        }
        for dir in &report.removed {
            tracing::info!(dir = %dir.display(), policy = %self.options.policy, "pruned ledger archive");
        }
        report
    }

    /// Drops rows from other days out of the rolling completed file.
    /// Only applies when retention is off; returns the number of rows removed.
    pub fn filter_rolling_to_today(&self, today_code: &str) -> Result<usize> {
        if self.options.policy != RetentionPolicy::Off {
            return Ok(0);
        }
        let path = &self.options.rolling_file;
        let Some(table) = csv_file::read_table(path)? else {
            return Ok(0);
        };

        let kept: Vec<Vec<String>> = table
            .views()
            .zip(&table.rows)
            .filter(|(view, _)| view.get("DateCode") == Some(today_code))
            .map(|(_, row)| row.clone())
            .collect();
        let removed = table.rows.len() - kept.len();
        if removed > 0 {
            let header: Vec<&str> = if table.has_columns(&COMPLETED_HEADER) {
                table.header.iter().map(String::as_str).collect()
            } else {
                COMPLETED_HEADER.to_vec()
            };
            csv_file::write_table_atomic(path, &header, &kept)?;
            tracing::info!(removed, today = today_code, "dropped stale rows from rolling completed file");
        }
        Ok(removed)
    }

    /// Files holding completed rows for `date_code` under the active policy.
    fn completed_files(&self, date_code: &str) -> Result<Vec<PathBuf>> {
        if self.options.policy == RetentionPolicy::Off {
            return Ok(vec![self.options.rolling_file.clone()]);
        }
        let Some(day_dir) = self.day_dir(date_code) else {
            return Ok(Vec::new());
        };
        match &self.active_day {
            Some(index) if index.day_dir() == day_dir => Ok(index.chunk_paths(ShardKind::Completed)),
            _ => Ok(ShardIndex::open(&day_dir)?.chunk_paths(ShardKind::Completed)),
        }
    }

    /// Visits every completed row relevant to `date_code`. Read-only.
    pub fn scan_completed(&self, date_code: &str, mut visit: impl FnMut(&RowView<'_>)) -> Result<()> {
        for path in self.completed_files(date_code)? {
            if let Some(table) = csv_file::read_table(&path)? {
                for row in table.views() {
                    visit(&row);
                }
            }
        }
        Ok(())
    }

    /// Completed entries for `date_code`, in the order they were written.
    pub fn completed_entries(&self, date_code: &str) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        self.scan_completed(date_code, |row| {
            if row.get("DateCode") == Some(date_code) {
                entries.push(LedgerEntry::from_row(row));
            }
        })?;
        Ok(entries)
    }
}

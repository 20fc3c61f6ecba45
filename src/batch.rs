//! The committed run queue (`Working/CurrentBatch.csv`) and the code
//! hand-off file read by the engraving software (`Handoff/NextBatch.csv`).

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{LasermarkError, Result};
use crate::ledger::csv_file::{self, RowView};
use crate::registry::Job;
use crate::serial::{SerialNumberAllocator, date_code, full_code, serial4};

pub const QUEUE_HEADER: [&str; 7] = [
    "Date",
    "JobID",
    "JobName",
    "PartNumber",
    "DateCode",
    "Serial4",
    "FullCode",
];

const HANDOFF_HEADER: [&str; 1] = ["CODE"];

/// One part with its issued serial, waiting to be engraved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedItem {
    /// Issue date, `YYYY-MM-DD`.
    pub created_date: String,
    pub job_key: String,
    pub job_name: String,
    pub part_number: String,
    pub date_code: String,
    pub serial4: String,
    pub full_code: String,
}

impl SerializedItem {
    /// Row in [`QUEUE_HEADER`] order.
    pub fn row(&self) -> Vec<&str> {
        vec![
            self.created_date.as_str(),
            self.job_key.as_str(),
            self.job_name.as_str(),
            self.part_number.as_str(),
            self.date_code.as_str(),
            self.serial4.as_str(),
            self.full_code.as_str(),
        ]
    }

    fn from_row(row: &RowView<'_>, path: &Path) -> Result<Self> {
        let required = |column: &str| {
            row.get(column)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| LasermarkError::MalformedRecord {
                    path: path.to_path_buf(),
                    detail: format!("missing {column}"),
                })
        };
        Ok(Self {
            created_date: row.text("Date"),
            job_key: required("JobID")?,
            job_name: row.text("JobName"),
            part_number: required("PartNumber")?,
            date_code: required("DateCode")?,
            serial4: required("Serial4")?,
            full_code: required("FullCode")?,
        })
    }

    #[cfg(test)]
    pub fn issue_for_test(part_number: &str, date_code: &str, serial: u32) -> Self {
        let created_date = crate::serial::date_from_code(date_code)
            .map(|day| day.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let s4 = serial4(serial);
        Self {
            created_date,
            job_key: "test".to_string(),
            job_name: "Test Job".to_string(),
            part_number: part_number.to_string(),
            date_code: date_code.to_string(),
            full_code: full_code(part_number, date_code, &s4, None),
            serial4: s4,
        }
    }
}

/// Date and machine code stamped on issued items.
#[derive(Debug, Clone, Copy)]
pub struct IssueContext<'a> {
    pub today: NaiveDate,
    pub machine_code: Option<&'a str>,
}

/// Items a run would engrave, with their codes in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preview {
    pub items: Vec<SerializedItem>,
    pub codes: Vec<String>,
}

impl Preview {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Ordered queue of items for the active run, mirrored to disk.
#[derive(Debug)]
pub struct BatchQueue {
    queue_file: PathBuf,
    handoff_file: PathBuf,
    items: Vec<SerializedItem>,
    armed: bool,
}

impl BatchQueue {
    /// Opens the queue, picking up any batch left on disk by a previous process.
    pub fn open(working_dir: &Path, handoff_dir: &Path) -> Result<Self> {
        let mut queue = Self {
            queue_file: working_dir.join("CurrentBatch.csv"),
            handoff_file: handoff_dir.join("NextBatch.csv"),
            items: Vec::new(),
            armed: false,
        };
        let leftover = queue.read_persisted()?;
        if !leftover.is_empty() {
            tracing::warn!(
                pending = leftover.len(),
                file = %queue.queue_file.display(),
                "restored unfinished batch from previous session"
            );
            queue.items = leftover;
            queue.armed = true;
        }
        Ok(queue)
    }

    /// Computes `count` (at least one) items starting at the next free serial.
    /// Writes nothing, so repeated calls agree until the ledger changes.
    pub fn build_preview(
        allocator: &SerialNumberAllocator<'_>,
        job: &Job,
        count: u32,
        issue: IssueContext<'_>,
    ) -> Result<Preview> {
        let dc = date_code(issue.today);
        let start = allocator.next_serial(&job.part_number, &dc)?;
        let created_date = issue.today.format("%Y-%m-%d").to_string();

        let mut preview = Preview::default();
        for offset in 0..count.max(1) {
            let s4 = serial4(start.saturating_add(offset));
            let code = full_code(&job.part_number, &dc, &s4, issue.machine_code);
            preview.items.push(SerializedItem {
                created_date: created_date.clone(),
                job_key: job.key.clone(),
                job_name: job.name().to_string(),
                part_number: job.part_number.clone(),
                date_code: dc.clone(),
                serial4: s4,
                full_code: code.clone(),
            });
            preview.codes.push(code);
        }
        Ok(preview)
    }

    /// Persists `items` as the active queue, replacing an empty or finished one.
    /// Rejected while an armed queue still has items.
    pub fn commit(&mut self, items: Vec<SerializedItem>) -> Result<()> {
        if self.armed && !self.items.is_empty() {
            return Err(LasermarkError::QueueBusy {
                pending: self.items.len(),
            });
        }
        self.persist(&items)?;
        self.armed = !items.is_empty();
        self.items = items;
        Ok(())
    }

    /// Drops the head item and persists the rest. Returns whether the queue
    /// is now empty.
    pub fn advance(&mut self) -> Result<bool> {
        if self.items.is_empty() {
            return Ok(true);
        }
        let remaining = self.items[1..].to_vec();
        self.persist(&remaining)?;
        self.items = remaining;
        if self.items.is_empty() {
            self.armed = false;
        }
        Ok(self.items.is_empty())
    }

    /// Discards the queue and persists the empty state.
    pub fn clear(&mut self) -> Result<()> {
        self.persist(&[])?;
        self.items.clear();
        self.armed = false;
        Ok(())
    }

    /// Puts back items taken off by [`advance`](Self::advance) or
    /// [`clear`](Self::clear) when the step they belonged to failed. Memory
    /// is restored even if the file cannot be.
    pub fn reinstate(&mut self, items: Vec<SerializedItem>) -> Result<()> {
        self.armed = !items.is_empty();
        self.items = items;
        self.persist(&self.items)
    }

    /// Rewrites the hand-off file with one code per row.
    pub fn write_handoff(&self, codes: &[String]) -> Result<()> {
        let rows: Vec<Vec<&str>> = codes.iter().map(|code| vec![code.as_str()]).collect();
        csv_file::write_table_atomic(&self.handoff_file, &HANDOFF_HEADER, &rows)
    }

    /// Reads the queue file back. A missing file is an empty queue.
    pub fn read_persisted(&self) -> Result<Vec<SerializedItem>> {
        let Some(table) = csv_file::read_table(&self.queue_file)? else {
            return Ok(Vec::new());
        };
        table
            .views()
            .map(|row| SerializedItem::from_row(&row, &self.queue_file))
            .collect()
    }

    fn persist(&self, items: &[SerializedItem]) -> Result<()> {
        let rows: Vec<Vec<&str>> = items.iter().map(SerializedItem::row).collect();
        csv_file::write_table_atomic(&self.queue_file, &QUEUE_HEADER, &rows)
    }

    pub fn head(&self) -> Option<&SerializedItem> {
        self.items.first()
    }

    pub fn items(&self) -> &[SerializedItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True while a committed batch has not been finished or cleared.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    #[cfg(test)]
    pub fn handoff_file(&self) -> &Path {
        &self.handoff_file
    }
}

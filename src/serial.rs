//! Serial numbering: date codes, engraved codes and the next-serial scan.

use chrono::NaiveDate;

use crate::error::Result;
use crate::ledger::ProductionLedger;

/// `yymmdd` for the given day.
pub fn date_code(date: NaiveDate) -> String {
    date.format("%y%m%d").to_string()
}

/// Inverse of [`date_code`]; `None` for anything that is not a real day.
pub fn date_from_code(code: &str) -> Option<NaiveDate> {
    if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(code, "%y%m%d").ok()
}

/// Four-digit, zero-padded serial text.
pub fn serial4(n: u32) -> String {
    format!("{n:04}")
}

/// The code engraved on a part: `PN-yymmdd[-MC]-0001`.
pub fn full_code(part_number: &str, date_code: &str, serial4: &str, machine: Option<&str>) -> String {
    match machine {
        Some(mc) if !mc.is_empty() => format!("{part_number}-{date_code}-{mc}-{serial4}"),
        _ => format!("{part_number}-{date_code}-{serial4}"),
    }
}

/// Computes the next unused serial from the completed ledger.
///
/// Read-only: it backs both the preview and the "next serial" display, so
/// calling it never writes anything.
pub struct SerialNumberAllocator<'a> {
    ledger: &'a ProductionLedger,
}

impl<'a> SerialNumberAllocator<'a> {
    pub fn new(ledger: &'a ProductionLedger) -> Self {
        Self { ledger }
    }

    /// `1 + max(serial)` over completed rows for this part and date code, or 1.
    ///
    /// Serial cells that are not numbers count as 0. A damaged row can
    /// therefore lead to a serial being issued twice; the ledger is the only
    /// source of truth.
    pub fn next_serial(&self, part_number: &str, date_code: &str) -> Result<u32> {
        let mut max = 0u32;
        self.ledger.scan_completed(date_code, |row| {
            if row.get("PartNumber") == Some(part_number) && row.get("DateCode") == Some(date_code) {
                let serial = row
                    .get("Serial4")
                    .and_then(|s| s.trim().parse::<u32>().ok())
                    .unwrap_or(0);
                max = max.max(serial);
            }
        })?;
        Ok(max.saturating_add(1))
    }
}

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};

use crate::serial::{date_code, date_from_code};

/// How much of the day-partitioned archive is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// No archive; only the rolling "completed today" file.
    Off,
    TodayOnly,
    /// Today plus the previous `n - 1` days.
    Days(u32),
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::Off => write!(f, "off"),
            RetentionPolicy::TodayOnly => write!(f, "today_only"),
            RetentionPolicy::Days(n) => write!(f, "days({n})"),
        }
    }
}

/// What a prune pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
}

/// Applies `policy` to the archive rooted at `logs_dir` (`<yyyy>/<yymmdd>/`).
///
/// Individual directories that cannot be removed are logged and skipped.
pub fn prune_archive(logs_dir: &Path, policy: RetentionPolicy, today: NaiveDate) -> PruneReport {
    let mut report = PruneReport::default();
    if !logs_dir.exists() {
        return report;
    }

    if policy == RetentionPolicy::Off {
        match fs::remove_dir_all(logs_dir) {
            Ok(()) => report.removed.push(logs_dir.to_path_buf()),
            Err(e) => tracing::warn!(dir = %logs_dir.display(), error = %e, "failed to remove ledger archive"),
        }
        return report;
    }

    let today_code = date_code(today);
    let cutoff = match policy {
        RetentionPolicy::Days(n) => Some(today - Duration::days(i64::from(n.max(1)) - 1)),
        _ => None,
    };

    for year_dir in subdirs(logs_dir) {
        for day_dir in subdirs(&year_dir) {
            let name = day_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            // Unparseable names are not ours to delete.
            let expired = date_from_code(&name).is_some_and(|day| match cutoff {
                None => name != today_code,
                Some(cutoff) => day < cutoff,
            });
            if !expired {
                continue;
            }
            match fs::remove_dir_all(&day_dir) {
                Ok(()) => report.removed.push(day_dir),
                Err(e) => {
                    tracing::warn!(dir = %day_dir.display(), error = %e, "failed to prune day directory")
                }
            }
        }
        // Drop year directories left empty.
        if fs::read_dir(&year_dir).is_ok_and(|mut entries| entries.next().is_none()) {
            let _ = fs::remove_dir(&year_dir);
        }
    }
    report
}

fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

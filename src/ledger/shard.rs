//! Row-count bounded chunks of a day's ledger files.
//!
//! Each day directory carries an `index.json` naming the active chunk of
//! `Completed*.csv` and `Planned*.csv` and how many rows it holds, so
//! rotation never lists the directory. The index is rebuilt from the files
//! when it is missing, unreadable or behind what is on disk.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::csv_file;
use crate::error::{LasermarkError, Result};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Completed,
    Planned,
}

impl ShardKind {
    pub fn stem(self) -> &'static str {
        match self {
            ShardKind::Completed => "Completed",
            ShardKind::Planned => "Planned",
        }
    }

    /// `Completed.csv` for chunk 1, `Completed_<n>.csv` after that.
    pub fn file_name(self, chunk: u32) -> String {
        if chunk <= 1 {
            format!("{}.csv", self.stem())
        } else {
            format!("{}_{chunk}.csv", self.stem())
        }
    }

    /// Chunk number encoded in a file name of this kind.
    pub fn chunk_of(self, file_name: &str) -> Option<u32> {
        let rest = file_name.strip_prefix(self.stem())?.strip_suffix(".csv")?;
        if rest.is_empty() {
            return Some(1);
        }
        rest.strip_prefix('_')?.parse().ok().filter(|&n| n >= 2)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCursor {
    /// Active chunk, starting at 1.
    pub chunk: u32,
    /// Records already in the active chunk.
    pub rows: usize,
}

/// Index for one day directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayShards {
    #[serde(default)]
    pub completed: ShardCursor,
    #[serde(default)]
    pub planned: ShardCursor,
}

impl DayShards {
    fn cursor_mut(&mut self, kind: ShardKind) -> &mut ShardCursor {
        match kind {
            ShardKind::Completed => &mut self.completed,
            ShardKind::Planned => &mut self.planned,
        }
    }

    pub fn cursor(&self, kind: ShardKind) -> ShardCursor {
        match kind {
            ShardKind::Completed => self.completed,
            ShardKind::Planned => self.planned,
        }
    }
}

/// Chunk file chosen for an append, with its cursor before the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendTarget {
    pub path: PathBuf,
    pub cursor: ShardCursor,
}

/// In-memory index of one day directory, mirrored to `index.json`.
#[derive(Debug, Clone)]
pub struct ShardIndex {
    day_dir: PathBuf,
    shards: DayShards,
}

impl ShardIndex {
    /// Loads the day's index, reconciling it against the files once.
    pub fn open(day_dir: &Path) -> Result<Self> {
        let from_disk = fs::read_to_string(day_dir.join(INDEX_FILE))
            .ok()
            .and_then(|raw| serde_json::from_str::<DayShards>(&raw).ok());

        let mut shards = DayShards::default();
        for kind in [ShardKind::Completed, ShardKind::Planned] {
            let recorded = from_disk.as_ref().map(|s| s.cursor(kind));
            *shards.cursor_mut(kind) = reconcile(day_dir, kind, recorded)?;
        }
        Ok(Self {
            day_dir: day_dir.to_path_buf(),
            shards,
        })
    }

    pub fn day_dir(&self) -> &Path {
        &self.day_dir
    }

    #[cfg(test)]
    pub fn shards(&self) -> &DayShards {
        &self.shards
    }

    /// Where the next rows of `kind` go, rolling to a new chunk once the
    /// active one has reached `max_rows`. Changes nothing until the rows are
    /// recorded with [`record_append`](Self::record_append).
    pub fn target_for_append(&self, kind: ShardKind, max_rows: usize) -> AppendTarget {
        let current = self.shards.cursor(kind);
        let cursor = if current.chunk == 0 {
            ShardCursor { chunk: 1, rows: current.rows }
        } else if current.rows >= max_rows {
            ShardCursor {
                chunk: current.chunk + 1,
                rows: 0,
            }
        } else {
            current
        };
        AppendTarget {
            path: self.day_dir.join(kind.file_name(cursor.chunk)),
            cursor,
        }
    }

    /// Records `count` rows written to `target` and persists the index.
    ///
    /// The in-memory cursor follows the rows on disk even when the index
    /// write fails; the next successful persist or a reopen catches up.
    pub fn record_append(&mut self, kind: ShardKind, target: &AppendTarget, count: usize) -> Result<()> {
        let cursor = self.shards.cursor_mut(kind);
        if target.cursor.chunk != cursor.chunk && cursor.chunk != 0 {
            tracing::info!(
                file = %kind.file_name(target.cursor.chunk),
                "ledger shard full, rolled to next chunk"
            );
        }
        *cursor = ShardCursor {
            chunk: target.cursor.chunk,
            rows: target.cursor.rows + count,
        };
        self.persist()
    }

    /// Every existing chunk of `kind`, oldest first.
    pub fn chunk_paths(&self, kind: ShardKind) -> Vec<PathBuf> {
        let last = self.shards.cursor(kind).chunk.max(1);
        (1..=last)
            .map(|chunk| self.day_dir.join(kind.file_name(chunk)))
            .filter(|path| path.exists())
            .collect()
    }

    fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.day_dir)
            .map_err(|e| LasermarkError::file("create", &self.day_dir, e))?;
        let path = self.day_dir.join(INDEX_FILE);
        let temp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.shards)?;
        fs::write(&temp, json).map_err(|e| LasermarkError::file("write", &temp, e))?;
        fs::rename(&temp, &path).map_err(|e| LasermarkError::file("replace", &path, e))
    }
}

/// Highest chunk present on disk for `kind`, if any.
fn last_chunk_on_disk(day_dir: &Path, kind: ShardKind) -> Result<Option<u32>> {
    let entries = match fs::read_dir(day_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LasermarkError::file("list", day_dir, e)),
    };
    Ok(entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| kind.chunk_of(&entry.file_name().to_string_lossy()))
        .max())
}

fn reconcile(day_dir: &Path, kind: ShardKind, recorded: Option<ShardCursor>) -> Result<ShardCursor> {
    let chunk = match recorded {
        // A newer chunk than the index knows means we crashed mid-rotation.
        Some(cursor) if cursor.chunk >= 1 && !day_dir.join(kind.file_name(cursor.chunk + 1)).exists() => {
            cursor.chunk
        }
        _ => last_chunk_on_disk(day_dir, kind)?.unwrap_or(1),
    };
    let rows = csv_file::count_rows(&day_dir.join(kind.file_name(chunk)))?;
    if let Some(cursor) = recorded
        && (cursor.chunk, cursor.rows) != (chunk, rows)
    {
        tracing::debug!(
            dir = %day_dir.display(),
            kind = kind.stem(),
            recorded_chunk = cursor.chunk,
            recorded_rows = cursor.rows,
            chunk,
            rows,
            "shard index disagreed with files, rebuilt"
        );
    }
    Ok(ShardCursor { chunk, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_rows(path: &Path, rows: usize) {
        let body: Vec<Vec<String>> = (0..rows).map(|i| vec![i.to_string()]).collect();
        csv_file::append_rows(path, &["N"], &body).unwrap();
    }

    #[test]
    fn chunk_names_round_trip() {
        assert_eq!(ShardKind::Completed.file_name(1), "Completed.csv");
        assert_eq!(ShardKind::Planned.file_name(3), "Planned_3.csv");
        assert_eq!(ShardKind::Completed.chunk_of("Completed.csv"), Some(1));
        assert_eq!(ShardKind::Completed.chunk_of("Completed_12.csv"), Some(12));
        assert_eq!(ShardKind::Completed.chunk_of("Completed_x.csv"), None);
        assert_eq!(ShardKind::Completed.chunk_of("Completed_1.csv"), None);
        assert_eq!(ShardKind::Completed.chunk_of("Planned.csv"), None);
    }

    #[test]
    fn rolls_over_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ShardIndex::open(dir.path()).unwrap();

        let first = index.target_for_append(ShardKind::Completed, 2);
        assert_eq!(first.path, dir.path().join("Completed.csv"));
        write_rows(&first.path, 2);
        index.record_append(ShardKind::Completed, &first, 2).unwrap();

        let second = index.target_for_append(ShardKind::Completed, 2);
        assert_eq!(second.path, dir.path().join("Completed_2.csv"));
        // Choosing a target alone does not rotate.
        assert_eq!(index.shards().completed, ShardCursor { chunk: 1, rows: 2 });
        write_rows(&second.path, 1);
        index.record_append(ShardKind::Completed, &second, 1).unwrap();

        assert_eq!(
            index.chunk_paths(ShardKind::Completed),
            vec![first.path.clone(), second.path.clone()]
        );
        // Planned is tracked independently.
        assert_eq!(
            index.target_for_append(ShardKind::Planned, 2).path,
            dir.path().join("Planned.csv")
        );

        let reopened = ShardIndex::open(dir.path()).unwrap();
        assert_eq!(
            reopened.shards().completed,
            ShardCursor { chunk: 2, rows: 1 }
        );
    }

    #[test]
    fn rebuilds_missing_index_from_files() {
        let dir = tempfile::tempdir().unwrap();
        write_rows(&dir.path().join("Completed.csv"), 5);
        write_rows(&dir.path().join("Completed_2.csv"), 5);
        write_rows(&dir.path().join("Completed_3.csv"), 2);

        let index = ShardIndex::open(dir.path()).unwrap();
        assert_eq!(index.shards().completed, ShardCursor { chunk: 3, rows: 2 });
        assert_eq!(index.chunk_paths(ShardKind::Completed).len(), 3);
    }

    #[test]
    fn stale_index_is_corrected() {
        let dir = tempfile::tempdir().unwrap();
        write_rows(&dir.path().join("Completed.csv"), 4);
        write_rows(&dir.path().join("Completed_2.csv"), 1);
        fs::write(
            dir.path().join(INDEX_FILE),
            r#"{"completed":{"chunk":1,"rows":3},"planned":{"chunk":1,"rows":0}}"#,
        )
        .unwrap();

        let index = ShardIndex::open(dir.path()).unwrap();
        assert_eq!(index.shards().completed, ShardCursor { chunk: 2, rows: 1 });
    }

    #[test]
    fn failed_index_write_keeps_cursor_on_the_written_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = ShardIndex::open(dir.path()).unwrap();
        // A directory in the way of the temp file makes the index write fail.
        fs::create_dir_all(dir.path().join("index.json.tmp")).unwrap();

        let target = index.target_for_append(ShardKind::Completed, 10);
        write_rows(&target.path, 3);
        assert!(index.record_append(ShardKind::Completed, &target, 3).is_err());
        assert_eq!(index.shards().completed, ShardCursor { chunk: 1, rows: 3 });

        fs::remove_dir(dir.path().join("index.json.tmp")).unwrap();
        let target = index.target_for_append(ShardKind::Completed, 10);
        write_rows(&target.path, 2);
        index.record_append(ShardKind::Completed, &target, 2).unwrap();

        let raw = fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        let saved: DayShards = serde_json::from_str(&raw).unwrap();
        assert_eq!(saved.completed, ShardCursor { chunk: 1, rows: 5 });
    }
}

//! Minimal CSV files: a header row followed by records.
//!
//! Fields are quoted only when they contain a comma, quote or line break, and
//! rows end with `\r\n` so existing spreadsheets keep opening them.

use std::borrow::Cow;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use crate::error::{LasermarkError, Result};

const LINE_END: &str = "\r\n";

/// Parsed file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    pub fn views(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().map(|fields| RowView {
            header: &self.header,
            fields,
        })
    }

    pub fn has_columns(&self, columns: &[&str]) -> bool {
        columns
            .iter()
            .all(|column| self.header.iter().any(|h| h == column))
    }
}

/// One record addressed by column name.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    header: &'a [String],
    fields: &'a [String],
}

impl<'a> RowView<'a> {
    /// Value of `column`; `None` when the column or the cell is missing.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let index = self.header.iter().position(|h| h == column)?;
        self.fields.get(index).map(String::as_str)
    }

    /// Like [`get`](Self::get) but missing cells read as empty.
    pub fn text(&self, column: &str) -> String {
        self.get(column).unwrap_or_default().to_string()
    }
}

pub fn escape_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

pub fn render_row<S: AsRef<str>>(fields: &[S]) -> String {
    let mut line = fields
        .iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str(LINE_END);
    line
}

/// Splits one line into fields, honouring double-quoted cells.
pub fn parse_line(line: &str) -> Vec<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Splits file contents into records. Line breaks inside a quoted field
/// stay part of that field's record.
fn split_records(contents: &str) -> Vec<&str> {
    let mut records = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, byte) in contents.bytes().enumerate() {
        match byte {
            b'"' => in_quotes = !in_quotes,
            b'\n' if !in_quotes => {
                records.push(&contents[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < contents.len() {
        records.push(&contents[start..]);
    }
    records
}

/// Reads a whole file. `Ok(None)` when it does not exist.
pub fn read_table(path: &Path) -> Result<Option<CsvTable>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LasermarkError::file("read", path, e)),
    };

    let mut lines = split_records(&contents)
        .into_iter()
        .filter(|line| !line.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Ok(Some(CsvTable::default()));
    };
    let header = parse_line(header_line.trim_start_matches('\u{feff}'));
    let rows = lines.map(parse_line).collect();
    Ok(Some(CsvTable { header, rows }))
}

/// Number of records (lines after the header). Missing files have none.
pub fn count_rows(path: &Path) -> Result<usize> {
    Ok(read_table(path)?.map_or(0, |table| table.rows.len()))
}

/// Appends records with one open-append-close, writing the header first
/// when the file is new or empty.
pub fn append_rows<S: AsRef<str>>(path: &Path, header: &[&str], rows: &[Vec<S>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| LasermarkError::file("create", parent, e))?;
    }

    let mut buf = String::new();
    let needs_header = fs::metadata(path).map_or(true, |meta| meta.len() == 0);
    if needs_header {
        buf.push_str(&render_row(header));
    }
    for row in rows {
        buf.push_str(&render_row(row));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LasermarkError::file("open", path, e))?;
    file.write_all(buf.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|e| LasermarkError::file("append to", path, e))
}

/// Replaces the file contents via a temp file and rename.
pub fn write_table_atomic<S: AsRef<str>>(path: &Path, header: &[&str], rows: &[Vec<S>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| LasermarkError::file("create", parent, e))?;
    }

    let mut buf = render_row(header);
    for row in rows {
        buf.push_str(&render_row(row));
    }

    let temp = path.with_extension("csv.tmp");
    fs::write(&temp, buf).map_err(|e| LasermarkError::file("write", &temp, e))?;
    fs::rename(&temp, path).map_err(|e| LasermarkError::file("replace", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_only_when_needed() {
        assert_eq!(escape_field("PN123"), "PN123");
        assert_eq!(escape_field("hello, world"), "\"hello, world\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn parses_quoted_fields() {
        assert_eq!(
            parse_line("a,\"b, c\",\"d \"\"e\"\"\",\r\n"),
            vec!["a", "b, c", "d \"e\"", ""]
        );
        assert_eq!(parse_line(""), vec![""]);
    }

    #[test]
    fn append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("Completed.csv");
        let header = ["Time", "JobName"];
        append_rows(&path, &header, &[vec!["10:00:00", "Idler, left"]]).unwrap();
        append_rows(&path, &header, &[vec!["10:00:01", "Idler"]]).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(
            raw,
            "Time,JobName\r\n10:00:00,\"Idler, left\"\r\n10:00:01,Idler\r\n"
        );

        let table = read_table(&path).unwrap().unwrap();
        assert_eq!(table.header, vec!["Time", "JobName"]);
        let names: Vec<_> = table.views().map(|row| row.text("JobName")).collect();
        assert_eq!(names, vec!["Idler, left", "Idler"]);
        assert_eq!(count_rows(&path).unwrap(), 2);
    }

    #[test]
    fn quoted_line_breaks_stay_in_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("History.csv");
        let header = ["Time", "JobName", "Result"];
        append_rows(&path, &header, &[vec!["10:00:00", "Idler\r\nleft", "OK"]]).unwrap();
        append_rows(&path, &header, &[vec!["10:00:01", "Idler", "SIM"]]).unwrap();

        let table = read_table(&path).unwrap().unwrap();
        assert_eq!(table.rows.len(), 2);
        let first = table.views().next().unwrap();
        assert_eq!(first.get("JobName"), Some("Idler\r\nleft"));
        assert_eq!(first.get("Result"), Some("OK"));
        assert_eq!(count_rows(&path).unwrap(), 2);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_table(&dir.path().join("nope.csv")).unwrap(), None);
        assert_eq!(count_rows(&dir.path().join("nope.csv")).unwrap(), 0);
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("CurrentBatch.csv");
        write_table_atomic(&path, &["CODE"], &[vec!["A"], vec!["B"]]).unwrap();
        write_table_atomic::<&str>(&path, &["CODE"], &[]).unwrap();
        let table = read_table(&path).unwrap().unwrap();
        assert_eq!(table.header, vec!["CODE"]);
        assert!(table.rows.is_empty());
        assert!(!path.with_extension("csv.tmp").exists());
    }

    #[test]
    fn row_view_handles_short_rows_and_bom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.csv");
        fs::write(&path, "\u{feff}A,B,C\nonly\n").unwrap();
        let table = read_table(&path).unwrap().unwrap();
        assert!(table.has_columns(&["A", "B", "C"]));
        let row = table.views().next().unwrap();
        assert_eq!(row.get("A"), Some("only"));
        assert_eq!(row.get("C"), None);
        assert_eq!(row.get("Z"), None);
    }
}

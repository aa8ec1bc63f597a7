// 📄 Raw rows - decoded CSV records with their source line numbers
//
// Rows are ephemeral: the normalizer turns them into NormalizedRow or
// RejectedRow and they are dropped.

use crate::error::Result;
use csv::{ReaderBuilder, Trim};

/// One CSV record: ordered cells plus the 1-based line it started on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    pub line: usize,
    pub cells: Vec<String>,
}

impl RawRow {
    pub fn new(line: usize, cells: Vec<String>) -> Self {
        RawRow { line, cells }
    }

    /// Cell by index, `None` when the row is short
    pub fn cell(&self, index: usize) -> Option<&str> {
        self.cells.get(index).map(|s| s.as_str())
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|c| c.trim().is_empty())
    }
}

/// Decode upload bytes: strip a UTF-8 BOM, replace invalid sequences
pub fn decode_upload(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Split content into records using `delimiter`. Blank lines are dropped.
pub fn read_raw_rows(content: &str, delimiter: u8) -> Result<Vec<RawRow>> {
    read_rows_limited(content, delimiter, usize::MAX)
}

/// Like `read_raw_rows` but stops after `limit` non-blank records
pub fn read_rows_limited(content: &str, delimiter: u8, limit: usize) -> Result<Vec<RawRow>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .delimiter(delimiter)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();

    for result in reader.records() {
        if rows.len() >= limit {
            break;
        }

        let record = result?;
        let line = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(rows.len() + 1);

        let row = RawRow::new(line, record.iter().map(|s| s.to_string()).collect());
        if !row.is_blank() {
            rows.push(row);
        }
    }

    Ok(rows)
}

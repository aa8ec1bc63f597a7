// 🧹 Row Normalizer - RawRow + Dialect → canonical row or rejection
//
// A bad row never aborts the batch; it becomes a RejectedRow with its line
// number and reason.

use crate::dialect::{AmountLayout, Dialect};
use crate::error::{RejectReason, RejectedRow, Result};
use crate::models::NormalizedRow;
use crate::raw::{read_raw_rows, RawRow};

/// Outcome of normalizing a whole upload
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub rows: Vec<NormalizedRow>,
    pub rejected: Vec<RejectedRow>,
}

impl NormalizedBatch {
    /// Every non-blank data row, valid or not
    pub fn row_count(&self) -> usize {
        self.rows.len() + self.rejected.len()
    }
}

/// Normalize every data row of `content` in file order
pub fn normalize_content(content: &str, dialect: &Dialect) -> Result<NormalizedBatch> {
    let raw_rows = read_raw_rows(content, dialect.delimiter_byte())?;
    let skip = if dialect.has_header { 1 } else { 0 };

    let mut batch = NormalizedBatch::default();
    for row in raw_rows.iter().skip(skip) {
        match normalize_row(row, dialect) {
            Ok(normalized) => batch.rows.push(normalized),
            Err(reason) => batch.rejected.push(RejectedRow::new(row.line, reason)),
        }
    }

    Ok(batch)
}

/// Map one raw row to a NormalizedRow
pub fn normalize_row(row: &RawRow, dialect: &Dialect) -> std::result::Result<NormalizedRow, RejectReason> {
    let columns = &dialect.columns;

    let raw_date = row
        .cell(columns.date)
        .ok_or_else(|| RejectReason::MissingField("date".to_string()))?;
    let date = dialect
        .date_format
        .parse(raw_date)
        .ok_or_else(|| RejectReason::InvalidDate(raw_date.to_string()))?;

    let amount = match dialect.amount_layout {
        AmountLayout::Signed => signed_amount(row, dialect)?,
        AmountLayout::Split => split_amount(row, dialect)?,
    };
    if amount == 0 {
        return Err(RejectReason::ZeroAmount);
    }

    let description = clean_description(row.cell(columns.description).unwrap_or(""));
    if description.is_empty() {
        return Err(RejectReason::EmptyDescription);
    }

    // A garbled balance is dropped, not a rejection
    let raw_balance = columns
        .balance
        .and_then(|i| row.cell(i))
        .and_then(|v| dialect.decimal.parse_minor(v));

    Ok(NormalizedRow {
        line: row.line,
        date,
        description,
        amount,
        raw_balance,
    })
}

fn signed_amount(row: &RawRow, dialect: &Dialect) -> std::result::Result<i64, RejectReason> {
    let raw = dialect
        .columns
        .amount
        .and_then(|i| row.cell(i))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RejectReason::MissingField("amount".to_string()))?;

    dialect
        .decimal
        .parse_minor(raw)
        .ok_or_else(|| RejectReason::InvalidAmount(raw.to_string()))
}

/// Debit → negative, credit → positive, whatever sign the bank printed.
/// A zero cell counts as empty.
fn split_amount(row: &RawRow, dialect: &Dialect) -> std::result::Result<i64, RejectReason> {
    let read = |index: Option<usize>| -> std::result::Result<Option<i64>, RejectReason> {
        match index.and_then(|i| row.cell(i)).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(raw) => dialect
                .decimal
                .parse_minor(raw)
                .map(|v| Some(v).filter(|&n| n != 0))
                .ok_or_else(|| RejectReason::InvalidAmount(raw.to_string())),
        }
    };

    let debit = read(dialect.columns.debit)?;
    let credit = read(dialect.columns.credit)?;

    match (debit, credit) {
        (Some(_), Some(_)) => Err(RejectReason::ConflictingDebitCredit),
        (Some(d), None) => Ok(-d.abs()),
        (None, Some(c)) => Ok(c.abs()),
        (None, None) => Err(RejectReason::ZeroAmount),
    }
}

/// Trim and collapse internal whitespace
pub fn clean_description(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// TESTS
// ============================================================================

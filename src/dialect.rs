// 🔎 Dialect Detector - figure out how a bank laid out its CSV export
//
// Strategy table first (header synonyms), positional heuristics second.
// The result is an immutable Dialect scoped to one upload.

use crate::banks::{BankProfile, BankRegistry};
use crate::error::{LedgerError, Result};
use crate::raw::{read_rows_limited, RawRow};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Candidate delimiters, in tie-break order
const DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Lines inspected when choosing a delimiter
const DELIMITER_PROBE_LINES: usize = 10;

// ============================================================================
// DATE FORMATS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateFormat {
    /// 2024-01-05
    IsoDate,
    /// 01/05/2024
    MonthDayYear,
    /// 05/01/2024
    DayMonthYear,
    /// 05.01.2024
    DayMonthYearDots,
    /// 2024/01/05
    IsoSlashes,
    /// 01/05/24
    MonthDayShortYear,
    /// 05-01-2024
    DayMonthYearDashes,
    /// 05 Jan 2024
    DayMonthNameYear,
}

impl DateFormat {
    /// Supported patterns in preference order
    pub const ALL: [DateFormat; 8] = [
        DateFormat::IsoDate,
        DateFormat::MonthDayYear,
        DateFormat::DayMonthYear,
        DateFormat::DayMonthYearDots,
        DateFormat::IsoSlashes,
        DateFormat::MonthDayShortYear,
        DateFormat::DayMonthYearDashes,
        DateFormat::DayMonthNameYear,
    ];

    pub fn pattern(&self) -> &'static str {
        match self {
            DateFormat::IsoDate => "%Y-%m-%d",
            DateFormat::MonthDayYear => "%m/%d/%Y",
            DateFormat::DayMonthYear => "%d/%m/%Y",
            DateFormat::DayMonthYearDots => "%d.%m.%Y",
            DateFormat::IsoSlashes => "%Y/%m/%d",
            DateFormat::MonthDayShortYear => "%m/%d/%y",
            DateFormat::DayMonthYearDashes => "%d-%m-%Y",
            DateFormat::DayMonthNameYear => "%d %b %Y",
        }
    }

    /// Parse a cell. Time suffixes ("2024-01-05T10:00", "01/05/2024 09:12")
    /// are ignored; four-digit-year patterns reject implausible years so that
    /// "01/05/24" does not read as year 24.
    pub fn parse(&self, raw: &str) -> Option<NaiveDate> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let candidate = match self {
            DateFormat::DayMonthNameYear => raw,
            DateFormat::IsoDate => raw.split(|c: char| c == 'T' || c.is_whitespace()).next()?,
            _ => raw.split_whitespace().next()?,
        };

        let date = NaiveDate::parse_from_str(candidate, self.pattern()).ok()?;
        if (1900..=2200).contains(&date.year()) {
            Some(date)
        } else {
            None
        }
    }

    /// Does `raw` parse under any supported pattern?
    pub fn any_parses(raw: &str) -> bool {
        DateFormat::ALL.iter().any(|f| f.parse(raw).is_some())
    }
}

// ============================================================================
// DECIMAL STYLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecimalStyle {
    /// 1,234.56
    Dot,
    /// 1.234,56
    Comma,
}

impl DecimalStyle {
    fn separators(&self) -> (char, char) {
        match self {
            DecimalStyle::Dot => ('.', ','),
            DecimalStyle::Comma => (',', '.'),
        }
    }

    /// Parse an amount cell into signed minor units (cents).
    ///
    /// Accepts currency symbols, `(4.50)` and trailing-minus negatives, and
    /// thousands grouping. More than two fraction digits round half away
    /// from zero. Exact decimal arithmetic, no floats.
    pub fn parse_minor(&self, raw: &str) -> Option<i64> {
        let (decimal, thousands) = self.separators();

        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace() && !matches!(c, '$' | '€' | '£' | '¥' | '\''))
            .collect();
        let mut s = cleaned.as_str();
        if s.is_empty() {
            return None;
        }

        let mut negative = false;
        if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
            negative = true;
            s = inner;
        }
        if let Some(rest) = s.strip_prefix('-') {
            negative = !negative;
            s = rest;
        } else if let Some(rest) = s.strip_prefix('+') {
            s = rest;
        } else if let Some(rest) = s.strip_suffix('-') {
            negative = !negative;
            s = rest;
        }

        if s.matches(decimal).count() > 1 {
            return None;
        }
        let (int_part, frac_part) = s.split_once(decimal).unwrap_or((s, ""));

        if int_part.contains(thousands) && !valid_grouping(int_part, thousands) {
            return None;
        }
        let int_digits: String = int_part.chars().filter(|&c| c != thousands).collect();

        if int_digits.is_empty() && frac_part.is_empty() {
            return None;
        }
        if !int_digits.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return None;
        }

        let whole: i64 = if int_digits.is_empty() {
            0
        } else {
            int_digits.parse().ok()?
        };

        let frac_digits: Vec<i64> = frac_part
            .chars()
            .map(|c| c as i64 - '0' as i64)
            .collect();
        let cents = frac_digits.first().copied().unwrap_or(0) * 10
            + frac_digits.get(1).copied().unwrap_or(0);
        let round_up = frac_digits.get(2).map_or(false, |&d| d >= 5);

        let magnitude = whole
            .checked_mul(100)?
            .checked_add(cents)?
            .checked_add(round_up as i64)?;

        Some(if negative { -magnitude } else { magnitude })
    }

    /// Vote on the decimal style from sample cells; Dot wins ties
    pub fn detect<'a>(cells: impl Iterator<Item = &'a str>) -> DecimalStyle {
        let mut comma_votes = 0usize;
        let mut dot_votes = 0usize;

        for cell in cells {
            if ends_with_fraction(cell, ',', '.') {
                comma_votes += 1;
            } else if ends_with_fraction(cell, '.', ',') {
                dot_votes += 1;
            }
        }

        if comma_votes > dot_votes {
            DecimalStyle::Comma
        } else {
            DecimalStyle::Dot
        }
    }
}

/// `1,234,567` style grouping: leading group of 1-3 digits, then groups of 3
fn valid_grouping(int_part: &str, thousands: char) -> bool {
    let groups: Vec<&str> = int_part.split(thousands).collect();
    groups
        .first()
        .map_or(false, |g| (1..=3).contains(&g.len()))
        && groups[1..].iter().all(|g| g.len() == 3)
}

/// Numeric-looking cell whose last `sep` is followed by 1-2 digits and no `other`
fn ends_with_fraction(cell: &str, sep: char, other: char) -> bool {
    let cell = cell.trim().trim_end_matches(')').trim_end_matches('-');
    if !cell
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+' | '(' | '$' | '€' | '£' | ' '))
    {
        return false;
    }

    match cell.rfind(sep) {
        Some(pos) => {
            let tail = &cell[pos + sep.len_utf8()..];
            (1..=2).contains(&tail.len())
                && tail.chars().all(|c| c.is_ascii_digit())
                && !tail.contains(other)
                && cell[..pos].chars().any(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

// ============================================================================
// AMOUNT LAYOUT / COLUMN FIELDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountLayout {
    /// One signed amount column
    Signed,
    /// Separate debit and credit columns, at most one populated per row
    Split,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnField {
    Date,
    Description,
    Amount,
    Debit,
    Credit,
    Balance,
}

impl ColumnField {
    pub const ALL: [ColumnField; 6] = [
        ColumnField::Date,
        ColumnField::Description,
        ColumnField::Amount,
        ColumnField::Debit,
        ColumnField::Credit,
        ColumnField::Balance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ColumnField::Date => "date",
            ColumnField::Description => "description",
            ColumnField::Amount => "amount",
            ColumnField::Debit => "debit",
            ColumnField::Credit => "credit",
            ColumnField::Balance => "balance",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ColumnField::ALL.iter().copied().find(|f| f.name() == name)
    }
}

/// Lowercase, punctuation to spaces, whitespace collapsed
pub fn normalize_header(cell: &str) -> String {
    let spaced: String = cell
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(|c| c.to_lowercase())
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// SYNONYM TABLE
// ============================================================================

/// Known header names per semantic field
#[derive(Debug, Clone)]
pub struct SynonymTable {
    sets: Vec<(ColumnField, Vec<String>)>,
}

impl SynonymTable {
    pub fn new() -> Self {
        let mut table = SynonymTable { sets: Vec::new() };

        table.extend(
            ColumnField::Date,
            &["date", "transaction date", "posting date", "posted date", "trans date",
              "value date", "booking date", "txn date"],
        );
        table.extend(
            ColumnField::Description,
            &["description", "payee", "memo", "details", "narrative",
              "transaction description", "merchant", "name", "reference"],
        );
        table.extend(
            ColumnField::Amount,
            &["amount", "transaction amount", "amount usd", "value", "net amount"],
        );
        table.extend(
            ColumnField::Debit,
            &["debit", "withdrawal", "withdrawals", "debit amount", "money out", "paid out"],
        );
        table.extend(
            ColumnField::Credit,
            &["credit", "deposit", "deposits", "credit amount", "money in", "paid in"],
        );
        table.extend(
            ColumnField::Balance,
            &["balance", "running balance", "running bal", "available balance"],
        );

        table
    }

    /// Add synonyms for a field (normalized on the way in)
    pub fn extend<S: AsRef<str>>(&mut self, field: ColumnField, names: &[S]) {
        let normalized: Vec<String> = names
            .iter()
            .map(|n| normalize_header(n.as_ref()))
            .filter(|n| !n.is_empty())
            .collect();

        match self.sets.iter_mut().find(|(f, _)| *f == field) {
            Some((_, existing)) => {
                for name in normalized {
                    if !existing.contains(&name) {
                        existing.push(name);
                    }
                }
            }
            None => self.sets.push((field, normalized)),
        }
    }

    pub fn field_for(&self, header_cell: &str) -> Option<ColumnField> {
        let normalized = normalize_header(header_cell);
        self.sets
            .iter()
            .find(|(_, names)| names.iter().any(|n| *n == normalized))
            .map(|(field, _)| *field)
    }

    /// First column index per field
    pub fn map_header(&self, cells: &[String]) -> HeaderMatch {
        let mut found = HeaderMatch::default();

        for (index, cell) in cells.iter().enumerate() {
            let slot = match self.field_for(cell) {
                Some(ColumnField::Date) => &mut found.date,
                Some(ColumnField::Description) => &mut found.description,
                Some(ColumnField::Amount) => &mut found.amount,
                Some(ColumnField::Debit) => &mut found.debit,
                Some(ColumnField::Credit) => &mut found.credit,
                Some(ColumnField::Balance) => &mut found.balance,
                None => continue,
            };
            if slot.is_none() {
                *slot = Some(index);
            }
        }

        found
    }
}

impl Default for SynonymTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMatch {
    pub date: Option<usize>,
    pub description: Option<usize>,
    pub amount: Option<usize>,
    pub debit: Option<usize>,
    pub credit: Option<usize>,
    pub balance: Option<usize>,
}

impl HeaderMatch {
    fn split(&self) -> Option<(usize, usize)> {
        Some((self.debit?, self.credit?))
    }

    /// Date, description and at least one amount representation
    fn candidates(&self) -> Option<Candidates> {
        let split = self.split();
        if self.amount.is_none() && split.is_none() {
            return None;
        }

        Some(Candidates {
            has_header: true,
            detected_by: DetectedBy::Header,
            date: self.date?,
            description: self.description?,
            amount: self.amount,
            split,
            balance_signed: self.balance,
            balance_split: self.balance,
        })
    }
}

// ============================================================================
// DIALECT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedBy {
    Header,
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub date: usize,
    pub description: usize,
    pub amount: Option<usize>,
    pub debit: Option<usize>,
    pub credit: Option<usize>,
    pub balance: Option<usize>,
}

/// Detected schema for one upload. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialect {
    pub delimiter: char,
    pub has_header: bool,
    pub columns: ColumnMap,
    pub date_format: DateFormat,
    pub decimal: DecimalStyle,
    pub amount_layout: AmountLayout,
    pub detected_by: DetectedBy,
    /// Bank profile applied from the hint, if any
    pub profile: Option<String>,
}

impl Dialect {
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter as u8
    }

    /// Short human summary, stored on the upload batch
    pub fn describe(&self) -> String {
        let by = match self.detected_by {
            DetectedBy::Header => "header",
            DetectedBy::Heuristic => "heuristic",
        };
        let layout = match self.amount_layout {
            AmountLayout::Signed => "signed amount",
            AmountLayout::Split => "debit/credit",
        };
        let decimal = match self.decimal {
            DecimalStyle::Dot => "dot decimal",
            DecimalStyle::Comma => "comma decimal",
        };
        let delimiter = match self.delimiter {
            '\t' => "tab".to_string(),
            c => format!("'{}'", c),
        };

        let mut summary = format!(
            "{} match, {} delimited, {}, {}, {}",
            by,
            delimiter,
            self.date_format.pattern(),
            layout,
            decimal
        );
        if let Some(profile) = &self.profile {
            summary.push_str(&format!(" ({})", profile));
        }
        summary
    }
}

/// Column guesses before date/decimal/layout are resolved
#[derive(Debug, Clone)]
struct Candidates {
    has_header: bool,
    detected_by: DetectedBy,
    date: usize,
    description: usize,
    amount: Option<usize>,
    split: Option<(usize, usize)>,
    balance_signed: Option<usize>,
    balance_split: Option<usize>,
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct DialectDetector {
    /// Maximum data rows sampled (default: 20)
    pub sample_rows: usize,
    synonyms: SynonymTable,
    banks: BankRegistry,
}

impl DialectDetector {
    pub fn new(sample_rows: usize, synonyms: SynonymTable, banks: BankRegistry) -> Self {
        DialectDetector {
            sample_rows: sample_rows.max(1),
            synonyms,
            banks,
        }
    }

    /// Inspect content and return its dialect. Pure: no side effects.
    pub fn detect(&self, content: &str, hint: Option<&str>) -> Result<Dialect> {
        let profile = self.resolve_hint(hint);

        let delimiter = detect_delimiter(content)?;
        let rows = read_rows_limited(content, delimiter, self.sample_rows + 1)?;
        if rows.is_empty() {
            return Err(LedgerError::UnrecognizedFormat("file is empty".to_string()));
        }

        let candidates = match self.synonyms.map_header(&rows[0].cells).candidates() {
            Some(c) => c,
            None => {
                debug!("header did not match synonyms, falling back to heuristics");
                self.heuristic_candidates(&rows)?
            }
        };

        let samples: Vec<&RawRow> = if candidates.has_header {
            rows.iter().skip(1).collect()
        } else {
            rows.iter().take(self.sample_rows).collect()
        };

        let dialect = resolve(delimiter, candidates, &samples, profile)?;
        debug!(dialect = %dialect.describe(), "dialect detected");
        Ok(dialect)
    }

    fn resolve_hint(&self, hint: Option<&str>) -> Option<&BankProfile> {
        let hint = hint.map(str::trim).filter(|h| !h.is_empty())?;
        let profile = self.banks.find_by_hint(hint);
        if profile.is_none() {
            warn!(hint = %hint, "unknown bank hint ignored");
        }
        profile
    }

    fn heuristic_candidates(&self, rows: &[RawRow]) -> Result<Candidates> {
        let has_header = !rows[0].cells.iter().any(|c| DateFormat::any_parses(c));
        let samples: Vec<&RawRow> = if has_header {
            rows.iter().skip(1).collect()
        } else {
            rows.iter().take(self.sample_rows).collect()
        };
        if samples.is_empty() {
            return Err(LedgerError::UnrecognizedFormat(
                "no data rows to sample".to_string(),
            ));
        }

        let width = samples.iter().map(|r| r.cells.len()).max().unwrap_or(0);

        let date = (0..width)
            .find(|&i| {
                DateFormat::ALL
                    .iter()
                    .any(|f| meets_threshold(&samples, |r| f.parse(cell(r, i)).is_some()))
            })
            .ok_or_else(|| LedgerError::UnrecognizedFormat("no date-like column".to_string()))?;

        let decimal = DecimalStyle::detect(
            samples
                .iter()
                .flat_map(|r| r.cells.iter().enumerate())
                .filter(|(i, _)| *i != date)
                .map(|(_, c)| c.as_str()),
        );

        let amount_like: Vec<usize> = (0..width)
            .filter(|&i| i != date && column_amount_like(&samples, i, decimal))
            .collect();

        let sparse_numeric: Vec<bool> = (0..width)
            .map(|i| {
                i != date
                    && samples.iter().any(|r| !cell(r, i).is_empty())
                    && samples.iter().all(|r| {
                        let v = cell(r, i);
                        v.is_empty() || decimal.parse_minor(v).is_some()
                    })
            })
            .collect();

        // Debit column first by convention
        let split = (0..width.saturating_sub(1))
            .find(|&i| {
                sparse_numeric[i] && sparse_numeric[i + 1] && split_like(&samples, i, i + 1, decimal)
            })
            .map(|i| (i, i + 1));

        // A fully populated column after the pair is a balance, not an amount
        let amount = amount_like
            .iter()
            .copied()
            .find(|&i| split.map_or(true, |(_, credit)| i <= credit));

        if amount.is_none() && split.is_none() {
            return Err(LedgerError::UnrecognizedFormat(
                "no amount-like column".to_string(),
            ));
        }

        let balance_signed = amount.and_then(|a| {
            amount_like
                .iter()
                .copied()
                .find(|&i| i > a && split.map_or(true, |(d, c)| i != d && i != c))
        });
        let balance_split = split.and_then(|(_, c)| amount_like.iter().copied().find(|&i| i > c));

        let mut used = vec![date];
        used.extend(amount);
        if let Some((d, c)) = split {
            used.push(d);
            used.push(c);
        }
        used.extend(balance_signed);
        used.extend(balance_split);

        let description = best_text_column(&samples, width, &used, decimal).ok_or_else(|| {
            LedgerError::UnrecognizedFormat("no description-like column".to_string())
        })?;

        Ok(Candidates {
            has_header,
            detected_by: DetectedBy::Heuristic,
            date,
            description,
            amount,
            split,
            balance_signed,
            balance_split,
        })
    }
}

impl Default for DialectDetector {
    fn default() -> Self {
        DialectDetector::new(20, SynonymTable::new(), BankRegistry::new())
    }
}

/// Settle date pattern, decimal style and amount layout for the candidates
fn resolve(
    delimiter: u8,
    c: Candidates,
    samples: &[&RawRow],
    profile: Option<&BankProfile>,
) -> Result<Dialect> {
    if samples.is_empty() {
        return Err(LedgerError::UnrecognizedFormat(
            "no data rows to sample".to_string(),
        ));
    }

    let date_format = choose_date_format(samples, c.date, profile).ok_or_else(|| {
        LedgerError::UnrecognizedFormat(format!(
            "column {} does not hold dates in a supported pattern",
            c.date + 1
        ))
    })?;

    let mut amount_columns: Vec<usize> = c.amount.into_iter().collect();
    if let Some((d, cr)) = c.split {
        amount_columns.push(d);
        amount_columns.push(cr);
    }
    let decimal = DecimalStyle::detect(
        samples
            .iter()
            .flat_map(|r| amount_columns.iter().map(move |&i| cell(r, i))),
    );

    let layout = match (c.amount, c.split) {
        (Some(amount), Some((debit, credit))) => {
            let signed_ok = column_amount_like(samples, amount, decimal);
            let split_ok = split_like(samples, debit, credit, decimal);
            match (signed_ok, split_ok) {
                (true, true) => match profile.and_then(|p| p.amount_layout) {
                    Some(layout) => layout,
                    None => {
                        return Err(LedgerError::AmbiguousAmountColumns(format!(
                            "column {} reads as a signed amount and columns {}/{} as debit/credit; supply a bank hint",
                            amount + 1,
                            debit + 1,
                            credit + 1
                        )))
                    }
                },
                (true, false) => AmountLayout::Signed,
                (false, true) => AmountLayout::Split,
                (false, false) => {
                    return Err(LedgerError::UnrecognizedFormat(
                        "no column parses as an amount".to_string(),
                    ))
                }
            }
        }
        (Some(_), None) => AmountLayout::Signed,
        (None, Some(_)) => AmountLayout::Split,
        (None, None) => {
            return Err(LedgerError::UnrecognizedFormat(
                "no amount column".to_string(),
            ))
        }
    };

    let columns = match layout {
        AmountLayout::Signed => ColumnMap {
            date: c.date,
            description: c.description,
            amount: c.amount,
            debit: None,
            credit: None,
            balance: c.balance_signed,
        },
        AmountLayout::Split => ColumnMap {
            date: c.date,
            description: c.description,
            amount: None,
            debit: c.split.map(|(d, _)| d),
            credit: c.split.map(|(_, cr)| cr),
            balance: c.balance_split,
        },
    };

    Ok(Dialect {
        delimiter: delimiter as char,
        has_header: c.has_header,
        columns,
        date_format,
        decimal,
        amount_layout: layout,
        detected_by: c.detected_by,
        profile: profile.map(|p| p.canonical_name.clone()),
    })
}

/// Pick the delimiter that yields the most rows with a consistent width > 1
pub fn detect_delimiter(content: &str) -> Result<u8> {
    let mut best: Option<(u8, usize, usize)> = None;

    for &delimiter in &DELIMITERS {
        let rows = read_rows_limited(content, delimiter, DELIMITER_PROBE_LINES)?;
        let widths: Vec<usize> = rows.iter().map(|r| r.cells.len()).collect();

        let modal = modal_width(&widths);
        if modal < 2 {
            continue;
        }
        let score = widths.iter().filter(|&&w| w == modal).count();

        let better = best.map_or(true, |(_, best_score, best_modal)| {
            (score, modal) > (best_score, best_modal)
        });
        if better {
            best = Some((delimiter, score, modal));
        }
    }

    best.map(|(d, _, _)| d).ok_or_else(|| {
        LedgerError::UnrecognizedFormat("could not find a column delimiter".to_string())
    })
}

fn modal_width(widths: &[usize]) -> usize {
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for &w in widths {
        match counts.iter_mut().find(|(width, _)| *width == w) {
            Some((_, n)) => *n += 1,
            None => counts.push((w, 1)),
        }
    }
    counts
        .into_iter()
        .max_by_key(|&(width, n)| (n, width))
        .map(|(width, _)| width)
        .unwrap_or(0)
}

fn cell<'a>(row: &'a RawRow, index: usize) -> &'a str {
    row.cell(index).unwrap_or("")
}

/// At least 90% of sampled rows satisfy `pred`
fn meets_threshold(samples: &[&RawRow], pred: impl Fn(&RawRow) -> bool) -> bool {
    let total = samples.len();
    let hits = samples.iter().filter(|&&r| pred(r)).count();
    total > 0 && hits * 10 >= total * 9
}

fn column_amount_like(samples: &[&RawRow], index: usize, decimal: DecimalStyle) -> bool {
    meets_threshold(samples, |r| decimal.parse_minor(cell(r, index)).is_some())
}

/// Exactly one of the two cells carries a non-zero amount
fn split_like(samples: &[&RawRow], debit: usize, credit: usize, decimal: DecimalStyle) -> bool {
    meets_threshold(samples, |r| {
        let populated = [debit, credit]
            .iter()
            .map(|&i| cell(r, i))
            .filter(|v| !v.is_empty())
            .map(|v| decimal.parse_minor(v))
            .collect::<Vec<_>>();

        populated.iter().all(|v| v.is_some())
            && populated.iter().filter(|v| matches!(v, Some(n) if *n != 0)).count() == 1
    })
}

fn choose_date_format(
    samples: &[&RawRow],
    index: usize,
    profile: Option<&BankProfile>,
) -> Option<DateFormat> {
    let passing: Vec<DateFormat> = DateFormat::ALL
        .iter()
        .copied()
        .filter(|f| meets_threshold(samples, |r| f.parse(cell(r, index)).is_some()))
        .collect();

    profile
        .and_then(|p| p.date_format)
        .filter(|preferred| passing.contains(preferred))
        .or_else(|| passing.first().copied())
}

/// Column with the longest average free text, populated in at least half the rows
fn best_text_column(
    samples: &[&RawRow],
    width: usize,
    used: &[usize],
    decimal: DecimalStyle,
) -> Option<usize> {
    let mut best: Option<(usize, usize, usize)> = None;

    for i in (0..width).filter(|i| !used.contains(i)) {
        let texts: Vec<&str> = samples
            .iter()
            .map(|r| cell(r, i))
            .filter(|v| !v.is_empty() && decimal.parse_minor(v).is_none() && !DateFormat::any_parses(v))
            .collect();

        if texts.is_empty() || texts.len() * 2 < samples.len() {
            continue;
        }

        let total_len: usize = texts.iter().map(|t| t.chars().count()).sum();
        let count = texts.len();

        // Compare averages without floats: a/b > c/d  <=>  a*d > c*b
        let better = best.map_or(true, |(_, best_total, best_count)| {
            total_len * best_count > best_total * count
        });
        if better {
            best = Some((i, total_len, count));
        }
    }

    best.map(|(i, _, _)| i)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(content: &str) -> Result<Dialect> {
        DialectDetector::default().detect(content, None)
    }

    #[test]
    fn test_header_signed_amount() {
        let csv = "Date,Description,Amount\n2024-01-05,Coffee Shop,-4.50\n2024-01-05,Coffee Shop,-4.50\n2024-01-06,Salary,2000.00\n";
        let d = detect(csv).unwrap();

        assert_eq!(d.detected_by, DetectedBy::Header);
        assert!(d.has_header);
        assert_eq!(d.date_format, DateFormat::IsoDate);
        assert_eq!(d.amount_layout, AmountLayout::Signed);
        assert_eq!(d.decimal, DecimalStyle::Dot);
        assert_eq!(d.columns.date, 0);
        assert_eq!(d.columns.description, 1);
        assert_eq!(d.columns.amount, Some(2));
    }

    #[test]
    fn test_header_split_columns_with_balance() {
        let csv = "Posted Date,Payee,Debit,Credit,Running Bal.\n\
                   01/05/2024,Coffee Shop,4.50,,995.50\n\
                   01/06/2024,Salary,,2000.00,2995.50\n";
        let d = detect(csv).unwrap();

        assert_eq!(d.amount_layout, AmountLayout::Split);
        assert_eq!(d.columns.debit, Some(2));
        assert_eq!(d.columns.credit, Some(3));
        assert_eq!(d.columns.balance, Some(4));
        assert_eq!(d.date_format, DateFormat::MonthDayYear);
    }

    #[test]
    fn test_semicolon_comma_decimal() {
        let csv = "Booking Date;Narrative;Amount\n05.01.2024;Kaffee;-4,50\n06.01.2024;Gehalt;1.234,56\n";
        let d = detect(csv).unwrap();

        assert_eq!(d.delimiter, ';');
        assert_eq!(d.decimal, DecimalStyle::Comma);
        assert_eq!(d.date_format, DateFormat::DayMonthYearDots);
    }

    #[test]
    fn test_headerless_heuristic() {
        let csv = "01/05/2024,-4.50,*,,COFFEE SHOP 123\n01/06/2024,2000.00,*,,ACME PAYROLL\n01/07/2024,-12.00,*,,GROCERY STORE\n";
        let d = detect(csv).unwrap();

        assert_eq!(d.detected_by, DetectedBy::Heuristic);
        assert!(!d.has_header);
        assert_eq!(d.columns.date, 0);
        assert_eq!(d.columns.amount, Some(1));
        assert_eq!(d.columns.description, 4);
    }

    #[test]
    fn test_unmatched_header_uses_heuristic_and_skips_header() {
        let csv = "Buchungstag,Verwendungszweck,Umsatz,Saldo\n\
                   2024-01-05,Kaffee Haus,-4.50,995.50\n\
                   2024-01-06,Gehalt ACME,2000.00,2995.50\n";
        let d = detect(csv).unwrap();

        assert_eq!(d.detected_by, DetectedBy::Heuristic);
        assert!(d.has_header);
        assert_eq!(d.columns.amount, Some(2));
        assert_eq!(d.columns.balance, Some(3));
        assert_eq!(d.amount_layout, AmountLayout::Signed);
    }

    #[test]
    fn test_zero_filled_pair_is_ambiguous_without_hint() {
        let csv = "2024-01-05,Coffee Shop,4.50,0.00\n2024-01-06,Salary,0.00,2000.00\n2024-01-07,Rent,900.00,0.00\n";
        let err = detect(csv).unwrap_err();
        assert!(matches!(err, LedgerError::AmbiguousAmountColumns(_)));
    }

    #[test]
    fn test_hint_resolves_ambiguity() {
        let csv = "2024-01-05,Coffee Shop,4.50,0.00\n2024-01-06,Salary,0.00,2000.00\n2024-01-07,Rent,900.00,0.00\n";
        let d = DialectDetector::default().detect(csv, Some("Barclays")).unwrap();

        assert_eq!(d.amount_layout, AmountLayout::Split);
        assert_eq!(d.profile.as_deref(), Some("Barclays"));
        assert_eq!(d.columns.debit, Some(2));
        assert_eq!(d.columns.credit, Some(3));
    }

    #[test]
    fn test_hint_prefers_day_first_dates() {
        let csv = "Date,Description,Amount\n05/01/2024,Coffee,-4.50\n06/01/2024,Salary,2000.00\n";

        let us = DialectDetector::default().detect(csv, None).unwrap();
        assert_eq!(us.date_format, DateFormat::MonthDayYear);

        let uk = DialectDetector::default().detect(csv, Some("monzo")).unwrap();
        assert_eq!(uk.date_format, DateFormat::DayMonthYear);
    }

    #[test]
    fn test_unrecognized_formats() {
        assert!(matches!(detect(""), Err(LedgerError::UnrecognizedFormat(_))));
        assert!(matches!(
            detect("just one column\nanother line\n"),
            Err(LedgerError::UnrecognizedFormat(_))
        ));
        assert!(matches!(
            detect("a,b,c\nfoo,bar,baz\nqux,quux,corge\n"),
            Err(LedgerError::UnrecognizedFormat(_))
        ));
    }

    #[test]
    fn test_header_only_file() {
        let err = detect("Date,Description,Amount\n").unwrap_err();
        assert!(matches!(err, LedgerError::UnrecognizedFormat(_)));
    }

    #[test]
    fn test_parse_minor_units() {
        let dot = DecimalStyle::Dot;
        assert_eq!(dot.parse_minor("-4.50"), Some(-450));
        assert_eq!(dot.parse_minor("2000.00"), Some(200000));
        assert_eq!(dot.parse_minor("$1,234.56"), Some(123456));
        assert_eq!(dot.parse_minor("(12.30)"), Some(-1230));
        assert_eq!(dot.parse_minor("12.30-"), Some(-1230));
        assert_eq!(dot.parse_minor("-$855.94"), Some(-85594));
        assert_eq!(dot.parse_minor("7"), Some(700));
        assert_eq!(dot.parse_minor(".5"), Some(50));
        assert_eq!(dot.parse_minor("1.005"), Some(101));
        assert_eq!(dot.parse_minor("-1.005"), Some(-101));
        assert_eq!(dot.parse_minor("1.004"), Some(100));
        assert_eq!(dot.parse_minor("1,23"), None);
        assert_eq!(dot.parse_minor("1.2.3"), None);
        assert_eq!(dot.parse_minor("abc"), None);
        assert_eq!(dot.parse_minor(""), None);

        let comma = DecimalStyle::Comma;
        assert_eq!(comma.parse_minor("1.234,56"), Some(123456));
        assert_eq!(comma.parse_minor("-4,5"), Some(-450));
    }

    #[test]
    fn test_date_formats() {
        assert_eq!(
            DateFormat::IsoDate.parse("2024-01-05T10:00:00"),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(DateFormat::MonthDayYear.parse("01/05/24"), None);
        assert_eq!(
            DateFormat::MonthDayShortYear.parse("01/05/24"),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(
            DateFormat::DayMonthNameYear.parse("05 Jan 2024"),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(DateFormat::IsoDate.parse("2024-02-30"), None);
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("  Running Bal. "), "running bal");
        assert_eq!(normalize_header("Amount (USD)"), "amount usd");
        assert_eq!(normalize_header("Trans._Date"), "trans date");
    }

    #[test]
    fn test_synonym_extension() {
        let mut table = SynonymTable::new();
        assert_eq!(table.field_for("Buchungstag"), None);

        table.extend(ColumnField::Date, &["Buchungstag"]);
        assert_eq!(table.field_for("buchungstag"), Some(ColumnField::Date));
        assert_eq!(ColumnField::from_name("credit"), Some(ColumnField::Credit));
    }

    #[test]
    fn test_describe() {
        let d = detect("Date,Description,Amount\n2024-01-05,Coffee,-4.50\n").unwrap();
        assert_eq!(
            d.describe(),
            "header match, ',' delimited, %Y-%m-%d, signed amount, dot decimal"
        );
    }
}

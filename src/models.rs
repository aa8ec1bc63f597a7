// 📦 Domain model - canonical transactions, upload batches, sessions
//
// Amounts are signed minor units (cents): negative = money out.

use crate::error::RejectedRow;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// USER IDENTITY
// ============================================================================

/// Opaque user identity. Only ever produced by the authenticator or the
/// user directory; request payloads never carry one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn generate() -> Self {
        UserId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Debit,
    Credit,
}

/// A row that survived normalization but has not been fingerprinted yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub line: usize,
    pub date: NaiveDate,
    pub description: String,
    pub amount: i64,
    pub raw_balance: Option<i64>,
}

impl NormalizedRow {
    pub fn direction(&self) -> Direction {
        direction_of(self.amount)
    }
}

/// Canonical, persisted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Stable identity (UUID)
    pub id: String,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub description: String,
    /// Minor units, never zero
    pub amount: i64,
    pub raw_balance: Option<i64>,
    /// Upload that first introduced this transaction
    pub source_upload_id: String,
    pub source_line: usize,
    pub base_fingerprint: String,
    pub occurrence: u32,
    /// `base_fingerprint:occurrence`
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn direction(&self) -> Direction {
        direction_of(self.amount)
    }

    /// Amount as a display string, e.g. `-4.50`
    pub fn amount_display(&self) -> String {
        format_minor(self.amount)
    }
}

fn direction_of(amount: i64) -> Direction {
    if amount < 0 {
        Direction::Debit
    } else {
        Direction::Credit
    }
}

/// Render minor units with two decimals
pub fn format_minor(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

// ============================================================================
// UPLOAD BATCH
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Completed,
    /// A fatal store error stopped the batch; a prefix may have been accepted
    Aborted,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Completed => "completed",
            BatchStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(BatchStatus::Completed),
            "aborted" => Some(BatchStatus::Aborted),
            _ => None,
        }
    }
}

/// Immutable audit record of one upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadBatch {
    pub upload_id: String,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub source_filename: String,
    /// Short human description of the detected dialect
    pub dialect: String,
    /// Normalized plus rejected rows
    pub row_count: usize,
    pub accepted_count: usize,
    pub duplicate_count: usize,
    pub rejected_count: usize,
    pub rejected: Vec<RejectedRow>,
    pub status: BatchStatus,
}

/// Identity of an upload before reconciliation runs
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub upload_id: String,
    pub source_filename: String,
    pub dialect: String,
}

impl UploadContext {
    pub fn new(source_filename: impl Into<String>, dialect: impl Into<String>) -> Self {
        UploadContext {
            upload_id: uuid::Uuid::new_v4().to_string(),
            source_filename: source_filename.into(),
            dialect: dialect.into(),
        }
    }
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ============================================================================
// QUERY FILTER
// ============================================================================

/// Listing filter; all bounds inclusive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub min_amount: Option<i64>,
    pub max_amount: Option<i64>,
    pub upload_id: Option<String>,
    pub limit: Option<usize>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.from.map_or(true, |d| tx.date >= d)
            && self.to.map_or(true, |d| tx.date <= d)
            && self.min_amount.map_or(true, |a| tx.amount >= a)
            && self.max_amount.map_or(true, |a| tx.amount <= a)
            && self
                .upload_id
                .as_ref()
                .map_or(true, |u| &tx.source_upload_id == u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(date: &str, amount: i64) -> Transaction {
        Transaction {
            id: "t1".to_string(),
            user_id: UserId::new("u1"),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            description: "Coffee Shop".to_string(),
            amount,
            raw_balance: None,
            source_upload_id: "up1".to_string(),
            source_line: 2,
            base_fingerprint: "abc".to_string(),
            occurrence: 0,
            fingerprint: "abc:0".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_direction_from_sign() {
        assert_eq!(tx("2024-01-05", -450).direction(), Direction::Debit);
        assert_eq!(tx("2024-01-05", 200000).direction(), Direction::Credit);
    }

    #[test]
    fn test_format_minor() {
        assert_eq!(format_minor(-450), "-4.50");
        assert_eq!(format_minor(200000), "2000.00");
        assert_eq!(format_minor(-5), "-0.05");
    }

    #[test]
    fn test_filter_bounds_inclusive() {
        let filter = TransactionFilter {
            from: NaiveDate::from_ymd_opt(2024, 1, 5),
            to: NaiveDate::from_ymd_opt(2024, 1, 6),
            max_amount: Some(0),
            ..Default::default()
        };

        assert!(filter.matches(&tx("2024-01-05", -450)));
        assert!(!filter.matches(&tx("2024-01-05", 450)));
        assert!(!filter.matches(&tx("2024-01-07", -450)));
    }

    #[test]
    fn test_batch_status_round_trip_names() {
        assert_eq!(BatchStatus::parse("aborted"), Some(BatchStatus::Aborted));
        assert_eq!(BatchStatus::Completed.as_str(), "completed");
        assert_eq!(BatchStatus::parse("bogus"), None);
    }
}

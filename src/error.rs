// 🚨 Error taxonomy - upload-fatal, row-level, store and auth failures
//
// Row-level problems never become a LedgerError: they are collected as
// RejectedRow values and travel inside the upload result.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// LEDGER ERROR
// ============================================================================

#[derive(Error, Debug)]
pub enum LedgerError {
    /// No header synonym set or heuristic could place the columns
    #[error("Unrecognized CSV format: {0}")]
    UnrecognizedFormat(String),

    /// Both a signed amount column and a debit/credit pair look valid
    #[error("Ambiguous amount columns: {0}")]
    AmbiguousAmountColumns(String),

    /// Store disagrees with the occurrence-index bookkeeping
    #[error("Reconciliation inconsistency: {0}")]
    ReconciliationInconsistency(String),

    /// Store timed out or was busy after bounded retries
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session invalid")]
    SessionInvalid,

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl LedgerError {
    /// Authentication failures are answered with a 401 at the boundary
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidCredentials | LedgerError::SessionExpired | LedgerError::SessionInvalid
        )
    }

    /// Upload-fatal format problems (nothing was persisted)
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            LedgerError::UnrecognizedFormat(_) | LedgerError::AmbiguousAmountColumns(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

// ============================================================================
// STORE ERROR
// ============================================================================

/// Failure modes of the transaction store contract
#[derive(Error, Debug)]
pub enum StoreError {
    /// Final fingerprint already present for this user
    #[error("Conflict: fingerprint {0} already exists")]
    Conflict(String),

    /// Busy, locked or timed out; worth retrying
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Db(rusqlite::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Unavailable(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => StoreError::Db(err),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => LedgerError::StoreUnavailable(msg),
            StoreError::Conflict(fp) => LedgerError::ReconciliationInconsistency(format!(
                "unexpected conflict on fingerprint {}",
                fp
            )),
            StoreError::Db(e) => LedgerError::Db(e),
            StoreError::Corrupt(msg) => LedgerError::Other(msg),
        }
    }
}

// ============================================================================
// ROW REJECTION
// ============================================================================

/// Why a single row was skipped (non-fatal)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum RejectReason {
    MissingField(String),
    InvalidDate(String),
    InvalidAmount(String),
    ZeroAmount,
    EmptyDescription,
    ConflictingDebitCredit,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MissingField(field) => write!(f, "missing {} column", field),
            RejectReason::InvalidDate(raw) => write!(f, "unparseable date '{}'", raw),
            RejectReason::InvalidAmount(raw) => write!(f, "unparseable amount '{}'", raw),
            RejectReason::ZeroAmount => write!(f, "amount is zero"),
            RejectReason::EmptyDescription => write!(f, "description is empty"),
            RejectReason::ConflictingDebitCredit => {
                write!(f, "both debit and credit are populated")
            }
        }
    }
}

/// A rejected line, kept on the upload batch for audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub line: usize,
    pub reason: RejectReason,
}

impl RejectedRow {
    pub fn new(line: usize, reason: RejectReason) -> Self {
        RejectedRow { line, reason }
    }
}

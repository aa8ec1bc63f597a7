// Statement Ledger - Core Library
// Bank CSV ingestion with per-user idempotent reconciliation.
// Exposes all modules for use in the CLI, the API server, and tests.

pub mod error;
pub mod models;
pub mod raw;
pub mod banks;
pub mod dialect;
pub mod normalizer;
pub mod fingerprint;
pub mod store;
pub mod db;
pub mod reconcile;
pub mod auth;
pub mod config;
pub mod service;

// Re-export commonly used types
pub use error::{LedgerError, RejectReason, RejectedRow, Result, StoreError};
pub use models::{
    BatchStatus, Direction, NormalizedRow, Session, Transaction, TransactionFilter,
    UploadBatch, UploadContext, UserId,
};
pub use banks::{BankProfile, BankRegistry};
pub use dialect::{
    AmountLayout, ColumnField, ColumnMap, DateFormat, DecimalStyle, DetectedBy, Dialect,
    DialectDetector, SynonymTable,
};
pub use normalizer::{normalize_content, normalize_row, NormalizedBatch};
pub use fingerprint::{base_fingerprint, final_fingerprint};
pub use store::{StoreResult, TransactionStore, UserDirectory, UserRecord};
pub use db::SqliteStore;
pub use reconcile::{ReconcileOutcome, ReconciliationEngine, RetryPolicy};
pub use auth::{Credentials, SessionAuthenticator};
pub use config::AppConfig;
pub use service::{IngestService, UploadSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
/// Safe to call more than once.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

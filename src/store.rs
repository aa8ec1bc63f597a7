// 🗄️ Store contract - what the engine and authenticator need from persistence
//
// The engine only talks to these traits. `db::SqliteStore` is the shipped
// implementation; tests swap in fakes to simulate races and outages.

use crate::error::StoreError;
use crate::models::{Transaction, TransactionFilter, UploadBatch, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence contract for reconciled transactions and upload audit records
pub trait TransactionStore: Send + Sync {
    /// Stored transactions for `user` sharing a base fingerprint
    fn count_by_base_fingerprint(&self, user: &UserId, base: &str) -> StoreResult<u64>;

    /// Is this final fingerprint already stored for `user`?
    fn exists(&self, user: &UserId, fingerprint: &str) -> StoreResult<bool>;

    fn find_by_fingerprint(&self, user: &UserId, fingerprint: &str) -> StoreResult<Option<Transaction>>;

    /// Insert one fully built record. `Conflict` if the fingerprint exists.
    fn insert(&self, tx: &Transaction) -> StoreResult<()>;

    fn record_upload_batch(&self, batch: &UploadBatch) -> StoreResult<()>;

    /// Ordered by date, then insertion order
    fn list_transactions(&self, user: &UserId, filter: &TransactionFilter) -> StoreResult<Vec<Transaction>>;

    /// Newest first
    fn list_upload_batches(&self, user: &UserId) -> StoreResult<Vec<UploadBatch>>;
}

/// Stored credentials; the password itself is never kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: String,
    /// B64 random salt, also embedded in the PHC string
    pub salt: String,
    /// Argon2id PHC string
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Credential lookup used by the session authenticator
pub trait UserDirectory: Send + Sync {
    fn find_user(&self, username: &str) -> StoreResult<Option<UserRecord>>;

    /// `Conflict` if the username is taken
    fn insert_user(&self, record: &UserRecord) -> StoreResult<()>;
}

// ============================================================================
// IN-MEMORY FAKE (tests only)
// ============================================================================

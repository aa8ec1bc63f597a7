// 💾 SQLite store - WAL-mode implementation of the store contract
//
// Every accepted transaction is a single INSERT, so an interrupted upload
// leaves whole records or nothing. UNIQUE(user_id, fingerprint) is the
// safety net under races.

use crate::error::{RejectedRow, Result, StoreError};
use crate::models::{BatchStatus, Transaction, TransactionFilter, UploadBatch, UserId};
use crate::store::{StoreResult, TransactionStore, UserDirectory, UserRecord};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{ffi, params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const TRANSACTION_COLUMNS: &str = "tx_uuid, user_id, date, description, amount, raw_balance,
    source_upload_id, source_line, base_fingerprint, occurrence, fingerprint, created_at";

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Users (credentials only; no plaintext passwords)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Upload batches (immutable audit trail, one row per upload call)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_batches (
            upload_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            source_filename TEXT NOT NULL,
            dialect TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            accepted_count INTEGER NOT NULL,
            duplicate_count INTEGER NOT NULL,
            rejected_count INTEGER NOT NULL,
            rejected TEXT NOT NULL,
            status TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Transactions
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tx_uuid TEXT UNIQUE NOT NULL,
            user_id TEXT NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            amount INTEGER NOT NULL CHECK (amount <> 0),
            raw_balance INTEGER,
            source_upload_id TEXT NOT NULL,
            source_line INTEGER NOT NULL,
            base_fingerprint TEXT NOT NULL,
            occurrence INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (user_id, fingerprint)
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_base_fingerprint ON transactions(user_id, base_fingerprint)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_date ON transactions(user_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batches_user ON upload_batches(user_id, timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        debug!(path = %path.display(), "opened sqlite store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))
    }

    pub fn count_transactions(&self, user: &UserId) -> StoreResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE user_id = ?1",
            [user.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn conversion_error(index: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn parse_timestamp(row: &Row, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(index, e))
}

fn transaction_from_row(row: &Row) -> rusqlite::Result<Transaction> {
    let date_raw: String = row.get(2)?;
    let date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d").map_err(|e| conversion_error(2, e))?;
    let source_line: i64 = row.get(7)?;
    let occurrence: i64 = row.get(9)?;

    Ok(Transaction {
        id: row.get(0)?,
        user_id: UserId::new(row.get::<_, String>(1)?),
        date,
        description: row.get(3)?,
        amount: row.get(4)?,
        raw_balance: row.get(5)?,
        source_upload_id: row.get(6)?,
        source_line: source_line as usize,
        base_fingerprint: row.get(8)?,
        occurrence: occurrence as u32,
        fingerprint: row.get(10)?,
        created_at: parse_timestamp(row, 11)?,
    })
}

fn batch_from_row(row: &Row) -> rusqlite::Result<UploadBatch> {
    let rejected_json: String = row.get(9)?;
    let rejected: Vec<RejectedRow> =
        serde_json::from_str(&rejected_json).map_err(|e| conversion_error(9, e))?;
    let status_raw: String = row.get(10)?;
    let status = BatchStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(10, Type::Text, format!("bad status {}", status_raw).into())
    })?;
    let count = |i: usize| -> rusqlite::Result<usize> { Ok(row.get::<_, i64>(i)? as usize) };

    Ok(UploadBatch {
        upload_id: row.get(0)?,
        user_id: UserId::new(row.get::<_, String>(1)?),
        timestamp: parse_timestamp(row, 2)?,
        source_filename: row.get(3)?,
        dialect: row.get(4)?,
        row_count: count(5)?,
        accepted_count: count(6)?,
        duplicate_count: count(7)?,
        rejected_count: count(8)?,
        rejected,
        status,
    })
}

const FINGERPRINT_KEY: &str = "transactions.user_id, transactions.fingerprint";
const UPLOAD_KEY: &str = "upload_batches.upload_id";
const USERNAME_KEY: &str = "users.username";

/// Uniqueness failure on `key`. CHECK and other UNIQUE failures stay `Db`.
fn violates_unique(err: &rusqlite::Error, key: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg)) => {
            matches!(
                e.extended_code,
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ) && msg.contains(key)
        }
        _ => false,
    }
}

impl TransactionStore for SqliteStore {
    fn count_by_base_fingerprint(&self, user: &UserId, base: &str) -> StoreResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE user_id = ?1 AND base_fingerprint = ?2",
            params![user.as_str(), base],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn exists(&self, user: &UserId, fingerprint: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM transactions WHERE user_id = ?1 AND fingerprint = ?2",
        )?;
        Ok(stmt.exists(params![user.as_str(), fingerprint])?)
    }

    fn find_by_fingerprint(&self, user: &UserId, fingerprint: &str) -> StoreResult<Option<Transaction>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM transactions WHERE user_id = ?1 AND fingerprint = ?2",
            TRANSACTION_COLUMNS
        );
        let tx = conn
            .query_row(&sql, params![user.as_str(), fingerprint], transaction_from_row)
            .optional()?;
        Ok(tx)
    }

    fn insert(&self, tx: &Transaction) -> StoreResult<()> {
        let conn = self.conn()?;
        let result = conn.execute(
            &format!(
                "INSERT INTO transactions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                TRANSACTION_COLUMNS
            ),
            params![
                tx.id,
                tx.user_id.as_str(),
                tx.date.format("%Y-%m-%d").to_string(),
                tx.description,
                tx.amount,
                tx.raw_balance,
                tx.source_upload_id,
                tx.source_line as i64,
                tx.base_fingerprint,
                tx.occurrence as i64,
                tx.fingerprint,
                tx.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if violates_unique(&e, FINGERPRINT_KEY) => Err(StoreError::Conflict(tx.fingerprint.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn record_upload_batch(&self, batch: &UploadBatch) -> StoreResult<()> {
        let rejected_json = serde_json::to_string(&batch.rejected)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO upload_batches (
                upload_id, user_id, timestamp, source_filename, dialect, row_count,
                accepted_count, duplicate_count, rejected_count, rejected, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                batch.upload_id,
                batch.user_id.as_str(),
                batch.timestamp.to_rfc3339(),
                batch.source_filename,
                batch.dialect,
                batch.row_count as i64,
                batch.accepted_count as i64,
                batch.duplicate_count as i64,
                batch.rejected_count as i64,
                rejected_json,
                batch.status.as_str(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if violates_unique(&e, UPLOAD_KEY) => Err(StoreError::Conflict(batch.upload_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn list_transactions(&self, user: &UserId, filter: &TransactionFilter) -> StoreResult<Vec<Transaction>> {
        let mut sql = format!("SELECT {} FROM transactions WHERE user_id = ?", TRANSACTION_COLUMNS);
        let mut values: Vec<Value> = vec![Value::Text(user.as_str().to_string())];

        if let Some(from) = filter.from {
            sql.push_str(" AND date >= ?");
            values.push(Value::Text(from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND date <= ?");
            values.push(Value::Text(to.format("%Y-%m-%d").to_string()));
        }
        if let Some(min) = filter.min_amount {
            sql.push_str(" AND amount >= ?");
            values.push(Value::Integer(min));
        }
        if let Some(max) = filter.max_amount {
            sql.push_str(" AND amount <= ?");
            values.push(Value::Integer(max));
        }
        if let Some(upload_id) = &filter.upload_id {
            sql.push_str(" AND source_upload_id = ?");
            values.push(Value::Text(upload_id.clone()));
        }
        sql.push_str(" ORDER BY date ASC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let transactions = stmt
            .query_map(params_from_iter(values.iter()), transaction_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(transactions)
    }

    fn list_upload_batches(&self, user: &UserId) -> StoreResult<Vec<UploadBatch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT upload_id, user_id, timestamp, source_filename, dialect, row_count,
                    accepted_count, duplicate_count, rejected_count, rejected, status
             FROM upload_batches
             WHERE user_id = ?1
             ORDER BY timestamp DESC",
        )?;

        let batches = stmt
            .query_map([user.as_str()], batch_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(batches)
    }
}

impl UserDirectory for SqliteStore {
    fn find_user(&self, username: &str) -> StoreResult<Option<UserRecord>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT user_id, username, salt, password_hash, created_at
                 FROM users WHERE username = ?1",
                [username],
                |row| {
                    Ok(UserRecord {
                        user_id: UserId::new(row.get::<_, String>(0)?),
                        username: row.get(1)?,
                        salt: row.get(2)?,
                        password_hash: row.get(3)?,
                        created_at: parse_timestamp(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn insert_user(&self, record: &UserRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO users (user_id, username, salt, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.user_id.as_str(),
                record.username,
                record.salt,
                record.password_hash,
                record.created_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if violates_unique(&e, USERNAME_KEY) => Err(StoreError::Conflict(record.username.clone())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectReason;

    fn create_test_transaction(user: &str, fingerprint: &str, date: &str, amount: i64) -> Transaction {
        let (base, occurrence) = crate::fingerprint::split_fingerprint(fingerprint).unwrap();
        Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: UserId::new(user),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            description: "Coffee Shop".to_string(),
            amount,
            raw_balance: Some(99550),
            source_upload_id: "upload-1".to_string(),
            source_line: 2,
            base_fingerprint: base.to_string(),
            occurrence,
            fingerprint: fingerprint.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = UserId::new("u1");
        let tx = create_test_transaction("u1", "abc:0", "2024-01-05", -450);

        store.insert(&tx).unwrap();

        assert!(store.exists(&user, "abc:0").unwrap());
        assert!(!store.exists(&user, "abc:1").unwrap());
        assert_eq!(store.find_by_fingerprint(&user, "abc:0").unwrap(), Some(tx));
        assert_eq!(store.count_by_base_fingerprint(&user, "abc").unwrap(), 1);
    }

    #[test]
    fn test_duplicate_fingerprint_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&create_test_transaction("u1", "abc:0", "2024-01-05", -450)).unwrap();

        let again = create_test_transaction("u1", "abc:0", "2024-01-05", -450);
        assert!(matches!(store.insert(&again), Err(StoreError::Conflict(_))));

        // Same fingerprint under another user is independent
        store.insert(&create_test_transaction("u2", "abc:0", "2024-01-05", -450)).unwrap();
        assert_eq!(store.count_transactions(&UserId::new("u1")).unwrap(), 1);
        assert_eq!(store.count_transactions(&UserId::new("u2")).unwrap(), 1);
    }

    #[test]
    fn test_other_constraint_failures_are_not_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tx = create_test_transaction("u1", "abc:0", "2024-01-05", -450);
        store.insert(&tx).unwrap();

        // Reused row id under a fresh fingerprint
        let mut reused_id = create_test_transaction("u1", "abc:1", "2024-01-05", -450);
        reused_id.id = tx.id.clone();
        assert!(matches!(store.insert(&reused_id), Err(StoreError::Db(_))));

        let zero = create_test_transaction("u1", "zero:0", "2024-01-05", 0);
        assert!(matches!(store.insert(&zero), Err(StoreError::Db(_))));

        assert_eq!(store.count_transactions(&UserId::new("u1")).unwrap(), 1);
    }

    #[test]
    fn test_list_with_filter() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&create_test_transaction("u1", "a:0", "2024-01-07", 200000)).unwrap();
        store.insert(&create_test_transaction("u1", "b:0", "2024-01-05", -450)).unwrap();
        store.insert(&create_test_transaction("u1", "c:0", "2024-01-06", -1200)).unwrap();
        store.insert(&create_test_transaction("u2", "d:0", "2024-01-06", -999)).unwrap();

        let user = UserId::new("u1");
        let all = store.list_transactions(&user, &TransactionFilter::default()).unwrap();
        let dates: Vec<String> = all.iter().map(|t| t.date.to_string()).collect();
        assert_eq!(dates, vec!["2024-01-05", "2024-01-06", "2024-01-07"]);

        let debits = store
            .list_transactions(
                &user,
                &TransactionFilter {
                    max_amount: Some(-1),
                    from: NaiveDate::from_ymd_opt(2024, 1, 6),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(debits.len(), 1);
        assert_eq!(debits[0].amount, -1200);

        let limited = store
            .list_transactions(&user, &TransactionFilter { limit: Some(2), ..Default::default() })
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_upload_batch_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch = UploadBatch {
            upload_id: "upload-1".to_string(),
            user_id: UserId::new("u1"),
            timestamp: Utc::now(),
            source_filename: "statement.csv".to_string(),
            dialect: "header match".to_string(),
            row_count: 4,
            accepted_count: 2,
            duplicate_count: 1,
            rejected_count: 1,
            rejected: vec![RejectedRow::new(3, RejectReason::ZeroAmount)],
            status: BatchStatus::Completed,
        };

        store.record_upload_batch(&batch).unwrap();

        let batches = store.list_upload_batches(&UserId::new("u1")).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].rejected, batch.rejected);
        assert_eq!(batches[0].status, BatchStatus::Completed);
        assert!(store.list_upload_batches(&UserId::new("u2")).unwrap().is_empty());
    }

    #[test]
    fn test_users() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = UserRecord {
            user_id: UserId::new("u1"),
            username: "alice".to_string(),
            salt: "00".to_string(),
            password_hash: "ff".to_string(),
            created_at: Utc::now(),
        };

        store.insert_user(&record).unwrap();
        let same_name = UserRecord {
            user_id: UserId::new("u2"),
            ..record.clone()
        };
        assert!(matches!(store.insert_user(&same_name), Err(StoreError::Conflict(_))));
        assert_eq!(store.find_user("alice").unwrap().map(|u| u.user_id), Some(UserId::new("u1")));
        assert!(store.find_user("bob").unwrap().is_none());
    }
}

// 🔄 Reconciliation Engine - merge an upload into the user's stored set
//
// Dedup policy: a row's identity is its base fingerprint plus its ordinal
// among same-base rows in the file. Re-uploading a file reproduces the same
// final fingerprints, so every row comes back as a duplicate. Two genuine
// same-day coffees get occurrences 0 and 1 and are both kept.
//
// The engine never holds state between batches; the store is the source of
// truth.

use crate::error::{LedgerError, RejectedRow, Result, StoreError};
use crate::fingerprint::{base_fingerprint, final_fingerprint, normalize_description};
use crate::models::{BatchStatus, NormalizedRow, Transaction, UploadBatch, UploadContext, UserId};
use crate::store::{StoreResult, TransactionStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Bounded retry with exponential backoff. Only `StoreError::Unavailable`
/// is retried; everything else surfaces immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Single try, no sleeping
    pub fn none() -> Self {
        RetryPolicy::new(1, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }

    pub fn run<T, F>(&self, op: &str, mut call: F) -> StoreResult<T>
    where
        F: FnMut() -> StoreResult<T>,
    {
        let mut attempt = 1;
        loop {
            match call() {
                Err(StoreError::Unavailable(reason)) if attempt < self.attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(op, attempt, ?delay, %reason, "store unavailable, retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(StoreError::Unavailable(reason)) => {
                    error!(op, attempts = attempt, %reason, "store unavailable, giving up");
                    return Err(StoreError::Unavailable(reason));
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, Duration::from_millis(50))
    }
}

// ============================================================================
// PER-USER LOCKS
// ============================================================================

/// One mutex per user; uploads for a user run one at a time while different
/// users proceed in parallel. Entries nobody holds are dropped on the next
/// lookup.
#[derive(Default)]
pub struct UserLocks {
    inner: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, user: &UserId) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry(user.clone()).or_default().clone()
    }

    /// Users currently holding or waiting on a lock
    pub fn tracked(&self) -> usize {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.values().filter(|lock| Arc::strong_count(lock) > 1).count()
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub accepted: Vec<Transaction>,
    pub duplicates: usize,
    pub rejected: Vec<RejectedRow>,
    pub batch: UploadBatch,
}

#[derive(Default)]
struct Progress {
    accepted: Vec<Transaction>,
    duplicates: usize,
}

pub struct ReconciliationEngine {
    store: Arc<dyn TransactionStore>,
    locks: UserLocks,
    retry: RetryPolicy,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn TransactionStore>, retry: RetryPolicy) -> Self {
        ReconciliationEngine {
            store,
            locks: UserLocks::new(),
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Merge `rows` (file order) into the user's stored set and write the
    /// upload batch record. On a fatal error the accepted prefix stays
    /// stored and an `Aborted` batch is recorded when possible.
    pub fn reconcile(
        &self,
        user: &UserId,
        upload: &UploadContext,
        rows: &[NormalizedRow],
        rejected: Vec<RejectedRow>,
    ) -> Result<ReconcileOutcome> {
        let lock = self.locks.lock_for(user);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let started = Utc::now();
        let row_count = rows.len() + rejected.len();
        let mut progress = Progress::default();

        if let Err(err) = self.merge_rows(user, upload, rows, &mut progress) {
            let batch = build_batch(user, upload, started, row_count, &progress, &rejected, BatchStatus::Aborted);
            if let Err(record_err) = self.store.record_upload_batch(&batch) {
                warn!(upload_id = %upload.upload_id, error = %record_err, "could not record aborted batch");
            }
            error!(
                user_id = %user,
                upload_id = %upload.upload_id,
                accepted = progress.accepted.len(),
                error = %err,
                "upload aborted"
            );
            return Err(err);
        }

        let batch = build_batch(user, upload, started, row_count, &progress, &rejected, BatchStatus::Completed);
        self.retry
            .run("record_upload_batch", || self.store.record_upload_batch(&batch))?;

        info!(
            user_id = %user,
            upload_id = %upload.upload_id,
            rows = row_count,
            accepted = batch.accepted_count,
            duplicates = batch.duplicate_count,
            rejected = batch.rejected_count,
            "upload reconciled"
        );

        Ok(ReconcileOutcome {
            accepted: progress.accepted,
            duplicates: progress.duplicates,
            rejected,
            batch,
        })
    }

    fn merge_rows(
        &self,
        user: &UserId,
        upload: &UploadContext,
        rows: &[NormalizedRow],
        progress: &mut Progress,
    ) -> Result<()> {
        // Stored count per base, read before this batch touches that base
        let mut stored_counts: HashMap<String, u64> = HashMap::new();
        // Rows per base seen so far in this batch
        let mut ordinals: HashMap<String, u32> = HashMap::new();

        for row in rows {
            let base = base_fingerprint(user, row.date, &row.description, row.amount);

            let stored = match stored_counts.get(&base) {
                Some(&count) => count,
                None => {
                    let count = self.retry.run("count_by_base_fingerprint", || {
                        self.store.count_by_base_fingerprint(user, &base)
                    })?;
                    stored_counts.insert(base.clone(), count);
                    count
                }
            };

            let ordinal = ordinals.entry(base.clone()).or_insert(0);
            let occurrence = *ordinal;
            *ordinal += 1;

            let fingerprint = final_fingerprint(&base, occurrence);
            let exists = self
                .retry
                .run("exists", || self.store.exists(user, &fingerprint))?;
            let tx = build_transaction(user, upload, row, base, occurrence, fingerprint);

            if exists {
                if u64::from(occurrence) >= stored {
                    // Another writer stored it after the count was read
                    warn!(
                        line = row.line,
                        fingerprint = %tx.fingerprint,
                        stored,
                        "occurrence exists beyond stored count"
                    );
                }
                self.match_stored(&tx)?;
                debug!(line = row.line, fingerprint = %tx.fingerprint, "duplicate");
                progress.duplicates += 1;
                continue;
            }

            if u64::from(occurrence) < stored {
                warn!(
                    line = row.line,
                    fingerprint = %tx.fingerprint,
                    stored,
                    "occurrence missing below stored count, inserting"
                );
            }

            match self.retry.run("insert", || self.store.insert(&tx)) {
                Ok(()) => {
                    debug!(line = row.line, fingerprint = %tx.fingerprint, "accepted");
                    progress.accepted.push(tx);
                }
                Err(StoreError::Conflict(_)) => {
                    self.match_stored(&tx)?;
                    debug!(line = row.line, fingerprint = %tx.fingerprint, "duplicate after insert race");
                    progress.duplicates += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// A record already holds this fingerprint: fine if it is the same
    /// transaction, an invariant violation otherwise.
    fn match_stored(&self, tx: &Transaction) -> Result<()> {
        let stored = self.retry.run("find_by_fingerprint", || {
            self.store.find_by_fingerprint(&tx.user_id, &tx.fingerprint)
        })?;

        match stored {
            Some(existing) if same_transaction(&existing, tx) => Ok(()),
            Some(existing) => Err(LedgerError::ReconciliationInconsistency(format!(
                "fingerprint collision on {}: stored '{}' {} on {}, incoming '{}' {} on {}",
                tx.fingerprint,
                existing.description,
                existing.amount,
                existing.date,
                tx.description,
                tx.amount,
                tx.date
            ))),
            None => Err(LedgerError::ReconciliationInconsistency(format!(
                "{} reported as stored but no record was found",
                tx.fingerprint
            ))),
        }
    }
}

fn same_transaction(a: &Transaction, b: &Transaction) -> bool {
    a.user_id == b.user_id
        && a.date == b.date
        && a.amount == b.amount
        && normalize_description(&a.description) == normalize_description(&b.description)
}

fn build_transaction(
    user: &UserId,
    upload: &UploadContext,
    row: &NormalizedRow,
    base: String,
    occurrence: u32,
    fingerprint: String,
) -> Transaction {
    Transaction {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user.clone(),
        date: row.date,
        description: row.description.clone(),
        amount: row.amount,
        raw_balance: row.raw_balance,
        source_upload_id: upload.upload_id.clone(),
        source_line: row.line,
        base_fingerprint: base,
        occurrence,
        fingerprint,
        created_at: Utc::now(),
    }
}

fn build_batch(
    user: &UserId,
    upload: &UploadContext,
    timestamp: DateTime<Utc>,
    row_count: usize,
    progress: &Progress,
    rejected: &[RejectedRow],
    status: BatchStatus,
) -> UploadBatch {
    UploadBatch {
        upload_id: upload.upload_id.clone(),
        user_id: user.clone(),
        timestamp,
        source_filename: upload.source_filename.clone(),
        dialect: upload.dialect.clone(),
        row_count,
        accepted_count: progress.accepted.len(),
        duplicate_count: progress.duplicates,
        rejected_count: rejected.len(),
        rejected: rejected.to_vec(),
        status,
    }
}

// ============================================================================
// TESTS
// ============================================================================

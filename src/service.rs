// 🧾 Ingest Service - authenticated entry point for uploads and queries
//
// Pipeline: validate → detect → normalize → reconcile. The user id always
// comes from the validated session, never from the caller.

use crate::auth::{Credentials, SessionAuthenticator};
use crate::banks::BankRegistry;
use crate::config::AppConfig;
use crate::db::SqliteStore;
use crate::dialect::{Dialect, DialectDetector};
use crate::error::{RejectedRow, Result};
use crate::models::{Session, Transaction, TransactionFilter, UploadBatch, UploadContext, UserId};
use crate::normalizer::normalize_content;
use crate::raw::decode_upload;
use crate::reconcile::ReconciliationEngine;
use crate::store::{TransactionStore, UserDirectory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// What an upload call reports back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub upload_id: String,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: Vec<RejectedRow>,
    pub dialect: String,
}

pub struct IngestService {
    auth: SessionAuthenticator,
    detector: DialectDetector,
    engine: ReconciliationEngine,
}

impl IngestService {
    pub fn new<S>(store: Arc<S>, config: &AppConfig) -> Self
    where
        S: TransactionStore + UserDirectory + 'static,
    {
        let directory: Arc<dyn UserDirectory> = store.clone();
        let transactions: Arc<dyn TransactionStore> = store;

        IngestService {
            auth: SessionAuthenticator::new(directory, config.session_ttl(), config.session.sliding),
            detector: DialectDetector::new(
                config.ingest.sample_rows,
                config.synonym_table(),
                BankRegistry::new(),
            ),
            engine: ReconciliationEngine::new(transactions, config.retry_policy()),
        }
    }

    /// Open the SQLite store named in `config`
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.store.db_path, config.busy_timeout())?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn authenticator(&self) -> &SessionAuthenticator {
        &self.auth
    }

    pub fn login(&self, credentials: &Credentials) -> Result<Session> {
        self.auth.login(credentials)
    }

    pub fn logout(&self, token: &str) {
        self.auth.logout(token)
    }

    /// Dialect of an upload, without persisting anything
    pub fn detect(&self, bytes: &[u8], hint: Option<&str>) -> Result<Dialect> {
        self.detector.detect(&decode_upload(bytes), hint)
    }

    pub fn upload(
        &self,
        token: &str,
        filename: &str,
        bytes: &[u8],
        hint: Option<&str>,
    ) -> Result<UploadSummary> {
        let user = self.auth.validate(token)?;
        self.ingest(&user, filename, bytes, hint)
    }

    fn ingest(&self, user: &UserId, filename: &str, bytes: &[u8], hint: Option<&str>) -> Result<UploadSummary> {
        info!(user_id = %user, filename, bytes = bytes.len(), hint = ?hint, "upload received");

        let content = decode_upload(bytes);
        let dialect = self.detector.detect(&content, hint)?;
        let normalized = normalize_content(&content, &dialect)?;

        let context = UploadContext::new(filename, dialect.describe());
        let outcome = self
            .engine
            .reconcile(user, &context, &normalized.rows, normalized.rejected)?;

        Ok(UploadSummary {
            upload_id: outcome.batch.upload_id,
            accepted: outcome.accepted.len(),
            duplicates: outcome.duplicates,
            rejected: outcome.rejected,
            dialect: context.dialect,
        })
    }

    pub fn list_transactions(&self, token: &str, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let user = self.auth.validate(token)?;
        let store = self.engine.store();
        Ok(self
            .engine
            .retry_policy()
            .run("list_transactions", || store.list_transactions(&user, filter))?)
    }

    pub fn list_uploads(&self, token: &str) -> Result<Vec<UploadBatch>> {
        let user = self.auth.validate(token)?;
        let store = self.engine.store();
        Ok(self
            .engine
            .retry_policy()
            .run("list_upload_batches", || store.list_upload_batches(&user))?)
    }
}

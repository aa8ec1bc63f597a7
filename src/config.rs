// ⚙️ Configuration - TOML file, defaults, environment overrides
//
// Lookup order: defaults → ledger.toml (or $LEDGER_CONFIG) → LEDGER_* env vars.

use crate::dialect::{ColumnField, SynonymTable};
use crate::error::{LedgerError, Result};
use crate::reconcile::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_FILE: &str = "ledger.toml";

/// Ten years
pub const MAX_SESSION_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub session: SessionSection,
    pub store: StoreSection,
    pub ingest: IngestSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    /// Empty means same-origin only
    pub cors_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            bind: "127.0.0.1:8080".to_string(),
            cors_origins: Vec::new(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub cookie_name: String,
    pub ttl_secs: u64,
    /// Extend expiry on every successful validation
    pub sliding: bool,
    /// Mark the session cookie `Secure` (HTTPS only)
    pub secure_cookie: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            cookie_name: "ledger_session".to_string(),
            ttl_secs: 30 * 60,
            sliding: false,
            secure_cookie: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub db_path: PathBuf,
    pub busy_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        StoreSection {
            db_path: PathBuf::from("ledger.db"),
            busy_timeout_ms: 5_000,
            retry_attempts: 3,
            retry_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    /// Data rows inspected by the dialect detector
    pub sample_rows: usize,
    /// Extra header names per field, e.g. `date = ["valuta"]`
    pub synonyms: BTreeMap<String, Vec<String>>,
}

impl Default for IngestSection {
    fn default() -> Self {
        IngestSection {
            sample_rows: 20,
            synonyms: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Load from `$LEDGER_CONFIG` or `./ledger.toml` when present, then
    /// apply environment overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var("LEDGER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            AppConfig::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| LedgerError::Config(format!("read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&raw)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks serde cannot express
    pub fn validate(&self) -> Result<()> {
        let ttl = self.session.ttl_secs;
        if ttl == 0 || ttl > MAX_SESSION_TTL_SECS {
            return Err(LedgerError::Config(format!(
                "session ttl_secs must be between 1 and {}, got {}",
                MAX_SESSION_TTL_SECS, ttl
            )));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LedgerError::Config(e.to_string()))
    }

    /// Write the defaults to `path` unless a file is already there.
    /// Returns false when nothing was written.
    pub fn write_default(path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        fs::write(path, AppConfig::default().to_toml_string()?)?;
        Ok(true)
    }

    /// `lookup` is `std::env::var` in production, a map in tests
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("LEDGER_BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = lookup("LEDGER_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
        if let Some(name) = lookup("LEDGER_SESSION_COOKIE") {
            self.session.cookie_name = name;
        }
        if let Some(ttl) = lookup("LEDGER_SESSION_TTL_SECS") {
            self.session.ttl_secs = ttl
                .trim()
                .parse()
                .map_err(|_| LedgerError::Config(format!("LEDGER_SESSION_TTL_SECS: not a number: {}", ttl)))?;
        }
        if let Some(sliding) = lookup("LEDGER_SLIDING_SESSIONS") {
            self.session.sliding = parse_bool(&sliding)
                .ok_or_else(|| LedgerError::Config(format!("LEDGER_SLIDING_SESSIONS: not a boolean: {}", sliding)))?;
        }
        if let Some(secure) = lookup("LEDGER_SECURE_COOKIE") {
            self.session.secure_cookie = parse_bool(&secure)
                .ok_or_else(|| LedgerError::Config(format!("LEDGER_SECURE_COOKIE: not a boolean: {}", secure)))?;
        }
        if let Some(origins) = lookup("LEDGER_CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        self.validate()
    }

    /// Built-in synonyms plus the configured extras. Unknown field names
    /// are logged and skipped.
    pub fn synonym_table(&self) -> SynonymTable {
        let mut table = SynonymTable::new();
        for (field, names) in &self.ingest.synonyms {
            match ColumnField::from_name(field) {
                Some(f) => table.extend(f, names),
                None => warn!(field = %field, "ignoring synonyms for unknown column field"),
            }
        }
        table
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.store.retry_attempts,
            Duration::from_millis(self.store.retry_backoff_ms),
        )
    }

    /// Clamped to `MAX_SESSION_TTL_SECS` for configs built in code
    pub fn session_ttl(&self) -> chrono::Duration {
        let secs = self.session.ttl_secs.min(MAX_SESSION_TTL_SECS) as i64;
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::zero())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.session.ttl_secs, 1800);
        assert!(!config.session.sliding);
        assert_eq!(config.ingest.sample_rows, 20);
        assert_eq!(config.retry_policy().attempts, 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [session]
            sliding = true

            [ingest.synonyms]
            date = ["valuta"]
            "#,
        )
        .unwrap();

        assert!(config.session.sliding);
        assert_eq!(config.session.cookie_name, "ledger_session");
        assert_eq!(config.store.retry_attempts, 3);
        assert_eq!(config.synonym_table().field_for("Valuta"), Some(ColumnField::Date));
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(matches!(
            AppConfig::from_toml_str("[session\nttl_secs = 1"),
            Err(LedgerError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("LEDGER_BIND", "0.0.0.0:9000"),
            ("LEDGER_SESSION_TTL_SECS", "60"),
            ("LEDGER_SLIDING_SESSIONS", "yes"),
            ("LEDGER_CORS_ORIGINS", "http://a.test, http://b.test,"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.session_ttl(), chrono::Duration::seconds(60));
        assert!(config.session.sliding);
        assert_eq!(config.server.cors_origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = AppConfig::default();
        let result = config.apply_env_overrides(|k| {
            (k == "LEDGER_SESSION_TTL_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_oversized_ttl_is_a_config_error() {
        let mut config = AppConfig::default();
        let result = config.apply_env_overrides(|k| {
            (k == "LEDGER_SESSION_TTL_SECS").then(|| "100000000000000000".to_string())
        });
        assert!(matches!(result, Err(LedgerError::Config(_))));

        assert!(matches!(
            AppConfig::from_toml_str("[session]\nttl_secs = 0"),
            Err(LedgerError::Config(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "[session]\nttl_secs = 9000000000000000000\n").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_session_ttl_is_clamped() {
        let mut config = AppConfig::default();
        config.session.ttl_secs = u64::MAX;
        assert_eq!(
            config.session_ttl(),
            chrono::Duration::seconds(MAX_SESSION_TTL_SECS as i64)
        );
    }

    #[test]
    fn test_secure_cookie_flag() {
        let mut config = AppConfig::default();
        assert!(!config.session.secure_cookie);
        config
            .apply_env_overrides(|k| (k == "LEDGER_SECURE_COOKIE").then(|| "true".to_string()))
            .unwrap();
        assert!(config.session.secure_cookie);
    }

    #[test]
    fn test_write_default_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);

        assert!(AppConfig::write_default(&path).unwrap());
        assert!(!AppConfig::write_default(&path).unwrap());
        assert_eq!(AppConfig::load_from(&path).unwrap(), AppConfig::default());
    }
}

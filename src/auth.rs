// 🔐 Session Authenticator - login, validate, logout
//
// Sessions live in memory only. Passwords are stored as Argon2id PHC
// strings with a per-user random salt.

use crate::error::{LedgerError, Result, StoreError};
use crate::models::{Session, UserId};
use crate::store::{UserDirectory, UserRecord};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

const TOKEN_BYTES: usize = 32;
const SALT_BYTES: usize = 16;

/// Login payload
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// First characters of a token, safe to log
pub fn token_prefix(token: &str) -> String {
    token.chars().take(8).collect()
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn random_salt() -> Result<SaltString> {
    let mut bytes = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    salt_from(&bytes)
}

fn salt_from(bytes: &[u8]) -> Result<SaltString> {
    SaltString::encode_b64(bytes).map_err(|e| LedgerError::Other(format!("password salt: {}", e)))
}

/// Argon2id PHC string for `password`
pub fn hash_password(salt: &SaltString, password: &str) -> Result<String> {
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), salt)
        .map_err(|e| LedgerError::Other(format!("password hash: {}", e)))?;
    Ok(hash.to_string())
}

/// Check `password` against a stored record
pub fn verify_password(record: &UserRecord, password: &str) -> Result<bool> {
    let parsed = PasswordHash::new(&record.password_hash)
        .map_err(|e| LedgerError::Other(format!("corrupt hash for {}: {}", record.username, e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

// ============================================================================
// AUTHENTICATOR
// ============================================================================

pub struct SessionAuthenticator {
    directory: Arc<dyn UserDirectory>,
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
    sliding: bool,
}

impl SessionAuthenticator {
    pub fn new(directory: Arc<dyn UserDirectory>, ttl: Duration, sliding: bool) -> Self {
        SessionAuthenticator {
            directory,
            sessions: RwLock::new(HashMap::new()),
            ttl,
            sliding,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a user with a fresh salt. Usernames are unique.
    pub fn register_user(&self, username: &str, password: &str) -> Result<UserId> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(LedgerError::Other("username and password must not be empty".to_string()));
        }

        let salt = random_salt()?;

        let record = UserRecord {
            user_id: UserId::generate(),
            username: username.to_string(),
            salt: salt.as_str().to_string(),
            password_hash: hash_password(&salt, password)?,
            created_at: Utc::now(),
        };

        match self.directory.insert_user(&record) {
            Ok(()) => {
                info!(user_id = %record.user_id, username, "user created");
                Ok(record.user_id)
            }
            Err(StoreError::Conflict(_)) => Err(LedgerError::UserExists(username.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn login(&self, credentials: &Credentials) -> Result<Session> {
        self.login_at(credentials, Utc::now())
    }

    pub fn login_at(&self, credentials: &Credentials, now: DateTime<Utc>) -> Result<Session> {
        let record = match self.directory.find_user(&credentials.username)? {
            Some(record) => record,
            None => {
                // Hash anyway so timing matches a real check
                let _ = salt_from(&[0u8; SALT_BYTES]).and_then(|salt| hash_password(&salt, &credentials.password));
                warn!(username = %credentials.username, "login for unknown user");
                return Err(LedgerError::InvalidCredentials);
            }
        };

        if !verify_password(&record, &credentials.password)? {
            warn!(username = %credentials.username, "login with wrong password");
            return Err(LedgerError::InvalidCredentials);
        }

        let session = Session {
            token: random_hex(TOKEN_BYTES),
            user_id: record.user_id,
            issued_at: now,
            expires_at: now
                .checked_add_signed(self.ttl)
                .ok_or_else(|| LedgerError::Config(format!("session ttl {} overflows", self.ttl)))?,
        };

        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.token.clone(), session.clone());

        info!(
            user_id = %session.user_id,
            token = %token_prefix(&session.token),
            expires_at = %session.expires_at,
            "session issued"
        );
        Ok(session)
    }

    /// Resolve a token to its user. Expiry is re-checked on every call.
    pub fn validate(&self, token: &str) -> Result<UserId> {
        self.validate_at(token, Utc::now())
    }

    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<UserId> {
        let session = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            sessions.get(token).cloned()
        };

        let session = match session {
            Some(session) => session,
            None => {
                debug!(token = %token_prefix(token), "unknown session token");
                return Err(LedgerError::SessionInvalid);
            }
        };

        if session.is_expired_at(now) {
            self.sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(token);
            debug!(user_id = %session.user_id, token = %token_prefix(token), "session expired");
            return Err(LedgerError::SessionExpired);
        }

        if self.sliding {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(live) = sessions.get_mut(token) {
                if let Some(expires_at) = now.checked_add_signed(self.ttl) {
                    live.expires_at = expires_at;
                }
            }
        }

        Ok(session.user_id)
    }

    /// Revoke a session. Unknown tokens are fine.
    pub fn logout(&self, token: &str) {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);

        if let Some(session) = removed {
            info!(user_id = %session.user_id, token = %token_prefix(token), "session revoked");
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "purged expired sessions");
        }
        removed
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

//! Bearer credential providers.
//!
//! The stream does not log in by itself; it asks a [`CredentialProvider`]
//! for the session token before every connect attempt.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Source of the bearer token presented when a transport opens.
pub trait CredentialProvider: Send + Sync + 'static {
    /// The current token, or `None` when there is no valid session.
    fn bearer_token(&self) -> Option<String>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn bearer_token(&self) -> Option<String> {
        self()
    }
}

/// A fixed token, e.g. from `AGENTDECK_TOKEN`.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        (!self.0.is_empty()).then(|| self.0.clone())
    }
}

/// Errors from session file operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session as returned by the login endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "bearer".into()
}

impl Session {
    /// Builds a session from a login response's `expires_in` (seconds).
    pub fn issued_now(access_token: impl Into<String>, expires_in: i64) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: default_token_type(),
            expires_at: Some(Utc::now() + ChronoDuration::seconds(expires_in)),
        }
    }

    fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty()
            && self.token_type.eq_ignore_ascii_case("bearer")
            && self.expires_at.is_none_or(|at| at > now)
    }
}

/// File-backed session store.
///
/// The session is cached in memory and persisted as JSON. Call
/// [`TokenStore::reload`] after another process refreshed the file.
pub struct TokenStore {
    path: PathBuf,
    session: RwLock<Option<Session>>,
}

impl TokenStore {
    /// Opens the store, loading an existing session from disk.
    pub fn new(path: PathBuf) -> Result<Self, TokenStoreError> {
        let session = load_session(&path)?;
        Ok(Self {
            path,
            session: RwLock::new(session),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the cached session, if any.
    pub fn session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the session and persists it.
    pub fn save(&self, session: Session) -> Result<(), TokenStoreError> {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
        self.persist()
    }

    /// Forgets the session (logout) and removes the file.
    pub fn clear(&self) -> Result<(), TokenStoreError> {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-reads the session file.
    pub fn reload(&self) -> Result<(), TokenStoreError> {
        let session = load_session(&self.path)?;
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
        Ok(())
    }

    fn persist(&self) -> Result<(), TokenStoreError> {
        let session = self.session();
        let json = serde_json::to_string_pretty(&session)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        set_permissions_0600(&self.path);
        debug!(path = %self.path.display(), "persisted session");
        Ok(())
    }
}

impl CredentialProvider for TokenStore {
    fn bearer_token(&self) -> Option<String> {
        let guard = self.session.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(s) if s.is_usable(Utc::now()) => Some(s.access_token.clone()),
            Some(_) => {
                warn!(path = %self.path.display(), "stored session is expired or not a bearer token");
                None
            }
            None => None,
        }
    }
}

fn load_session(path: &Path) -> Result<Option<Session>, TokenStoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let session: Option<Session> = serde_json::from_str(&data)?;
    debug!(path = %path.display(), present = session.is_some(), "loaded session");
    Ok(session)
}

fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

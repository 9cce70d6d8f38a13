use crate::error::AuthError;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const CSRF_SESSION_KEY: &str = "_csrf";
pub const AUTHZ_CODE_SESSION_KEY: &str = "__authzCode";
pub const AUTHZ_CODE_REDIRECT_SESSION_KEY: &str = "_authzCodeRed";
pub const AUTHZ_CODE_CALLBACK_SESSION_KEY: &str = "_authzCodeCall";
pub const AUTHZ_CODE_REQUEST_SESSION_KEY: &str = "_authzCodeReq";
pub const ROPC_SESSION_KEY: &str = "_ropc";

/// Storage for one user session.
///
/// Implementations own the encoding of the session itself (cookies, a
/// server-side store, ...). Entries are opaque bytes under string keys; a
/// missing entry is `Ok(None)`, never an error.
pub trait Session: Send + Sync {
    fn extract(&self, key: &str) -> Result<Option<Vec<u8>>, AuthError>;
    fn persist(&self, key: &str, value: Vec<u8>) -> Result<(), AuthError>;
    fn delete(&self, key: &str);
}

/// Request extension carrying the session an outer layer attached.
#[derive(Clone)]
pub struct SessionHandle(pub Arc<dyn Session>);

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionHandle")
    }
}

impl std::ops::Deref for SessionHandle {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

pub fn extract_json<T: DeserializeOwned>(
    session: &dyn Session,
    key: &str,
) -> Result<Option<T>, AuthError> {
    let Some(raw) = session.extract(key)? else {
        return Ok(None);
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| AuthError::Session {
            operation: "extract",
            reason: format!("{}: {}", key, e),
        })
}

pub fn persist_json<T: Serialize>(
    session: &dyn Session,
    key: &str,
    value: &T,
) -> Result<(), AuthError> {
    let raw = serde_json::to_vec(value).map_err(|e| AuthError::Session {
        operation: "persist",
        reason: format!("{}: {}", key, e),
    })?;
    session.persist(key, raw)
}

/// Extract and delete in one step. Used for single-use entries like CSRF states.
pub fn take_json<T: DeserializeOwned>(
    session: &dyn Session,
    key: &str,
) -> Result<Option<T>, AuthError> {
    let value = extract_json(session, key);
    session.delete(key);
    value
}

/// Map-backed session. The gateway binary keeps one per cookie; tests use it directly.
#[derive(Debug, Default)]
pub struct MemorySession {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.contains_key(key))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().map(|e| e.is_empty()).unwrap_or(true)
    }
}

impl Session for MemorySession {
    fn extract(&self, key: &str) -> Result<Option<Vec<u8>>, AuthError> {
        let entries = self.entries.lock().map_err(|e| AuthError::Session {
            operation: "extract",
            reason: e.to_string(),
        })?;
        Ok(entries.get(key).cloned())
    }

    fn persist(&self, key: &str, value: Vec<u8>) -> Result<(), AuthError> {
        let mut entries = self.entries.lock().map_err(|e| AuthError::Session {
            operation: "persist",
            reason: e.to_string(),
        })?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

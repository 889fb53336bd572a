//! Client identity and its persistence port.
//!
//! The backend may reassign the client id mid-session (a `status` message
//! carrying `sid`). The new id is written through an [`IdentityStore`] so a
//! restarted process resumes the same backend session.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Result, SdfxError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub auth_token: Option<String>,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            auth_token,
        }
    }

    /// Pick the id for a new connection: an explicit id wins, then a
    /// previously known one, otherwise a fresh random id.
    pub fn resolve(explicit: Option<String>, known: Option<String>, auth_token: Option<String>) -> Self {
        let client_id = explicit
            .filter(|id| !id.is_empty())
            .or_else(|| known.filter(|id| !id.is_empty()))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            client_id,
            auth_token,
        }
    }
}

/// Narrow persistence slot holding the resumption client id.
pub trait IdentityStore: Send + Sync {
    /// Read the persisted id, if any.
    fn load(&self) -> Option<String>;

    /// Persist a server-assigned id.
    fn save(&self, client_id: &str) -> Result<()>;
}

/// Stores the client id in a single file.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Option<String> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let id = raw.trim();
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }

    fn save(&self, client_id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, client_id)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Persisted client id");
        Ok(())
    }
}

/// In-process store. Survives reconnects and re-created sessions, not restarts.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    slot: Mutex<Option<String>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(client_id: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(client_id.into())),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Option<String> {
        self.slot.lock().ok()?.clone()
    }

    fn save(&self, client_id: &str) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| SdfxError::Identity(e.to_string()))?;
        *slot = Some(client_id.to_string());
        Ok(())
    }
}

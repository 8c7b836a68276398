//! Session persistence boundary.
//!
//! The core only requires `load` and `save` over a serializable state
//! snapshot; where sessions actually live is the caller's concern. A JSON
//! file store is provided for single-host use, an in-memory store for tests
//! and ephemeral runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crucible_types::{CrucibleError, Result, SessionSnapshot};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<SessionSnapshot>;
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()>;
}

// ---------------------------------------------------------------------------
// InMemorySessionStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: std::sync::Mutex<HashMap<String, SessionSnapshot>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<SessionSnapshot> {
        self.sessions
            .lock()
            .expect("session map lock")
            .get(session_id)
            .cloned()
            .ok_or_else(|| CrucibleError::Store {
                session: session_id.to_string(),
                message: "session not found".into(),
            })
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.sessions
            .lock()
            .expect("session map lock")
            .insert(snapshot.session_id.clone(), snapshot.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFileSessionStore
// ---------------------------------------------------------------------------

/// One pretty-printed JSON file per session under a root directory.
pub struct JsonFileSessionStore {
    root: PathBuf,
}

impl JsonFileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        // Session ids become file names; reject anything that would escape.
        if session_id.is_empty()
            || session_id
                .chars()
                .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(CrucibleError::Store {
                session: session_id.to_string(),
                message: "session id must be alphanumeric with '-' or '_'".into(),
            });
        }
        Ok(self.root.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn load(&self, session_id: &str) -> Result<SessionSnapshot> {
        let path = self.path_for(session_id)?;
        let data = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CrucibleError::Store {
                session: session_id.to_string(),
                message: format!("read {}: {e}", path.display()),
            })?;
        let snapshot: SessionSnapshot = serde_json::from_str(&data)?;
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let path = self.path_for(&snapshot.session_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(path = %path.display(), "Session saved");
        Ok(())
    }
}

/// Convenience: the default on-disk location under a working directory.
pub fn default_store_root(workdir: &Path) -> PathBuf {
    workdir.join(".crucible").join("sessions")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Session state store — the single mutable container for one pipeline run.
//!
//! Cloning a `SessionState` yields another handle to the **same** inner
//! state. Use [`clone_isolated`](SessionState::clone_isolated) to get a deep
//! copy for parallel branch isolation, then [`merge_child`](SessionState::merge_child)
//! to fold a branch's private writes back in at the join.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CrucibleError, Result};

/// Writer recorded for keys present before any stage ran.
const INITIAL_WRITER: &str = "session";

/// Mint a fresh session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Thread-safe key-value store scoped to one pipeline run.
///
/// Last-writer-wins per key. Every write is attributed to the stage that
/// produced it so wiring bugs can be diagnosed from the final state alone.
#[derive(Clone)]
pub struct SessionState {
    inner: Arc<tokio::sync::RwLock<StateInner>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateInner {
    values: HashMap<String, serde_json::Value>,
    writers: HashMap<String, String>,
    /// Keys written since this handle was isolated from its parent.
    dirty: HashSet<String>,
}

impl SessionState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(StateInner::default())),
        }
    }

    /// Create a state pre-populated with initial values.
    pub fn with_values(values: HashMap<String, serde_json::Value>) -> Self {
        let writers = values
            .keys()
            .map(|k| (k.clone(), INITIAL_WRITER.to_string()))
            .collect();
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(StateInner {
                values,
                writers,
                dirty: HashSet::new(),
            })),
        }
    }

    /// Insert or overwrite a key outside of stage execution.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        let mut guard = self.inner.write().await;
        guard.writers.insert(key.clone(), INITIAL_WRITER.to_string());
        guard.dirty.insert(key.clone());
        guard.values.insert(key, value);
    }

    /// Merge a stage's output delta. Each key is attributed to `stage_id`.
    pub async fn apply_delta(
        &self,
        stage_id: &str,
        delta: HashMap<String, serde_json::Value>,
    ) {
        let mut guard = self.inner.write().await;
        for (key, value) in delta {
            guard.writers.insert(key.clone(), stage_id.to_string());
            guard.dirty.insert(key.clone());
            guard.values.insert(key, value);
        }
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.values.get(key).cloned()
    }

    /// Read a required value; an unset key is a pipeline wiring bug.
    pub async fn get_required(&self, stage: &str, key: &str) -> Result<serde_json::Value> {
        self.get(key).await.ok_or_else(|| CrucibleError::State {
            stage: stage.to_string(),
            key: key.to_string(),
        })
    }

    /// Convenience accessor that returns a `String`. Falls back to `default`
    /// when the key is absent or not a JSON string.
    pub async fn get_string(&self, key: &str, default: &str) -> String {
        self.inner
            .read()
            .await
            .values
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| default.to_owned())
    }

    /// The stage that last wrote `key`, if any.
    pub async fn writer_of(&self, key: &str) -> Option<String> {
        self.inner.read().await.writers.get(key).cloned()
    }

    /// Shallow copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.values.clone()
    }

    /// Snapshot restricted to the given keys. Absent keys are omitted;
    /// required-read enforcement happens before invocation, not here.
    pub async fn snapshot_of(&self, keys: &[String]) -> HashMap<String, serde_json::Value> {
        let guard = self.inner.read().await;
        keys.iter()
            .filter_map(|k| guard.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Deep copy that is fully independent of the original state. The copy's
    /// dirty-key journal starts empty, so after the branch runs,
    /// [`dirty_keys`](SessionState::dirty_keys) is exactly its private write set.
    pub async fn clone_isolated(&self) -> SessionState {
        let guard = self.inner.read().await;
        let mut copy = guard.clone();
        copy.dirty.clear();
        SessionState {
            inner: Arc::new(tokio::sync::RwLock::new(copy)),
        }
    }

    /// Keys written through this handle since it was isolated.
    pub async fn dirty_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().await.dirty.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Fold a finished branch's private writes into this state.
    ///
    /// Only the branch's dirty keys move; construction-time validation
    /// guarantees sibling branches write disjoint key sets, so the merge is a
    /// plain union whatever order the branches finished in.
    pub async fn merge_child(&self, child: &SessionState) {
        let child_guard = child.inner.read().await;
        let mut guard = self.inner.write().await;
        let mut merged = 0usize;
        for key in &child_guard.dirty {
            if let Some(value) = child_guard.values.get(key) {
                guard.values.insert(key.clone(), value.clone());
                if let Some(writer) = child_guard.writers.get(key) {
                    guard.writers.insert(key.clone(), writer.clone());
                }
                guard.dirty.insert(key.clone());
                merged += 1;
            }
        }
        tracing::debug!(keys = merged, "Merged branch writes");
    }

    /// Serializable image of the state for the persistence boundary.
    pub async fn to_snapshot(&self, session_id: &str) -> SessionSnapshot {
        let guard = self.inner.read().await;
        SessionSnapshot {
            session_id: session_id.to_string(),
            saved_at: chrono::Utc::now(),
            values: guard.values.clone(),
            writers: guard.writers.clone(),
        }
    }

    /// Rebuild a state from a persisted snapshot.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> SessionState {
        SessionState {
            inner: Arc::new(tokio::sync::RwLock::new(StateInner {
                values: snapshot.values,
                writers: snapshot.writers,
                dirty: HashSet::new(),
            })),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of a session's state, exchanged with a session
/// store implementation at the persistence boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub saved_at: chrono::DateTime<chrono::Utc>,
    pub values: HashMap<String, serde_json::Value>,
    pub writers: HashMap<String, String>,
}

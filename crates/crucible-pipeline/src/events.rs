//! Append-only event log with live fan-out.
//!
//! The engine appends [`Event`]s as it walks the stage tree; external
//! transports (SSE, polling, a TUI) either read the ordered log after the
//! run or subscribe to the [`tokio::sync::broadcast`] channel for live
//! consumption. Emission never blocks the engine; a lagging subscriber
//! misses events rather than applying back-pressure.

use std::sync::{Arc, Mutex};

use crucible_types::{Event, EventKind};

/// Append-only, totally ordered event record for one pipeline run.
///
/// Cloning an `EventLog` yields another handle to the same log.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<Vec<Event>>>,
    sender: tokio::sync::broadcast::Sender<Event>,
}

impl EventLog {
    /// Create a log with the given broadcast capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            sender,
        }
    }

    /// Append an event. The sequence number is assigned atomically with the
    /// push, so the log order and the numbering always agree.
    pub fn append(
        &self,
        stage_id: impl Into<String>,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Event {
        let event = {
            let mut log = self.inner.lock().expect("event log lock");
            let event = Event {
                seq: log.len() as u64 + 1,
                stage_id: stage_id.into(),
                kind,
                payload,
                timestamp: chrono::Utc::now(),
            };
            log.push(event.clone());
            event
        };
        // Dropped silently when nobody is subscribed.
        let _ = self.sender.send(event.clone());
        event
    }

    /// Copy of the log so far, in append order.
    pub fn snapshot(&self) -> Vec<Event> {
        self.inner.lock().expect("event log lock").clone()
    }

    /// Subscribe to live events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event log lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(256)
    }
}

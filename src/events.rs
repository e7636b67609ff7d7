//! Append-only in-memory event log with NDJSON export.
//!
//! Events are never mutated or removed; append order is the export order.
//! Growth is unbounded for the life of the process, an accepted tradeoff for
//! the scoped single-process lifetime.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChatCompleted,
    ChatFailed,
}

/// One structured log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub session_id: String,
    pub payload: serde_json::Value,
}

impl Event {
    #[must_use]
    pub fn new(kind: EventKind, session_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            session_id: session_id.into(),
            payload,
        }
    }
}

/// Append-only recorder shared across the pipeline.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    inner: Arc<RwLock<Vec<Event>>>,
}

impl EventRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: Event) {
        self.inner.write().unwrap().push(event);
    }

    /// All events in append order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.inner.read().unwrap().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render the log as newline-delimited JSON, one record per line.
    ///
    /// # Errors
    ///
    /// Returns an error if an event payload fails to serialize.
    pub fn export_ndjson(&self) -> Result<String, serde_json::Error> {
        let events = self.inner.read().unwrap();
        let mut out = String::new();
        for event in events.iter() {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }
}

//! Bounded per-session conversation history.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a turn author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One role-tagged message unit within a conversation. Immutable once
/// appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Thread-safe store of per-session turn history, trimmed on write to the
/// configured window so memory stays bounded per session.
///
/// Sessions are created on first append and live for the process lifetime.
/// Writes must be issued from inside a sequencer task; the lock below makes
/// individual operations atomic, the sequencer provides the per-session
/// ordering guarantee.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    window: usize,
    sessions: RwLock<HashMap<String, Vec<Turn>>>,
}

impl ConversationStore {
    /// Create a store keeping at most `window` turns per session.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    #[must_use]
    pub fn new(window: usize) -> Self {
        assert!(window > 0, "history window must be at least 1");
        Self {
            inner: Arc::new(StoreInner {
                window,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Append a turn to the session's history, trimming the oldest turns
    /// beyond the window.
    pub fn append(&self, session_id: &str, turn: Turn) {
        let mut sessions = self.inner.sessions.write().unwrap();
        let turns = sessions.entry(session_id.to_owned()).or_default();
        turns.push(turn);
        if turns.len() > self.inner.window {
            let excess = turns.len() - self.inner.window;
            turns.drain(..excess);
        }
    }

    /// Chronologically ordered suffix of at most `window` most recent turns.
    /// Unknown sessions yield an empty sequence.
    #[must_use]
    pub fn recent(&self, session_id: &str, window: usize) -> Vec<Turn> {
        let sessions = self.inner.sessions.read().unwrap();
        match sessions.get(session_id) {
            Some(turns) => {
                let start = turns.len().saturating_sub(window);
                turns[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.sessions.read().unwrap().contains_key(session_id)
    }

    /// Number of turns currently retained for the session.
    #[must_use]
    pub fn turn_count(&self, session_id: &str) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap()
            .get(session_id)
            .map_or(0, Vec::len)
    }

    /// All known session ids.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        self.inner
            .sessions
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }
}

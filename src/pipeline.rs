//! Request lifecycle orchestration.
//!
//! One submission moves through: validation, admission, then a single
//! sequenced exchange per session (record the user turn, read the window,
//! call the upstream, record the assistant turn and an event). The admission
//! permit is held across the exchange and released by drop on every exit
//! path.
//!
//! Because the whole exchange runs as one sequencer task, concurrent
//! submissions for the same session land as non-interleaved user/assistant
//! pairs in submission order, while distinct sessions proceed concurrently
//! up to the gate's capacity.

use serde::Serialize;
use serde_json::json;

use crate::error::ChatError;
use crate::events::{Event, EventKind, EventRecorder};
use crate::gate::{AdmissionGate, GateError};
use crate::history::{ConversationStore, Turn};
use crate::sequencer::SessionSequencer;
use crate::upstream::{ChatMessage, CompletionRequest, Usage, UpstreamCaller};

/// Chat-level knobs, resolved from configuration once at startup.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Model identifier sent with every completion request.
    pub model: String,
    /// System message prepended to the upstream message list; never stored
    /// in history.
    pub system_prompt: String,
    /// Most-recent turns surfaced to the upstream for context.
    pub memory_window: usize,
    /// Optional sampling temperature.
    pub temperature: Option<f32>,
}

/// A successful chat exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub session_id: String,
    pub reply: String,
    pub usage: Usage,
}

/// The concurrency-control core: admission gate, per-session sequencer,
/// bounded history, retrying upstream caller, and event log.
#[derive(Debug)]
pub struct ChatPipeline {
    gate: AdmissionGate,
    sequencer: SessionSequencer,
    history: ConversationStore,
    caller: UpstreamCaller,
    events: EventRecorder,
    settings: ChatSettings,
}

impl ChatPipeline {
    #[must_use]
    pub fn new(gate: AdmissionGate, caller: UpstreamCaller, settings: ChatSettings) -> Self {
        Self {
            gate,
            sequencer: SessionSequencer::new(),
            history: ConversationStore::new(settings.memory_window),
            caller,
            events: EventRecorder::new(),
            settings,
        }
    }

    /// Submit one user message for the session and wait for the answer.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] for empty input (pre-admission),
    /// [`ChatError::QueueFull`] when the gate is saturated, and
    /// [`ChatError::Upstream`] when the completion call ultimately fails.
    pub async fn submit_chat(
        &self,
        session_id: &str,
        user_message: &str,
    ) -> Result<ChatReply, ChatError> {
        // Cheapest failure path first: validate before admission.
        if session_id.trim().is_empty() {
            return Err(ChatError::Validation("session_id must not be empty".into()));
        }
        let message = user_message.trim();
        if message.is_empty() {
            return Err(ChatError::Validation("message must not be empty".into()));
        }

        // Saturation short-circuits before any session work or upstream call.
        let permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(GateError::QueueFull) => return Err(ChatError::QueueFull),
            Err(GateError::Closed) => {
                return Err(ChatError::Internal("admission gate closed".into()));
            }
        };

        let result = self
            .sequencer
            .run(session_id, self.exchange(session_id, message))
            .await;

        // Released on every path out of Admitted.
        drop(permit);
        result
    }

    /// One sequenced exchange: mutate history, call upstream, record the
    /// outcome. Runs with the session's chain held.
    async fn exchange(&self, session_id: &str, message: &str) -> Result<ChatReply, ChatError> {
        self.history.append(session_id, Turn::user(message));
        let window = self.history.recent(session_id, self.settings.memory_window);

        let mut messages = Vec::with_capacity(window.len() + 1);
        messages.push(ChatMessage::system(&self.settings.system_prompt));
        messages.extend(window.iter().map(ChatMessage::from));

        let request = CompletionRequest {
            model: self.settings.model.clone(),
            messages,
            temperature: self.settings.temperature,
        };

        match self.caller.call(&request).await {
            Ok(outcome) => {
                self.history
                    .append(session_id, Turn::assistant(outcome.completion.text.clone()));
                self.events.record(Event::new(
                    EventKind::ChatCompleted,
                    session_id,
                    json!({
                        "attempts": outcome.attempts,
                        "usage": outcome.completion.usage,
                    }),
                ));
                tracing::info!(
                    name: "chat.completed",
                    session_id = %session_id,
                    attempts = outcome.attempts,
                    "Chat exchange completed"
                );
                Ok(ChatReply {
                    session_id: session_id.to_owned(),
                    reply: outcome.completion.text,
                    usage: outcome.completion.usage,
                })
            }
            Err(err) => {
                self.events.record(Event::new(
                    EventKind::ChatFailed,
                    session_id,
                    json!({ "class": err.class() }),
                ));
                tracing::warn!(
                    name: "chat.failed",
                    session_id = %session_id,
                    class = err.class(),
                    "Chat exchange failed"
                );
                Err(ChatError::Upstream(err))
            }
        }
    }

    #[must_use]
    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    #[must_use]
    pub fn history(&self) -> &ConversationStore {
        &self.history
    }

    #[must_use]
    pub fn events(&self) -> &EventRecorder {
        &self.events
    }
}

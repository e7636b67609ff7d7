//! Shared test doubles for the upstream boundary.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chatgate::upstream::{Completion, CompletionApi, CompletionRequest, Usage, UpstreamError};
use tokio::sync::{Mutex, Semaphore};

pub fn completion(text: &str) -> Completion {
    Completion {
        text: text.to_owned(),
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        },
    }
}

/// Replays a fixed sequence of results, one per call.
pub struct ScriptedApi {
    script: Mutex<VecDeque<Result<Completion, UpstreamError>>>,
    calls: AtomicU32,
}

impl ScriptedApi {
    pub fn new(script: Vec<Result<Completion, UpstreamError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionApi for ScriptedApi {
    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(UpstreamError::Protocol("script exhausted".to_owned())))
    }
}

/// Parks every call until the test hands out a release permit, so tests can
/// hold upstream slots open and observe gate occupancy.
pub struct BlockingApi {
    started: AtomicU32,
    release: Semaphore,
}

impl BlockingApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicU32::new(0),
            release: Semaphore::new(0),
        })
    }

    /// Calls that have entered the upstream and are parked.
    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    /// Let `n` parked (or future) calls complete.
    pub fn release(&self, n: usize) {
        self.release.add_permits(n);
    }
}

#[async_trait]
impl CompletionApi for BlockingApi {
    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, UpstreamError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release
            .acquire()
            .await
            .expect("release semaphore closed")
            .forget();
        Ok(completion("done"))
    }
}

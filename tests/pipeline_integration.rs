//! End-to-end pipeline scenarios: admission, per-session ordering, retry
//! absorption, and slot release across mixed outcomes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chatgate::error::ChatError;
use chatgate::events::EventKind;
use chatgate::gate::AdmissionGate;
use chatgate::history::TurnRole;
use chatgate::pipeline::{ChatPipeline, ChatSettings};
use chatgate::upstream::{CompletionApi, RetryPolicy, UpstreamCaller, UpstreamError};

use common::{BlockingApi, ScriptedApi, completion};

fn pipeline(
    api: Arc<dyn CompletionApi>,
    capacity: usize,
    max_queue: usize,
    max_retries: u32,
) -> Arc<ChatPipeline> {
    let caller = UpstreamCaller::new(
        api,
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(400),
            max_jitter: Duration::ZERO,
        },
    );
    Arc::new(ChatPipeline::new(
        AdmissionGate::new(capacity, max_queue),
        caller,
        ChatSettings {
            model: "test-model".to_owned(),
            system_prompt: "be brief".to_owned(),
            memory_window: 20,
            temperature: None,
        },
    ))
}

#[tokio::test]
async fn same_session_turns_never_interleave() {
    let api = ScriptedApi::new(vec![
        Ok(completion("r0")),
        Ok(completion("r1")),
        Ok(completion("r2")),
    ]);
    let pipeline = pipeline(api, 3, 3, 0);

    let mut handles = Vec::new();
    for i in 0..3 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.submit_chat("alice", &format!("m{i}")).await
        }));
        // Pin down submission order.
        tokio::task::yield_now().await;
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let turns = pipeline.history().recent("alice", 20);
    let shape: Vec<(TurnRole, &str)> = turns
        .iter()
        .map(|t| (t.role, t.content.as_str()))
        .collect();
    assert_eq!(
        shape,
        vec![
            (TurnRole::User, "m0"),
            (TurnRole::Assistant, "r0"),
            (TurnRole::User, "m1"),
            (TurnRole::Assistant, "r1"),
            (TurnRole::User, "m2"),
            (TurnRole::Assistant, "r2"),
        ]
    );
}

#[tokio::test]
async fn four_sessions_against_capacity_two_queue_one() {
    let api = BlockingApi::new();
    let pipeline = pipeline(api.clone(), 2, 1, 0);

    let mut handles = Vec::new();
    for i in 0..4 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.submit_chat(&format!("session-{i}"), "hello").await
        }));
        tokio::task::yield_now().await;
    }
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    // Two calls reached the upstream, one is queued, the fourth was
    // rejected synchronously.
    assert_eq!(api.started(), 2);
    let snap = pipeline.gate().snapshot();
    assert_eq!(snap.in_flight, 2);
    assert_eq!(snap.queued, 1);

    api.release(3);
    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(ChatError::QueueFull) => rejected += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(admitted, 3);
    assert_eq!(rejected, 1);

    let snap = pipeline.gate().snapshot();
    assert_eq!(snap.in_flight, 0);
    assert_eq!(snap.queued, 0);
}

#[tokio::test(start_paused = true)]
async fn transient_rate_limit_is_invisible_to_the_submitter() {
    let api = ScriptedApi::new(vec![
        Err(UpstreamError::RateLimited),
        Err(UpstreamError::RateLimited),
        Ok(completion("finally")),
    ]);
    let pipeline = pipeline(api.clone(), 1, 0, 3);

    let reply = pipeline.submit_chat("bob", "hi").await.unwrap();
    assert_eq!(reply.reply, "finally");
    assert_eq!(api.calls(), 3);

    let events = pipeline.events().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::ChatCompleted);
    assert_eq!(events[0].payload["attempts"], 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_and_release_the_slot() {
    let api = ScriptedApi::new(vec![
        Err(UpstreamError::Server { status: 502 }),
        Err(UpstreamError::Server { status: 502 }),
        Err(UpstreamError::Server { status: 502 }),
    ]);
    let pipeline = pipeline(api.clone(), 1, 0, 2);

    let err = pipeline.submit_chat("carol", "hi").await.unwrap_err();
    match err {
        ChatError::Upstream(UpstreamError::Exhausted { attempts, .. }) => {
            assert_eq!(attempts, 3);
        }
        other => panic!("expected exhausted upstream error, got {other:?}"),
    }

    // The user turn was recorded, no assistant turn followed.
    let turns = pipeline.history().recent("carol", 20);
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, TurnRole::User);

    let events = pipeline.events().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::ChatFailed);
    assert_eq!(events[0].payload["class"], "retries_exhausted");

    // The slot came back despite the failure.
    assert_eq!(pipeline.gate().snapshot().in_flight, 0);
}

#[tokio::test]
async fn client_error_is_not_retried_through_the_pipeline() {
    let api = ScriptedApi::new(vec![Err(UpstreamError::Client {
        status: 401,
        body: "bad key".to_owned(),
    })]);
    let pipeline = pipeline(api.clone(), 1, 0, 3);

    let err = pipeline.submit_chat("dave", "hi").await.unwrap_err();
    assert!(matches!(
        err,
        ChatError::Upstream(UpstreamError::Client { status: 401, .. })
    ));
    assert_eq!(api.calls(), 1);
    assert_eq!(pipeline.gate().snapshot().in_flight, 0);
}

#[tokio::test]
async fn validation_fails_before_any_session_work() {
    let api = ScriptedApi::new(vec![]);
    let pipeline = pipeline(api.clone(), 1, 0, 0);

    let err = pipeline.submit_chat("erin", "   ").await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));
    let err = pipeline.submit_chat("", "hello").await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(_)));

    assert!(pipeline.history().recent("erin", 20).is_empty());
    assert!(pipeline.events().is_empty());
    assert_eq!(api.calls(), 0);
    assert_eq!(pipeline.gate().snapshot().in_flight, 0);
}

#[tokio::test]
async fn history_window_bounds_the_upstream_context() {
    let mut script = Vec::new();
    for i in 0..6 {
        script.push(Ok(completion(&format!("r{i}"))));
    }
    let api = ScriptedApi::new(script);
    let caller = UpstreamCaller::new(
        api,
        RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        },
    );
    let pipeline = Arc::new(ChatPipeline::new(
        AdmissionGate::new(1, 0),
        caller,
        ChatSettings {
            model: "test-model".to_owned(),
            system_prompt: "be brief".to_owned(),
            memory_window: 4,
            temperature: None,
        },
    ));

    for i in 0..6 {
        pipeline
            .submit_chat("frank", &format!("m{i}"))
            .await
            .unwrap();
    }

    // Trim-on-write keeps the stored history at the window.
    assert_eq!(pipeline.history().turn_count("frank"), 4);
    let turns = pipeline.history().recent("frank", 4);
    let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["m4", "r4", "m5", "r5"]);
}

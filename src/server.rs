use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tower_http::trace::TraceLayer;

use tracing::info;

use crate::AppState;
use crate::config::AppConfig;
use crate::error::ChatError;
use crate::gate::AdmissionGate;
use crate::pipeline::{ChatPipeline, ChatSettings};
use crate::upstream::{
    ChatCompletionsClient, CompletionApi, RetryPolicy, UpstreamCaller, UpstreamSettings, Usage,
};

/// Assemble the pipeline from configuration with the HTTP completion client.
#[must_use]
pub fn build_pipeline(config: &AppConfig) -> Arc<ChatPipeline> {
    let api: Arc<dyn CompletionApi> = Arc::new(ChatCompletionsClient::new(UpstreamSettings {
        base_url: config.upstream.base_url.clone(),
        api_key: config.upstream.api_key.clone(),
    }));
    build_pipeline_with(config, api)
}

/// Assemble the pipeline around an explicit completion implementation.
/// Separated from [`build_pipeline`] so tests can inject scripted upstreams.
#[must_use]
pub fn build_pipeline_with(config: &AppConfig, api: Arc<dyn CompletionApi>) -> Arc<ChatPipeline> {
    let caller = UpstreamCaller::new(
        api,
        RetryPolicy {
            max_retries: config.upstream.max_retries,
            base_delay: std::time::Duration::from_millis(config.upstream.base_delay_ms),
            max_jitter: std::time::Duration::from_millis(config.upstream.jitter_ms),
        },
    );
    let gate = AdmissionGate::new(config.gate.capacity, config.gate.max_queue);
    Arc::new(ChatPipeline::new(
        gate,
        caller,
        ChatSettings {
            model: config.upstream.model.clone(),
            system_prompt: config.chat.system_prompt.clone(),
            memory_window: config.chat.memory_window,
            temperature: config.upstream.temperature,
        },
    ))
}

/// Build the application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/api/sessions", get(api_list_sessions))
        .route("/api/sessions/{id}/messages", get(api_get_messages))
        .route("/api/events", get(api_export_events))
        .route("/api/gate", get(api_gate_snapshot))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admin_auth,
        ));

    Router::new()
        .route("/api/chat", post(api_chat))
        .route("/healthz", get(healthz))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the Axum server with the provided configuration.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    info!(
        name: "upstream.config.loaded",
        base_url = %config.upstream.base_url,
        model = %config.upstream.model,
        "Upstream configuration loaded"
    );

    let pipeline = build_pipeline(&config);
    let state = AppState {
        pipeline,
        config: config.clone(),
    };
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin auth
// ─────────────────────────────────────────────────────────────────────────────

async fn admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(value) if value.starts_with("Bearer ") => &value[7..],
        _ => return Err(StatusCode::UNAUTHORIZED),
    };

    match &state.config.security.admin_token {
        Some(expected)
            if !expected.is_empty() && constant_time_eq(token.as_bytes(), expected.as_bytes()) =>
        {
            Ok(next.run(request).await)
        }
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Request body for chat API.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    /// Optional session ID (a new one is minted if not provided).
    #[serde(default)]
    session_id: Option<String>,
    /// User message content.
    #[serde(default)]
    message: Option<String>,
}

/// Response from chat API.
#[derive(Debug, Serialize)]
struct ChatResponseBody {
    session_id: String,
    reply: String,
    usage: Usage,
}

/// API error with a stable code, mapped from [`ChatError`].
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    detail: Option<String>,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.into(),
            detail: None,
        }
    }

    fn from_chat(err: ChatError, debug_errors: bool) -> Self {
        let code = err.code();
        match err {
            ChatError::Validation(msg) => Self {
                status: StatusCode::BAD_REQUEST,
                code,
                message: msg,
                detail: None,
            },
            ChatError::QueueFull => Self {
                status: StatusCode::TOO_MANY_REQUESTS,
                code,
                message: "server is at capacity, try again shortly".to_owned(),
                detail: None,
            },
            ChatError::Upstream(e) => Self {
                status: StatusCode::BAD_GATEWAY,
                code,
                message: "upstream completion failed".to_owned(),
                detail: debug_errors.then(|| e.to_string()),
            },
            ChatError::Internal(msg) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code,
                message: "internal server error".to_owned(),
                detail: debug_errors.then_some(msg),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(detail) = self.detail {
            error["detail"] = serde_json::Value::String(detail);
        }
        (self.status, Json(serde_json::json!({ "error": error }))).into_response()
    }
}

/// POST /api/chat - Submit a user message and wait for the answer.
async fn api_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponseBody>, ApiError> {
    let session_id = match req.session_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => uuid::Uuid::new_v4().to_string(),
    };
    let message = req.message.unwrap_or_default();

    tracing::info!(
        name: "chat.received",
        session_id = %session_id,
        "Received chat request"
    );

    match state.pipeline.submit_chat(&session_id, &message).await {
        Ok(reply) => Ok(Json(ChatResponseBody {
            session_id: reply.session_id,
            reply: reply.reply,
            usage: reply.usage,
        })),
        Err(err) => Err(ApiError::from_chat(err, state.config.security.debug_errors)),
    }
}

#[derive(Debug, Serialize)]
struct SessionsBody {
    sessions: Vec<String>,
}

/// GET /api/sessions - List known session ids.
async fn api_list_sessions(State(state): State<AppState>) -> Json<SessionsBody> {
    let mut sessions = state.pipeline.history().session_ids();
    sessions.sort();
    Json(SessionsBody { sessions })
}

/// Message DTO for API responses.
#[derive(Debug, Serialize)]
struct MessageDto {
    role: String,
    content: String,
}

/// GET /api/sessions/{id}/messages - Windowed history of one session.
async fn api_get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<MessageDto>>, StatusCode> {
    let history = state.pipeline.history();
    if !history.contains(&id) {
        return Err(StatusCode::NOT_FOUND);
    }
    let messages: Vec<MessageDto> = history
        .recent(&id, state.config.chat.memory_window)
        .iter()
        .map(|turn| MessageDto {
            role: format!("{:?}", turn.role).to_lowercase(),
            content: turn.content.clone(),
        })
        .collect();
    Ok(Json(messages))
}

/// GET /api/events - NDJSON export of the event log.
async fn api_export_events(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = state
        .pipeline
        .events()
        .export_ndjson()
        .map_err(|e| ApiError::internal(format!("event export failed: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}

/// GET /api/gate - Admission gate occupancy for diagnostics.
async fn api_gate_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pipeline.gate().snapshot())
}

/// GET /healthz - Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

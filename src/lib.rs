//! Core library for Parley.  This module wires the permission table, the
//! chat pipeline and its stores into an axum router that serves named query
//! and mutation operations.

pub mod auth;
pub mod completion;
mod config;
pub mod conversation;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod ratelimit;
pub mod shield;
pub mod telemetry;
pub mod validate;

pub use config::{AppConfig, RotationConfig};

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::map_response_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

use crate::auth::{AuthGate, Identity};
use crate::completion::{CompletionClient, OpenAiClient};
use crate::conversation::{ConversationStore, MemoryConversationStore, RedisConversationStore};
use crate::error::{AppError, ErrorKind, ValidationIssue};
use crate::metrics::Metrics;
use crate::pipeline::{ChatPipeline, Stage};
use crate::ratelimit::{CounterStore, MemoryCounterStore, RateLimiter, RedisCounterStore};
use crate::shield::{Operation, OperationKind, PermissionTable};
use crate::telemetry::{ChatEvent, Outcome, RotatingWriter, TelemetrySink};

const DEFAULT_HISTORY_LIMIT: i64 = 10;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthGate>,
    pub permissions: Arc<PermissionTable>,
    pub chat: ChatPipeline,
    pub metrics: Arc<Metrics>,
    pub telemetry: TelemetrySink,
    /// Maximum accepted raw request body size in bytes (None => axum default)
    pub max_request_bytes: Option<usize>,
}

/// Storage and provider implementations behind the pipeline.
pub struct Backends {
    pub counters: Arc<dyn CounterStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub completion: Arc<dyn CompletionClient>,
}

impl Backends {
    /// Process-local stores around the given provider.
    pub fn in_memory(completion: Arc<dyn CompletionClient>) -> Self {
        Self {
            counters: Arc::new(MemoryCounterStore::new()),
            conversations: Arc::new(MemoryConversationStore::new()),
            completion,
        }
    }

    /// Redis-backed stores when `REDIS_URL` is configured, otherwise
    /// in-memory ones, plus the OpenAI client.
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let completion: Arc<dyn CompletionClient> = Arc::new(
            OpenAiClient::new(config.openai.clone()).context("failed to build completion client")?,
        );
        let Some(url) = config.redis_url.as_deref() else {
            tracing::warn!("REDIS_URL not set; using in-memory counters and history (single instance only)");
            return Ok(Self::in_memory(completion));
        };
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        tracing::info!("using redis for counters and history");
        Ok(Self {
            counters: Arc::new(RedisCounterStore::new(conn.clone(), config.store_timeout)),
            conversations: Arc::new(RedisConversationStore::new(conn, config.store_timeout)),
            completion,
        })
    }
}

/// Assemble application state from a parsed configuration and backends.
pub fn build_state(config: &AppConfig, backends: Backends) -> AppState {
    let metrics = Arc::new(Metrics::new());

    let writer = match config.log_file.as_deref() {
        Some(path) => match RotatingWriter::open(path, &config.rotation) {
            Ok(w) => Some(w),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to open LOG_FILE for telemetry; telemetry disabled");
                None
            }
        },
        None => {
            tracing::debug!("Telemetry file disabled: LOG_FILE not set");
            None
        }
    };
    let telemetry = TelemetrySink::new(writer, config.log_stdout, config.log_sample_n, &metrics);

    let limiter = RateLimiter::new(backends.counters, config.rate_limit, config.rate_window);
    let chat = ChatPipeline::new(
        limiter,
        backends.completion,
        backends.conversations,
        config.model.clone(),
        config.openai.timeout,
    )
    .with_metrics(metrics.clone());

    AppState {
        auth: Arc::new(AuthGate::new(&config.jwt_secret)),
        permissions: Arc::new(PermissionTable::standard()),
        chat,
        metrics,
        telemetry,
        max_request_bytes: config.max_request_bytes,
    }
}

/// Build state from environment variables; see [`AppConfig::from_env`].
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    tracing::debug!(config = ?config, "configuration loaded");
    let backends = Backends::connect(&config).await?;
    Ok(build_state(&config, backends))
}

/// Build the axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/query/:name", post(query_handler))
        .route("/mutation/:name", post(mutation_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    // The limit layer answers a declared oversized Content-Length itself;
    // the outer map turns that bare 413 into the error envelope.
    let router = if let Some(limit) = max_request_bytes {
        router.layer(
            ServiceBuilder::new()
                .layer(map_response_with_state(state.clone(), envelope_rejected_body))
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(limit)),
        )
    } else {
        router
    };

    router.with_state(state)
}

async fn query_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    dispatch(&state, OperationKind::Query, &name, &headers, body).await
}

async fn mutation_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    dispatch(&state, OperationKind::Mutation, &name, &headers, body).await
}

async fn envelope_rejected_body<B>(
    State(state): State<AppState>,
    response: axum::http::Response<B>,
) -> Response
where
    B: axum::body::HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if response.status() != StatusCode::PAYLOAD_TOO_LARGE || is_json {
        return response.into_response();
    }
    tracing::warn!(limit = ?state.max_request_bytes, "declared request body exceeds configured limit");
    state.metrics.record_request();
    state.metrics.record_error(ErrorKind::PayloadTooLarge);
    AppError::PayloadTooLarge {
        limit: state.max_request_bytes,
    }
    .into_response()
}

fn body_error(rejection: BytesRejection, limit: Option<usize>) -> AppError {
    match rejection {
        BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_)) => {
            AppError::PayloadTooLarge { limit }
        }
        other => {
            tracing::debug!(error = %other, "failed to read request body");
            malformed("Failed to read request body")
        }
    }
}

fn malformed(message: &str) -> AppError {
    AppError::bad_input(vec![ValidationIssue {
        path: String::new(),
        message: message.to_string(),
    }])
}

/// Operation arguments: a JSON object, or nothing at all.
fn parse_args(body: &[u8]) -> Result<Value, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Null) => Ok(Value::Object(Map::new())),
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(_) => Err(malformed("Arguments must be a JSON object")),
        Err(e) => {
            tracing::debug!(error = %e, "malformed request body");
            Err(malformed("Malformed JSON body"))
        }
    }
}

async fn dispatch(
    state: &AppState,
    kind: OperationKind,
    name: &str,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let started = Instant::now();
    state.metrics.record_request();

    let body = match body {
        Ok(bytes) => bytes,
        Err(rejection) => {
            let err = body_error(rejection, state.max_request_bytes);
            tracing::warn!(operation = name, code = err.kind().code(), limit = ?state.max_request_bytes, "request body rejected");
            state.metrics.record_error(err.kind());
            return err.into_response();
        }
    };

    let correlation_id = headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let identity = state.auth.identify(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    );
    tracing::debug!(
        kind = kind.as_str(),
        operation = name,
        correlation_id = %correlation_id,
        authenticated = identity.is_some(),
        stage = %Stage::Received
    );

    let (question_chars, result) = match parse_args(&body) {
        Ok(args) => {
            let chars = args
                .get("question")
                .and_then(Value::as_str)
                .map_or(0, |q| q.chars().count());
            (chars, resolve(state, kind, name, identity.as_ref(), &args).await)
        }
        Err(e) => (0, Err(e)),
    };

    if Operation::lookup(kind, name) == Some(Operation::AskQuestion) {
        record_chat_event(
            state,
            &correlation_id,
            identity.as_ref(),
            &result,
            question_chars,
            started,
        );
    }

    match result {
        Ok(data) => {
            tracing::debug!(operation = name, stage = %Stage::Responded, latency_ms = started.elapsed().as_millis() as u64);
            (StatusCode::OK, Json(json!({ "data": data }))).into_response()
        }
        Err(err) => {
            let stage = Stage::for_error(&err);
            match err.kind() {
                ErrorKind::Upstream | ErrorKind::Internal => {
                    tracing::warn!(operation = name, stage = %stage, code = err.kind().code(), "operation failed")
                }
                _ => tracing::info!(operation = name, stage = %stage, code = err.kind().code(), "operation rejected"),
            }
            state.metrics.record_error(err.kind());
            err.into_response()
        }
    }
}

fn record_chat_event(
    state: &AppState,
    correlation_id: &str,
    identity: Option<&Identity>,
    result: &Result<Value, AppError>,
    question_chars: usize,
    started: Instant,
) {
    let (outcome, code, remaining) = match result {
        Ok(data) => (
            Outcome::Answered,
            None,
            data.pointer("/rateLimitInfo/remaining")
                .and_then(Value::as_u64)
                .map(|r| r as u32),
        ),
        Err(err) => {
            let outcome = match err.kind() {
                ErrorKind::Upstream | ErrorKind::Internal => Outcome::Failed,
                _ => Outcome::Rejected,
            };
            let remaining = matches!(err, AppError::RateLimited { .. }).then_some(0);
            (outcome, Some(err.kind().code()), remaining)
        }
    };
    state.telemetry.emit(&ChatEvent {
        subject: identity.map(|i| i.subject_id.as_str()),
        outcome,
        code,
        latency_ms: started.elapsed().as_millis() as u64,
        remaining,
        question_chars,
        ..ChatEvent::new(correlation_id, chrono::Utc::now())
    });
}

fn authenticated(identity: Option<&Identity>) -> Result<&Identity, AppError> {
    identity.ok_or(AppError::Unauthenticated)
}

fn encode<T: serde::Serialize>(value: T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(format!("failed to encode result: {}", e)))
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, AppError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(&format!("{} is required", key)))
}

/// Authorize the named operation, then run its resolver.
async fn resolve(
    state: &AppState,
    kind: OperationKind,
    name: &str,
    identity: Option<&Identity>,
    args: &Value,
) -> Result<Value, AppError> {
    let op = state
        .permissions
        .authorize_named(kind, name, identity, args)?;
    tracing::debug!(operation = %op, stage = %Stage::Authorized);

    match op {
        Operation::Health => Ok(json!("ok")),
        Operation::Me => encode(authenticated(identity)?),
        Operation::ChatHistory => {
            let identity = authenticated(identity)?;
            let limit = args
                .get("limit")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_HISTORY_LIMIT)
                .max(0) as usize;
            let offset = args
                .get("offset")
                .and_then(Value::as_i64)
                .unwrap_or(0)
                .max(0) as usize;
            encode(state.chat.history(identity, limit, offset).await?)
        }
        Operation::RateLimitStatus => encode(state.chat.quota(authenticated(identity)?).await?),
        Operation::AskQuestion => {
            let identity = authenticated(identity)?;
            let question = str_arg(args, "question")?;
            encode(state.chat.ask(identity, question).await?)
        }
        Operation::ResetRateLimit => {
            let subject = str_arg(args, "subjectId")?;
            state.chat.limiter().reset(subject).await?;
            Ok(json!(true))
        }
    }
}

/// Liveness endpoint for container health checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "operations": Operation::ALL.len(),
        "rateLimit": state.chat.limiter().limit(),
        "rateWindowSecs": state.chat.limiter().window().as_secs(),
        "model": state.chat.model(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// Prometheus-style metrics exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

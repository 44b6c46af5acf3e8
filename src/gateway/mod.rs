//! Axum-based HTTP surface for the webhook gateway.
//!
//! Response contract with the provider:
//! - `GET /webhook` is the subscription handshake (echo `hub.challenge`)
//! - `HEAD /webhook` is a liveness probe, always 200
//! - `POST /webhook` returns 401 only for a bad signature; everything
//!   else — malformed JSON, schema violations, handler failures — is
//!   acknowledged with `200 {"success": true}`, because any other status
//!   makes the provider redeliver and a systemic failure becomes a retry
//!   storm. Real failures go to the audit log and the metrics registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::audit::{self, AuditEvent, AuditKind, AuditSink, TracingAuditSink};
use crate::channels::{Channel, CloudChannel, DisabledChannel};
use crate::config::Config;
use crate::handlers::{EventHandler, HttpForwardHandler, NoopHandler};
use crate::metrics::GatewayMetrics;
use crate::util::constant_time_eq;
use crate::webhook::envelope::{self, WebhookEnvelope};
use crate::webhook::signature::{verify_signature, SIGNATURE_HEADER};
use crate::webhook::{DedupWindow, Dispatcher, SenderRateLimiter};

/// Maximum request body size (64KB) — prevents memory exhaustion
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s) — prevents slow-loris attacks
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Longest challenge echoed back by the verification handshake.
const CHALLENGE_MAX_CHARS: usize = 256;

/// Prometheus content type for text exposition format.
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub verify_token: Option<Arc<str>>,
    /// App secret for webhook signature verification (`X-Hub-Signature-256`).
    pub app_secret: Option<Arc<str>>,
    pub dispatcher: Arc<Dispatcher>,
    pub audit: Arc<dyn AuditSink>,
    pub metrics: Arc<GatewayMetrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/webhook", get(handle_verify).post(handle_receive))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

fn is_public_bind(host: &str) -> bool {
    !(host == "localhost" || host == "::1" || host.starts_with("127."))
}

fn secret_from(value: &Option<String>) -> Option<Arc<str>> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(Arc::from)
}

/// Run the HTTP gateway until ctrl-c.
pub async fn run_gateway(config: Config) -> Result<()> {
    let host = config.gateway.host.clone();
    let port = config.gateway.port;

    // ── Security: refuse public bind without explicit opt-in ──
    if is_public_bind(&host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "🛑 Refusing to bind to {host} — gateway would be exposed to the internet.\n\
             Fix: use host 127.0.0.1 (default) behind a reverse proxy, or set\n\
             [gateway] allow_public_bind = true in config.toml."
        );
    }

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_port = listener.local_addr()?.port();

    let metrics = Arc::new(GatewayMetrics::new());
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

    let dedup = Arc::new(DedupWindow::new(
        Duration::from_secs(config.webhook.dedup_ttl_secs.max(1)),
        config.webhook.dedup_max_entries.max(1),
    ));
    let sweeper = dedup
        .clone()
        .spawn_sweeper(Duration::from_secs(config.webhook.dedup_sweep_secs.max(1)));
    let limiter = Arc::new(SenderRateLimiter::new(
        config.webhook.rate_limit_per_window,
        Duration::from_secs(config.webhook.rate_limit_window_secs.max(1)),
        config.webhook.rate_limit_max_senders.max(1),
    ));

    let outbound: Arc<dyn Channel> = match config.channel.as_ref() {
        Some(channel) => Arc::new(CloudChannel::new(
            &channel.api_url,
            &channel.phone_number_id,
            &channel.access_token,
        )?),
        None => Arc::new(DisabledChannel),
    };
    let handler: Arc<dyn EventHandler> = match config.forward.as_ref() {
        Some(forward) => Arc::new(HttpForwardHandler::new(forward)?),
        None => Arc::new(NoopHandler),
    };

    let dispatcher = Arc::new(Dispatcher::new(
        handler,
        outbound,
        dedup,
        limiter,
        audit.clone(),
        metrics.clone(),
        Duration::from_secs(config.webhook.handler_timeout_secs.max(1)),
    ));

    let app_secret = secret_from(&config.webhook.app_secret);
    if app_secret.is_none() {
        tracing::warn!("no app secret configured — webhook signature verification is DISABLED");
    }

    println!("🏠 Stayflow gateway listening on http://{host}:{actual_port}");
    println!("  GET  /webhook   — provider verification handshake");
    println!("  POST /webhook   — event delivery");
    println!("  GET  /health    — health check");
    println!("  GET  /metrics   — Prometheus metrics");
    println!("  Press Ctrl+C to stop.\n");

    let state = AppState {
        verify_token: secret_from(&config.webhook.verify_token),
        app_secret,
        dispatcher,
        audit,
        metrics,
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health — always public (no secrets leaked)
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// GET /metrics — Prometheus text exposition format
async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.encode(),
    )
}

/// Provider verification query params.
#[derive(Debug, serde::Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// GET/HEAD /webhook — subscription handshake and liveness probe
async fn handle_verify(
    State(state): State<AppState>,
    method: Method,
    Query(params): Query<VerifyQuery>,
) -> Response {
    // axum routes HEAD through the GET handler; the probe gets an empty
    // 200 without touching the handshake.
    if method == Method::HEAD {
        return StatusCode::OK.into_response();
    }

    let (Some(mode), Some(token), Some(challenge)) =
        (params.mode, params.verify_token, params.challenge)
    else {
        return (StatusCode::BAD_REQUEST, "Missing hub.* parameters").into_response();
    };

    // Constant-time token comparison to prevent timing attacks.
    let token_matches = state
        .verify_token
        .as_deref()
        .is_some_and(|expected| constant_time_eq(&token, expected));
    if mode != "subscribe" || !token_matches {
        tracing::warn!("webhook verification failed — mode or token mismatch");
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    tracing::info!("webhook verified successfully");
    (StatusCode::OK, sanitize_challenge(&challenge)).into_response()
}

/// The challenge is echoed into a text/plain body; keep it printable and
/// bounded no matter what arrives in the query string.
fn sanitize_challenge(challenge: &str) -> String {
    challenge
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(CHALLENGE_MAX_CHARS)
        .collect()
}

/// The one acknowledgment the provider accepts without redelivering.
fn ack() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"success": true}))).into_response()
}

/// POST /webhook — event delivery
async fn handle_receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // ── Signature check on the exact raw bytes, before any parsing ──
    if let Some(ref app_secret) = state.app_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if !verify_signature(app_secret, &body, signature) {
            state.metrics.auth_failures.inc();
            tracing::warn!(
                "webhook signature verification failed (signature: {})",
                if signature.is_empty() { "missing" } else { "invalid" }
            );
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Invalid signature"})),
            )
                .into_response();
        }
    }

    // From here on the provider always gets a success acknowledgment.
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            state.metrics.malformed.inc();
            tracing::warn!("webhook body is not valid JSON: {err}");
            audit::emit(
                state.audit.as_ref(),
                AuditEvent::new(AuditKind::Error, "-", serde_json::json!({"stage": "parse"}))
                    .with_error(err.to_string()),
            )
            .await;
            return ack();
        }
    };

    if let Err(violations) = envelope::validate(&value) {
        state.metrics.malformed.inc();
        let detail = violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        tracing::warn!("webhook envelope failed validation: {detail}");
        audit::emit(
            state.audit.as_ref(),
            AuditEvent::new(AuditKind::Error, "-", serde_json::json!({"stage": "validate"}))
                .with_error(detail),
        )
        .await;
        return ack();
    }

    let delivery: WebhookEnvelope = match serde_json::from_value(value) {
        Ok(delivery) => delivery,
        Err(err) => {
            state.metrics.malformed.inc();
            tracing::warn!("webhook envelope failed to deserialize: {err}");
            return ack();
        }
    };

    // A validated delivery with no entries is a no-op, not an error.
    if delivery.entry.is_empty() {
        return ack();
    }

    state.metrics.deliveries.inc();
    let summary = state.dispatcher.process(&delivery).await;
    tracing::info!(
        processed = summary.messages_processed,
        duplicates = summary.duplicates,
        rate_limited = summary.rate_limited,
        failures = summary.failures,
        statuses = summary.statuses_processed,
        "webhook delivery dispatched"
    );

    ack()
}

// ABOUTME: HTTP webhook receiver for git push notifications, plus the Prometheus metrics endpoint
// ABOUTME: Provides POST /api/webhook (HMAC-SHA1 signed) and GET /metrics

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use hmac::{Hmac, Mac};
use metrics_exporter_prometheus::PrometheusHandle;
use saltbot_core::{metrics, Config, ExchangeRequest, PushEvent, QueueSender};
use serde::Deserialize;
use sha1::Sha1;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

type HmacSha1 = Hmac<Sha1>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";
pub const EVENT_HEADER: &str = "X-GitHub-Event";

#[derive(Clone)]
struct WebhookState {
    secret: Arc<String>,
    requests: QueueSender<ExchangeRequest>,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    gitref: String,
    repository: RepositoryPayload,
    head_commit: CommitPayload,
    pusher: PusherPayload,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct CommitPayload {
    id: String,
    message: String,
    timestamp: String,
    url: String,
    author: AuthorPayload,
}

#[derive(Debug, Deserialize)]
struct AuthorPayload {
    username: String,
}

#[derive(Debug, Deserialize)]
struct PusherPayload {
    name: String,
}

/// Check an `X-Hub-Signature` header (`sha1=<hex>`) against the body.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.strip_prefix("sha1=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// `sha1=<hex>` signature for a body; what a sender puts in `X-Hub-Signature`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).context("Invalid HMAC key")?;
    mac.update(body);
    Ok(format!("sha1={}", hex::encode(mac.finalize().into_bytes())))
}

/// Turn a push payload into a PushEvent.
pub fn normalize_push(body: &[u8]) -> Result<PushEvent> {
    let payload: PushPayload =
        serde_json::from_slice(body).context("Malformed push payload")?;
    Ok(PushEvent {
        gitref: payload.gitref,
        repo_name: payload.repository.full_name,
        repo_url: payload.repository.url,
        commit_id: payload.head_commit.id,
        commit_msg: payload.head_commit.message,
        commit_ts: payload.head_commit.timestamp,
        commit_url: payload.head_commit.url,
        commit_author: payload.head_commit.author.username,
        pusher: payload.pusher.name,
        received_at: chrono::Utc::now(),
    })
}

pub fn router(
    secret: String,
    requests: QueueSender<ExchangeRequest>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let state = WebhookState {
        secret: Arc::new(secret),
        requests,
    };

    let webhook_routes = Router::new()
        .route("/api/webhook", post(webhook_handler))
        .with_state(state);

    // Metrics endpoint - renders Prometheus text format
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(metrics_handle));

    Router::new()
        .merge(webhook_routes)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}

/// Serve the webhook until cancelled.
pub async fn serve(
    config: Arc<Config>,
    requests: QueueSender<ExchangeRequest>,
    cancel: CancellationToken,
) -> Result<()> {
    let metrics_handle =
        metrics::init_metrics().context("Failed to initialize Prometheus metrics")?;
    let app = router(config.webhook.secret.clone(), requests, metrics_handle);

    let addr = format!("{}:{}", config.webhook.host, config.webhook.port);
    tracing::info!(addr = %addr, "Starting webhook server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    tracing::info!("Webhook server stopped");
    Ok(())
}

async fn webhook_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    tracing::info!(bytes = body.len(), "Webhook received");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if !verify_signature(&state.secret, &body, signature) {
        tracing::warn!("Invalid signature received");
        metrics::record_webhook_request("forbidden");
        return (StatusCode::FORBIDDEN, "Invalid signature");
    }

    let event = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match event {
        "push" => match normalize_push(&body) {
            Ok(push) => {
                tracing::info!(
                    repo = %push.repo_name,
                    gitref = %push.gitref,
                    pusher = %push.pusher,
                    "Push received"
                );
                if state.requests.send(ExchangeRequest::Push(push)).is_err() {
                    tracing::error!("Exchange request queue closed");
                    metrics::record_webhook_request("error");
                    return (StatusCode::SERVICE_UNAVAILABLE, "Unavailable");
                }
                metrics::record_webhook_request("accepted");
                (StatusCode::OK, "OK")
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "Rejecting push payload");
                metrics::record_webhook_request("bad_request");
                (StatusCode::BAD_REQUEST, "Malformed push payload")
            }
        },
        "ping" => {
            tracing::info!("Received ping");
            metrics::record_webhook_request("ping");
            (StatusCode::OK, "OK")
        }
        other => {
            tracing::debug!(event = %other, "Ignoring webhook event");
            metrics::record_webhook_request("ignored");
            (StatusCode::OK, "OK")
        }
    }
}

async fn metrics_handler(State(handle): State<Arc<PrometheusHandle>>) -> String {
    handle.render()
}

// ABOUTME: Tests for the webhook HTTP surface: signature checks, push normalization, ping
// ABOUTME: Drives the axum router directly with tower's oneshot, no socket involved

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use saltbot::webhook::{self, EVENT_HEADER, SIGNATURE_HEADER};
use saltbot_core::{metrics, ExchangeRequest, Queue};
use serde_json::json;
use tower::ServiceExt;

const SECRET: &str = "It's a Secret to Everybody";

fn push_body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ref": "refs/heads/main",
        "before": "0000000000000000000000000000000000000000",
        "repository": {
            "full_name": "ops/states",
            "url": "https://git.example.com/ops/states",
            "private": true
        },
        "head_commit": {
            "id": "1481a2de7b2a7d02428ad93446ab166be7793fbb",
            "message": "Bump nginx worker count\n\nLoad is up.",
            "timestamp": "2024-03-05T10:15:00Z",
            "url": "https://git.example.com/ops/states/commit/1481a2d",
            "author": { "name": "Alice", "username": "alice" }
        },
        "pusher": { "name": "alice", "email": "alice@example.com" }
    }))
    .unwrap()
}

fn app(queue: &Queue<ExchangeRequest>) -> Router {
    let handle = metrics::init_metrics().unwrap();
    webhook::router(SECRET.to_string(), queue.sender(), handle)
}

fn webhook_request(event: &str, body: Vec<u8>, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/webhook")
        .header("content-type", "application/json")
        .header(EVENT_HEADER, event);
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_signed_push_is_queued_for_exchange() {
    let queue = Queue::new();
    let body = push_body();
    let signature = webhook::sign(SECRET, &body).unwrap();

    let response = app(&queue)
        .oneshot(webhook_request("push", body, Some(signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let request = queue.receiver().try_recv().await;
    let Some(ExchangeRequest::Push(push)) = request else {
        panic!("expected a queued push, got {:?}", request);
    };
    assert_eq!(push.gitref, "refs/heads/main");
    assert_eq!(push.branch(), Some("main"));
    assert_eq!(push.repo_name, "ops/states");
    assert_eq!(push.repo_url, "https://git.example.com/ops/states");
    assert_eq!(push.commit_id, "1481a2de7b2a7d02428ad93446ab166be7793fbb");
    assert_eq!(push.commit_msg, "Bump nginx worker count\n\nLoad is up.");
    assert_eq!(push.commit_ts, "2024-03-05T10:15:00Z");
    assert_eq!(push.commit_author, "alice");
    assert_eq!(push.pusher, "alice");
}

#[tokio::test]
async fn test_bad_signature_is_forbidden() {
    let queue = Queue::new();
    let body = push_body();
    let signature = webhook::sign("wrong secret", &body).unwrap();

    let response = app(&queue)
        .oneshot(webhook_request("push", body, Some(signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_text(response).await, "Invalid signature");
    assert!(queue.receiver().try_recv().await.is_none());
}

#[tokio::test]
async fn test_missing_signature_is_forbidden() {
    let queue = Queue::new();

    let response = app(&queue)
        .oneshot(webhook_request("push", push_body(), None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(queue.receiver().try_recv().await.is_none());
}

#[tokio::test]
async fn test_ping_acknowledged_without_queueing() {
    let queue = Queue::new();
    let body = br#"{"zen": "Design for failure."}"#.to_vec();
    let signature = webhook::sign(SECRET, &body).unwrap();

    let response = app(&queue)
        .oneshot(webhook_request("ping", body, Some(signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK");
    assert!(queue.receiver().try_recv().await.is_none());
}

#[tokio::test]
async fn test_other_events_ignored() {
    let queue = Queue::new();
    let body = br#"{"action": "opened"}"#.to_vec();
    let signature = webhook::sign(SECRET, &body).unwrap();

    let response = app(&queue)
        .oneshot(webhook_request("issues", body, Some(signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(queue.receiver().try_recv().await.is_none());
}

#[tokio::test]
async fn test_malformed_push_is_bad_request() {
    let queue = Queue::new();
    let body = br#"{"ref": "refs/heads/main", "repository": {}}"#.to_vec();
    let signature = webhook::sign(SECRET, &body).unwrap();

    let response = app(&queue)
        .oneshot(webhook_request("push", body, Some(signature)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(queue.receiver().try_recv().await.is_none());
}

#[tokio::test]
async fn test_metrics_endpoint_renders_counters() {
    let queue = Queue::new();
    let router = app(&queue);

    // Any request counts, even a rejected one
    router
        .clone()
        .oneshot(webhook_request("push", push_body(), None))
        .await
        .unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response)
        .await
        .contains("saltbot_webhook_requests_total"));
}

#[tokio::test]
async fn test_get_on_webhook_not_allowed() {
    let queue = Queue::new();

    let response = app(&queue)
        .oneshot(
            Request::builder()
                .uri("/api/webhook")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

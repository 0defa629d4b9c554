//! HTTP API routes exercised in-process.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{fixture, north_of, pool_id, two_pools, DEST};
use crpark_allocator::api::{create_router, AppState};
use crpark_allocator::commit::{MockCommitEndpoint, MockReply};
use crpark_allocator::listener::FeedStatus;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

fn app(endpoint: MockCommitEndpoint, feed: FeedStatus) -> Router {
    let fx = fixture(two_pools(), endpoint);
    let (tx, rx) = watch::channel(feed);
    // The receiver keeps the last value once the sender is gone.
    drop(tx);
    create_router(AppState::new(fx.allocator, rx))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn allocation_body(requester: &str) -> Value {
    let origin = north_of(DEST, -2.0);
    json!({
        "requester_id": requester,
        "origin": { "lat": origin.lat, "lng": origin.lng },
        "destination": { "lat": DEST.lat, "lng": DEST.lng },
        "duration_minutes": 60,
    })
}

#[tokio::test]
async fn test_health_and_readiness() {
    let app = app(MockCommitEndpoint::new(), FeedStatus::Connected);
    let (status, body) = call(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pools"], 2);
}

#[tokio::test]
async fn test_readiness_degraded_without_feed() {
    let app = app(MockCommitEndpoint::new(), FeedStatus::Disconnected);
    let (status, body) = call(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["code"], "feed_disconnected");
}

#[tokio::test]
async fn test_pools_and_preview() {
    let app = app(MockCommitEndpoint::new(), FeedStatus::Connected);

    let (status, body) = call(&app, "GET", "/v1/pools", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let (status, body) = call(
        &app,
        "POST",
        "/v1/candidates",
        Some(json!({ "destination": { "lat": DEST.lat, "lng": DEST.lng } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pass"], "primary");
    assert_eq!(body["items"][0]["pool"]["id"], "P1");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/candidates",
        Some(json!({ "destination": { "lat": 123.0, "lng": 0.0 } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}

#[tokio::test]
async fn test_allocation_retry_and_commitment_routes() {
    let endpoint = MockCommitEndpoint::new().script(&pool_id("P1"), [MockReply::Reject]);
    let app = app(endpoint, FeedStatus::Connected);

    let (status, body) = call(&app, "POST", "/v1/allocations", Some(allocation_body("driver-7"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "awaiting_retry_decision");
    assert_eq!(body["code"], "rejected");

    let (status, body) = call(&app, "GET", "/v1/allocations/driver-7", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "awaiting_retry_decision");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/allocations/driver-7/retry",
        Some(json!({ "confirm": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "accepted");
    assert_eq!(body["commitment"]["pool_id"], "P1");

    let (status, body) = call(&app, "GET", "/v1/requesters/driver-7/commitment", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["commitment"]["phase"], "second_chance");

    let (status, body) = call(&app, "GET", "/v1/requesters/driver-7/attempts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);

    let (status, _) = call(&app, "DELETE", "/v1/requesters/driver-7/commitment", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "GET", "/v1/requesters/driver-7/history", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["status"], "released");

    let (status, body) = call(&app, "GET", "/v1/requesters/driver-7/commitment", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "no_commitment");
}

#[tokio::test]
async fn test_error_mapping() {
    let app = app(MockCommitEndpoint::new(), FeedStatus::Connected);

    let mut bad = allocation_body("driver-1");
    bad["duration_minutes"] = json!(0);
    let (status, body) = call(&app, "POST", "/v1/allocations", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
    assert_eq!(body["status"], 400);

    let (status, body) = call(
        &app,
        "POST",
        "/v1/allocations/nobody/retry",
        Some(json!({ "confirm": false })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "no_session");

    call(&app, "POST", "/v1/allocations", Some(allocation_body("driver-1"))).await;
    let (status, body) = call(
        &app,
        "POST",
        "/v1/allocations/driver-1/retry",
        Some(json!({ "confirm": true })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "invalid_transition");
}

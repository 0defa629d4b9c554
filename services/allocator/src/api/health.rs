//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use super::AppState;
use crate::error::ErrorCode;
use crate::listener::FeedStatus;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,

    pub service: String,
    pub version: String,

    /// Current timestamp (RFC 3339).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<String>,

    /// Why the service is degraded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pools: Option<usize>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// Liveness: the process is up.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "allocator".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        feed: None,
        code: None,
        pools: None,
    })
}

/// Readiness.
///
/// A disconnected feed leaves the cache stale but usable, so the service
/// reports `degraded` and still accepts traffic.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let feed = state.feed_status();
    let connected = feed == FeedStatus::Connected;
    let pools = state.allocator().cache().len().await;

    let response = HealthResponse {
        status: if connected { "ok" } else { "degraded" }.to_string(),
        service: "allocator".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        feed: Some(
            match feed {
                FeedStatus::Connected => "connected",
                FeedStatus::Disconnected => "disconnected",
            }
            .to_string(),
        ),
        code: (!connected).then(|| ErrorCode::FeedDisconnected.as_str().to_string()),
        pools: Some(pools),
    };

    (StatusCode::OK, Json(response))
}

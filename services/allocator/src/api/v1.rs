//! API v1 routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use crpark_id::RequesterId;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::AppState;
use crate::pool::{GeoPoint, ResourcePool};
use crate::protocol::{AllocationRequest, RetryDecision};
use crate::scoring::{Candidate, RankQuery, RankingPass};
use crate::state::{ActiveCommitment, HistoryEntry};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/pools", get(list_pools))
        .route("/candidates", post(preview_candidates))
        .route("/allocations", post(create_allocation))
        .route("/allocations/{requester_id}", get(get_allocation))
        .route("/allocations/{requester_id}/retry", post(decide_retry))
        .route(
            "/requesters/{requester_id}/commitment",
            get(get_commitment).delete(release_commitment),
        )
        .route("/requesters/{requester_id}/history", get(get_history))
        .route("/requesters/{requester_id}/attempts", get(get_attempts))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ListPoolsResponse {
    pub items: Vec<ResourcePool>,
}

/// Ranking preview request.
#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub origin: Option<GeoPoint>,
    pub destination: GeoPoint,
    #[serde(default)]
    pub pass: RankingPass,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub pass: RankingPass,
    pub items: Vec<Candidate>,
}

/// Answer to the second-chance question.
#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub confirm: bool,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub items: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
pub struct AttemptsResponse {
    pub items: Vec<crate::protocol::ReservationAttempt>,
}

fn requester(raw: &str) -> Result<RequesterId, ApiError> {
    RequesterId::parse(raw)
        .map_err(|e| ApiError::bad_request("invalid_request", format!("invalid requester id: {e}")))
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /v1/pools
async fn list_pools(State(state): State<AppState>) -> impl IntoResponse {
    let items = state.allocator().cache().list().await;
    Json(ListPoolsResponse { items })
}

/// POST /v1/candidates
async fn preview_candidates(
    State(state): State<AppState>,
    Json(req): Json<PreviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let valid_origin = req.origin.is_none_or(|o| o.is_valid());
    if !req.destination.is_valid() || !valid_origin {
        return Err(ApiError::bad_request(
            "invalid_request",
            "coordinates out of range",
        ));
    }

    let query = RankQuery {
        origin: req.origin,
        destination: req.destination,
    };
    let items = state.allocator().preview(&query, req.pass).await;
    Ok(Json(PreviewResponse {
        pass: req.pass,
        items,
    }))
}

/// POST /v1/allocations
async fn create_allocation(
    State(state): State<AppState>,
    Json(req): Json<AllocationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.allocator().allocate(req).await?;
    Ok((StatusCode::OK, Json(report)))
}

/// GET /v1/allocations/{requester_id}
async fn get_allocation(
    State(state): State<AppState>,
    Path(requester_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let requester_id = requester(&requester_id)?;
    let report = state
        .allocator()
        .session(&requester_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found("no_session", format!("no allocation session for {requester_id}"))
        })?;
    Ok(Json(report))
}

/// POST /v1/allocations/{requester_id}/retry
async fn decide_retry(
    State(state): State<AppState>,
    Path(requester_id): Path<String>,
    Json(req): Json<RetryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let requester_id = requester(&requester_id)?;
    let report = state
        .allocator()
        .decide_retry(&requester_id, RetryDecision::from(req.confirm))
        .await?;
    Ok(Json(report))
}

/// GET /v1/requesters/{requester_id}/commitment
async fn get_commitment(
    State(state): State<AppState>,
    Path(requester_id): Path<String>,
) -> Result<Json<ActiveCommitment>, ApiError> {
    let requester_id = requester(&requester_id)?;
    state
        .allocator()
        .active_commitment(&requester_id)?
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found("no_commitment", format!("no active commitment for {requester_id}"))
        })
}

/// DELETE /v1/requesters/{requester_id}/commitment
async fn release_commitment(
    State(state): State<AppState>,
    Path(requester_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let requester_id = requester(&requester_id)?;
    let released = state.allocator().release(&requester_id).await?;
    released.map(Json).ok_or_else(|| {
        ApiError::not_found("no_commitment", format!("no active commitment for {requester_id}"))
    })
}

/// GET /v1/requesters/{requester_id}/history
async fn get_history(
    State(state): State<AppState>,
    Path(requester_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let requester_id = requester(&requester_id)?;
    let items = state
        .allocator()
        .store()
        .history(&requester_id)
        .map_err(crate::error::AllocationError::from)?;
    Ok(Json(HistoryResponse { items }))
}

/// GET /v1/requesters/{requester_id}/attempts
async fn get_attempts(
    State(state): State<AppState>,
    Path(requester_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let requester_id = requester(&requester_id)?;
    let items = state
        .allocator()
        .store()
        .attempts(&requester_id)
        .map_err(crate::error::AllocationError::from)?;
    Ok(Json(AttemptsResponse { items }))
}

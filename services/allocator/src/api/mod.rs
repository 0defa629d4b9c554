//! HTTP API handlers and routing.

pub mod error;
mod health;
mod v1;

use axum::{
    http::{header, Method},
    Router,
};
use tokio::sync::watch;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::listener::FeedStatus;
use crate::protocol::Allocator;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    allocator: Allocator,
    feed_status: watch::Receiver<FeedStatus>,
}

impl AppState {
    pub fn new(allocator: Allocator, feed_status: watch::Receiver<FeedStatus>) -> Self {
        Self {
            allocator,
            feed_status,
        }
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn feed_status(&self) -> FeedStatus {
        *self.feed_status.borrow()
    }
}

/// Create the API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

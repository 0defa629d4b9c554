//! crpark allocator service
//!
//! Serves the allocation API, keeps the occupancy cache in line with the
//! upstream event feed and persists sessions in a local SQLite store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crpark_allocator::api::{self, AppState};
use crpark_allocator::cache::OccupancyCache;
use crpark_allocator::client::HttpCommitEndpoint;
use crpark_allocator::config::Config;
use crpark_allocator::feed::HttpEventFeed;
use crpark_allocator::listener::{FeedStatus, ReconciliationListener};
use crpark_allocator::pool;
use crpark_allocator::protocol::Allocator;
use crpark_allocator::state::SessionStore;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        listen_addr = %config.listen_addr,
        commit_url = %config.commit_url,
        feed_url = config.feed_url.as_deref().unwrap_or("-"),
        data_dir = %config.data_dir.display(),
        "Starting crpark allocator"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = SessionStore::open(config.session_db_path())
        .context("failed to open session store")?
        .with_ttl(config.session_ttl)
        .context("invalid session ttl")?
        .with_retention(config.retention);
    let store = Arc::new(store);

    let cache = Arc::new(OccupancyCache::new());
    if let Some(path) = &config.pools_file {
        let pools = pool::load_seed(path)
            .with_context(|| format!("failed to load pools from {}", path.display()))?;
        info!(count = pools.len(), "Seeded occupancy cache");
        cache.seed(pools).await;
    } else {
        warn!("No pool seed configured, starting with an empty cache");
    }

    let endpoint = HttpCommitEndpoint::new(&config.commit_url, config.commit_timeout)
        .context("failed to build commit client")?;
    let allocator = Allocator::new(
        Arc::clone(&cache),
        Arc::new(endpoint),
        Arc::clone(&store),
        config.allocator_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (feed_status, listener_handle) = match &config.feed_url {
        Some(url) => {
            let feed = HttpEventFeed::new(url.clone(), Duration::from_secs(10))
                .context("failed to build event feed client")?;
            let listener = ReconciliationListener::new(
                Arc::new(feed),
                Arc::clone(&cache),
                Arc::clone(&store),
                config.listener_config(),
            );
            let status = listener.status();
            let handle = tokio::spawn(listener.run(shutdown_rx.clone()));
            (status, Some(handle))
        }
        None => {
            warn!("No event feed configured, the occupancy cache will not be reconciled");
            let (_, status) = watch::channel(FeedStatus::Disconnected);
            (status, None)
        }
    };

    let app = api::create_router(AppState::new(allocator, feed_status));
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if let Some(handle) = listener_handle {
        if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
            warn!("Reconciliation listener did not shut down in time");
        }
    }

    info!("Allocator shutdown complete");
    Ok(())
}

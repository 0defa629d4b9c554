//! Reconciliation listener.
//!
//! Consumes the event feed and keeps local state in line with upstream:
//! occupancy deltas go to the cache, reservation outcomes confirm or revoke
//! stored commitments, and optimisation passes refresh pool parameters.
//! Delivery is at-least-once, so every event is deduplicated by timestamp.
//!
//! The listener reconnects after any connection loss and never gives up.

use std::sync::Arc;

use crpark_events::{FeedEvent, OptimizationComplete, ReservationOutcome};
use crpark_id::PoolId;
use crpark_reconcile::{BackoffPolicy, Observation, Watermark, Watermarks};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{DeltaOutcome, OccupancyCache};
use crate::feed::{EventFeed, EventStream};
use crate::state::{OutcomeEffect, SessionStore};

/// Connection state of the event feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Connected,
    Disconnected,
}

/// Listener configuration.
#[derive(Debug, Clone, Default)]
pub struct ListenerConfig {
    /// Delay policy between reconnect attempts.
    pub reconnect: BackoffPolicy,
}

/// Applies feed events to the cache and the session store.
pub struct ReconciliationListener {
    feed: Arc<dyn EventFeed>,
    cache: Arc<OccupancyCache>,
    store: Arc<SessionStore>,
    config: ListenerConfig,
    status_tx: watch::Sender<FeedStatus>,
    outcome_marks: Watermarks<PoolId>,
    optimization_mark: Option<Watermark>,
}

impl ReconciliationListener {
    pub fn new(
        feed: Arc<dyn EventFeed>,
        cache: Arc<OccupancyCache>,
        store: Arc<SessionStore>,
        config: ListenerConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(FeedStatus::Disconnected);
        Self {
            feed,
            cache,
            store,
            config,
            status_tx,
            outcome_marks: Watermarks::new(),
            optimization_mark: None,
        }
    }

    /// Subscribe to feed connection changes.
    pub fn status(&self) -> watch::Receiver<FeedStatus> {
        self.status_tx.subscribe()
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Reconciliation listener starting");
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.feed.connect().await {
                Ok(stream) => {
                    info!("Event feed connected");
                    failures = 0;
                    self.set_status(FeedStatus::Connected);

                    if self.consume(stream, &mut shutdown).await {
                        break;
                    }
                    warn!("Event feed disconnected");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to event feed");
                }
            }

            self.set_status(FeedStatus::Disconnected);
            failures = failures.saturating_add(1);
            let delay = self.config.reconnect.delay();
            debug!(attempt = failures, delay_ms = delay.as_millis() as u64, "Reconnecting to event feed");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.set_status(FeedStatus::Disconnected);
        info!("Reconciliation listener stopped");
    }

    /// Drain one connection. Returns true when shutdown was requested.
    async fn consume(&mut self, mut stream: EventStream, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            tokio::select! {
                next = stream.next() => {
                    match next {
                        Some(Ok(event)) => {
                            self.dispatch(event).await;
                        }
                        Some(Err(e)) if !e.is_fatal() => {
                            warn!(error = %e, "Skipping feed message");
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Event feed failed");
                            return false;
                        }
                        None => return false,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }

    /// Apply one event. Returns true if it changed local state.
    pub async fn dispatch(&mut self, event: FeedEvent) -> bool {
        match event {
            FeedEvent::OccupancyUpdate(update) => match self.cache.apply_delta(&update).await {
                DeltaOutcome::Applied => true,
                DeltaOutcome::Stale { watermark } => {
                    debug!(pool_id = %update.pool_id, ts = update.ts, watermark, "Dropping stale occupancy update");
                    false
                }
                DeltaOutcome::UnknownPool => {
                    debug!(pool_id = %update.pool_id, "Occupancy update for unknown pool");
                    false
                }
                DeltaOutcome::Invalid(reason) => {
                    warn!(pool_id = %update.pool_id, %reason, "Rejecting occupancy update");
                    false
                }
            },
            FeedEvent::ReservationOutcome(outcome) => self.apply_outcome(outcome).await,
            FeedEvent::OptimizationComplete(done) => self.apply_optimization(done).await,
        }
    }

    async fn apply_outcome(&mut self, outcome: ReservationOutcome) -> bool {
        if self.outcome_marks.is_processed(&outcome.pool_id, outcome.ts) {
            debug!(pool_id = %outcome.pool_id, ts = outcome.ts, "Dropping duplicate reservation outcome");
            return false;
        }

        // Unapplied outcomes stay below the watermark so redelivery retries them.
        let effect = match self
            .store
            .apply_reservation_outcome(&outcome.reservation_id, outcome.accepted)
        {
            Ok(effect) => effect,
            Err(e) => {
                warn!(reservation_id = %outcome.reservation_id, error = %e, "Failed to apply reservation outcome");
                return false;
            }
        };
        self.outcome_marks.observe(&outcome.pool_id, outcome.ts);

        match effect {
            OutcomeEffect::Unmatched => false,
            OutcomeEffect::Confirmed { requester_id } => {
                debug!(%requester_id, reservation_id = %outcome.reservation_id, "Reservation confirmed");
                true
            }
            OutcomeEffect::Revoked(commitment) => {
                self.cache
                    .revert_optimistic_reservation(&commitment.pool_id)
                    .await;
                warn!(
                    requester_id = %commitment.requester_id,
                    pool_id = %commitment.pool_id,
                    reservation_id = %outcome.reservation_id,
                    "Reservation revoked upstream"
                );
                true
            }
        }
    }

    async fn apply_optimization(&mut self, done: OptimizationComplete) -> bool {
        let observation = match self.optimization_mark.as_mut() {
            Some(mark) => mark.advance(done.ts),
            None => {
                self.optimization_mark = Some(Watermark::new(done.ts));
                Observation::Fresh
            }
        };
        if let Observation::Stale { watermark } = observation {
            debug!(ts = done.ts, watermark, "Dropping stale optimisation pass");
            return false;
        }

        let updated = self.cache.apply_parameters(&done.parameters).await;
        info!(ts = done.ts, updated, "Optimisation pass applied");
        true
    }

    fn set_status(&self, status: FeedStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

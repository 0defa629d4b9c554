//! In-memory occupancy cache.
//!
//! Holds the last known state of every pool. Two writers mutate it: the
//! reconciliation listener (authoritative deltas) and the allocator
//! (optimistic holds on accepted commits). Everything else reads
//! snapshots.
//!
//! ## Reconciliation rule
//!
//! An optimistic hold moves one unit from `available` to `reserved` ahead
//! of upstream confirmation. The next authoritative delta for the pool
//! overwrites the counts and drops every outstanding hold, so the
//! authoritative view always wins.

use std::collections::BTreeMap;

use crpark_events::{OccupancyUpdate, PoolParameters};
use crpark_id::PoolId;
use crpark_reconcile::{Observation, Watermarks};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::pool::ResourcePool;

/// Result of applying an authoritative delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// The pool now reflects the delta.
    Applied,

    /// Timestamp not newer than the last applied one; nothing changed.
    Stale { watermark: i64 },

    /// The pool is not known to this cache.
    UnknownPool,

    /// Counts are inconsistent with the pool's capacity; nothing changed.
    Invalid(String),
}

#[derive(Debug)]
struct PoolEntry {
    pool: ResourcePool,
    /// Optimistic holds not yet superseded by an authoritative delta.
    holds: u32,
}

#[derive(Debug, Default)]
struct CacheInner {
    pools: BTreeMap<PoolId, PoolEntry>,
    watermarks: Watermarks<PoolId>,
}

/// Live pool occupancy.
#[derive(Debug, Default)]
pub struct OccupancyCache {
    inner: RwLock<CacheInner>,
}

impl OccupancyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache from an initial set of pools.
    pub fn with_pools(pools: impl IntoIterator<Item = ResourcePool>) -> Self {
        let pools = pools
            .into_iter()
            .map(|pool| (pool.id.clone(), PoolEntry { pool, holds: 0 }))
            .collect();
        Self {
            inner: RwLock::new(CacheInner {
                pools,
                watermarks: Watermarks::new(),
            }),
        }
    }

    /// Insert or replace pools. Replaced pools lose their holds and watermark.
    pub async fn seed(&self, pools: impl IntoIterator<Item = ResourcePool>) {
        let mut inner = self.inner.write().await;
        for pool in pools {
            inner.watermarks.forget(&pool.id);
            inner
                .pools
                .insert(pool.id.clone(), PoolEntry { pool, holds: 0 });
        }
    }

    pub async fn get(&self, pool_id: &PoolId) -> Option<ResourcePool> {
        let inner = self.inner.read().await;
        inner.pools.get(pool_id).map(|e| e.pool.clone())
    }

    /// Snapshot of every pool, ordered by id.
    pub async fn list(&self) -> Vec<ResourcePool> {
        let inner = self.inner.read().await;
        inner.pools.values().map(|e| e.pool.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.pools.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.pools.is_empty()
    }

    /// Outstanding optimistic holds on a pool.
    pub async fn optimistic_holds(&self, pool_id: &PoolId) -> u32 {
        let inner = self.inner.read().await;
        inner.pools.get(pool_id).map(|e| e.holds).unwrap_or(0)
    }

    /// Overwrite a pool's counts from an authoritative update.
    ///
    /// Reserved units are whatever capacity is neither occupied nor
    /// available. Stale and duplicate updates are dropped.
    pub async fn apply_delta(&self, update: &OccupancyUpdate) -> DeltaOutcome {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let Some(entry) = inner.pools.get_mut(&update.pool_id) else {
            return DeltaOutcome::UnknownPool;
        };

        if let Some(mark) = inner.watermarks.get(&update.pool_id) {
            if mark.is_processed(update.ts) {
                return DeltaOutcome::Stale {
                    watermark: mark.last_ts,
                };
            }
        }

        let capacity = entry.pool.capacity;
        let used = update.occupied as u64 + update.available as u64;
        if used > capacity as u64 {
            let reason = format!(
                "occupied {} + available {} exceeds capacity {}",
                update.occupied, update.available, capacity
            );
            warn!(pool_id = %update.pool_id, ts = update.ts, %reason, "Rejected occupancy update");
            return DeltaOutcome::Invalid(reason);
        }

        let reserved = capacity - update.occupied - update.available;
        if let Err(e) = entry.pool.set_counts(update.occupied, reserved) {
            return DeltaOutcome::Invalid(e.to_string());
        }

        if entry.holds > 0 {
            debug!(
                pool_id = %update.pool_id,
                holds = entry.holds,
                "Authoritative update superseded optimistic holds"
            );
        }
        entry.holds = 0;

        match inner.watermarks.observe(&update.pool_id, update.ts) {
            Observation::Fresh => DeltaOutcome::Applied,
            Observation::Stale { watermark } => DeltaOutcome::Stale { watermark },
        }
    }

    /// Move one unit from available to reserved ahead of confirmation.
    ///
    /// Returns false if the pool is unknown or has nothing available locally.
    pub async fn apply_optimistic_reservation(&self, pool_id: &PoolId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.pools.get_mut(pool_id) else {
            return false;
        };
        if entry.pool.available == 0 {
            return false;
        }

        let (occupied, reserved) = (entry.pool.occupied, entry.pool.reserved + 1);
        if entry.pool.set_counts(occupied, reserved).is_err() {
            return false;
        }
        entry.holds += 1;
        true
    }

    /// Undo one optimistic hold. No-op once an authoritative delta has
    /// superseded it.
    pub async fn revert_optimistic_reservation(&self, pool_id: &PoolId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.pools.get_mut(pool_id) else {
            return false;
        };
        if entry.holds == 0 {
            return false;
        }

        let (occupied, reserved) = (entry.pool.occupied, entry.pool.reserved.saturating_sub(1));
        if entry.pool.set_counts(occupied, reserved).is_err() {
            return false;
        }
        entry.holds -= 1;
        true
    }

    /// Update acceptance parameters published by the optimiser.
    ///
    /// Returns the number of pools updated. Unknown pools and out-of-range
    /// values are skipped.
    pub async fn apply_parameters(&self, parameters: &BTreeMap<PoolId, PoolParameters>) -> usize {
        let mut inner = self.inner.write().await;
        let mut updated = 0;
        for (pool_id, params) in parameters {
            if !params.is_valid() {
                warn!(%pool_id, pa = params.pa, rs = params.rs, "Ignoring out-of-range pool parameters");
                continue;
            }
            if let Some(entry) = inner.pools.get_mut(pool_id) {
                entry.pool.pa = params.pa;
                entry.pool.rs = params.rs;
                updated += 1;
            }
        }
        updated
    }
}

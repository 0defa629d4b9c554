//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use crpark_allocator::cache::OccupancyCache;
use crpark_allocator::commit::MockCommitEndpoint;
use crpark_allocator::pool::{GeoPoint, ResourcePool};
use crpark_allocator::protocol::{AllocationRequest, Allocator, AllocatorConfig};
use crpark_allocator::state::SessionStore;
use crpark_id::{PoolId, RequesterId};

/// Central Bengaluru.
pub const DEST: GeoPoint = GeoPoint::new(12.9716, 77.5946);

/// Degrees of latitude per kilometre.
const DEG_PER_KM: f64 = 180.0 / (std::f64::consts::PI * 6371.0);

pub fn north_of(p: GeoPoint, km: f64) -> GeoPoint {
    GeoPoint::new(p.lat + km * DEG_PER_KM, p.lng)
}

pub fn pool_id(id: &str) -> PoolId {
    PoolId::parse(id).unwrap()
}

pub fn requester(id: &str) -> RequesterId {
    RequesterId::parse(id).unwrap()
}

pub fn pool(id: &str, km: f64, capacity: u32, occupied: u32, reserved: u32) -> ResourcePool {
    ResourcePool::new(pool_id(id), north_of(DEST, km), capacity)
        .with_counts(occupied, reserved)
        .unwrap()
}

/// P1 close and roomy, P2 further out.
pub fn two_pools() -> Vec<ResourcePool> {
    vec![pool("P1", 1.0, 50, 5, 0), pool("P2", 3.0, 30, 10, 0)]
}

pub fn request(requester_id: &str) -> AllocationRequest {
    AllocationRequest {
        requester_id: requester(requester_id),
        origin: north_of(DEST, -4.0),
        destination: DEST,
        duration_minutes: 90,
    }
}

pub struct Fixture {
    pub allocator: Allocator,
    pub cache: Arc<OccupancyCache>,
    pub store: Arc<SessionStore>,
    pub endpoint: Arc<MockCommitEndpoint>,
}

pub fn fixture(pools: Vec<ResourcePool>, endpoint: MockCommitEndpoint) -> Fixture {
    let cache = Arc::new(OccupancyCache::with_pools(pools));
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let endpoint = Arc::new(endpoint);
    let allocator = Allocator::new(
        Arc::clone(&cache),
        endpoint.clone(),
        Arc::clone(&store),
        AllocatorConfig::default(),
    );
    Fixture {
        allocator,
        cache,
        store,
        endpoint,
    }
}

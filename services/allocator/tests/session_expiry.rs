//! Session persistence across time and restarts.

mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{request, requester, two_pools};
use crpark_allocator::cache::OccupancyCache;
use crpark_allocator::commit::MockCommitEndpoint;
use crpark_allocator::protocol::{Allocator, AllocatorConfig};
use crpark_allocator::state::{CommitmentStatus, HistoryRetention, SessionStore};

fn allocator(store: Arc<SessionStore>) -> Allocator {
    Allocator::new(
        Arc::new(OccupancyCache::with_pools(two_pools())),
        Arc::new(MockCommitEndpoint::new()),
        store,
        AllocatorConfig::default(),
    )
}

#[tokio::test]
async fn test_active_commitment_expires_after_inactivity() {
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let driver = requester("driver-1");

    let report = allocator(Arc::clone(&store))
        .allocate(request("driver-1"))
        .await
        .unwrap();
    let commitment = report.commitment.unwrap();
    let created = commitment.created_at;

    let still_active = store
        .load_active_at(&driver, created + Duration::minutes(29))
        .unwrap();
    assert!(still_active.is_some());

    let expired = store
        .load_active_at(&driver, created + Duration::minutes(31))
        .unwrap();
    assert!(expired.is_none());

    // The active record is gone for good, even at an earlier clock.
    assert!(store.load_active_at(&driver, created).unwrap().is_none());

    let history = store.history(&driver).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].commitment.id, commitment.id);
    assert_eq!(history[0].status, CommitmentStatus::Expired);
}

#[tokio::test]
async fn test_touch_extends_the_window() {
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let driver = requester("driver-1");

    let report = allocator(Arc::clone(&store))
        .allocate(request("driver-1"))
        .await
        .unwrap();
    let created = report.commitment.unwrap().created_at;

    assert!(store.touch(&driver, created + Duration::minutes(20)).unwrap());
    let active = store
        .load_active_at(&driver, created + Duration::minutes(45))
        .unwrap();
    assert!(active.is_some());
}

#[tokio::test]
async fn test_commitment_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.db");
    let driver = requester("driver-1");

    let commitment = {
        let store = Arc::new(SessionStore::open(&path).unwrap());
        allocator(store)
            .allocate(request("driver-1"))
            .await
            .unwrap()
            .commitment
            .unwrap()
    };

    let reopened = SessionStore::open(&path).unwrap();
    let active = reopened.load_active(&driver).unwrap().unwrap();
    assert_eq!(active.commitment.id, commitment.id);
    assert_eq!(active.commitment.claim_token, commitment.claim_token);
    assert_eq!(reopened.attempts(&driver).unwrap().len(), 1);
}

#[tokio::test]
async fn test_release_then_retention_limits_history() {
    let store = Arc::new(
        SessionStore::open_in_memory()
            .unwrap()
            .with_retention(HistoryRetention {
                max_entries: Some(2),
                max_age: None,
            }),
    );
    let allocator = allocator(Arc::clone(&store));
    let driver = requester("driver-1");

    for _ in 0..4 {
        allocator.allocate(request("driver-1")).await.unwrap();
    }
    let released = allocator.release(&driver).await.unwrap();
    assert!(released.is_some());
    assert!(store.load_active(&driver).unwrap().is_none());

    let history = store.history(&driver).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].status, CommitmentStatus::Released);
}

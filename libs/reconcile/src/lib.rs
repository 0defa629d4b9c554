//! Reconciliation primitives.
//!
//! Helpers for applying an at-least-once event stream to local state:
//!
//! - **Watermarks**: the last logical timestamp applied per key. An event
//!   whose timestamp is not newer than the key's watermark is a duplicate
//!   or arrived out of order, and is dropped.
//! - **Backoff**: how long to wait before reconnecting a lost stream.
//!
//! # Invariants
//!
//! - Applying the same event twice is a no-op the second time
//! - Watermarks only move forward

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Result of offering a timestamp to a watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Newer than anything seen for the key; the watermark advanced.
    Fresh,

    /// Older than or equal to the watermark; drop the event.
    Stale { watermark: i64 },
}

impl Observation {
    /// Returns true if the event should be applied.
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Last applied logical timestamp for a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    /// Last applied logical timestamp.
    pub last_ts: i64,

    /// Wall-clock time the watermark last advanced.
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    /// Create a watermark at the given timestamp.
    pub fn new(last_ts: i64) -> Self {
        Self {
            last_ts,
            updated_at: Utc::now(),
        }
    }

    /// Check if an event has already been applied.
    pub fn is_processed(&self, ts: i64) -> bool {
        ts <= self.last_ts
    }

    /// Advance to `ts` if it is newer.
    pub fn advance(&mut self, ts: i64) -> Observation {
        if self.is_processed(ts) {
            return Observation::Stale {
                watermark: self.last_ts,
            };
        }
        self.last_ts = ts;
        self.updated_at = Utc::now();
        Observation::Fresh
    }
}

/// Watermarks keyed by resource.
#[derive(Debug, Clone)]
pub struct Watermarks<K: Ord> {
    marks: BTreeMap<K, Watermark>,
}

impl<K: Ord> Default for Watermarks<K> {
    fn default() -> Self {
        Self {
            marks: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> Watermarks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `(key, ts)`; advances the key's watermark if fresh.
    pub fn observe(&mut self, key: &K, ts: i64) -> Observation {
        match self.marks.get_mut(key) {
            Some(mark) => mark.advance(ts),
            None => {
                self.marks.insert(key.clone(), Watermark::new(ts));
                Observation::Fresh
            }
        }
    }

    /// Whether `(key, ts)` is at or below the key's watermark.
    pub fn is_processed(&self, key: &K, ts: i64) -> bool {
        self.marks.get(key).is_some_and(|mark| mark.is_processed(ts))
    }

    /// Current watermark for a key.
    pub fn get(&self, key: &K) -> Option<&Watermark> {
        self.marks.get(key)
    }

    /// Forget a key (e.g. the resource was removed).
    pub fn forget(&mut self, key: &K) {
        self.marks.remove(key);
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

/// Reconnect backoff policy.
///
/// The feed is retried at a fixed interval for as long as it stays down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Pause between reconnect attempts.
    pub interval: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl BackoffPolicy {
    /// Same delay on every attempt.
    pub fn fixed(interval: Duration) -> Self {
        Self { interval }
    }

    /// Delay before the next reconnect attempt.
    pub fn delay(&self) -> Duration {
        self.interval
    }
}

/// Reconnect delay for the event feed.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

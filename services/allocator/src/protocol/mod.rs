//! Allocation protocol.
//!
//! An allocation walks a fixed state machine:
//!
//! ```text
//! IDLE -> SCORING -> FIRST_ATTEMPT -> ACCEPTED
//!                                  \-> AWAITING_RETRY_DECISION
//!                                        -> SECOND_CHANCE -> ACCEPTED | FALLBACK_SEARCH
//!                                        -> FALLBACK_SEARCH (decline)
//! FALLBACK_SEARCH -> ACCEPTED | FAILED
//! SCORING -> FAILED (no capacity)
//! ```
//!
//! [`AllocationSession`] holds the state and validates transitions without
//! doing any I/O. [`Allocator`] drives sessions against the occupancy cache,
//! the commit endpoint and the session store.

mod allocator;
mod session;

pub use allocator::{Allocator, AllocatorConfig};
pub use session::{AllocationReport, AllocationSession, AttemptResolution};

use chrono::{DateTime, Utc};
use crpark_id::{AllocationId, AttemptId, PoolId, RequesterId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::commit::SlotType;
use crate::error::AllocationError;
use crate::pool::GeoPoint;
use crate::scoring::RankQuery;

/// Longest reservation a request may ask for.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

/// Protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Idle,
    Scoring,
    FirstAttempt,
    AwaitingRetryDecision,
    SecondChance,
    FallbackSearch,
    Accepted,
    Failed,
}

impl AllocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scoring => "scoring",
            Self::FirstAttempt => "first_attempt",
            Self::AwaitingRetryDecision => "awaiting_retry_decision",
            Self::SecondChance => "second_chance",
            Self::FallbackSearch => "fallback_search",
            Self::Accepted => "accepted",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Failed)
    }
}

impl std::fmt::Display for AllocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which protocol phase a commit request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    First,
    SecondChance,
    Fallback,
}

impl AttemptPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::First => "first",
            Self::SecondChance => "second_chance",
            Self::Fallback => "fallback",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "first" => Some(Self::First),
            "second_chance" => Some(Self::SecondChance),
            "fallback" => Some(Self::Fallback),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Accepted,
    Rejected,
    /// No answer within the commit timeout. Transitions like a rejection.
    Timeout,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Rejected or timed out.
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Timeout)
    }
}

/// Why an allocation ended in `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Nothing eligible at scoring time.
    NoCapacity,
    /// Fallback search ran out of candidates.
    Exhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCapacity => "no_capacity",
            Self::Exhausted => "exhausted",
        }
    }
}

/// The requester's answer after a first-attempt refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    /// Try the same pool once more.
    Retry,
    /// Skip straight to fallback search.
    Decline,
}

impl From<bool> for RetryDecision {
    fn from(confirm: bool) -> Self {
        if confirm {
            Self::Retry
        } else {
            Self::Decline
        }
    }
}

/// A requester asking for a unit near a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub requester_id: RequesterId,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub duration_minutes: u32,
}

impl AllocationRequest {
    pub fn validate(&self) -> Result<(), AllocationError> {
        if !self.origin.is_valid() {
            return Err(AllocationError::InvalidRequest(format!(
                "origin out of range: {}, {}",
                self.origin.lat, self.origin.lng
            )));
        }
        if !self.destination.is_valid() {
            return Err(AllocationError::InvalidRequest(format!(
                "destination out of range: {}, {}",
                self.destination.lat, self.destination.lng
            )));
        }
        if self.duration_minutes == 0 || self.duration_minutes > MAX_DURATION_MINUTES {
            return Err(AllocationError::InvalidRequest(format!(
                "duration must be between 1 and {MAX_DURATION_MINUTES} minutes"
            )));
        }
        Ok(())
    }

    pub fn query(&self) -> RankQuery {
        RankQuery {
            origin: Some(self.origin),
            destination: self.destination,
        }
    }
}

/// One commit request against one pool.
///
/// The outcome moves from `pending` to a final value exactly once; each
/// phase gets its own attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationAttempt {
    pub id: AttemptId,
    pub allocation_id: AllocationId,
    pub requester_id: RequesterId,
    pub pool_id: PoolId,
    pub phase: AttemptPhase,
    pub outcome: AttemptOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_unit: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_type: Option<SlotType>,

    /// Transport error that stood in for a verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(origin: GeoPoint, duration_minutes: u32) -> AllocationRequest {
        AllocationRequest {
            requester_id: RequesterId::parse("user-1").unwrap(),
            origin,
            destination: GeoPoint::new(12.9716, 77.5946),
            duration_minutes,
        }
    }

    #[test]
    fn test_request_validation() {
        assert!(request(GeoPoint::new(12.9, 77.5), 60).validate().is_ok());
        assert!(matches!(
            request(GeoPoint::new(120.0, 77.5), 60).validate(),
            Err(AllocationError::InvalidRequest(_))
        ));
        assert!(request(GeoPoint::new(12.9, 77.5), 0).validate().is_err());
        assert!(request(GeoPoint::new(12.9, 77.5), MAX_DURATION_MINUTES + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_phase_wire_names() {
        for phase in [AttemptPhase::First, AttemptPhase::SecondChance, AttemptPhase::Fallback] {
            let json = serde_json::to_value(phase).unwrap();
            assert_eq!(json, phase.as_str());
            assert_eq!(AttemptPhase::from_str(phase.as_str()), Some(phase));
        }
    }

    #[test]
    fn test_timeout_is_a_refusal() {
        assert!(AttemptOutcome::Timeout.is_refusal());
        assert!(AttemptOutcome::Rejected.is_refusal());
        assert!(!AttemptOutcome::Accepted.is_refusal());
        assert!(!AttemptOutcome::Pending.is_refusal());
    }

    #[test]
    fn test_retry_decision_from_confirm_flag() {
        assert_eq!(RetryDecision::from(true), RetryDecision::Retry);
        assert_eq!(RetryDecision::from(false), RetryDecision::Decline);
    }
}

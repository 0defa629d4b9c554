//! Commitments and the allocation context stored beside them.

use chrono::{DateTime, Duration, Utc};
use crpark_id::{AllocationId, AttemptId, CommitmentId, PoolId, RequesterId, ReservationId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::commit::SlotType;
use crate::pool::GeoPoint;
use crate::protocol::{AttemptPhase, ReservationAttempt};
use crate::scoring::Candidate;

/// Lifecycle status of a commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    /// Current commitment of its requester.
    Active,
    /// Retired by a newer commitment.
    Completed,
    /// Cancelled by the requester.
    Released,
    /// Inactive for longer than the session window.
    Expired,
    /// Refused upstream after local acceptance.
    Revoked,
}

impl CommitmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Released => "released",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "released" => Some(Self::Released),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// An accepted reservation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    pub id: CommitmentId,
    pub requester_id: RequesterId,
    pub allocation_id: AllocationId,
    pub attempt_id: AttemptId,
    pub pool_id: PoolId,
    pub phase: AttemptPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,

    /// Unit index inside the pool.
    pub assigned_unit: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_type: Option<SlotType>,

    pub cost: f64,

    /// Token presented when claiming the unit.
    pub claim_token: String,

    pub status: CommitmentStatus,

    /// Upstream confirmed the reservation on the event feed.
    #[serde(default)]
    pub confirmed: bool,

    pub created_at: DateTime<Utc>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl Commitment {
    /// Build an active commitment from an accepted attempt.
    pub fn from_attempt(
        attempt: &ReservationAttempt,
        assigned_unit: u32,
        cost: f64,
        duration_minutes: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let id = CommitmentId::new();
        let claim_token = claim_token(&id, attempt.reservation_id.as_ref());
        Self {
            id,
            requester_id: attempt.requester_id.clone(),
            allocation_id: attempt.allocation_id,
            attempt_id: attempt.id,
            pool_id: attempt.pool_id.clone(),
            phase: attempt.phase,
            reservation_id: attempt.reservation_id.clone(),
            assigned_unit,
            slot_type: attempt.slot_type,
            cost,
            claim_token,
            status: CommitmentStatus::Active,
            confirmed: false,
            created_at: now,
            starts_at: now,
            ends_at: now + Duration::minutes(i64::from(duration_minutes)),
        }
    }
}

/// Hex SHA-256 over the commitment id, reservation id and a random nonce.
pub fn claim_token(id: &CommitmentId, reservation_id: Option<&ReservationId>) -> String {
    let nonce: [u8; 16] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(id.to_string().as_bytes());
    hasher.update(b":");
    if let Some(resv) = reservation_id {
        hasher.update(resv.as_str().as_bytes());
    }
    hasher.update(b":");
    hasher.update(nonce);
    hex::encode(hasher.finalize())
}

/// What the allocator knew when it made a commitment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationContext {
    pub allocation_id: AllocationId,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub duration_minutes: u32,

    /// Score state of the committed pool.
    pub candidate: Candidate,

    /// Other candidates offered during fallback search.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<Candidate>,
}

/// The active commitment together with its stored context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveCommitment {
    pub commitment: Commitment,
    pub context: AllocationContext,
    pub created_at: DateTime<Utc>,
    pub touched_at: DateTime<Utc>,
}

/// A retired commitment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub seq: i64,
    pub commitment: Commitment,
    pub status: CommitmentStatus,
    pub retired_at: DateTime<Utc>,
}

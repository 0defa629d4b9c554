//! Commit endpoint interface and mock implementation.
//!
//! The commit endpoint is the upstream authority that accepts or rejects a
//! reservation against one pool. The allocator talks to it through
//! [`CommitEndpoint`]; [`crate::client::HttpCommitEndpoint`] is the real
//! transport and [`MockCommitEndpoint`] is scripted for tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use crpark_id::{PoolId, RequesterId, ReservationId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::protocol::AttemptPhase;

/// Commit transport failures. These are not authoritative verdicts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommitError {
    #[error("commit transport error: {0}")]
    Transport(String),

    /// No answer within the transport deadline.
    #[error("commit request timed out")]
    Timeout,

    #[error("commit endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid commit response: {0}")]
    Decode(String),
}

/// Body of a commit request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub pool_id: PoolId,
    pub requester_id: RequesterId,
    pub phase: AttemptPhase,
}

/// Upstream verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    Accepted,
    Rejected,
}

/// Kind of unit granted by an accepted commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    /// Held for the requester.
    #[serde(alias = "R")]
    Reserved,

    /// Must be won on arrival.
    #[serde(alias = "C")]
    Competitive,
}

/// Body of a commit response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResponse {
    pub outcome: CommitOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_unit: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_type: Option<SlotType>,

    /// Minutes the requester has to confirm a second-chance retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_request_deadline_minutes: Option<u32>,
}

impl CommitResponse {
    pub fn accepted(reservation_id: ReservationId) -> Self {
        Self {
            outcome: CommitOutcome::Accepted,
            reservation_id: Some(reservation_id),
            assigned_unit: None,
            slot_type: None,
            second_request_deadline_minutes: None,
        }
    }

    pub fn rejected() -> Self {
        Self {
            outcome: CommitOutcome::Rejected,
            reservation_id: None,
            assigned_unit: None,
            slot_type: None,
            second_request_deadline_minutes: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome == CommitOutcome::Accepted
    }
}

/// Upstream commit authority.
#[async_trait]
pub trait CommitEndpoint: Send + Sync {
    /// Attempt to commit a reservation. Callers bound this with a timeout.
    async fn commit(&self, request: &CommitRequest) -> Result<CommitResponse, CommitError>;
}

// =============================================================================
// Mock
// =============================================================================

/// Scripted reply of the mock endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Accept,
    Reject,
    /// Reject with a retry window in minutes.
    RejectWithDeadline(u32),
    /// Fail at the transport level.
    Fail,
    /// Never answer within any reasonable timeout.
    Hang,
}

/// Mock commit endpoint for tests and local development.
///
/// Replies are scripted per pool and consumed in order. Once a pool's
/// script is exhausted the default reply is used.
pub struct MockCommitEndpoint {
    scripts: Mutex<HashMap<PoolId, VecDeque<MockReply>>>,
    default_reply: MockReply,
    calls: Mutex<Vec<CommitRequest>>,
    reservation_counter: AtomicU64,
}

impl MockCommitEndpoint {
    /// Accepts everything unless scripted otherwise.
    pub fn new() -> Self {
        Self::with_default(MockReply::Accept)
    }

    /// Rejects everything unless scripted otherwise.
    pub fn rejecting() -> Self {
        Self::with_default(MockReply::Reject)
    }

    pub fn with_default(default_reply: MockReply) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_reply,
            calls: Mutex::new(Vec::new()),
            reservation_counter: AtomicU64::new(0),
        }
    }

    /// Queue replies for a pool.
    pub fn script(self, pool_id: &PoolId, replies: impl IntoIterator<Item = MockReply>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts
                .entry(pool_id.clone())
                .or_default()
                .extend(replies);
        }
        self
    }

    /// Requests received so far.
    pub fn calls(&self) -> Vec<CommitRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_reply(&self, pool_id: &PoolId) -> MockReply {
        self.scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(pool_id).and_then(|q| q.pop_front()))
            .unwrap_or_else(|| self.default_reply.clone())
    }

    fn next_reservation_id(&self) -> Result<ReservationId, CommitError> {
        let n = self.reservation_counter.fetch_add(1, Ordering::SeqCst) + 1;
        ReservationId::parse(&format!("resv-mock-{n:06}"))
            .map_err(|e| CommitError::Decode(e.to_string()))
    }
}

impl Default for MockCommitEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommitEndpoint for MockCommitEndpoint {
    async fn commit(&self, request: &CommitRequest) -> Result<CommitResponse, CommitError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }

        let reply = self.next_reply(&request.pool_id);
        info!(
            pool_id = %request.pool_id,
            requester_id = %request.requester_id,
            phase = %request.phase,
            reply = ?reply,
            "[MOCK] Commit request"
        );

        match reply {
            MockReply::Accept => Ok(CommitResponse::accepted(self.next_reservation_id()?)),
            MockReply::Reject => Ok(CommitResponse::rejected()),
            MockReply::RejectWithDeadline(minutes) => Ok(CommitResponse {
                second_request_deadline_minutes: Some(minutes),
                ..CommitResponse::rejected()
            }),
            MockReply::Fail => Err(CommitError::Transport(
                "mock endpoint configured to fail".to_string(),
            )),
            MockReply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(CommitResponse::rejected())
            }
        }
    }
}

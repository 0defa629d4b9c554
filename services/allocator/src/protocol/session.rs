//! Allocation session state machine.
//!
//! Pure state and transitions. The allocator performs the I/O and feeds
//! results back in; every method checks that it is legal in the current
//! state and leaves the session untouched when it is not.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use crpark_id::{AllocationId, AttemptId, PoolId, RequesterId, ReservationId};
use serde::Serialize;
use tracing::debug;

use super::{
    AllocationRequest, AllocationState, AttemptOutcome, AttemptPhase, FailureReason,
    ReservationAttempt, RetryDecision,
};
use crate::commit::{CommitResponse, SlotType};
use crate::error::{AllocationError, ErrorCode};
use crate::scoring::Candidate;
use crate::state::Commitment;

/// Most candidates presented to the requester at once.
pub const MAX_PRESENTED_CANDIDATES: usize = 3;

/// What came back for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResolution {
    pub outcome: AttemptOutcome,
    pub reservation_id: Option<ReservationId>,
    pub assigned_unit: Option<u32>,
    pub slot_type: Option<SlotType>,
    /// Time the requester has to confirm a retry.
    pub retry_window: Option<Duration>,
    pub error: Option<String>,
}

impl AttemptResolution {
    fn with_outcome(outcome: AttemptOutcome) -> Self {
        Self {
            outcome,
            reservation_id: None,
            assigned_unit: None,
            slot_type: None,
            retry_window: None,
            error: None,
        }
    }

    pub fn rejected() -> Self {
        Self::with_outcome(AttemptOutcome::Rejected)
    }

    pub fn timeout() -> Self {
        Self::with_outcome(AttemptOutcome::Timeout)
    }

    /// A transport failure, treated as a rejection.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::rejected()
        }
    }
}

impl From<CommitResponse> for AttemptResolution {
    fn from(resp: CommitResponse) -> Self {
        let outcome = if resp.is_accepted() {
            AttemptOutcome::Accepted
        } else {
            AttemptOutcome::Rejected
        };
        Self {
            outcome,
            reservation_id: resp.reservation_id,
            assigned_unit: resp.assigned_unit,
            slot_type: resp.slot_type,
            retry_window: resp
                .second_request_deadline_minutes
                .map(|m| Duration::minutes(i64::from(m))),
            error: None,
        }
    }
}

/// Snapshot of a session for callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationReport {
    pub allocation_id: AllocationId,
    pub requester_id: RequesterId,
    pub state: AllocationState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<AttemptOutcome>,

    /// Code of the last refusal or of the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Candidate>,

    pub alternatives: Vec<Candidate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_deadline: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub commitment: Option<Commitment>,

    pub attempts: Vec<ReservationAttempt>,
}

/// One requester's walk through the protocol.
#[derive(Debug, Clone)]
pub struct AllocationSession {
    id: AllocationId,
    request: AllocationRequest,
    state: AllocationState,
    target: Option<Candidate>,
    alternatives: Vec<Candidate>,
    rejected_pools: BTreeSet<PoolId>,
    attempts: Vec<ReservationAttempt>,
    pending: Option<usize>,
    fallback_attempts: u32,
    retry_deadline: Option<DateTime<Utc>>,
    failure: Option<FailureReason>,
    commitment: Option<Commitment>,
}

impl AllocationSession {
    pub fn new(request: AllocationRequest) -> Self {
        Self {
            id: AllocationId::new(),
            request,
            state: AllocationState::Idle,
            target: None,
            alternatives: Vec::new(),
            rejected_pools: BTreeSet::new(),
            attempts: Vec::new(),
            pending: None,
            fallback_attempts: 0,
            retry_deadline: None,
            failure: None,
            commitment: None,
        }
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn request(&self) -> &AllocationRequest {
        &self.request
    }

    pub fn requester_id(&self) -> &RequesterId {
        &self.request.requester_id
    }

    pub fn state(&self) -> AllocationState {
        self.state
    }

    /// Candidate the next attempt goes to.
    pub fn target(&self) -> Option<&Candidate> {
        self.target.as_ref()
    }

    pub fn alternatives(&self) -> &[Candidate] {
        &self.alternatives
    }

    pub fn rejected_pools(&self) -> &BTreeSet<PoolId> {
        &self.rejected_pools
    }

    pub fn attempts(&self) -> &[ReservationAttempt] {
        &self.attempts
    }

    pub fn failure(&self) -> Option<FailureReason> {
        self.failure
    }

    pub fn commitment(&self) -> Option<&Commitment> {
        self.commitment.as_ref()
    }

    pub fn has_pending_attempt(&self) -> bool {
        self.pending.is_some()
    }

    pub fn fallback_attempts(&self) -> u32 {
        self.fallback_attempts
    }

    /// Outcome of the most recent resolved attempt.
    pub fn last_outcome(&self) -> Option<AttemptOutcome> {
        self.attempts
            .iter()
            .rev()
            .map(|a| a.outcome)
            .find(|o| *o != AttemptOutcome::Pending)
    }

    fn set_state(&mut self, next: AllocationState) {
        debug!(
            allocation_id = %self.id,
            requester_id = %self.request.requester_id,
            from = %self.state,
            to = %next,
            "Allocation transition"
        );
        self.state = next;
    }

    fn fail(&mut self, reason: FailureReason) {
        self.failure = Some(reason);
        self.target = None;
        self.set_state(AllocationState::Failed);
    }

    fn present(&mut self, candidates: Vec<Candidate>) {
        self.alternatives = candidates
            .into_iter()
            .take(MAX_PRESENTED_CANDIDATES)
            .collect();
        self.target = self.alternatives.first().cloned();
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// `IDLE -> SCORING`.
    pub fn begin_scoring(&mut self) -> Result<(), AllocationError> {
        if self.state != AllocationState::Idle {
            return Err(AllocationError::transition(self.state, "begin scoring"));
        }
        self.set_state(AllocationState::Scoring);
        Ok(())
    }

    /// `SCORING -> FIRST_ATTEMPT`, or `FAILED(no_capacity)` when nothing ranked.
    pub fn apply_ranking(&mut self, ranked: Vec<Candidate>) -> Result<(), AllocationError> {
        if self.state != AllocationState::Scoring {
            return Err(AllocationError::transition(self.state, "apply ranking"));
        }
        if ranked.is_empty() {
            self.fail(FailureReason::NoCapacity);
            return Ok(());
        }
        self.present(ranked);
        self.set_state(AllocationState::FirstAttempt);
        Ok(())
    }

    /// Start a commit attempt against the current target.
    pub fn open_attempt(&mut self, now: DateTime<Utc>) -> Result<ReservationAttempt, AllocationError> {
        let phase = match self.state {
            AllocationState::FirstAttempt => AttemptPhase::First,
            AllocationState::SecondChance => AttemptPhase::SecondChance,
            AllocationState::FallbackSearch => AttemptPhase::Fallback,
            state => return Err(AllocationError::transition(state, "open an attempt")),
        };
        if self.pending.is_some() {
            return Err(AllocationError::transition(self.state, "open a second concurrent attempt"));
        }
        let Some(target) = &self.target else {
            return Err(AllocationError::transition(self.state, "open an attempt without a target"));
        };

        let attempt = ReservationAttempt {
            id: AttemptId::new(),
            allocation_id: self.id,
            requester_id: self.request.requester_id.clone(),
            pool_id: target.pool.id.clone(),
            phase,
            outcome: AttemptOutcome::Pending,
            reservation_id: None,
            assigned_unit: None,
            slot_type: None,
            error: None,
            created_at: now,
            resolved_at: None,
        };

        if phase == AttemptPhase::Fallback {
            self.fallback_attempts += 1;
        }
        self.attempts.push(attempt.clone());
        self.pending = Some(self.attempts.len() - 1);
        Ok(attempt)
    }

    /// Withdraw the pending attempt before anything was sent for it.
    pub fn abandon_attempt(&mut self, attempt_id: AttemptId) -> Result<(), AllocationError> {
        let idx = match self.pending {
            Some(idx) if self.attempts[idx].id == attempt_id => idx,
            _ => return Err(AllocationError::transition(self.state, "abandon an attempt that is not pending")),
        };
        let withdrawn = self.attempts.remove(idx);
        if withdrawn.phase == AttemptPhase::Fallback {
            self.fallback_attempts = self.fallback_attempts.saturating_sub(1);
        }
        self.pending = None;
        debug!(attempt_id = %attempt_id, pool_id = %withdrawn.pool_id, "Withdrew unsent attempt");
        Ok(())
    }

    /// Record the outcome of the pending attempt and transition.
    ///
    /// Accepted goes to `ACCEPTED`. A refusal on the first attempt waits for
    /// a retry decision; a refusal in any later phase goes to fallback search.
    pub fn resolve_attempt(
        &mut self,
        attempt_id: AttemptId,
        resolution: AttemptResolution,
        now: DateTime<Utc>,
    ) -> Result<ReservationAttempt, AllocationError> {
        let idx = match self.pending {
            Some(idx) if self.attempts[idx].id == attempt_id => idx,
            _ => return Err(AllocationError::transition(self.state, "resolve an attempt that is not pending")),
        };
        if resolution.outcome == AttemptOutcome::Pending {
            return Err(AllocationError::Internal(
                "attempt resolved with a pending outcome".to_string(),
            ));
        }

        let attempt = &mut self.attempts[idx];
        attempt.outcome = resolution.outcome;
        attempt.reservation_id = resolution.reservation_id;
        attempt.assigned_unit = resolution.assigned_unit;
        attempt.slot_type = resolution.slot_type;
        attempt.error = resolution.error;
        attempt.resolved_at = Some(now);
        let resolved = attempt.clone();
        self.pending = None;

        if resolved.outcome == AttemptOutcome::Accepted {
            self.set_state(AllocationState::Accepted);
            return Ok(resolved);
        }

        self.rejected_pools.insert(resolved.pool_id.clone());
        match self.state {
            AllocationState::FirstAttempt => {
                self.retry_deadline = resolution.retry_window.map(|w| now + w);
                self.set_state(AllocationState::AwaitingRetryDecision);
            }
            AllocationState::SecondChance => {
                self.target = None;
                self.set_state(AllocationState::FallbackSearch);
            }
            AllocationState::FallbackSearch => {
                self.target = None;
            }
            state => {
                return Err(AllocationError::Internal(format!(
                    "attempt pending in state {state}"
                )))
            }
        }
        Ok(resolved)
    }

    /// Apply the requester's retry decision.
    ///
    /// A retry confirmed after the deadline counts as a decline. Returns the
    /// decision that took effect.
    pub fn decide_retry(
        &mut self,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision, AllocationError> {
        if self.state != AllocationState::AwaitingRetryDecision {
            return Err(AllocationError::transition(self.state, "decide retry"));
        }

        let late = self.retry_deadline.is_some_and(|deadline| now > deadline);
        let effective = match decision {
            RetryDecision::Retry if !late => RetryDecision::Retry,
            _ => RetryDecision::Decline,
        };
        self.retry_deadline = None;

        match effective {
            RetryDecision::Retry => self.set_state(AllocationState::SecondChance),
            RetryDecision::Decline => {
                self.target = None;
                self.set_state(AllocationState::FallbackSearch);
            }
        }
        Ok(effective)
    }

    /// Pick the next fallback target from a fresh ranking, or fail with
    /// `exhausted` once nothing is left or the attempt budget is spent.
    pub fn apply_fallback_ranking(
        &mut self,
        ranked: Vec<Candidate>,
        max_attempts: u32,
    ) -> Result<(), AllocationError> {
        if self.state != AllocationState::FallbackSearch || self.target.is_some() {
            return Err(AllocationError::transition(self.state, "apply fallback ranking"));
        }

        let remaining: Vec<Candidate> = ranked
            .into_iter()
            .filter(|c| !self.rejected_pools.contains(&c.pool.id))
            .collect();

        if remaining.is_empty() || self.fallback_attempts >= max_attempts {
            self.fail(FailureReason::Exhausted);
            return Ok(());
        }
        self.present(remaining);
        Ok(())
    }

    /// Attach the commitment created for an accepted attempt.
    pub fn commit(&mut self, commitment: Commitment) -> Result<(), AllocationError> {
        if self.state != AllocationState::Accepted || self.commitment.is_some() {
            return Err(AllocationError::transition(self.state, "attach a commitment"));
        }
        self.commitment = Some(commitment);
        Ok(())
    }

    /// Snapshot for callers.
    pub fn report(&self) -> AllocationReport {
        let last_outcome = self.last_outcome();
        let code = match (self.failure, last_outcome) {
            (Some(reason), _) => Some(ErrorCode::from(reason)),
            (None, Some(outcome)) if self.state != AllocationState::Accepted => outcome.code(),
            _ => None,
        };

        AllocationReport {
            allocation_id: self.id,
            requester_id: self.request.requester_id.clone(),
            state: self.state,
            last_outcome,
            code,
            failure: self.failure,
            target: self.target.clone(),
            alternatives: self.alternatives.clone(),
            retry_deadline: self.retry_deadline,
            commitment: self.commitment.clone(),
            attempts: self.attempts.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{GeoPoint, ResourcePool};
    use crate::scoring::{score_pool, RankQuery, RankingPass, ScoringConfig};

    const DEST: GeoPoint = GeoPoint::new(12.9716, 77.5946);

    fn request() -> AllocationRequest {
        AllocationRequest {
            requester_id: RequesterId::parse("user-1").unwrap(),
            origin: DEST,
            destination: DEST,
            duration_minutes: 60,
        }
    }

    fn candidate(id: &str, lat_offset: f64) -> Candidate {
        let pool = ResourcePool::new(
            PoolId::parse(id).unwrap(),
            GeoPoint::new(DEST.lat + lat_offset, DEST.lng),
            10,
        );
        let query = RankQuery {
            origin: None,
            destination: DEST,
        };
        score_pool(&pool, &query, RankingPass::Fallback, &ScoringConfig::default()).unwrap()
    }

    fn ranked() -> Vec<Candidate> {
        vec![candidate("lot_p1", 0.001), candidate("lot_p2", 0.01), candidate("lot_p3", 0.02)]
    }

    fn scored_session() -> AllocationSession {
        let mut s = AllocationSession::new(request());
        s.begin_scoring().unwrap();
        s.apply_ranking(ranked()).unwrap();
        s
    }

    fn refuse(s: &mut AllocationSession, resolution: AttemptResolution) -> ReservationAttempt {
        let attempt = s.open_attempt(Utc::now()).unwrap();
        s.resolve_attempt(attempt.id, resolution, Utc::now()).unwrap()
    }

    #[test]
    fn test_no_candidates_fails_with_no_capacity() {
        let mut s = AllocationSession::new(request());
        s.begin_scoring().unwrap();
        s.apply_ranking(Vec::new()).unwrap();

        assert_eq!(s.state(), AllocationState::Failed);
        assert_eq!(s.failure(), Some(FailureReason::NoCapacity));
        assert_eq!(s.report().code, Some(ErrorCode::NoCapacity));
    }

    #[test]
    fn test_first_attempt_accepted() {
        let mut s = scored_session();
        assert_eq!(s.state(), AllocationState::FirstAttempt);
        assert_eq!(s.alternatives().len(), 3);

        let attempt = s.open_attempt(Utc::now()).unwrap();
        assert_eq!(attempt.phase, AttemptPhase::First);
        assert_eq!(attempt.pool_id.as_str(), "lot_p1");

        let resolution = AttemptResolution::from(CommitResponse::accepted(
            ReservationId::parse("resv-1").unwrap(),
        ));
        let resolved = s.resolve_attempt(attempt.id, resolution, Utc::now()).unwrap();
        assert_eq!(resolved.outcome, AttemptOutcome::Accepted);
        assert_eq!(s.state(), AllocationState::Accepted);
        assert_eq!(s.report().code, None);
    }

    #[test]
    fn test_first_refusal_waits_for_decision() {
        let mut s = scored_session();
        refuse(&mut s, AttemptResolution::rejected());

        assert_eq!(s.state(), AllocationState::AwaitingRetryDecision);
        // No attempt may start until the requester decides.
        assert!(s.open_attempt(Utc::now()).is_err());
        assert_eq!(s.state(), AllocationState::AwaitingRetryDecision);
        assert_eq!(s.report().code, Some(ErrorCode::Rejected));
    }

    #[test]
    fn test_timeout_reported_distinctly_but_transitions_like_rejection() {
        let mut s = scored_session();
        let resolved = refuse(&mut s, AttemptResolution::timeout());

        assert_eq!(resolved.outcome, AttemptOutcome::Timeout);
        assert_eq!(s.state(), AllocationState::AwaitingRetryDecision);
        assert_eq!(s.report().code, Some(ErrorCode::Timeout));
    }

    #[test]
    fn test_retry_targets_same_pool() {
        let mut s = scored_session();
        refuse(&mut s, AttemptResolution::rejected());

        assert_eq!(s.decide_retry(RetryDecision::Retry, Utc::now()).unwrap(), RetryDecision::Retry);
        assert_eq!(s.state(), AllocationState::SecondChance);

        let attempt = s.open_attempt(Utc::now()).unwrap();
        assert_eq!(attempt.phase, AttemptPhase::SecondChance);
        assert_eq!(attempt.pool_id.as_str(), "lot_p1");
    }

    #[test]
    fn test_second_chance_refusal_goes_to_fallback() {
        let mut s = scored_session();
        refuse(&mut s, AttemptResolution::rejected());
        s.decide_retry(RetryDecision::Retry, Utc::now()).unwrap();
        refuse(&mut s, AttemptResolution::rejected());

        assert_eq!(s.state(), AllocationState::FallbackSearch);
        assert!(s.target().is_none());

        s.apply_fallback_ranking(ranked(), 3).unwrap();
        let attempt = s.open_attempt(Utc::now()).unwrap();
        assert_eq!(attempt.phase, AttemptPhase::Fallback);
        assert_eq!(attempt.pool_id.as_str(), "lot_p2");
        assert_eq!(s.alternatives().len(), 2);
    }

    #[test]
    fn test_decline_goes_to_fallback() {
        let mut s = scored_session();
        refuse(&mut s, AttemptResolution::rejected());

        assert_eq!(
            s.decide_retry(RetryDecision::Decline, Utc::now()).unwrap(),
            RetryDecision::Decline
        );
        assert_eq!(s.state(), AllocationState::FallbackSearch);
    }

    #[test]
    fn test_late_retry_counts_as_decline() {
        let mut s = scored_session();
        let resolution = AttemptResolution {
            retry_window: Some(Duration::minutes(2)),
            ..AttemptResolution::rejected()
        };
        refuse(&mut s, resolution);
        assert!(s.report().retry_deadline.is_some());

        let late = Utc::now() + Duration::minutes(5);
        assert_eq!(s.decide_retry(RetryDecision::Retry, late).unwrap(), RetryDecision::Decline);
        assert_eq!(s.state(), AllocationState::FallbackSearch);
    }

    #[test]
    fn test_fallback_exhausted_when_nothing_left() {
        let mut s = scored_session();
        refuse(&mut s, AttemptResolution::rejected());
        s.decide_retry(RetryDecision::Decline, Utc::now()).unwrap();

        s.apply_fallback_ranking(vec![candidate("lot_p1", 0.001)], 3).unwrap();
        assert_eq!(s.state(), AllocationState::Failed);
        assert_eq!(s.failure(), Some(FailureReason::Exhausted));
    }

    #[test]
    fn test_fallback_attempt_budget() {
        let mut s = scored_session();
        refuse(&mut s, AttemptResolution::rejected());
        s.decide_retry(RetryDecision::Decline, Utc::now()).unwrap();

        s.apply_fallback_ranking(ranked(), 1).unwrap();
        refuse(&mut s, AttemptResolution::failed("connection refused"));
        assert_eq!(s.state(), AllocationState::FallbackSearch);
        assert_eq!(s.attempts().last().unwrap().error.as_deref(), Some("connection refused"));

        s.apply_fallback_ranking(ranked(), 1).unwrap();
        assert_eq!(s.failure(), Some(FailureReason::Exhausted));
    }

    #[test]
    fn test_only_one_pending_attempt() {
        let mut s = scored_session();
        s.open_attempt(Utc::now()).unwrap();
        assert!(s.has_pending_attempt());
        assert!(matches!(
            s.open_attempt(Utc::now()),
            Err(AllocationError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_resolve_unknown_attempt_rejected() {
        let mut s = scored_session();
        s.open_attempt(Utc::now()).unwrap();
        let err = s
            .resolve_attempt(AttemptId::new(), AttemptResolution::rejected(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, AllocationError::InvalidTransition { .. }));
        assert!(s.has_pending_attempt());
    }

    #[test]
    fn test_abandoned_attempt_leaves_no_trace() {
        let mut s = scored_session();
        let attempt = s.open_attempt(Utc::now()).unwrap();

        assert!(s.abandon_attempt(AttemptId::new()).is_err());
        s.abandon_attempt(attempt.id).unwrap();

        assert!(!s.has_pending_attempt());
        assert!(s.attempts().is_empty());
        assert_eq!(s.state(), AllocationState::FirstAttempt);
        assert!(s.abandon_attempt(attempt.id).is_err());

        // The session can open a fresh attempt afterwards.
        let retry = s.open_attempt(Utc::now()).unwrap();
        assert_ne!(retry.id, attempt.id);
    }

    #[test]
    fn test_decide_retry_outside_decision_point() {
        let mut s = scored_session();
        assert!(s.decide_retry(RetryDecision::Retry, Utc::now()).is_err());
        assert_eq!(s.state(), AllocationState::FirstAttempt);
    }

    #[test]
    fn test_attempts_are_appended_per_phase() {
        let mut s = scored_session();
        refuse(&mut s, AttemptResolution::rejected());
        s.decide_retry(RetryDecision::Retry, Utc::now()).unwrap();
        refuse(&mut s, AttemptResolution::rejected());

        let phases: Vec<_> = s.attempts().iter().map(|a| a.phase).collect();
        assert_eq!(phases, vec![AttemptPhase::First, AttemptPhase::SecondChance]);
        assert!(s.attempts().iter().all(|a| a.resolved_at.is_some()));
    }
}

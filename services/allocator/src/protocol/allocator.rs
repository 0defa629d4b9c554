//! Allocation driver.
//!
//! Runs sessions against the occupancy cache, the commit endpoint and the
//! session store. Work for a requester runs on its own task, so a commit
//! that has been sent is always resolved and recorded even if the caller
//! stops waiting.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use crpark_id::RequesterId;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::session::{AllocationReport, AllocationSession, AttemptResolution};
use super::{AllocationRequest, AllocationState, AttemptOutcome, RetryDecision};
use crate::cache::OccupancyCache;
use crate::commit::{CommitEndpoint, CommitError, CommitRequest};
use crate::error::AllocationError;
use crate::scoring::{self, Candidate, RankQuery, RankingPass, ScoringConfig};
use crate::state::{
    ActiveCommitment, AllocationContext, Commitment, SessionStore, SessionStoreError,
};

/// Tries per session store write before the error is surfaced.
const PERSIST_ATTEMPTS: u32 = 3;

const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub scoring: ScoringConfig,

    /// Bound on each commit round-trip.
    pub commit_timeout: Duration,

    /// Fallback attempts before giving up with `exhausted`.
    pub max_fallback_attempts: u32,

    /// Sessions idle this long are dropped from memory.
    pub session_idle_ttl: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringConfig::default(),
            commit_timeout: Duration::from_secs(5),
            max_fallback_attempts: 3,
            session_idle_ttl: Duration::from_secs(30 * 60),
        }
    }
}

type SharedSession = Arc<AsyncMutex<AllocationSession>>;

struct SessionEntry {
    session: SharedSession,
    last_active: Instant,
}

struct AllocatorInner {
    cache: Arc<OccupancyCache>,
    endpoint: Arc<dyn CommitEndpoint>,
    store: Arc<SessionStore>,
    config: AllocatorConfig,
    sessions: Mutex<HashMap<RequesterId, SessionEntry>>,
    in_flight: Mutex<HashSet<RequesterId>>,
}

/// Marks a requester busy until dropped.
struct InFlightGuard {
    inner: Arc<AllocatorInner>,
    requester_id: RequesterId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            in_flight.remove(&self.requester_id);
        }
    }
}

/// Drives allocation sessions.
#[derive(Clone)]
pub struct Allocator {
    inner: Arc<AllocatorInner>,
}

impl Allocator {
    pub fn new(
        cache: Arc<OccupancyCache>,
        endpoint: Arc<dyn CommitEndpoint>,
        store: Arc<SessionStore>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                cache,
                endpoint,
                store,
                config,
                sessions: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<OccupancyCache> {
        &self.inner.cache
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.inner.config
    }

    /// Start a new allocation for the requester.
    ///
    /// Replaces any session that is waiting for a retry decision. Fails with
    /// `AlreadyInProgress` while another commit for the requester is in flight.
    pub async fn allocate(
        &self,
        request: AllocationRequest,
    ) -> Result<AllocationReport, AllocationError> {
        request.validate()?;
        self.evict_idle_sessions()?;
        let guard = self.acquire(&request.requester_id)?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner.run_allocation(request).await
        });
        task.await
            .map_err(|e| AllocationError::Internal(format!("allocation task failed: {e}")))?
    }

    /// Answer the retry question after a first-attempt refusal.
    pub async fn decide_retry(
        &self,
        requester_id: &RequesterId,
        decision: RetryDecision,
    ) -> Result<AllocationReport, AllocationError> {
        let session = self
            .shared_session(requester_id)?
            .ok_or_else(|| AllocationError::NoSession(requester_id.clone()))?;
        let guard = self.acquire(requester_id)?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let mut locked = session.lock().await;
            let effective = locked.decide_retry(decision, Utc::now())?;
            if effective != decision {
                info!(
                    requester_id = %locked.requester_id(),
                    "Retry confirmed after the deadline, treating as decline"
                );
            }
            let result = inner.drive(&mut locked).await;
            inner.mark_active(locked.requester_id(), &session);
            result
        });
        task.await
            .map_err(|e| AllocationError::Internal(format!("retry task failed: {e}")))?
    }

    /// Latest session report for the requester.
    pub async fn session(
        &self,
        requester_id: &RequesterId,
    ) -> Result<Option<AllocationReport>, AllocationError> {
        let Some(session) = self.shared_session(requester_id)? else {
            return Ok(None);
        };
        let report = session.lock().await.report();
        Ok(Some(report))
    }

    /// Active commitment, refreshing its inactivity window.
    pub fn active_commitment(
        &self,
        requester_id: &RequesterId,
    ) -> Result<Option<ActiveCommitment>, AllocationError> {
        let active = self.inner.store.load_active(requester_id)?;
        if active.is_some() {
            self.inner.store.touch(requester_id, Utc::now())?;
        }
        Ok(active)
    }

    /// Cancel the active commitment and give its unit back locally.
    pub async fn release(
        &self,
        requester_id: &RequesterId,
    ) -> Result<Option<Commitment>, AllocationError> {
        let released = self.inner.store.release(requester_id)?;
        if let Some(commitment) = &released {
            self.inner
                .cache
                .revert_optimistic_reservation(&commitment.pool_id)
                .await;
        }
        Ok(released)
    }

    /// Rank pools without attempting anything.
    pub async fn preview(&self, query: &RankQuery, pass: RankingPass) -> Vec<Candidate> {
        let snapshot = self.inner.cache.list().await;
        scoring::rank(
            &snapshot,
            query,
            pass,
            &BTreeSet::new(),
            &self.inner.config.scoring,
        )
    }

    /// Sessions currently held in memory.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Drop sessions that have been idle longer than the configured TTL.
    ///
    /// Sessions with work in flight are kept. Returns how many were dropped.
    pub fn evict_idle_sessions(&self) -> Result<usize, AllocationError> {
        let busy = self
            .inner
            .in_flight
            .lock()
            .map_err(|_| AllocationError::Internal("in-flight set poisoned".to_string()))?
            .clone();
        let ttl = self.inner.config.session_idle_ttl;

        let mut sessions = self.inner.sessions()?;
        let before = sessions.len();
        sessions.retain(|requester_id, entry| {
            busy.contains(requester_id) || entry.last_active.elapsed() < ttl
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "Evicted idle allocation sessions");
        }
        Ok(evicted)
    }

    fn shared_session(
        &self,
        requester_id: &RequesterId,
    ) -> Result<Option<SharedSession>, AllocationError> {
        let sessions = self.inner.sessions()?;
        Ok(sessions.get(requester_id).map(|entry| Arc::clone(&entry.session)))
    }

    fn acquire(&self, requester_id: &RequesterId) -> Result<InFlightGuard, AllocationError> {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .map_err(|_| AllocationError::Internal("in-flight set poisoned".to_string()))?;
        if !in_flight.insert(requester_id.clone()) {
            debug!(%requester_id, "Allocation already in progress");
            return Err(AllocationError::AlreadyInProgress(requester_id.clone()));
        }
        Ok(InFlightGuard {
            inner: Arc::clone(&self.inner),
            requester_id: requester_id.clone(),
        })
    }
}

impl AllocatorInner {
    fn sessions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<RequesterId, SessionEntry>>, AllocationError> {
        self.sessions
            .lock()
            .map_err(|_| AllocationError::Internal("session map poisoned".to_string()))
    }

    /// Restart the idle clock of the requester's session, if it is still current.
    fn mark_active(&self, requester_id: &RequesterId, session: &SharedSession) {
        let Ok(mut sessions) = self.sessions() else {
            return;
        };
        if let Some(entry) = sessions.get_mut(requester_id) {
            if Arc::ptr_eq(&entry.session, session) {
                entry.last_active = Instant::now();
            }
        }
    }

    async fn run_allocation(
        &self,
        request: AllocationRequest,
    ) -> Result<AllocationReport, AllocationError> {
        let requester_id = request.requester_id.clone();
        let mut session = AllocationSession::new(request);
        info!(
            allocation_id = %session.id(),
            %requester_id,
            "Starting allocation"
        );

        session.begin_scoring()?;
        let snapshot = self.cache.list().await;
        let ranked = scoring::rank(
            &snapshot,
            &session.request().query(),
            RankingPass::Primary,
            &BTreeSet::new(),
            &self.config.scoring,
        );
        debug!(
            allocation_id = %session.id(),
            pools = snapshot.len(),
            eligible = ranked.len(),
            "Scored pools"
        );
        session.apply_ranking(ranked)?;

        let shared = Arc::new(AsyncMutex::new(session));
        self.sessions()?.insert(
            requester_id.clone(),
            SessionEntry {
                session: Arc::clone(&shared),
                last_active: Instant::now(),
            },
        );

        let mut session = shared.lock().await;
        let result = self.drive(&mut session).await;
        self.mark_active(&requester_id, &shared);
        result
    }

    /// Run the session until it needs a decision or reaches a terminal state.
    async fn drive(
        &self,
        session: &mut AllocationSession,
    ) -> Result<AllocationReport, AllocationError> {
        loop {
            match session.state() {
                AllocationState::FirstAttempt | AllocationState::SecondChance => {
                    self.attempt(session).await?;
                }
                AllocationState::FallbackSearch if session.target().is_none() => {
                    let snapshot = self.cache.list().await;
                    let ranked = scoring::rank(
                        &snapshot,
                        &session.request().query(),
                        RankingPass::Fallback,
                        session.rejected_pools(),
                        &self.config.scoring,
                    );
                    session.apply_fallback_ranking(ranked, self.config.max_fallback_attempts)?;
                }
                AllocationState::FallbackSearch => {
                    self.attempt(session).await?;
                }
                AllocationState::Accepted => {
                    if session.commitment().is_none() {
                        self.finalize(session).await?;
                    }
                    return Ok(session.report());
                }
                AllocationState::AwaitingRetryDecision => {
                    info!(
                        allocation_id = %session.id(),
                        requester_id = %session.requester_id(),
                        "Waiting for retry decision"
                    );
                    return Ok(session.report());
                }
                AllocationState::Failed => {
                    info!(
                        allocation_id = %session.id(),
                        requester_id = %session.requester_id(),
                        reason = ?session.failure(),
                        "Allocation failed"
                    );
                    return Ok(session.report());
                }
                state @ (AllocationState::Idle | AllocationState::Scoring) => {
                    return Err(AllocationError::Internal(format!(
                        "cannot drive a session in state {state}"
                    )));
                }
            }
        }
    }

    /// One commit round-trip against the session's target.
    async fn attempt(&self, session: &mut AllocationSession) -> Result<(), AllocationError> {
        let attempt = session.open_attempt(Utc::now())?;
        if let Err(e) = self.persist(|| self.store.record_attempt(&attempt)).await {
            // Nothing was sent, so nothing is lost by withdrawing it.
            error!(attempt_id = %attempt.id, error = %e, "Failed to log attempt, not sending it");
            session.abandon_attempt(attempt.id)?;
            return Err(e.into());
        }

        let request = CommitRequest {
            pool_id: attempt.pool_id.clone(),
            requester_id: attempt.requester_id.clone(),
            phase: attempt.phase,
        };

        let resolution =
            match tokio::time::timeout(self.config.commit_timeout, self.endpoint.commit(&request))
                .await
            {
                Ok(Ok(response)) => AttemptResolution::from(response),
                Ok(Err(CommitError::Timeout)) | Err(_) => {
                    warn!(
                        pool_id = %request.pool_id,
                        phase = %request.phase,
                        timeout_ms = self.config.commit_timeout.as_millis() as u64,
                        "Commit request timed out"
                    );
                    AttemptResolution::timeout()
                }
                Ok(Err(e)) => {
                    warn!(
                        pool_id = %request.pool_id,
                        phase = %request.phase,
                        error = %e,
                        "Commit request failed, treating as rejection"
                    );
                    AttemptResolution::failed(e.to_string())
                }
            };

        let resolved = session.resolve_attempt(attempt.id, resolution, Utc::now())?;
        info!(
            allocation_id = %session.id(),
            requester_id = %resolved.requester_id,
            pool_id = %resolved.pool_id,
            phase = %resolved.phase,
            outcome = resolved.outcome.as_str(),
            "Commit attempt resolved"
        );

        if resolved.outcome == AttemptOutcome::Accepted
            && !self.cache.apply_optimistic_reservation(&resolved.pool_id).await
        {
            debug!(pool_id = %resolved.pool_id, "No local room for optimistic hold");
        }

        // The outcome is already applied; a lost log update only leaves the row pending.
        if let Err(e) = self.persist(|| self.store.resolve_attempt(&resolved)).await {
            error!(
                attempt_id = %resolved.id,
                outcome = resolved.outcome.as_str(),
                error = %e,
                "Failed to log attempt outcome"
            );
        }
        Ok(())
    }

    /// Run a store write, retrying briefly before giving up.
    async fn persist<T>(
        &self,
        mut write: impl FnMut() -> Result<T, SessionStoreError>,
    ) -> Result<T, SessionStoreError> {
        let mut tries = 1;
        loop {
            match write() {
                Ok(value) => return Ok(value),
                Err(e) if tries < PERSIST_ATTEMPTS => {
                    warn!(error = %e, tries, "Session store write failed, retrying");
                    tries += 1;
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create and persist the commitment for an accepted session.
    ///
    /// The commitment is attached to the session before it is written, so a
    /// failed write still leaves the accepted outcome visible in the report.
    async fn finalize(&self, session: &mut AllocationSession) -> Result<(), AllocationError> {
        let (Some(accepted), Some(target)) = (session.attempts().last(), session.target()) else {
            return Err(AllocationError::Internal(
                "accepted session without an attempt or target".to_string(),
            ));
        };

        // Counts are from before the optimistic hold.
        let pool = &target.pool;
        let assigned_unit = accepted
            .assigned_unit
            .unwrap_or(pool.occupied + pool.reserved + 1);

        let request = session.request();
        let commitment = Commitment::from_attempt(
            accepted,
            assigned_unit,
            target.cost,
            request.duration_minutes,
            Utc::now(),
        );
        let context = AllocationContext {
            allocation_id: session.id(),
            origin: request.origin,
            destination: request.destination,
            duration_minutes: request.duration_minutes,
            candidate: target.clone(),
            alternatives: session
                .alternatives()
                .iter()
                .filter(|c| c.pool.id != target.pool.id)
                .cloned()
                .collect(),
        };

        let allocation_id = session.id();
        session.commit(commitment.clone())?;

        if let Err(e) = self
            .persist(|| self.store.save_commitment(&commitment, &context))
            .await
        {
            error!(
                %allocation_id,
                requester_id = %commitment.requester_id,
                commitment_id = %commitment.id,
                error = %e,
                "Failed to persist accepted commitment"
            );
            return Err(e.into());
        }
        info!(
            %allocation_id,
            requester_id = %commitment.requester_id,
            commitment_id = %commitment.id,
            pool_id = %commitment.pool_id,
            assigned_unit,
            "Allocation accepted"
        );
        Ok(())
    }
}

//! SQLite-based session store.
//!
//! Durable storage for each requester's active commitment, the history of
//! retired commitments and the attempt log, so sessions survive restarts.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use crpark_id::{RequesterId, ReservationId};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::commitment::{
    ActiveCommitment, AllocationContext, Commitment, CommitmentStatus, HistoryEntry,
};
use crate::protocol::ReservationAttempt;

/// Default inactivity window of an active commitment.
pub const DEFAULT_SESSION_TTL: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// Errors from session store operations.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),

    #[error("Session store lock poisoned")]
    Poisoned,
}

/// How much commitment history to keep per requester.
///
/// Unbounded by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryRetention {
    /// Keep at most this many entries.
    pub max_entries: Option<usize>,

    /// Drop entries retired longer ago than this.
    pub max_age: Option<Duration>,
}

impl HistoryRetention {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_entries.is_none() && self.max_age.is_none()
    }
}

/// Effect of an upstream reservation outcome on stored commitments.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeEffect {
    /// No active commitment holds that reservation.
    Unmatched,

    /// The active commitment is now confirmed.
    Confirmed { requester_id: RequesterId },

    /// The active commitment was revoked and moved to history.
    Revoked(Commitment),
}

/// SQLite session store.
pub struct SessionStore {
    conn: Mutex<Connection>,
    ttl: Duration,
    retention: HistoryRetention,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Open or create a store at the given path.
    ///
    /// A file that is not a readable database is moved aside and replaced
    /// by an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SessionStoreError> {
        let path = path.as_ref();
        match Self::open_file(path) {
            Err(SessionStoreError::Sqlite(e)) if is_corruption(&e) => {
                let aside = path.with_extension("corrupt");
                warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Session store unreadable, starting with an empty one"
                );
                std::fs::rename(path, &aside)?;
                Self::open_file(path)
            }
            other => other,
        }
    }

    fn open_file(path: &Path) -> Result<Self, SessionStoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::from_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, SessionStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, SessionStoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl: Duration::from_std(DEFAULT_SESSION_TTL)
                .map_err(|e| SessionStoreError::Invalid(e.to_string()))?,
            retention: HistoryRetention::default(),
        })
    }

    /// Set the inactivity window.
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Result<Self, SessionStoreError> {
        self.ttl = Duration::from_std(ttl).map_err(|e| SessionStoreError::Invalid(e.to_string()))?;
        Ok(self)
    }

    pub fn with_retention(mut self, retention: HistoryRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn retention(&self) -> HistoryRetention {
        self.retention
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SessionStoreError> {
        self.conn.lock().map_err(|_| SessionStoreError::Poisoned)
    }

    // =========================================================================
    // Active commitment
    // =========================================================================

    /// Store a new active commitment, retiring the previous one as `completed`.
    ///
    /// Returns the retired commitment, if any.
    pub fn save_commitment(
        &self,
        commitment: &Commitment,
        context: &AllocationContext,
    ) -> Result<Option<Commitment>, SessionStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = commitment.created_at;

        let retired = match read_active_row(&tx, &commitment.requester_id)? {
            Some(row) => match row.decode() {
                Ok(previous) => {
                    retire(&tx, &previous.commitment, CommitmentStatus::Completed, now)?;
                    Some(previous.commitment)
                }
                Err(e) => {
                    warn!(requester_id = %commitment.requester_id, error = %e, "Dropping unreadable active commitment");
                    None
                }
            },
            None => None,
        };

        let mut active = commitment.clone();
        active.status = CommitmentStatus::Active;
        tx.execute(
            r#"
            INSERT INTO active_commitments
                (requester_id, commitment_id, reservation_id, commitment, context, created_at, touched_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(requester_id) DO UPDATE SET
                commitment_id = excluded.commitment_id,
                reservation_id = excluded.reservation_id,
                commitment = excluded.commitment,
                context = excluded.context,
                created_at = excluded.created_at,
                touched_at = excluded.touched_at
            "#,
            params![
                active.requester_id.as_str(),
                active.id.to_string(),
                active.reservation_id.as_ref().map(|r| r.as_str()),
                serde_json::to_string(&active)?,
                serde_json::to_string(context)?,
                now.timestamp_millis(),
            ],
        )?;

        if retired.is_some() {
            prune(&tx, &commitment.requester_id, &self.retention, now)?;
        }
        tx.commit()?;

        info!(
            requester_id = %commitment.requester_id,
            commitment_id = %commitment.id,
            pool_id = %commitment.pool_id,
            retired = retired.is_some(),
            "Saved active commitment"
        );
        Ok(retired)
    }

    /// Active commitment, if present and not expired.
    pub fn load_active(
        &self,
        requester_id: &RequesterId,
    ) -> Result<Option<ActiveCommitment>, SessionStoreError> {
        self.load_active_at(requester_id, Utc::now())
    }

    /// Active commitment as of `now`.
    ///
    /// An expired commitment is moved to history as `expired`; an unreadable
    /// one is discarded. Both return `None`.
    pub fn load_active_at(
        &self,
        requester_id: &RequesterId,
        now: DateTime<Utc>,
    ) -> Result<Option<ActiveCommitment>, SessionStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let Some(row) = read_active_row(&tx, requester_id)? else {
            return Ok(None);
        };

        let active = match row.decode() {
            Ok(active) => active,
            Err(e) => {
                warn!(%requester_id, error = %e, "Discarding unreadable active commitment");
                delete_active(&tx, requester_id)?;
                tx.commit()?;
                return Ok(None);
            }
        };

        if now - active.touched_at >= self.ttl {
            retire(&tx, &active.commitment, CommitmentStatus::Expired, now)?;
            delete_active(&tx, requester_id)?;
            prune(&tx, requester_id, &self.retention, now)?;
            tx.commit()?;
            info!(
                %requester_id,
                commitment_id = %active.commitment.id,
                "Active commitment expired"
            );
            return Ok(None);
        }

        Ok(Some(active))
    }

    /// Record activity on the active commitment. Returns false if there is none.
    pub fn touch(
        &self,
        requester_id: &RequesterId,
        now: DateTime<Utc>,
    ) -> Result<bool, SessionStoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE active_commitments SET touched_at = ?2 WHERE requester_id = ?1",
            params![requester_id.as_str(), now.timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    /// End the active commitment early, moving it to history as `released`.
    pub fn release(
        &self,
        requester_id: &RequesterId,
    ) -> Result<Option<Commitment>, SessionStoreError> {
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let Some(row) = read_active_row(&tx, requester_id)? else {
            return Ok(None);
        };

        let released = match row.decode() {
            Ok(active) => {
                retire(&tx, &active.commitment, CommitmentStatus::Released, now)?;
                Some(active.commitment)
            }
            Err(e) => {
                warn!(%requester_id, error = %e, "Discarding unreadable active commitment");
                None
            }
        };
        delete_active(&tx, requester_id)?;
        prune(&tx, requester_id, &self.retention, now)?;
        tx.commit()?;

        if let Some(c) = &released {
            info!(%requester_id, commitment_id = %c.id, "Released commitment");
        }
        Ok(released)
    }

    /// Apply an upstream verdict to whichever active commitment holds the reservation.
    pub fn apply_reservation_outcome(
        &self,
        reservation_id: &ReservationId,
        accepted: bool,
    ) -> Result<OutcomeEffect, SessionStoreError> {
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let requester: Option<String> = tx
            .query_row(
                "SELECT requester_id FROM active_commitments WHERE reservation_id = ?1",
                params![reservation_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(requester) = requester else {
            return Ok(OutcomeEffect::Unmatched);
        };
        let requester_id =
            RequesterId::parse(&requester).map_err(|e| SessionStoreError::Invalid(e.to_string()))?;

        let Some(row) = read_active_row(&tx, &requester_id)? else {
            return Ok(OutcomeEffect::Unmatched);
        };
        let mut active = match row.decode() {
            Ok(active) => active,
            Err(e) => {
                warn!(%requester_id, error = %e, "Discarding unreadable active commitment");
                delete_active(&tx, &requester_id)?;
                tx.commit()?;
                return Ok(OutcomeEffect::Unmatched);
            }
        };

        let effect = if accepted {
            active.commitment.confirmed = true;
            tx.execute(
                "UPDATE active_commitments SET commitment = ?2 WHERE requester_id = ?1",
                params![requester_id.as_str(), serde_json::to_string(&active.commitment)?],
            )?;
            OutcomeEffect::Confirmed {
                requester_id: requester_id.clone(),
            }
        } else {
            retire(&tx, &active.commitment, CommitmentStatus::Revoked, now)?;
            delete_active(&tx, &requester_id)?;
            prune(&tx, &requester_id, &self.retention, now)?;
            let mut revoked = active.commitment;
            revoked.status = CommitmentStatus::Revoked;
            OutcomeEffect::Revoked(revoked)
        };
        tx.commit()?;

        debug!(%requester_id, %reservation_id, accepted, "Applied reservation outcome");
        Ok(effect)
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Retired commitments, oldest first.
    pub fn history(
        &self,
        requester_id: &RequesterId,
    ) -> Result<Vec<HistoryEntry>, SessionStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT seq, commitment, status, retired_at
            FROM commitment_history
            WHERE requester_id = ?1
            ORDER BY seq
            "#,
        )?;

        let rows = stmt.query_map(params![requester_id.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (seq, json, status, retired_at) = row?;
            let decoded = serde_json::from_str::<Commitment>(&json)
                .map_err(SessionStoreError::from)
                .and_then(|commitment| {
                    let status = CommitmentStatus::from_str(&status).ok_or_else(|| {
                        SessionStoreError::Invalid(format!("unknown status {status}"))
                    })?;
                    Ok(HistoryEntry {
                        seq,
                        commitment,
                        status,
                        retired_at: from_millis(retired_at)?,
                    })
                });
            match decoded {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(%requester_id, seq, error = %e, "Skipping unreadable history entry"),
            }
        }

        Ok(entries)
    }

    /// Apply the retention policy now. Returns the number of entries removed.
    pub fn prune_history(
        &self,
        requester_id: &RequesterId,
        now: DateTime<Utc>,
    ) -> Result<usize, SessionStoreError> {
        let conn = self.lock()?;
        prune(&conn, requester_id, &self.retention, now)
    }

    // =========================================================================
    // Attempt log
    // =========================================================================

    /// Append a new attempt.
    pub fn record_attempt(&self, attempt: &ReservationAttempt) -> Result<(), SessionStoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO attempt_log
                (attempt_id, requester_id, allocation_id, pool_id, phase, outcome, attempt, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                attempt.id.to_string(),
                attempt.requester_id.as_str(),
                attempt.allocation_id.to_string(),
                attempt.pool_id.as_str(),
                attempt.phase.as_str(),
                attempt.outcome.as_str(),
                serde_json::to_string(attempt)?,
                attempt.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Record the outcome of a pending attempt. Resolved attempts are never
    /// rewritten; returns false if the attempt was not pending.
    pub fn resolve_attempt(&self, attempt: &ReservationAttempt) -> Result<bool, SessionStoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE attempt_log SET outcome = ?2, attempt = ?3
            WHERE attempt_id = ?1 AND outcome = 'pending'
            "#,
            params![
                attempt.id.to_string(),
                attempt.outcome.as_str(),
                serde_json::to_string(attempt)?,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Every attempt by the requester, oldest first.
    pub fn attempts(
        &self,
        requester_id: &RequesterId,
    ) -> Result<Vec<ReservationAttempt>, SessionStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT attempt FROM attempt_log WHERE requester_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![requester_id.as_str()], |row| row.get::<_, String>(0))?;

        let mut attempts = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str(&json) {
                Ok(attempt) => attempts.push(attempt),
                Err(e) => warn!(%requester_id, error = %e, "Skipping unreadable attempt"),
            }
        }
        Ok(attempts)
    }

    /// Run raw SQL against the store, e.g. to install failing triggers.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), SessionStoreError> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn init_schema(conn: &Connection) -> Result<(), SessionStoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS active_commitments (
            requester_id TEXT PRIMARY KEY,
            commitment_id TEXT NOT NULL,
            reservation_id TEXT,
            commitment TEXT NOT NULL,
            context TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            touched_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_active_reservation ON active_commitments(reservation_id);

        CREATE TABLE IF NOT EXISTS commitment_history (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            requester_id TEXT NOT NULL,
            commitment_id TEXT NOT NULL,
            status TEXT NOT NULL,
            commitment TEXT NOT NULL,
            retired_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_history_requester ON commitment_history(requester_id, seq);

        CREATE TABLE IF NOT EXISTS attempt_log (
            attempt_id TEXT PRIMARY KEY,
            requester_id TEXT NOT NULL,
            allocation_id TEXT NOT NULL,
            pool_id TEXT NOT NULL,
            phase TEXT NOT NULL,
            outcome TEXT NOT NULL,
            attempt TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_attempts_requester ON attempt_log(requester_id, created_at);
        "#,
    )?;

    debug!("Session store schema initialized");
    Ok(())
}

fn is_corruption(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, SessionStoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SessionStoreError::Invalid(format!("timestamp out of range: {ms}")))
}

/// Raw active row, decoded lazily so unreadable rows can be discarded.
struct ActiveRow {
    commitment: String,
    context: String,
    created_at: i64,
    touched_at: i64,
}

impl ActiveRow {
    fn decode(&self) -> Result<ActiveCommitment, SessionStoreError> {
        Ok(ActiveCommitment {
            commitment: serde_json::from_str(&self.commitment)?,
            context: serde_json::from_str(&self.context)?,
            created_at: from_millis(self.created_at)?,
            touched_at: from_millis(self.touched_at)?,
        })
    }
}

fn read_active_row(
    conn: &Connection,
    requester_id: &RequesterId,
) -> Result<Option<ActiveRow>, SessionStoreError> {
    conn.query_row(
        r#"
        SELECT commitment, context, created_at, touched_at
        FROM active_commitments WHERE requester_id = ?1
        "#,
        params![requester_id.as_str()],
        |row| {
            Ok(ActiveRow {
                commitment: row.get(0)?,
                context: row.get(1)?,
                created_at: row.get(2)?,
                touched_at: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

fn delete_active(conn: &Connection, requester_id: &RequesterId) -> Result<(), SessionStoreError> {
    conn.execute(
        "DELETE FROM active_commitments WHERE requester_id = ?1",
        params![requester_id.as_str()],
    )?;
    Ok(())
}

fn retire(
    conn: &Connection,
    commitment: &Commitment,
    status: CommitmentStatus,
    now: DateTime<Utc>,
) -> Result<(), SessionStoreError> {
    let mut retired = commitment.clone();
    retired.status = status;
    conn.execute(
        r#"
        INSERT INTO commitment_history (requester_id, commitment_id, status, commitment, retired_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            retired.requester_id.as_str(),
            retired.id.to_string(),
            status.as_str(),
            serde_json::to_string(&retired)?,
            now.timestamp_millis(),
        ],
    )?;
    debug!(
        requester_id = %retired.requester_id,
        commitment_id = %retired.id,
        status = status.as_str(),
        "Retired commitment"
    );
    Ok(())
}

fn prune(
    conn: &Connection,
    requester_id: &RequesterId,
    retention: &HistoryRetention,
    now: DateTime<Utc>,
) -> Result<usize, SessionStoreError> {
    let mut removed = 0;

    if let Some(max_age) = retention.max_age {
        removed += conn.execute(
            "DELETE FROM commitment_history WHERE requester_id = ?1 AND retired_at < ?2",
            params![requester_id.as_str(), (now - max_age).timestamp_millis()],
        )?;
    }

    if let Some(max_entries) = retention.max_entries {
        let keep = i64::try_from(max_entries).unwrap_or(i64::MAX);
        removed += conn.execute(
            r#"
            DELETE FROM commitment_history
            WHERE requester_id = ?1 AND seq NOT IN (
                SELECT seq FROM commitment_history
                WHERE requester_id = ?1
                ORDER BY seq DESC
                LIMIT ?2
            )
            "#,
            params![requester_id.as_str(), keep],
        )?;
    }

    if removed > 0 {
        debug!(%requester_id, removed, "Pruned commitment history");
    }
    Ok(removed)
}

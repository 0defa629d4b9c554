//! Allocation error taxonomy.

use crpark_id::RequesterId;
use serde::Serialize;
use thiserror::Error;

use crate::protocol::{AllocationState, AttemptOutcome, FailureReason};
use crate::state::SessionStoreError;

/// Stable machine-readable codes shared by errors, reports and the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Nothing eligible at scoring time.
    NoCapacity,
    /// Authoritative commit refusal.
    Rejected,
    /// Commit round-trip exceeded its bound.
    Timeout,
    /// Fallback search ran out of candidates.
    Exhausted,
    /// Event feed is down; the cache is stale but usable.
    FeedDisconnected,
    /// Malformed origin, destination or duration.
    InvalidRequest,
    AlreadyInProgress,
    NoSession,
    InvalidTransition,
    StoreError,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCapacity => "no_capacity",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Exhausted => "exhausted",
            Self::FeedDisconnected => "feed_disconnected",
            Self::InvalidRequest => "invalid_request",
            Self::AlreadyInProgress => "already_in_progress",
            Self::NoSession => "no_session",
            Self::InvalidTransition => "invalid_transition",
            Self::StoreError => "store_error",
            Self::Internal => "internal",
        }
    }

    /// Whether the protocol can make progress after this code.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidRequest)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FailureReason> for ErrorCode {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::NoCapacity => Self::NoCapacity,
            FailureReason::Exhausted => Self::Exhausted,
        }
    }
}

impl AttemptOutcome {
    /// Code for a refused attempt.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected => Some(ErrorCode::Rejected),
            Self::Timeout => Some(ErrorCode::Timeout),
            Self::Pending | Self::Accepted => None,
        }
    }
}

/// Errors returned by allocator operations.
///
/// Protocol outcomes such as a rejected commit or an exhausted fallback are
/// not errors; they are reported on the session.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("an allocation is already in progress for {0}")]
    AlreadyInProgress(RequesterId),

    #[error("no allocation session for {0}")]
    NoSession(RequesterId),

    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: AllocationState,
        action: &'static str,
    },

    #[error("session store error: {0}")]
    Store(#[from] SessionStoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AllocationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::AlreadyInProgress(_) => ErrorCode::AlreadyInProgress,
            Self::NoSession(_) => ErrorCode::NoSession,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::Store(_) => ErrorCode::StoreError,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub(crate) fn transition(state: AllocationState, action: &'static str) -> Self {
        Self::InvalidTransition { state, action }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_wire_names() {
        let json = serde_json::to_value(ErrorCode::FeedDisconnected).unwrap();
        assert_eq!(json, ErrorCode::FeedDisconnected.as_str());
        assert_eq!(ErrorCode::from(FailureReason::Exhausted).as_str(), "exhausted");
    }

    #[test]
    fn test_only_invalid_request_is_unrecoverable() {
        assert!(!ErrorCode::InvalidRequest.is_recoverable());
        assert!(ErrorCode::Timeout.is_recoverable());
        assert!(ErrorCode::NoCapacity.is_recoverable());
    }

    #[test]
    fn test_timeout_is_reported_distinctly() {
        assert_eq!(AttemptOutcome::Timeout.code(), Some(ErrorCode::Timeout));
        assert_eq!(AttemptOutcome::Rejected.code(), Some(ErrorCode::Rejected));
        assert_eq!(AttemptOutcome::Accepted.code(), None);
    }

    #[test]
    fn test_error_codes() {
        let requester = RequesterId::parse("user-1").unwrap();
        assert_eq!(
            AllocationError::AlreadyInProgress(requester).code(),
            ErrorCode::AlreadyInProgress
        );
        let err = AllocationError::transition(AllocationState::Accepted, "decide retry");
        assert_eq!(err.code(), ErrorCode::InvalidTransition);
        assert_eq!(err.to_string(), "cannot decide retry while accepted");
    }
}

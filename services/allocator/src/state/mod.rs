//! Session persistence.
//!
//! Each requester has at most one active commitment. Retired commitments
//! move to an append-only history and every reservation attempt lands in
//! an attempt log.

mod commitment;
mod store;

pub use commitment::{
    claim_token, ActiveCommitment, AllocationContext, Commitment, CommitmentStatus, HistoryEntry,
};
pub use store::{
    HistoryRetention, OutcomeEffect, SessionStore, SessionStoreError, DEFAULT_SESSION_TTL,
};

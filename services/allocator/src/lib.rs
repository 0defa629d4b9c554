//! crpark allocator
//!
//! Assigns requesters to units in resource pools near their destination.
//!
//! ## Architecture
//!
//! - **Scoring**: ranks pools by distance, availability, cost, waiting time
//!   and competition
//! - **Occupancy cache**: live pool counts, seeded at start and kept current
//!   by the reconciliation listener
//! - **Reconciliation listener**: consumes the NDJSON event feed with
//!   timestamp deduplication and automatic reconnects
//! - **Allocation protocol**: first attempt, optional second chance, then a
//!   bounded fallback search
//! - **Session store**: SQLite persistence of the active commitment with an
//!   inactivity window, plus history and an attempt log
//!
//! ## Modules
//!
//! - `api`: HTTP routes
//! - `commit` / `client`: commit endpoint trait, mock and HTTP client
//! - `feed` / `listener`: event feed sources and the listener
//! - `protocol`: session state machine and the allocator driver
//! - `state`: local SQLite persistence

pub mod api;
pub mod cache;
pub mod client;
pub mod commit;
pub mod config;
pub mod error;
pub mod feed;
pub mod listener;
pub mod pool;
pub mod protocol;
pub mod scoring;
pub mod state;

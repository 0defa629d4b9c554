//! # crpark-events
//!
//! Wire types for the occupancy/reservation event feed.
//!
//! ## Design Principles
//!
//! - Events are immutable, authoritative observations from upstream
//! - Every event carries a logical timestamp `ts`; consumers are idempotent
//!   on `(poolId, ts)` because delivery is at-least-once
//! - The feed is newline-delimited JSON; one event per line
//!
//! ## Event Types
//!
//! - `occupancy_update`: absolute occupied/available counts for one pool
//! - `reservation_outcome`: upstream verdict on a reservation
//! - `optimization_complete`: the optimiser finished a pass, optionally
//!   publishing new per-pool acceptance parameters

mod codec;
mod error;
mod types;

pub use codec::{encode_line, LineDecoder, MAX_LINE_LEN};
pub use error::EventError;
pub use types::*;

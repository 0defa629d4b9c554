//! # crpark-id
//!
//! Typed identifiers for the crpark allocation service.
//!
//! ## Two kinds of identifier
//!
//! - **Minted ids** are generated by this system and use a prefixed ULID:
//!   `{prefix}_{ulid}` (for example `att_01HV4Z2WQXKJNM8GPQY6VBKC3D`).
//!   They sort by creation time.
//! - **Keys** are assigned by upstream systems (pool ids such as `lot_001`,
//!   requester ids, reservation ids such as `resv-1718000000000`). They are
//!   opaque strings; parsing only checks length and charset.
//!
//! Both are typed so a pool id can never be passed where a requester id is
//! expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

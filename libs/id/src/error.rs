//! Error types for ID parsing and validation.

use thiserror::Error;

/// Failures parsing minted ids or upstream keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A key exceeds the maximum length.
    #[error("key too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    /// A key contains a character outside `[A-Za-z0-9_.:-]`.
    #[error("invalid character {ch:?} in key")]
    InvalidCharacter { ch: char },
}

impl IdError {
    /// Returns true if the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if the input failed the key charset or length rules.
    pub fn is_key_error(&self) -> bool {
        matches!(self, IdError::TooLong { .. } | IdError::InvalidCharacter { .. })
    }
}

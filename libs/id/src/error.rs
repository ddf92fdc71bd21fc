//! Error types for handle and name parsing.

use thiserror::Error;

/// Errors that can occur when parsing handles or validating names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The handle has an invalid prefix.
    #[error("invalid handle prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The handle is missing the underscore separator.
    #[error("handle missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the handle is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A device name exceeds the maximum length.
    #[error("name too long: {len} > {max}")]
    TooLong { len: usize, max: usize },

    /// A device name contains a character outside the allowed set.
    #[error("invalid character {ch:?} in name '{name}'")]
    InvalidCharacter { name: String, ch: char },
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}

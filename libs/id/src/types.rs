//! Handle definitions for fleet resources.
//!
//! Each handle type has a unique prefix that identifies what it refers to.

use crate::define_handle;

// =============================================================================
// Links
// =============================================================================

define_handle!(LinkId, "lnk");

// =============================================================================
// Hosts
// =============================================================================

define_handle!(HostId, "host");

// =============================================================================
// Link Sequence Number
// =============================================================================

/// Per-link send sequence number.
///
/// Events on a single link are delivered in send order; the sequence makes
/// that order observable and lets receivers detect replays after reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LinkSeq(u64);

impl LinkSeq {
    /// The sequence number before anything has been sent.
    pub const ZERO: Self = Self(0);

    /// Creates a sequence number from a raw value.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for LinkSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for LinkSeq {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for LinkSeq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let seq = u64::deserialize(deserializer)?;
        Ok(Self(seq))
    }
}

// =============================================================================
// Tests
// =============================================================================

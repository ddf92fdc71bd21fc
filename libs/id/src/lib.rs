//! # fleet-id
//!
//! Identity types shared by every fleet component.
//!
//! Two families live here:
//!
//! - **Handles** (`LinkId`, `HostId`): opaque, system-issued,
//!   ULID-backed values. A link is identified by the handle issued when it
//!   was created, never by comparing transport objects.
//! - **Names** (`DeviceName`): operator-chosen, validated labels that are
//!   the externally visible identity of a logical device.
//!
//! ## Handle Format
//!
//! Handles render as `{prefix}_{ulid}`:
//!
//! - `lnk_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `host_01HV4Z3MXNKPQR9HSTZ7WCLD4E`

mod error;
mod macros;
mod name;
mod types;

pub use error::IdError;
pub use name::DeviceName;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

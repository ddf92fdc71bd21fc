//! # fleet-events
//!
//! The vocabulary exchanged between logical devices, their parents and
//! their controllers.
//!
//! ## Design Principles
//!
//! - A device's state is a small integer enum with a stable string table,
//!   so status reports are cheap to encode and easy to read in logs
//! - Events are distinguishable by a [`Signal`] opcode plus a typed payload;
//!   no particular binary framing is assumed
//! - Parameter bundles are opaque to everything except the device that
//!   consumes them
//!
//! ## Envelope
//!
//! Every event travelling over a link is wrapped in an [`Envelope`] with:
//! - Per-link ordering (`seq`)
//! - Routing (`source`, `destination`)
//! - Timing (`sent_at`), also used as the enqueue time while buffered

mod envelope;
mod error;
mod types;

pub use envelope::Envelope;
pub use error::EventError;
pub use types::*;

//! Device lifecycle: transition table, hooks and the engine that ties them.
//!
//! ```text
//! Initial -> Idle <-> { Claiming -> Claimed -> Preparing -> Suspended <-> Active }
//!                                   -> Releasing -> Idle | GoingDown
//! ```
//!
//! Commands are validated against the table; an illegal command leaves the
//! device untouched and returns a wrong-state error. Hook failures are
//! surfaced to the caller without retry.

mod behavior;
mod engine;
mod simulated;
mod table;

pub use behavior::{DeviceBehavior, HookContext, HookOutcome, Phase};
pub use engine::{Effect, LifecycleEngine};
pub use simulated::{HookLog, SimulatedDevice};
pub use table::{step, Action, Step, Trigger};

//! Actor framework for the device host.
//!
//! One process runs one cooperative loop per concern. Each actor owns its
//! state outright and is driven by its mailbox, its next timer and a
//! shutdown signal; nothing inside an actor is shared or locked.
//!
//! ## Actor Types
//!
//! - `HostActor`: owns the [`Host`](crate::host::Host) (devices, links,
//!   schedules, arbiter)
//! - `ControllerActor`: ticks the fleet-level reconciliation controller

mod controller;
mod framework;
mod host;

pub use controller::{ControllerActor, ControllerMessage};
pub use framework::{
    spawn_actor, Actor, ActorContext, ActorError, ActorHandle, ActorRef, Message,
};
pub use host::{DeviceCommand, HostActor, HostClient, HostMessage};

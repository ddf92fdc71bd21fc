//! Fleet device host library.
//!
//! A device host runs on each machine in the fleet and owns the logical
//! devices created there. Devices are claimed, prepared, activated and
//! released according to time windows and shared-capacity constraints;
//! composite devices follow a quorum of their children across hosts.
//!
//! ## Architecture
//!
//! Everything a process owns is driven by one cooperative loop:
//!
//! ```text
//! HostActor
//! └── Host
//!     ├── DeviceRegistry    (factories, LifecycleEngine per device, GC)
//!     ├── LinkTable         (parent/child/listener links, buffering, reconnect)
//!     ├── ScheduleManager   (prepare/start/stop timers, capacity preemption)
//!     └── ResourceArbiter   (first-come master per shared resource)
//! ControllerActor
//! └── ReconciliationController (fleet-level desired state, from fleet-reconcile)
//! ```
//!
//! ## Modules
//!
//! - `lifecycle`: transition table, device hooks and the per-device engine
//! - `composite`: quorum tracking over child devices
//! - `schedule`: schedule entries, the manager and the capacity allocator
//! - `transport`: links, outbound buffers and the transport seam

pub mod actors;
pub mod arbiter;
pub mod clock;
pub mod composite;
pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod registry;
pub mod schedule;
pub mod status;
pub mod timer;
pub mod transport;

pub use arbiter::ResourceArbiter;
pub use clock::{Clock, ManualClock, SystemClock};
pub use composite::{CompositeBehavior, DisconnectedPolicy, QuorumPolicy};
pub use config::{ConfigSource, HostConfig, MapConfigSource};
pub use error::{HostError, HostResult, ResultCode};
pub use host::Host;
pub use lifecycle::{DeviceBehavior, HookOutcome, LifecycleEngine, Phase, SimulatedDevice};
pub use registry::{DeviceFactory, DeviceRegistry};
pub use schedule::{CapacityPool, ScheduleEntry, ScheduleManager};
pub use status::{RecordingStatusSink, StatusSink, TracingStatusSink};
pub use transport::{LinkEvent, MockTransport, Transport};

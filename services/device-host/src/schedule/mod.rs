//! Time-driven activation with capacity arbitration.

mod allocator;
mod entry;
mod manager;

pub use allocator::{AllocationOutcome, CapacityAllocator, CapacityPool, Rebalance, Reservation};
pub use entry::{CapacityDemand, ScheduleEntry, ScheduleField, ScheduleUpdate};
pub use manager::{OutcomeRecord, ScheduleAction, ScheduleManager, ScheduleOutcome, Submitted};

//! Capacity allocation with preemption.

use std::collections::{BTreeSet, HashMap};

use fleet_events::ScheduleWindow;
use fleet_id::DeviceName;
use tracing::{debug, info, warn};

use super::entry::CapacityDemand;

/// Answer to an allocation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationOutcome {
    pub granted: bool,
    /// Lower-priority holders whose capacity was reclaimed.
    pub to_suspend: BTreeSet<DeviceName>,
    /// Holders that can proceed again.
    pub to_resume: BTreeSet<DeviceName>,
}

/// Suspend/resume sets produced when capacity is returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rebalance {
    pub to_suspend: BTreeSet<DeviceName>,
    pub to_resume: BTreeSet<DeviceName>,
}

impl Rebalance {
    pub fn is_empty(&self) -> bool {
        self.to_suspend.is_empty() && self.to_resume.is_empty()
    }
}

/// Grants finite shared capacity to competing reservations.
pub trait CapacityAllocator: Send {
    fn allocate(
        &mut self,
        claimant: &DeviceName,
        priority: u32,
        window: ScheduleWindow,
        demand: &CapacityDemand,
    ) -> AllocationOutcome;

    fn deallocate(&mut self, claimant: &DeviceName) -> Rebalance;
}

/// A granted (possibly preempted) reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub claimant: DeviceName,
    pub resource: String,
    pub priority: u32,
    pub window: ScheduleWindow,
    pub amount: u64,
    /// False while preempted.
    pub holding: bool,
}

/// Reference allocator: fixed totals per resource, priority preemption.
///
/// Holders whose windows overlap the request are charged against the
/// resource total for the whole request. When the request does not fit,
/// overlapping holders of strictly lower priority are preempted, lowest
/// priority and latest start first, until it does. If preempting every
/// candidate is still not enough, nothing is preempted and the request is
/// declined.
#[derive(Debug, Clone, Default)]
pub struct CapacityPool {
    totals: HashMap<String, u64>,
    reservations: Vec<Reservation>,
}

impl CapacityPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, resource: impl Into<String>, total: u64) -> Self {
        self.totals.insert(resource.into(), total);
        self
    }

    pub fn total(&self, resource: &str) -> u64 {
        self.totals.get(resource).copied().unwrap_or(0)
    }

    /// Capacity held by reservations overlapping `window`.
    pub fn in_use(&self, resource: &str, window: ScheduleWindow) -> u64 {
        self.holding_overlapping(resource, window)
            .fold(0, |sum, r| sum.saturating_add(r.amount))
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Claimants currently holding capacity on `resource`.
    pub fn holders(&self, resource: &str) -> BTreeSet<DeviceName> {
        self.reservations
            .iter()
            .filter(|r| r.holding && r.resource == resource)
            .map(|r| r.claimant.clone())
            .collect()
    }

    fn holding_overlapping<'a>(
        &'a self,
        resource: &'a str,
        window: ScheduleWindow,
    ) -> impl Iterator<Item = &'a Reservation> {
        self.reservations
            .iter()
            .filter(move |r| r.holding && r.resource == resource && overlaps(&r.window, &window))
    }

    /// Try to put preempted reservations back, highest priority first.
    fn resume_waiting(&mut self, resource: &str) -> BTreeSet<DeviceName> {
        let total = self.total(resource);
        let mut waiting: Vec<usize> = self
            .reservations
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.holding && r.resource == resource)
            .map(|(i, _)| i)
            .collect();
        waiting.sort_by(|a, b| {
            let (ra, rb) = (&self.reservations[*a], &self.reservations[*b]);
            rb.priority
                .cmp(&ra.priority)
                .then(ra.window.start_at.cmp(&rb.window.start_at))
        });

        let mut resumed = BTreeSet::new();
        for index in waiting {
            let window = self.reservations[index].window;
            let amount = self.reservations[index].amount;
            if fits(self.in_use(resource, window), amount, total) {
                self.reservations[index].holding = true;
                resumed.insert(self.reservations[index].claimant.clone());
            }
        }
        resumed
    }
}

/// Whether `amount` more fits under `total`. Overflow never fits.
fn fits(used: u64, amount: u64, total: u64) -> bool {
    used.checked_add(amount).is_some_and(|sum| sum <= total)
}

/// Half-open overlap; a zero-length window occupies its start second.
fn overlaps(a: &ScheduleWindow, b: &ScheduleWindow) -> bool {
    let a_end = a.stop_at.max(a.start_at.saturating_add(1));
    let b_end = b.stop_at.max(b.start_at.saturating_add(1));
    a.start_at < b_end && b.start_at < a_end
}

impl CapacityAllocator for CapacityPool {
    fn allocate(
        &mut self,
        claimant: &DeviceName,
        priority: u32,
        window: ScheduleWindow,
        demand: &CapacityDemand,
    ) -> AllocationOutcome {
        let resource = demand.resource.as_str();
        let Some(&total) = self.totals.get(resource) else {
            warn!(%resource, claimant = %claimant, "Unknown capacity resource");
            return AllocationOutcome::default();
        };

        // A claimant holds at most one reservation per resource.
        self.reservations
            .retain(|r| !(r.claimant == *claimant && r.resource == resource));

        let used = self.in_use(resource, window);
        let mut outcome = AllocationOutcome::default();

        if !fits(used, demand.amount, total) {
            let mut candidates: Vec<usize> = self
                .reservations
                .iter()
                .enumerate()
                .filter(|(_, r)| {
                    r.holding
                        && r.resource == resource
                        && r.priority < priority
                        && overlaps(&r.window, &window)
                })
                .map(|(i, _)| i)
                .collect();
            candidates.sort_by(|a, b| {
                let (ra, rb) = (&self.reservations[*a], &self.reservations[*b]);
                ra.priority
                    .cmp(&rb.priority)
                    .then(rb.window.start_at.cmp(&ra.window.start_at))
            });

            let mut reclaimed: u64 = 0;
            let mut victims = Vec::new();
            for index in candidates {
                if fits(used.saturating_sub(reclaimed), demand.amount, total) {
                    break;
                }
                reclaimed = reclaimed.saturating_add(self.reservations[index].amount);
                victims.push(index);
            }
            if !fits(used.saturating_sub(reclaimed), demand.amount, total) {
                debug!(%resource, claimant = %claimant, used, total, requested = demand.amount, "Capacity declined");
                return outcome;
            }
            for index in victims {
                let victim = &mut self.reservations[index];
                victim.holding = false;
                info!(%resource, preempted = %victim.claimant, by = %claimant, "Reservation preempted");
                outcome.to_suspend.insert(victim.claimant.clone());
            }
        }

        self.reservations.push(Reservation {
            claimant: claimant.clone(),
            resource: resource.to_string(),
            priority,
            window,
            amount: demand.amount,
            holding: true,
        });
        outcome.granted = true;
        outcome
    }

    fn deallocate(&mut self, claimant: &DeviceName) -> Rebalance {
        let mut freed: BTreeSet<String> = BTreeSet::new();
        self.reservations.retain(|r| {
            if r.claimant == *claimant {
                if r.holding {
                    freed.insert(r.resource.clone());
                }
                false
            } else {
                true
            }
        });

        let mut rebalance = Rebalance::default();
        for resource in freed {
            rebalance.to_resume.extend(self.resume_waiting(&resource));
        }
        rebalance
    }
}

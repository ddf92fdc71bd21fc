//! The schedule manager.
//!
//! Each device has at most one current entry with up to three armed
//! deadlines, plus a queue of follow-up entries that start at or after the
//! current entry stops. Firing a deadline yields [`ScheduleAction`]s for the
//! host to apply to devices; the manager itself never touches a device.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_events::{DeviceState, ErrorCode, Params};
use fleet_id::DeviceName;
use fleet_reconcile::Fingerprint;
use tracing::{debug, info, warn};

use super::allocator::CapacityAllocator;
use super::entry::{ScheduleEntry, ScheduleField, ScheduleUpdate};
use crate::error::{HostError, HostResult};
use crate::timer::{TimerHandle, TimerQueue};

/// Work the host must do on a device because a deadline fired.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleAction {
    /// Claim (if needed) and prepare. `generation` identifies the entry.
    ClaimAndPrepare {
        device: DeviceName,
        params: Params,
        generation: u64,
    },
    Resume { device: DeviceName },
    Suspend { device: DeviceName },
    Release { device: DeviceName },
}

impl ScheduleAction {
    pub fn device(&self) -> &DeviceName {
        match self {
            ScheduleAction::ClaimAndPrepare { device, .. }
            | ScheduleAction::Resume { device }
            | ScheduleAction::Suspend { device }
            | ScheduleAction::Release { device } => device,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleAction::ClaimAndPrepare { .. } => "claim_and_prepare",
            ScheduleAction::Resume { .. } => "resume",
            ScheduleAction::Suspend { .. } => "suspend",
            ScheduleAction::Release { .. } => "release",
        }
    }
}

/// How a schedule entry ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Completed,
    Failed(ErrorCode),
    Cancelled,
}

/// Terminal outcome of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRecord {
    pub device: DeviceName,
    pub fingerprint: Fingerprint,
    pub outcome: ScheduleOutcome,
    pub at: DateTime<Utc>,
}

/// What `submit` did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Became the device's current entry.
    Current,
    /// Identical to the current entry; timers re-armed where needed.
    Unchanged,
    /// Replaced the current entry's deadlines and parameters.
    Replaced,
    /// Queued behind the current entry.
    Queued,
}

#[derive(Debug, Clone, Copy)]
struct ArmedField {
    deadline: DateTime<Utc>,
    handle: TimerHandle,
}

#[derive(Debug)]
struct ActiveEntry {
    entry: ScheduleEntry,
    fingerprint: Fingerprint,
    generation: u64,
    armed: BTreeMap<ScheduleField, ArmedField>,
    fired: BTreeSet<ScheduleField>,
    /// A claim was requested for this entry.
    claimed: bool,
    /// Start fired while the device was still preparing.
    start_held: bool,
}

impl ActiveEntry {
    fn window_active(&self) -> bool {
        self.fired.contains(&ScheduleField::Start) && !self.fired.contains(&ScheduleField::Stop)
    }
}

#[derive(Debug, Default)]
struct DeviceSchedule {
    current: Option<ActiveEntry>,
    follow_ups: VecDeque<ScheduleEntry>,
}

/// Time-driven activation of devices with capacity preemption.
pub struct ScheduleManager {
    min_lead: chrono::Duration,
    devices: BTreeMap<DeviceName, DeviceSchedule>,
    timers: TimerQueue<(DeviceName, ScheduleField)>,
    allocator: Option<Box<dyn CapacityAllocator>>,
    preempted: BTreeSet<DeviceName>,
    pinned: BTreeSet<DeviceName>,
    outcomes: Vec<OutcomeRecord>,
    next_generation: u64,
}

impl std::fmt::Debug for ScheduleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleManager")
            .field("devices", &self.devices.len())
            .field("timers", &self.timers.len())
            .field("preempted", &self.preempted)
            .field("has_allocator", &self.allocator.is_some())
            .finish_non_exhaustive()
    }
}

impl ScheduleManager {
    pub fn new(min_lead: Duration) -> Self {
        Self {
            min_lead: chrono::Duration::from_std(min_lead).unwrap_or(chrono::Duration::MAX),
            devices: BTreeMap::new(),
            timers: TimerQueue::new(),
            allocator: None,
            preempted: BTreeSet::new(),
            pinned: BTreeSet::new(),
            outcomes: Vec::new(),
            next_generation: 1,
        }
    }

    pub fn with_allocator(mut self, allocator: Box<dyn CapacityAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Earliest instant a deadline may be armed for.
    fn floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.min_lead)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn set_allocator(&mut self, allocator: Box<dyn CapacityAllocator>) {
        self.allocator = Some(allocator);
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Add or replace a schedule entry.
    pub fn submit(&mut self, entry: ScheduleEntry, now: DateTime<Utc>) -> HostResult<Submitted> {
        entry.validate()?;
        let fingerprint = entry.fingerprint();
        let floor = self.floor(now);
        let device = entry.device.clone();

        let schedule = self.devices.entry(device.clone()).or_default();
        let Some(current) = schedule.current.as_mut() else {
            self.activate(entry, now);
            return Ok(Submitted::Current);
        };

        if current.fingerprint == fingerprint {
            arm_fields(&mut self.timers, floor, current);
            debug!(device = %device, "Identical schedule resubmitted");
            return Ok(Submitted::Unchanged);
        }

        if entry.start_at >= current.entry.stop_at {
            if schedule.follow_ups.iter().any(|e| e.fingerprint() == fingerprint) {
                return Ok(Submitted::Unchanged);
            }
            let position = schedule
                .follow_ups
                .iter()
                .position(|e| e.start_at > entry.start_at)
                .unwrap_or(schedule.follow_ups.len());
            schedule.follow_ups.insert(position, entry);
            info!(device = %device, queued = schedule.follow_ups.len(), "Schedule entry queued");
            return Ok(Submitted::Queued);
        }

        for field in &current.fired {
            if entry.deadline(*field) != current.entry.deadline(*field) {
                return Err(fired_error(*field));
            }
        }
        current.entry = entry;
        current.fingerprint = fingerprint;
        arm_fields(&mut self.timers, floor, current);
        info!(device = %device, "Schedule entry replaced");
        Ok(Submitted::Replaced)
    }

    /// Move individual deadlines (or parameters) of the current entry.
    pub fn update_schedule(
        &mut self,
        device: &DeviceName,
        update: &ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> HostResult<()> {
        let floor = self.floor(now);
        let current = self
            .devices
            .get_mut(device)
            .and_then(|s| s.current.as_mut())
            .ok_or_else(|| HostError::NotFound(device.to_string()))?;
        if update.is_empty() {
            return Ok(());
        }

        let updated = update.apply_to(&current.entry)?;
        for field in &current.fired {
            if updated.deadline(*field) != current.entry.deadline(*field) {
                return Err(fired_error(*field));
            }
        }
        current.fingerprint = updated.fingerprint();
        current.entry = updated;
        arm_fields(&mut self.timers, floor, current);
        info!(device = %device, "Schedule entry updated");
        Ok(())
    }

    /// Drop every entry for `device`.
    pub fn cancel(&mut self, device: &DeviceName, now: DateTime<Utc>) -> Vec<ScheduleAction> {
        let mut actions = Vec::new();
        let queued = self
            .devices
            .get_mut(device)
            .map(|s| std::mem::take(&mut s.follow_ups).len())
            .unwrap_or(0);
        if queued > 0 {
            debug!(device = %device, queued, "Dropped queued schedule entries");
        }
        self.finish(device, ScheduleOutcome::Cancelled, now, &mut actions);
        self.devices.remove(device);
        actions
    }

    /// Forget a device entirely without emitting actions.
    pub fn remove_device(&mut self, device: &DeviceName) {
        if let Some(schedule) = self.devices.remove(device) {
            if let Some(current) = schedule.current {
                for armed in current.armed.values() {
                    self.timers.cancel(armed.handle);
                }
            }
        }
        if let Some(allocator) = self.allocator.as_mut() {
            allocator.deallocate(device);
        }
        self.preempted.remove(device);
        self.pinned.remove(device);
    }

    // =========================================================================
    // Firing
    // =========================================================================

    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    /// Fire every deadline due at `now`, in deadline order.
    pub fn fire_due(&mut self, now: DateTime<Utc>) -> Vec<ScheduleAction> {
        let mut actions = Vec::new();
        for (handle, (device, field)) in self.timers.pop_due(now) {
            self.fire(&device, field, handle, now, &mut actions);
        }
        actions
    }

    fn fire(
        &mut self,
        device: &DeviceName,
        field: ScheduleField,
        handle: TimerHandle,
        now: DateTime<Utc>,
        actions: &mut Vec<ScheduleAction>,
    ) {
        let Some(current) = self.devices.get_mut(device).and_then(|s| s.current.as_mut()) else {
            debug!(device = %device, %field, "Timer fired for device without schedule");
            return;
        };
        if current.armed.get(&field).map(|a| a.handle) != Some(handle) {
            debug!(device = %device, %field, "Ignoring superseded timer");
            return;
        }

        // Earlier fields still waiting fire first so the order is always
        // prepare, start, stop.
        let mut order: Vec<ScheduleField> = ScheduleField::ALL
            .iter()
            .copied()
            .filter(|f| *f < field && !current.fired.contains(f))
            .collect();
        order.push(field);

        for field in order {
            self.on_field(device, field, now, actions);
        }
    }

    fn on_field(
        &mut self,
        device: &DeviceName,
        field: ScheduleField,
        now: DateTime<Utc>,
        actions: &mut Vec<ScheduleAction>,
    ) {
        let Some(current) = self.devices.get_mut(device).and_then(|s| s.current.as_mut()) else {
            return;
        };
        if !current.fired.insert(field) {
            return;
        }
        if let Some(armed) = current.armed.remove(&field) {
            self.timers.cancel(armed.handle);
        }
        info!(device = %device, %field, generation = current.generation, "Schedule deadline reached");

        match field {
            ScheduleField::Prepare => {
                let entry = current.entry.clone();
                let generation = current.generation;
                let allocation = match (&entry.demand, self.allocator.as_mut()) {
                    (Some(demand), Some(allocator)) => {
                        Some(allocator.allocate(device, entry.priority, entry.window(), demand))
                    }
                    _ => None,
                };
                if let Some(outcome) = allocation {
                    if !outcome.granted {
                        warn!(
                            device = %device,
                            demand = ?entry.demand,
                            "Capacity allocation declined"
                        );
                        self.finish(
                            device,
                            ScheduleOutcome::Failed(ErrorCode::RESOURCE_EXHAUSTED),
                            now,
                            actions,
                        );
                        return;
                    }
                    self.rebalance(device, outcome.to_suspend, outcome.to_resume, actions);
                }
                if let Some(current) = self.devices.get_mut(device).and_then(|s| s.current.as_mut()) {
                    current.claimed = true;
                }
                actions.push(ScheduleAction::ClaimAndPrepare {
                    device: device.clone(),
                    params: entry.params,
                    generation,
                });
            }
            ScheduleField::Start => {
                if self.preempted.contains(device) {
                    info!(device = %device, "Start reached while preempted; staying suspended");
                } else {
                    actions.push(ScheduleAction::Resume {
                        device: device.clone(),
                    });
                }
            }
            ScheduleField::Stop => {
                if !self.preempted.contains(device) {
                    actions.push(ScheduleAction::Suspend {
                        device: device.clone(),
                    });
                }
                self.finish(device, ScheduleOutcome::Completed, now, actions);
            }
        }
    }

    /// Apply an allocator's suspend/resume sets to everyone but `requester`.
    fn rebalance(
        &mut self,
        requester: &DeviceName,
        to_suspend: BTreeSet<DeviceName>,
        to_resume: BTreeSet<DeviceName>,
        actions: &mut Vec<ScheduleAction>,
    ) {
        for device in to_suspend.into_iter().filter(|d| d != requester) {
            info!(device = %device, by = %requester, "Preempting reservation");
            self.preempted.insert(device.clone());
            actions.push(ScheduleAction::Suspend { device });
        }
        for device in to_resume.into_iter().filter(|d| d != requester) {
            self.preempted.remove(&device);
            let active = self
                .devices
                .get(&device)
                .and_then(|s| s.current.as_ref())
                .is_some_and(ActiveEntry::window_active);
            if active {
                info!(device = %device, "Resuming preempted reservation");
                actions.push(ScheduleAction::Resume { device });
            } else {
                debug!(device = %device, "Capacity returned before window start");
            }
        }
    }

    /// End the current entry and promote the next follow-up.
    fn finish(
        &mut self,
        device: &DeviceName,
        outcome: ScheduleOutcome,
        now: DateTime<Utc>,
        actions: &mut Vec<ScheduleAction>,
    ) {
        let Some(current) = self.devices.get_mut(device).and_then(|s| s.current.take()) else {
            return;
        };
        for armed in current.armed.values() {
            self.timers.cancel(armed.handle);
        }
        match outcome {
            ScheduleOutcome::Failed(code) => {
                warn!(device = %device, error = %code, "Schedule entry failed")
            }
            _ => info!(device = %device, ?outcome, "Schedule entry finished"),
        }
        self.outcomes.push(OutcomeRecord {
            device: device.clone(),
            fingerprint: current.fingerprint.clone(),
            outcome,
            at: now,
        });
        self.preempted.remove(device);

        if let Some(allocator) = self.allocator.as_mut() {
            let freed = allocator.deallocate(device);
            self.rebalance(device, freed.to_suspend, freed.to_resume, actions);
        }

        let next = self.devices.get_mut(device).and_then(|s| s.follow_ups.pop_front());
        match next {
            Some(entry) => {
                info!(device = %device, start_at = entry.start_at, "Promoting queued schedule entry");
                self.activate(entry, now);
            }
            None => {
                self.devices.remove(device);
                if current.claimed && !self.pinned.contains(device) {
                    actions.push(ScheduleAction::Release {
                        device: device.clone(),
                    });
                }
            }
        }
    }

    fn activate(&mut self, entry: ScheduleEntry, now: DateTime<Utc>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let device = entry.device.clone();
        let mut active = ActiveEntry {
            fingerprint: entry.fingerprint(),
            entry,
            generation,
            armed: BTreeMap::new(),
            fired: BTreeSet::new(),
            claimed: false,
            start_held: false,
        };
        let floor = self.floor(now);
        arm_fields(&mut self.timers, floor, &mut active);
        info!(
            device = %device,
            generation,
            prepare_at = active.entry.prepare_at,
            start_at = active.entry.start_at,
            stop_at = active.entry.stop_at,
            "Schedule entry armed"
        );
        self.devices.entry(device).or_default().current = Some(active);
    }

    // =========================================================================
    // Failures
    // =========================================================================

    /// The claim/prepare for entry `generation` failed.
    pub fn fail(
        &mut self,
        device: &DeviceName,
        generation: Option<u64>,
        code: ErrorCode,
        now: DateTime<Utc>,
    ) -> Vec<ScheduleAction> {
        let mut actions = Vec::new();
        let matches = self
            .devices
            .get(device)
            .and_then(|s| s.current.as_ref())
            .is_some_and(|c| c.claimed && generation.map_or(true, |g| g == c.generation));
        if matches {
            self.finish(device, ScheduleOutcome::Failed(code), now, &mut actions);
        }
        actions
    }

    /// Keep a start that reached a device still claiming or preparing. It
    /// is resumed once the device reports `Suspended`. Returns false when
    /// the device has no window in progress.
    pub fn hold_start(&mut self, device: &DeviceName) -> bool {
        let Some(current) = self.devices.get_mut(device).and_then(|s| s.current.as_mut()) else {
            return false;
        };
        if !current.window_active() {
            return false;
        }
        current.start_held = true;
        debug!(device = %device, generation = current.generation, "Start held until prepare completes");
        true
    }

    /// Watch device reports: an error landing back in `Idle` (quality
    /// failure, auto-release) or `Claimed` (prepare failure) fails the
    /// claimed entry. A clean `Suspended` releases a held start.
    pub fn observe(
        &mut self,
        device: &DeviceName,
        state: DeviceState,
        error: ErrorCode,
        now: DateTime<Utc>,
    ) -> Vec<ScheduleAction> {
        if error.is_ok() {
            return match state {
                DeviceState::Suspended => self.release_held_start(device),
                _ => Vec::new(),
            };
        }
        if !matches!(state, DeviceState::Idle | DeviceState::Claimed) {
            return Vec::new();
        }
        self.fail(device, None, error, now)
    }

    fn release_held_start(&mut self, device: &DeviceName) -> Vec<ScheduleAction> {
        let preempted = self.preempted.contains(device);
        let Some(current) = self.devices.get_mut(device).and_then(|s| s.current.as_mut()) else {
            return Vec::new();
        };
        if !std::mem::take(&mut current.start_held) || !current.window_active() || preempted {
            return Vec::new();
        }
        info!(device = %device, generation = current.generation, "Prepare completed; running held start");
        vec![ScheduleAction::Resume {
            device: device.clone(),
        }]
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn current_entry(&self, device: &DeviceName) -> Option<&ScheduleEntry> {
        self.devices
            .get(device)
            .and_then(|s| s.current.as_ref())
            .map(|c| &c.entry)
    }

    pub fn current_generation(&self, device: &DeviceName) -> Option<u64> {
        self.devices
            .get(device)
            .and_then(|s| s.current.as_ref())
            .map(|c| c.generation)
    }

    pub fn follow_ups(&self, device: &DeviceName) -> Vec<&ScheduleEntry> {
        self.devices
            .get(device)
            .map(|s| s.follow_ups.iter().collect())
            .unwrap_or_default()
    }

    pub fn has_schedule(&self, device: &DeviceName) -> bool {
        self.devices.contains_key(device)
    }

    /// Armed deadlines of the current entry after clamping.
    pub fn armed_deadlines(&self, device: &DeviceName) -> BTreeMap<ScheduleField, DateTime<Utc>> {
        self.devices
            .get(device)
            .and_then(|s| s.current.as_ref())
            .map(|c| c.armed.iter().map(|(f, a)| (*f, a.deadline)).collect())
            .unwrap_or_default()
    }

    pub fn is_preempted(&self, device: &DeviceName) -> bool {
        self.preempted.contains(device)
    }

    /// Pinned devices are not released when their schedule runs out.
    pub fn pin(&mut self, device: DeviceName) {
        self.pinned.insert(device);
    }

    pub fn unpin(&mut self, device: &DeviceName) {
        self.pinned.remove(device);
    }

    pub fn is_pinned(&self, device: &DeviceName) -> bool {
        self.pinned.contains(device)
    }

    pub fn outcomes(&self) -> &[OutcomeRecord] {
        &self.outcomes
    }

    pub fn last_outcome(&self, device: &DeviceName) -> Option<&OutcomeRecord> {
        self.outcomes.iter().rev().find(|o| o.device == *device)
    }
}

/// Arm every unfired field, moving deadlines earlier than `floor` up to it.
/// A field whose clamped deadline is unchanged keeps its timer.
fn arm_fields(
    timers: &mut TimerQueue<(DeviceName, ScheduleField)>,
    floor: DateTime<Utc>,
    active: &mut ActiveEntry,
) {
    for field in ScheduleField::ALL {
        if active.fired.contains(&field) {
            continue;
        }
        let deadline = clamp(active.entry.deadline(field), floor);
        if let Some(armed) = active.armed.get(&field) {
            if armed.deadline == deadline && timers.is_armed(armed.handle) {
                continue;
            }
            timers.cancel(armed.handle);
        }
        let handle = timers.arm(deadline, (active.entry.device.clone(), field));
        active.armed.insert(field, ArmedField { deadline, handle });
    }
}

fn clamp(unix_secs: i64, floor: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(unix_secs, 0).map_or(floor, |deadline| deadline.max(floor))
}

fn fired_error(field: ScheduleField) -> HostError {
    HostError::InvalidParameter {
        key: format!("{field}_at"),
        detail: "deadline already fired".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::CapacityPool;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn dev(s: &str) -> DeviceName {
        DeviceName::new(s).unwrap()
    }

    fn entry(device: &str, prepare: i64, start: i64, stop: i64) -> ScheduleEntry {
        ScheduleEntry::new(dev(device), Params::new(), prepare, start, stop).unwrap()
    }

    fn kinds(actions: &[ScheduleAction]) -> Vec<(&'static str, String)> {
        actions
            .iter()
            .map(|a| (a.kind(), a.device().to_string()))
            .collect()
    }

    #[test]
    fn test_fires_in_order_then_releases() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();

        assert!(m.fire_due(t(104)).is_empty());
        assert_eq!(kinds(&m.fire_due(t(105))), vec![("claim_and_prepare", "A".into())]);
        assert_eq!(kinds(&m.fire_due(t(110))), vec![("resume", "A".into())]);
        assert_eq!(
            kinds(&m.fire_due(t(120))),
            vec![("suspend", "A".into()), ("release", "A".into())]
        );
        assert!(!m.has_schedule(&dev("A")));
        assert_eq!(m.last_outcome(&dev("A")).unwrap().outcome, ScheduleOutcome::Completed);
    }

    #[test]
    fn test_late_deadlines_are_clamped() {
        let mut m = ScheduleManager::new(Duration::from_secs(2));
        m.submit(entry("A", 90, 95, 130), t(100)).unwrap();
        let deadlines = m.armed_deadlines(&dev("A"));
        assert_eq!(deadlines[&ScheduleField::Prepare], t(102));
        assert_eq!(deadlines[&ScheduleField::Start], t(102));
        assert_eq!(deadlines[&ScheduleField::Stop], t(130));

        assert_eq!(
            kinds(&m.fire_due(t(102))),
            vec![("claim_and_prepare", "A".into()), ("resume", "A".into())]
        );
    }

    #[test]
    fn test_identical_resubmission_keeps_timers() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        let before = m.armed_deadlines(&dev("A"));
        assert_eq!(m.submit(entry("A", 105, 110, 120), t(101)).unwrap(), Submitted::Unchanged);
        assert_eq!(m.armed_deadlines(&dev("A")), before);
        assert_eq!(m.timers.len(), 3);
    }

    #[test]
    fn test_update_moves_single_field() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        m.update_schedule(&dev("A"), &ScheduleUpdate::stop_at(150), t(100)).unwrap();

        let deadlines = m.armed_deadlines(&dev("A"));
        assert_eq!(deadlines[&ScheduleField::Start], t(110));
        assert_eq!(deadlines[&ScheduleField::Stop], t(150));
        assert_eq!(m.timers.len(), 3);

        assert!(m.fire_due(t(120)).iter().all(|a| a.kind() != "suspend"));
    }

    #[test]
    fn test_update_of_fired_field_rejected() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        m.fire_due(t(105));
        let err = m
            .update_schedule(&dev("A"), &ScheduleUpdate { prepare_at: Some(106), ..Default::default() }, t(105))
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidParameter { .. }));
    }

    #[test]
    fn test_follow_up_skips_release() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        assert_eq!(m.submit(entry("A", 125, 130, 140), t(100)).unwrap(), Submitted::Queued);

        m.fire_due(t(110));
        assert_eq!(kinds(&m.fire_due(t(120))), vec![("suspend", "A".into())]);
        assert_eq!(m.current_entry(&dev("A")).unwrap().start_at, 130);
        assert_eq!(kinds(&m.fire_due(t(125))), vec![("claim_and_prepare", "A".into())]);
    }

    #[test]
    fn test_pinned_device_not_released() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.pin(dev("A"));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        let actions = m.fire_due(t(120));
        assert!(actions.iter().all(|a| a.kind() != "release"));
    }

    #[test]
    fn test_declined_capacity_fails_entry() {
        let pool = CapacityPool::new().with_resource("band", 5);
        let mut m = ScheduleManager::new(Duration::from_secs(1)).with_allocator(Box::new(pool));
        m.submit(entry("A", 105, 110, 120).with_demand("band", 10), t(100)).unwrap();

        assert!(m.fire_due(t(105)).is_empty());
        assert_eq!(
            m.last_outcome(&dev("A")).unwrap().outcome,
            ScheduleOutcome::Failed(ErrorCode::RESOURCE_EXHAUSTED)
        );
        assert!(m.fire_due(t(200)).is_empty());
    }

    #[test]
    fn test_preemption_and_resumption() {
        let pool = CapacityPool::new().with_resource("band", 10);
        let mut m = ScheduleManager::new(Duration::from_secs(1)).with_allocator(Box::new(pool));
        m.submit(entry("low", 101, 102, 150).with_demand("band", 8).with_priority(1), t(100)).unwrap();
        m.submit(entry("high", 110, 112, 120).with_demand("band", 8).with_priority(5), t(100)).unwrap();

        m.fire_due(t(102));
        let actions = m.fire_due(t(110));
        assert_eq!(
            kinds(&actions),
            vec![("suspend", "low".into()), ("claim_and_prepare", "high".into())]
        );
        assert!(m.is_preempted(&dev("low")));

        let actions = m.fire_due(t(120));
        assert_eq!(
            kinds(&actions),
            vec![
                ("resume", "high".into()),
                ("suspend", "high".into()),
                ("resume", "low".into()),
                ("release", "high".into()),
            ]
        );
        assert!(!m.is_preempted(&dev("low")));
    }

    #[test]
    fn test_observed_failure_promotes_follow_up() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        m.submit(entry("A", 125, 130, 140), t(100)).unwrap();
        m.fire_due(t(105));

        m.observe(&dev("A"), DeviceState::Idle, ErrorCode::QUALITY_NOT_MET, t(106));
        assert_eq!(
            m.last_outcome(&dev("A")).unwrap().outcome,
            ScheduleOutcome::Failed(ErrorCode::QUALITY_NOT_MET)
        );
        assert_eq!(m.current_entry(&dev("A")).unwrap().start_at, 130);

        // The promoted entry has not claimed yet, so a stray report is ignored.
        m.observe(&dev("A"), DeviceState::Idle, ErrorCode::QUALITY_NOT_MET, t(107));
        assert_eq!(m.current_entry(&dev("A")).unwrap().start_at, 130);
    }

    #[test]
    fn test_stale_generation_failure_ignored() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        m.fire_due(t(105));
        let generation = m.current_generation(&dev("A")).unwrap();
        assert!(m.fail(&dev("A"), Some(generation + 1), ErrorCode::DEVICE_FAULT, t(106)).is_empty());
        assert!(m.has_schedule(&dev("A")));
        let actions = m.fail(&dev("A"), Some(generation), ErrorCode::DEVICE_FAULT, t(106));
        assert_eq!(kinds(&actions), vec![("release", "A".into())]);
    }

    #[test]
    fn test_held_start_resumes_after_prepare() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        m.fire_due(t(105));
        assert_eq!(kinds(&m.fire_due(t(110))), vec![("resume", "A".into())]);
        assert!(m.hold_start(&dev("A")));

        assert!(m.observe(&dev("A"), DeviceState::Preparing, ErrorCode::OK, t(111)).is_empty());
        let actions = m.observe(&dev("A"), DeviceState::Suspended, ErrorCode::OK, t(112));
        assert_eq!(kinds(&actions), vec![("resume", "A".into())]);
        // Released once only.
        assert!(m.observe(&dev("A"), DeviceState::Suspended, ErrorCode::OK, t(113)).is_empty());
    }

    #[test]
    fn test_start_not_held_outside_window() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        m.fire_due(t(105));
        assert!(!m.hold_start(&dev("A")));
        assert!(!m.hold_start(&dev("B")));
        assert!(m.observe(&dev("A"), DeviceState::Suspended, ErrorCode::OK, t(106)).is_empty());
    }

    #[test]
    fn test_oversized_lead_holds_every_deadline() {
        let mut m = ScheduleManager::new(Duration::from_secs(u64::MAX));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        let deadlines = m.armed_deadlines(&dev("A"));
        assert!(deadlines.values().all(|d| *d == DateTime::<Utc>::MAX_UTC));
        assert!(m.fire_due(t(1_000_000)).is_empty());
    }

    #[test]
    fn test_cancel_before_prepare_emits_nothing() {
        let mut m = ScheduleManager::new(Duration::from_secs(1));
        m.submit(entry("A", 105, 110, 120), t(100)).unwrap();
        assert!(m.cancel(&dev("A"), t(101)).is_empty());
        assert!(m.fire_due(t(200)).is_empty());
        assert_eq!(m.last_outcome(&dev("A")).unwrap().outcome, ScheduleOutcome::Cancelled);
    }
}

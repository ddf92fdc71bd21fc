//! Schedules driven by a manual clock through the host.

use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_device_host::schedule::{
    CapacityAllocator, CapacityDemand, ScheduleOutcome, ScheduleUpdate, Submitted,
};
use fleet_device_host::{
    CapacityPool, HookOutcome, Host, HostConfig, ManualClock, MapConfigSource, Phase,
    RecordingStatusSink, ResultCode, ScheduleEntry,
};
use fleet_events::{DeviceState, ErrorCode, Params, ScheduleWindow};
use fleet_id::DeviceName;
use proptest::prelude::*;

const T0: i64 = 1_000;

fn name(s: &str) -> DeviceName {
    DeviceName::new(s).unwrap()
}

struct Harness {
    host: Host,
    clock: Arc<ManualClock>,
    status: Arc<RecordingStatusSink>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::at_unix(T0));
        let status = Arc::new(RecordingStatusSink::new());
        let host = Host::new(
            HostConfig::default(),
            clock.clone(),
            status.clone(),
            Arc::new(MapConfigSource::new()),
        )
        .unwrap();
        Self { host, clock, status }
    }

    fn with_pool(pool: CapacityPool) -> Self {
        let mut harness = Self::new();
        harness.host = harness.host.with_allocator(Box::new(pool));
        harness
    }

    /// Move the clock to `T0 + secs` and fire everything due.
    fn at(&mut self, secs: i64) {
        self.clock.set(chrono::DateTime::from_timestamp(T0 + secs, 0).unwrap());
        self.host.advance();
    }

    fn state(&self, device: &str) -> DeviceState {
        self.host.get_state(&name(device)).unwrap()
    }
}

#[test]
fn test_window_runs_prepare_start_stop() {
    let mut h = Harness::new();
    h.host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    let window = ScheduleWindow::new(T0 + 10, T0 + 20).unwrap();
    assert_eq!(
        h.host.schedule(&name("rx0"), window, Params::new()).unwrap(),
        Submitted::Current
    );

    h.at(4);
    assert_eq!(h.state("rx0"), DeviceState::Idle);

    // Default prepare lead is five seconds.
    h.at(5);
    assert_eq!(h.state("rx0"), DeviceState::Suspended);

    h.at(10);
    assert_eq!(h.state("rx0"), DeviceState::Active);

    h.at(20);
    assert_eq!(h.state("rx0"), DeviceState::Idle);
    assert_eq!(
        h.status.states_of("rx0"),
        vec![
            "idle", "claiming", "claimed", "preparing", "suspended", "active", "suspended",
            "releasing", "idle",
        ]
    );
    assert_eq!(h.host.schedule_outcomes().len(), 1);
    assert_eq!(h.host.schedule_outcomes()[0].outcome, ScheduleOutcome::Completed);
    assert!(!h.host.schedules().has_schedule(&name("rx0")));
}

#[test]
fn test_identical_resubmission_is_unchanged() {
    let mut h = Harness::new();
    h.host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    let entry = ScheduleEntry::new(name("rx0"), Params::new(), T0 + 5, T0 + 10, T0 + 20).unwrap();

    assert_eq!(h.host.submit_schedule(entry.clone()).unwrap(), Submitted::Current);
    let armed = h.host.schedules().armed_deadlines(&name("rx0"));

    h.at(3);
    assert_eq!(h.host.submit_schedule(entry).unwrap(), Submitted::Unchanged);
    assert_eq!(h.host.schedules().armed_deadlines(&name("rx0")), armed);

    h.at(20);
    assert_eq!(h.host.schedule_outcomes().len(), 1);
    assert_eq!(h.state("rx0"), DeviceState::Idle);

    // Prepare, start and stop each ran exactly once.
    let states = h.status.states_of("rx0");
    assert_eq!(
        states,
        vec![
            "idle", "claiming", "claimed", "preparing", "suspended", "active", "suspended",
            "releasing", "idle",
        ]
    );
    for (state, times) in [("preparing", 1), ("active", 1), ("releasing", 1)] {
        assert_eq!(states.iter().filter(|s| **s == state).count(), times, "{states:?}");
    }
}

#[test]
fn test_late_submission_prepares_at_min_lead() {
    let mut h = Harness::new();
    h.host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    let entry = ScheduleEntry::new(name("rx0"), Params::new(), T0 - 5, T0 + 10, T0 + 20).unwrap();
    h.host.submit_schedule(entry).unwrap();

    h.at(1);
    assert_eq!(h.state("rx0"), DeviceState::Suspended);
}

#[test]
fn test_update_after_fire_rejected() {
    let mut h = Harness::new();
    h.host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    let entry = ScheduleEntry::new(name("rx0"), Params::new(), T0 + 5, T0 + 10, T0 + 20).unwrap();
    h.host.submit_schedule(entry).unwrap();
    h.at(10);

    let err = h
        .host
        .update_schedule(&name("rx0"), &ScheduleUpdate::start_at(T0 + 12))
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::ConfigurationError);

    h.host
        .update_schedule(&name("rx0"), &ScheduleUpdate::stop_at(T0 + 30))
        .unwrap();
    h.at(20);
    assert_eq!(h.state("rx0"), DeviceState::Active);
    h.at(30);
    assert_eq!(h.state("rx0"), DeviceState::Idle);
}

#[test]
fn test_cancel_releases_claimed_device() {
    let mut h = Harness::new();
    h.host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    let window = ScheduleWindow::new(T0 + 10, T0 + 20).unwrap();
    h.host.schedule(&name("rx0"), window, Params::new()).unwrap();
    h.at(10);
    assert_eq!(h.state("rx0"), DeviceState::Active);

    h.host.cancel_schedule(&name("rx0")).unwrap();
    assert_eq!(h.state("rx0"), DeviceState::Idle);
    assert!(h.host.next_deadline().is_none());
}

#[test]
fn test_failed_prepare_fails_entry() {
    let mut h = Harness::new();
    h.host
        .create_device("simulated", name("rx0"), Params::new().with("fail", "prepare"))
        .unwrap();
    let window = ScheduleWindow::new(T0 + 10, T0 + 20).unwrap();
    h.host.schedule(&name("rx0"), window, Params::new()).unwrap();

    h.at(5);
    let outcome = h.host.schedules().last_outcome(&name("rx0")).unwrap();
    assert_eq!(outcome.outcome, ScheduleOutcome::Failed(ErrorCode::DEVICE_FAULT));

    // Nothing left to fire for the failed entry.
    h.at(10);
    assert_ne!(h.state("rx0"), DeviceState::Active);
}

#[test]
fn test_start_during_slow_prepare_runs_when_prepare_completes() {
    let mut h = Harness::new();
    h.host
        .create_device("simulated", name("rx0"), Params::new().with("defer", "prepare"))
        .unwrap();
    let window = ScheduleWindow::new(T0 + 10, T0 + 20).unwrap();
    h.host.schedule(&name("rx0"), window, Params::new()).unwrap();

    h.at(5);
    assert_eq!(h.state("rx0"), DeviceState::Preparing);
    h.at(10);
    assert_eq!(h.state("rx0"), DeviceState::Preparing);

    assert!(h
        .host
        .complete(&name("rx0"), Phase::Prepare, HookOutcome::Done)
        .unwrap());
    assert_eq!(h.state("rx0"), DeviceState::Active);

    h.at(15);
    assert_eq!(h.state("rx0"), DeviceState::Active);
    h.at(20);
    assert_eq!(h.state("rx0"), DeviceState::Idle);
    assert_eq!(h.host.schedule_outcomes().len(), 1);
    assert_eq!(h.host.schedule_outcomes()[0].outcome, ScheduleOutcome::Completed);
}

#[test]
fn test_start_on_released_device_fails_entry() {
    let mut h = Harness::new();
    h.host.create_device("simulated", name("rx0"), Params::new()).unwrap();
    let window = ScheduleWindow::new(T0 + 10, T0 + 20).unwrap();
    h.host.schedule(&name("rx0"), window, Params::new()).unwrap();
    h.at(5);
    h.host.release(&name("rx0")).unwrap();

    h.at(10);
    assert_eq!(h.state("rx0"), DeviceState::Idle);
    assert_eq!(
        h.host.schedules().last_outcome(&name("rx0")).unwrap().outcome,
        ScheduleOutcome::Failed(ErrorCode::WRONG_STATE)
    );
    assert!(!h.host.schedules().has_schedule(&name("rx0")));
}

#[test]
fn test_preemption_suspends_then_resumes_lower_priority() {
    let mut h = Harness::with_pool(CapacityPool::new().with_resource("band-l", 10));
    for rx in ["low", "high"] {
        h.host.create_device("simulated", name(rx), Params::new()).unwrap();
    }
    let low = ScheduleEntry::new(name("low"), Params::new(), T0 + 1, T0 + 2, T0 + 50)
        .unwrap()
        .with_demand("band-l", 8)
        .with_priority(1);
    let high = ScheduleEntry::new(name("high"), Params::new(), T0 + 10, T0 + 12, T0 + 20)
        .unwrap()
        .with_demand("band-l", 8)
        .with_priority(5);
    h.host.submit_schedule(low).unwrap();
    h.host.submit_schedule(high).unwrap();

    h.at(2);
    assert_eq!(h.state("low"), DeviceState::Active);

    h.at(10);
    assert_eq!(h.state("low"), DeviceState::Suspended);
    assert_eq!(h.state("high"), DeviceState::Suspended);
    assert!(h.host.schedules().is_preempted(&name("low")));

    h.at(12);
    assert_eq!(h.state("high"), DeviceState::Active);
    assert_eq!(h.state("low"), DeviceState::Suspended);

    h.at(20);
    assert_eq!(h.state("high"), DeviceState::Idle);
    assert_eq!(h.state("low"), DeviceState::Active);

    h.at(50);
    assert_eq!(h.state("low"), DeviceState::Idle);
}

#[test]
fn test_equal_priority_is_declined() {
    let mut h = Harness::with_pool(CapacityPool::new().with_resource("band-l", 10));
    for rx in ["a", "b"] {
        h.host.create_device("simulated", name(rx), Params::new()).unwrap();
        let entry = ScheduleEntry::new(name(rx), Params::new(), T0 + 1, T0 + 2, T0 + 10)
            .unwrap()
            .with_demand("band-l", 6);
        h.host.submit_schedule(entry).unwrap();
    }

    h.at(2);
    assert_eq!(h.state("a"), DeviceState::Active);
    assert_eq!(h.state("b"), DeviceState::Idle);
    assert_eq!(
        h.host.schedules().last_outcome(&name("b")).unwrap().outcome,
        ScheduleOutcome::Failed(ErrorCode::RESOURCE_EXHAUSTED)
    );
}

#[derive(Debug, Clone)]
enum PoolOp {
    Allocate { claimant: usize, priority: u32, amount: u64, start: i64, len: i64 },
    Deallocate { claimant: usize },
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        3 => (0usize..6, 0u32..4, 1u64..8, 0i64..60, 0i64..30).prop_map(
            |(claimant, priority, amount, start, len)| PoolOp::Allocate {
                claimant,
                priority,
                amount,
                start,
                len,
            }
        ),
        1 => (0usize..6).prop_map(|claimant| PoolOp::Deallocate { claimant }),
    ]
}

/// Capacity held at the instant `t`.
fn held_at(pool: &CapacityPool, t: i64) -> u64 {
    pool.in_use("band-l", ScheduleWindow::new(t, t + 1).unwrap())
}

proptest! {
    /// At every instant, capacity held by reservations never exceeds the
    /// total, and a preempted claimant never holds.
    #[test]
    fn prop_capacity_is_conserved(ops in prop::collection::vec(pool_op(), 1..40)) {
        let mut pool = CapacityPool::new().with_resource("band-l", 10);
        for op in ops {
            match op {
                PoolOp::Allocate { claimant, priority, amount, start, len } => {
                    let window = ScheduleWindow::new(start, start + len).unwrap();
                    let demand = CapacityDemand { resource: "band-l".into(), amount };
                    let out = pool.allocate(&name(&format!("rx{claimant}")), priority, window, &demand);
                    let holders = pool.holders("band-l");
                    prop_assert!(out.to_suspend.iter().all(|d| !holders.contains(d)));
                    if !out.granted {
                        prop_assert!(out.to_suspend.is_empty());
                    }
                }
                PoolOp::Deallocate { claimant } => {
                    let before: BTreeSet<DeviceName> = pool.holders("band-l");
                    let rebalance = pool.deallocate(&name(&format!("rx{claimant}")));
                    prop_assert!(rebalance.to_resume.iter().all(|d| !before.contains(d)));
                }
            }
            for t in 0..90 {
                prop_assert!(
                    held_at(&pool, t) <= pool.total("band-l"),
                    "over capacity at {t}: {:?}",
                    pool.reservations()
                );
            }
        }
    }
}

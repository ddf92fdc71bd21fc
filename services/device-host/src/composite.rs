//! Composite devices: quorum over child states.
//!
//! A composite fans `Claim`, `Prepare` and `Release` out to its children
//! and only completes its own phase once enough of them report the state
//! that phase settles at. "Enough" is a percentage of the quorum members.
//!
//! Membership rules:
//!
//! - children with no report since the last fan-out do not count towards
//!   the numerator (a child that never answers never helps)
//! - with [`DisconnectedPolicy::Exclude`] a disconnected child leaves the
//!   denominator until it reconnects and reports again
//! - with [`DisconnectedPolicy::Count`] it stays in the denominator
//! - a composite with no children of the watched type is satisfied at once
//! - a composite whose children are all excluded is never satisfied

use std::str::FromStr;

use fleet_events::{DeviceEvent, DeviceState, ErrorCode, Params};
use fleet_id::{DeviceName, LinkId};
use tracing::{debug, info, warn};

use crate::error::{HostError, HostResult};
use crate::lifecycle::{DeviceBehavior, HookContext, HookOutcome, Phase};

// =============================================================================
// Policy
// =============================================================================

/// How disconnected children count towards a quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectedPolicy {
    /// Out of the denominator until the child re-reports.
    #[default]
    Exclude,
    /// Still in the denominator.
    Count,
}

impl FromStr for DisconnectedPolicy {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "exclude" => Ok(DisconnectedPolicy::Exclude),
            "count" => Ok(DisconnectedPolicy::Count),
            other => Err(HostError::InvalidParameter {
                key: "quorum.disconnected".into(),
                detail: format!("expected exclude or count, got {other:?}"),
            }),
        }
    }
}

/// Quorum threshold plus the disconnected-children rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumPolicy {
    threshold_percent: u8,
    disconnected: DisconnectedPolicy,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            threshold_percent: 100,
            disconnected: DisconnectedPolicy::Exclude,
        }
    }
}

impl QuorumPolicy {
    /// `threshold_percent` must be within 1..=100.
    pub fn new(threshold_percent: u8, disconnected: DisconnectedPolicy) -> HostResult<Self> {
        if !(1..=100).contains(&threshold_percent) {
            return Err(HostError::InvalidParameter {
                key: "quorum.threshold_percent".into(),
                detail: format!("{threshold_percent} is outside 1..=100"),
            });
        }
        Ok(Self {
            threshold_percent,
            disconnected,
        })
    }

    pub fn threshold_percent(&self) -> u8 {
        self.threshold_percent
    }

    pub fn disconnected(&self) -> DisconnectedPolicy {
        self.disconnected
    }

    pub fn with_threshold(self, threshold_percent: u8) -> HostResult<Self> {
        Self::new(threshold_percent, self.disconnected)
    }
}

// =============================================================================
// Children
// =============================================================================

/// Cached view of one child.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub link: LinkId,
    pub name: DeviceName,
    pub device_type: String,
    pub last_state: Option<DeviceState>,
    pub last_error: ErrorCode,
    pub connected: bool,
    /// Set on disconnect, cleared by the next report.
    pub needs_rereport: bool,
    /// Reported since the last fan-out.
    pub fresh: bool,
    /// Reported a failure since the last fan-out.
    pub failed: bool,
}

impl ChildEntry {
    fn is_member(&self, policy: DisconnectedPolicy) -> bool {
        match policy {
            DisconnectedPolicy::Exclude => self.connected && !self.needs_rereport,
            DisconnectedPolicy::Count => true,
        }
    }
}

/// Ordered children of a device.
#[derive(Debug, Clone, Default)]
pub struct ChildSet {
    entries: Vec<ChildEntry>,
    disconnected: DisconnectedPolicy,
}

impl ChildSet {
    pub fn new(disconnected: DisconnectedPolicy) -> Self {
        Self {
            entries: Vec::new(),
            disconnected,
        }
    }

    pub fn set_disconnected_policy(&mut self, policy: DisconnectedPolicy) {
        self.disconnected = policy;
    }

    /// Add a child. Returns false if the link is already a child.
    pub fn add(&mut self, link: LinkId, name: DeviceName, device_type: impl Into<String>) -> bool {
        if self.contains(link) {
            return false;
        }
        self.entries.push(ChildEntry {
            link,
            name,
            device_type: device_type.into(),
            last_state: None,
            last_error: ErrorCode::OK,
            connected: true,
            needs_rereport: false,
            fresh: false,
            failed: false,
        });
        true
    }

    pub fn remove(&mut self, link: LinkId) -> Option<ChildEntry> {
        let index = self.entries.iter().position(|c| c.link == link)?;
        Some(self.entries.remove(index))
    }

    pub fn contains(&self, link: LinkId) -> bool {
        self.entries.iter().any(|c| c.link == link)
    }

    pub fn get(&self, link: LinkId) -> Option<&ChildEntry> {
        self.entries.iter().find(|c| c.link == link)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn links(&self) -> Vec<LinkId> {
        self.entries.iter().map(|c| c.link).collect()
    }

    /// Start a new fan-out cycle: forget who has answered.
    pub fn begin_cycle(&mut self) {
        for child in &mut self.entries {
            child.fresh = false;
            child.failed = false;
        }
    }

    /// Cache a state report. A report carrying an error that does not land
    /// on `target` marks the child failed for this cycle.
    pub fn record_report(
        &mut self,
        link: LinkId,
        state: DeviceState,
        error: ErrorCode,
        target: Option<DeviceState>,
    ) -> bool {
        let Some(child) = self.entries.iter_mut().find(|c| c.link == link) else {
            return false;
        };
        child.last_state = Some(state);
        child.last_error = error;
        child.connected = true;
        child.needs_rereport = false;
        child.fresh = true;
        if let Some(target) = target {
            if state != target && (!error.is_ok() || state.is_terminal()) {
                child.failed = true;
            }
        }
        true
    }

    pub fn mark_disconnected(&mut self, link: LinkId) -> bool {
        match self.entries.iter_mut().find(|c| c.link == link) {
            Some(child) => {
                child.connected = false;
                child.needs_rereport = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_connected(&mut self, link: LinkId) -> bool {
        match self.entries.iter_mut().find(|c| c.link == link) {
            Some(child) => {
                child.connected = true;
                true
            }
            None => false,
        }
    }

    fn watched<'a>(&'a self, child_type: Option<&'a str>) -> impl Iterator<Item = &'a ChildEntry> {
        self.entries
            .iter()
            .filter(move |c| child_type.map_or(true, |t| c.device_type == t))
    }

    /// `(matching, members, failed, watched)` for `state`.
    fn tally(&self, child_type: Option<&str>, state: DeviceState) -> (usize, usize, usize, usize) {
        let mut matching = 0;
        let mut members = 0;
        let mut failed = 0;
        let mut watched = 0;
        for child in self.watched(child_type) {
            watched += 1;
            if !child.is_member(self.disconnected) {
                continue;
            }
            members += 1;
            if child.failed {
                failed += 1;
            } else if child.fresh && child.connected && child.last_state == Some(state) {
                matching += 1;
            }
        }
        (matching, members, failed, watched)
    }

    /// True once at least `threshold_percent` of the quorum members of
    /// `child_type` (all types for `None`) have reported `state`.
    pub fn children_in_state(
        &self,
        threshold_percent: u8,
        child_type: Option<&str>,
        state: DeviceState,
    ) -> bool {
        let (matching, members, _, watched) = self.tally(child_type, state);
        if watched == 0 {
            return true;
        }
        if members == 0 {
            return false;
        }
        matching * 100 >= usize::from(threshold_percent) * members
    }

    /// True when too many members have failed for the quorum to be met in
    /// this cycle.
    pub fn quorum_unreachable(
        &self,
        threshold_percent: u8,
        child_type: Option<&str>,
        state: DeviceState,
    ) -> bool {
        let (_, members, failed, _) = self.tally(child_type, state);
        if members == 0 {
            return false;
        }
        (members - failed) * 100 < usize::from(threshold_percent) * members
    }
}

// =============================================================================
// Composite Behavior
// =============================================================================

/// Quorum fan-out behavior for a device built from children.
#[derive(Debug, Clone)]
pub struct CompositeBehavior {
    threshold_percent: u8,
    child_type: Option<String>,
}

impl CompositeBehavior {
    pub fn new(policy: QuorumPolicy) -> Self {
        Self {
            threshold_percent: policy.threshold_percent(),
            child_type: None,
        }
    }

    /// Only children of this type take part in the quorum.
    pub fn watching(mut self, child_type: impl Into<String>) -> Self {
        self.child_type = Some(child_type.into());
        self
    }

    pub fn threshold_percent(&self) -> u8 {
        self.threshold_percent
    }

    fn evaluate(&self, ctx: &HookContext<'_>, phase: Phase) -> Option<HookOutcome> {
        let target = phase.settles_at();
        let children = ctx.children();
        let child_type = self.child_type.as_deref();
        if children.children_in_state(self.threshold_percent, child_type, target) {
            info!(
                device = %ctx.device(),
                %phase,
                threshold_percent = self.threshold_percent,
                "Child quorum reached"
            );
            return Some(HookOutcome::Done);
        }
        if children.quorum_unreachable(self.threshold_percent, child_type, target) {
            if phase == Phase::Release {
                // Releasing cannot be refused; give up on the stragglers.
                warn!(device = %ctx.device(), "Children failed to release");
                return Some(HookOutcome::Done);
            }
            warn!(
                device = %ctx.device(),
                %phase,
                threshold_percent = self.threshold_percent,
                "Child quorum unreachable"
            );
            return Some(HookOutcome::Failed(ErrorCode::QUALITY_NOT_MET));
        }
        None
    }

    fn fan_out_and_wait(
        &mut self,
        ctx: &mut HookContext<'_>,
        event: DeviceEvent,
        phase: Phase,
    ) -> HookOutcome {
        ctx.children_mut().begin_cycle();
        let sent = ctx.fan_out(event);
        debug!(device = %ctx.device(), %phase, children = sent, "Fanned out to children");
        self.evaluate(ctx, phase).unwrap_or(HookOutcome::Pending)
    }
}

impl DeviceBehavior for CompositeBehavior {
    fn on_claim(&mut self, ctx: &mut HookContext<'_>) -> HookOutcome {
        self.fan_out_and_wait(ctx, DeviceEvent::Claim, Phase::Claim)
    }

    fn on_prepare(&mut self, ctx: &mut HookContext<'_>, params: &Params) -> HookOutcome {
        let event = DeviceEvent::Prepare {
            params: params.clone(),
        };
        self.fan_out_and_wait(ctx, event, Phase::Prepare)
    }

    fn on_resume(&mut self, ctx: &mut HookContext<'_>) -> HookOutcome {
        ctx.fan_out(DeviceEvent::Resume);
        HookOutcome::Done
    }

    fn on_suspend(&mut self, ctx: &mut HookContext<'_>) -> HookOutcome {
        ctx.fan_out(DeviceEvent::Suspend);
        HookOutcome::Done
    }

    fn on_release(&mut self, ctx: &mut HookContext<'_>) -> HookOutcome {
        self.fan_out_and_wait(ctx, DeviceEvent::Release, Phase::Release)
    }

    fn on_child_state(&mut self, ctx: &mut HookContext<'_>, phase: Phase) -> Option<HookOutcome> {
        match phase {
            Phase::Claim | Phase::Prepare | Phase::Release => self.evaluate(ctx, phase),
            Phase::Initialize | Phase::Resume | Phase::Suspend => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> DeviceName {
        DeviceName::new(s).unwrap()
    }

    fn set_of(n: usize, policy: DisconnectedPolicy) -> (ChildSet, Vec<LinkId>) {
        let mut set = ChildSet::new(policy);
        let links: Vec<LinkId> = (0..n).map(|_| LinkId::issue()).collect();
        for (i, link) in links.iter().enumerate() {
            set.add(*link, name(&format!("rx{i}")), "receiver");
        }
        (set, links)
    }

    #[test]
    fn test_no_children_is_met() {
        let set = ChildSet::default();
        assert!(set.children_in_state(100, None, DeviceState::Claimed));
        assert!(!set.quorum_unreachable(100, None, DeviceState::Claimed));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let (mut set, links) = set_of(10, DisconnectedPolicy::Exclude);
        set.begin_cycle();
        for link in &links[..8] {
            set.record_report(*link, DeviceState::Claimed, ErrorCode::OK, Some(DeviceState::Claimed));
        }
        assert!(!set.children_in_state(90, None, DeviceState::Claimed));
        set.record_report(links[8], DeviceState::Claimed, ErrorCode::OK, Some(DeviceState::Claimed));
        assert!(set.children_in_state(90, None, DeviceState::Claimed));
        assert!(!set.children_in_state(100, None, DeviceState::Claimed));
    }

    #[test]
    fn test_stale_reports_do_not_count_after_new_cycle() {
        let (mut set, links) = set_of(2, DisconnectedPolicy::Exclude);
        for link in &links {
            set.record_report(*link, DeviceState::Suspended, ErrorCode::OK, None);
        }
        assert!(set.children_in_state(100, None, DeviceState::Suspended));
        set.begin_cycle();
        assert!(!set.children_in_state(100, None, DeviceState::Suspended));
    }

    #[test]
    fn test_disconnected_excluded_until_rereport() {
        let (mut set, links) = set_of(3, DisconnectedPolicy::Exclude);
        set.begin_cycle();
        set.record_report(links[0], DeviceState::Claimed, ErrorCode::OK, None);
        set.record_report(links[1], DeviceState::Claimed, ErrorCode::OK, None);
        assert!(!set.children_in_state(100, None, DeviceState::Claimed));

        set.mark_disconnected(links[2]);
        assert!(set.children_in_state(100, None, DeviceState::Claimed));

        // Reconnecting alone does not restore membership.
        set.mark_connected(links[2]);
        assert!(set.children_in_state(100, None, DeviceState::Claimed));
        set.record_report(links[2], DeviceState::Claiming, ErrorCode::OK, None);
        assert!(!set.children_in_state(100, None, DeviceState::Claimed));
    }

    #[test]
    fn test_disconnected_counted_when_configured() {
        let (mut set, links) = set_of(2, DisconnectedPolicy::Count);
        set.begin_cycle();
        set.record_report(links[0], DeviceState::Claimed, ErrorCode::OK, None);
        set.mark_disconnected(links[1]);
        assert!(!set.children_in_state(100, None, DeviceState::Claimed));
        assert!(set.children_in_state(50, None, DeviceState::Claimed));
    }

    #[test]
    fn test_all_excluded_is_not_met() {
        let (mut set, links) = set_of(2, DisconnectedPolicy::Exclude);
        for link in &links {
            set.mark_disconnected(*link);
        }
        assert!(!set.children_in_state(50, None, DeviceState::Claimed));
        assert!(!set.quorum_unreachable(50, None, DeviceState::Claimed));
    }

    #[test]
    fn test_failures_make_quorum_unreachable() {
        let (mut set, links) = set_of(10, DisconnectedPolicy::Exclude);
        set.begin_cycle();
        let target = Some(DeviceState::Claimed);
        set.record_report(links[0], DeviceState::Idle, ErrorCode::DEVICE_FAULT, target);
        assert!(!set.quorum_unreachable(90, None, DeviceState::Claimed));
        set.record_report(links[1], DeviceState::Idle, ErrorCode::DEVICE_FAULT, target);
        assert!(set.quorum_unreachable(90, None, DeviceState::Claimed));
    }

    #[test]
    fn test_error_report_on_target_is_not_failure() {
        let (mut set, links) = set_of(1, DisconnectedPolicy::Exclude);
        set.begin_cycle();
        set.record_report(links[0], DeviceState::Idle, ErrorCode::WRONG_STATE, Some(DeviceState::Idle));
        assert!(set.children_in_state(100, None, DeviceState::Idle));
    }

    #[test]
    fn test_child_type_filter() {
        let mut set = ChildSet::default();
        let rx = LinkId::issue();
        let psu = LinkId::issue();
        set.add(rx, name("rx0"), "receiver");
        set.add(psu, name("psu0"), "power");
        set.begin_cycle();
        set.record_report(rx, DeviceState::Claimed, ErrorCode::OK, None);
        assert!(set.children_in_state(100, Some("receiver"), DeviceState::Claimed));
        assert!(!set.children_in_state(100, None, DeviceState::Claimed));
        assert!(set.children_in_state(100, Some("antenna"), DeviceState::Claimed));
    }

    #[test]
    fn test_policy_validation() {
        assert!(QuorumPolicy::new(0, DisconnectedPolicy::Exclude).is_err());
        assert!(QuorumPolicy::new(101, DisconnectedPolicy::Exclude).is_err());
        assert_eq!(
            QuorumPolicy::new(90, DisconnectedPolicy::Count)
                .unwrap()
                .threshold_percent(),
            90
        );
        assert_eq!("count".parse::<DisconnectedPolicy>().unwrap(), DisconnectedPolicy::Count);
    }

    #[test]
    fn test_duplicate_child_rejected() {
        let mut set = ChildSet::default();
        let link = LinkId::issue();
        assert!(set.add(link, name("rx0"), "receiver"));
        assert!(!set.add(link, name("rx0"), "receiver"));
        assert_eq!(set.len(), 1);
    }
}

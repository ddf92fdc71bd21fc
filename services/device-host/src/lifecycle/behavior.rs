//! Per-device hooks.
//!
//! The [`LifecycleEngine`](super::LifecycleEngine) owns the state; a
//! [`DeviceBehavior`] owns what a device actually does in each phase. Leaf
//! devices talk to hardware, composites fan commands out to children.

use fleet_events::{DeviceEvent, DeviceState, ErrorCode, Params};
use fleet_id::{DeviceName, LinkId};

use super::engine::Effect;
use crate::composite::ChildSet;
use crate::error::HostError;

/// A lifecycle phase with device-specific work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Initialize,
    Claim,
    Prepare,
    Resume,
    Suspend,
    Release,
}

impl Phase {
    /// State the device settles in when this phase completes.
    pub fn settles_at(&self) -> DeviceState {
        match self {
            Phase::Initialize | Phase::Release => DeviceState::Idle,
            Phase::Claim => DeviceState::Claimed,
            Phase::Prepare | Phase::Suspend => DeviceState::Suspended,
            Phase::Resume => DeviceState::Active,
        }
    }

    /// Phases whose completion may arrive later than the hook call.
    pub fn is_deferrable(&self) -> bool {
        !matches!(self, Phase::Resume | Phase::Suspend)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initialize => "initialize",
            Phase::Claim => "claim",
            Phase::Prepare => "prepare",
            Phase::Resume => "resume",
            Phase::Suspend => "suspend",
            Phase::Release => "release",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "initialize" => Ok(Phase::Initialize),
            "claim" => Ok(Phase::Claim),
            "prepare" => Ok(Phase::Prepare),
            "resume" => Ok(Phase::Resume),
            "suspend" => Ok(Phase::Suspend),
            "release" => Ok(Phase::Release),
            other => Err(HostError::InvalidParameter {
                key: "phase".to_string(),
                detail: format!("unknown phase {other:?}"),
            }),
        }
    }
}

/// What a hook reports back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// The phase finished.
    Done,
    /// The phase will finish later through `LifecycleEngine::complete`.
    /// Resume and suspend treat this as `Done`.
    Pending,
    /// The phase failed with a device error code.
    Failed(ErrorCode),
}

/// What a hook may touch while it runs.
pub struct HookContext<'a> {
    device: &'a DeviceName,
    children: &'a mut ChildSet,
    outbox: &'a mut Vec<Effect>,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(
        device: &'a DeviceName,
        children: &'a mut ChildSet,
        outbox: &'a mut Vec<Effect>,
    ) -> Self {
        Self {
            device,
            children,
            outbox,
        }
    }

    pub fn device(&self) -> &DeviceName {
        self.device
    }

    pub fn children(&self) -> &ChildSet {
        self.children
    }

    pub fn children_mut(&mut self) -> &mut ChildSet {
        self.children
    }

    /// Queue an event on one link.
    pub fn send(&mut self, link: LinkId, event: DeviceEvent) {
        self.outbox.push(Effect::Send { link, event });
    }

    /// Send the same event to every child. Links that are down buffer it
    /// until they reconnect. Returns how many children it went to.
    pub fn fan_out(&mut self, event: DeviceEvent) -> usize {
        let links = self.children.links();
        for link in &links {
            self.outbox.push(Effect::Send {
                link: *link,
                event: event.clone(),
            });
        }
        links.len()
    }
}

/// Device-specific lifecycle logic. One method per phase.
pub trait DeviceBehavior: Send {
    fn on_initialize(&mut self, _ctx: &mut HookContext<'_>) -> HookOutcome {
        HookOutcome::Done
    }

    fn on_claim(&mut self, ctx: &mut HookContext<'_>) -> HookOutcome;

    fn on_prepare(&mut self, ctx: &mut HookContext<'_>, params: &Params) -> HookOutcome;

    fn on_resume(&mut self, ctx: &mut HookContext<'_>) -> HookOutcome;

    fn on_suspend(&mut self, ctx: &mut HookContext<'_>) -> HookOutcome;

    fn on_release(&mut self, ctx: &mut HookContext<'_>) -> HookOutcome;

    /// A child's cached state changed while `phase` is outstanding. Return
    /// an outcome to finish the phase, or `None` to keep waiting.
    fn on_child_state(&mut self, _ctx: &mut HookContext<'_>, _phase: Phase) -> Option<HookOutcome> {
        None
    }
}

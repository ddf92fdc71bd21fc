//! A leaf device with scripted behavior, used by tests and the demo binary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use fleet_events::{ErrorCode, Params};

use super::behavior::{DeviceBehavior, HookContext, HookOutcome, Phase};

/// Shared record of hook invocations.
#[derive(Debug, Clone, Default)]
pub struct HookLog(Arc<Mutex<Vec<(Phase, Option<Params>)>>>);

impl HookLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, phase: Phase, params: Option<Params>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((phase, params));
    }

    /// Phases invoked so far, in order.
    pub fn phases(&self) -> Vec<Phase> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(phase, _)| *phase)
            .collect()
    }

    /// Parameters of the most recent prepare.
    pub fn last_prepare_params(&self) -> Option<Params> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find_map(|(_, params)| params.clone())
    }
}

/// A leaf device whose hooks succeed, defer or fail as scripted.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    scripted: HashMap<Phase, HookOutcome>,
    log: HookLog,
}

impl SimulatedDevice {
    /// Every hook succeeds immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// `phase` completes only through `LifecycleEngine::complete`.
    pub fn defer(mut self, phase: Phase) -> Self {
        self.scripted.insert(phase, HookOutcome::Pending);
        self
    }

    /// `phase` fails with `code`.
    pub fn fail(mut self, phase: Phase, code: ErrorCode) -> Self {
        self.scripted.insert(phase, HookOutcome::Failed(code));
        self
    }

    /// Record hook calls into `log`.
    pub fn with_log(mut self, log: HookLog) -> Self {
        self.log = log;
        self
    }

    pub fn log(&self) -> HookLog {
        self.log.clone()
    }

    fn run(&self, phase: Phase, params: Option<&Params>) -> HookOutcome {
        self.log.push(phase, params.cloned());
        self.scripted.get(&phase).copied().unwrap_or(HookOutcome::Done)
    }
}

impl DeviceBehavior for SimulatedDevice {
    fn on_initialize(&mut self, _ctx: &mut HookContext<'_>) -> HookOutcome {
        self.run(Phase::Initialize, None)
    }

    fn on_claim(&mut self, _ctx: &mut HookContext<'_>) -> HookOutcome {
        self.run(Phase::Claim, None)
    }

    fn on_prepare(&mut self, _ctx: &mut HookContext<'_>, params: &Params) -> HookOutcome {
        self.run(Phase::Prepare, Some(params))
    }

    fn on_resume(&mut self, _ctx: &mut HookContext<'_>) -> HookOutcome {
        self.run(Phase::Resume, None)
    }

    fn on_suspend(&mut self, _ctx: &mut HookContext<'_>) -> HookOutcome {
        self.run(Phase::Suspend, None)
    }

    fn on_release(&mut self, _ctx: &mut HookContext<'_>) -> HookOutcome {
        self.run(Phase::Release, None)
    }
}

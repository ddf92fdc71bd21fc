//! The per-device lifecycle engine.

use fleet_events::{DeviceEvent, DeviceState, ErrorCode, Params, ScheduleWindow};
use fleet_id::{DeviceName, LinkId};
use tracing::{debug, error, info, warn};

use super::behavior::{DeviceBehavior, HookContext, HookOutcome, Phase};
use super::table::{self, Action, Step, Trigger};
use crate::composite::{ChildSet, DisconnectedPolicy};
use crate::error::{HostError, HostResult};

/// Output of the engine, drained by the host after every call.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send an event on a link.
    Send { link: LinkId, event: DeviceEvent },
    /// The device entered `state` (or re-announced it).
    Status { state: DeviceState, error: ErrorCode },
}

/// Drives one logical device through its lifecycle.
///
/// The externally visible state changes only through the transition table.
/// Hooks may finish synchronously or later through [`complete`]; children
/// finish composite phases through state reports.
///
/// [`complete`]: LifecycleEngine::complete
pub struct LifecycleEngine {
    name: DeviceName,
    device_type: String,
    state: DeviceState,
    last_error: ErrorCode,
    window: Option<ScheduleWindow>,
    parent: Option<LinkId>,
    listeners: Vec<LinkId>,
    children: ChildSet,
    behavior: Box<dyn DeviceBehavior>,
    pending: Option<Phase>,
    teardown: bool,
    prepare_params: Params,
    chained_prepare: Option<Params>,
    outbox: Vec<Effect>,
}

impl std::fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEngine")
            .field("name", &self.name)
            .field("device_type", &self.device_type)
            .field("state", &self.state)
            .field("last_error", &self.last_error)
            .field("pending", &self.pending)
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

impl LifecycleEngine {
    pub fn new(
        name: DeviceName,
        device_type: impl Into<String>,
        behavior: Box<dyn DeviceBehavior>,
    ) -> Self {
        Self {
            name,
            device_type: device_type.into(),
            state: DeviceState::Initial,
            last_error: ErrorCode::OK,
            window: None,
            parent: None,
            listeners: Vec::new(),
            children: ChildSet::default(),
            behavior,
            pending: None,
            teardown: false,
            prepare_params: Params::new(),
            chained_prepare: None,
            outbox: Vec::new(),
        }
    }

    pub fn with_disconnected_policy(mut self, policy: DisconnectedPolicy) -> Self {
        self.children.set_disconnected_policy(policy);
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &DeviceName {
        &self.name
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    /// Reportable status string.
    pub fn status(&self) -> String {
        if self.last_error.is_ok() {
            self.state.as_str().to_string()
        } else {
            format!("{} ({})", self.state, self.last_error)
        }
    }

    pub fn window(&self) -> Option<ScheduleWindow> {
        self.window
    }

    pub fn pending_phase(&self) -> Option<Phase> {
        self.pending
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_tearing_down(&self) -> bool {
        self.teardown
    }

    pub fn children(&self) -> &ChildSet {
        &self.children
    }

    pub fn parent(&self) -> Option<LinkId> {
        self.parent
    }

    pub fn listeners(&self) -> &[LinkId] {
        &self.listeners
    }

    /// Drain queued effects.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.outbox)
    }

    // =========================================================================
    // Wiring
    // =========================================================================

    pub fn attach_parent(&mut self, link: LinkId) {
        self.parent = Some(link);
    }

    pub fn add_listener(&mut self, link: LinkId) {
        if !self.listeners.contains(&link) {
            self.listeners.push(link);
        }
    }

    pub fn add_child(&mut self, link: LinkId, name: DeviceName, device_type: impl Into<String>) -> bool {
        self.children.add(link, name, device_type)
    }

    /// Forget a link, whatever role it had.
    pub fn detach(&mut self, link: LinkId) {
        if self.parent == Some(link) {
            self.parent = None;
        }
        self.listeners.retain(|l| *l != link);
        if self.children.remove(link).is_some() {
            self.reevaluate_children();
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Run the initialize hook: `Initial -> Idle`, or `Disabled` on failure.
    pub fn initialize(&mut self) -> HostResult<()> {
        self.fire(Trigger::Initialize)
    }

    pub fn schedule(&mut self, window: ScheduleWindow) -> HostResult<()> {
        self.fire(Trigger::Schedule)?;
        debug!(device = %self.name, start_at = window.start_at, stop_at = window.stop_at, "Schedule recorded");
        self.window = Some(window);
        Ok(())
    }

    pub fn cancel_schedule(&mut self) -> HostResult<()> {
        self.fire(Trigger::CancelSchedule)?;
        self.window = None;
        Ok(())
    }

    /// Track the window of the host-side schedule entry. Unlike
    /// [`schedule`](Self::schedule) this is valid in any state.
    pub(crate) fn set_window(&mut self, window: Option<ScheduleWindow>) {
        self.window = window;
    }

    pub fn claim(&mut self) -> HostResult<()> {
        self.chained_prepare = None;
        self.fire(Trigger::Claim)
    }

    /// Claim, then prepare with `params` as soon as the claim completes. A
    /// device that already holds its claim goes straight to prepare.
    pub fn claim_and_prepare(&mut self, params: Params) -> HostResult<()> {
        match self.state {
            DeviceState::Claimed | DeviceState::Suspended => self.prepare(params),
            _ => {
                self.check(Trigger::Claim)?;
                self.chained_prepare = Some(params);
                self.fire(Trigger::Claim)
            }
        }
    }

    pub fn prepare(&mut self, params: Params) -> HostResult<()> {
        self.check(Trigger::Prepare)?;
        self.prepare_params = params;
        self.fire(Trigger::Prepare)
    }

    pub fn resume(&mut self) -> HostResult<()> {
        self.fire(Trigger::Resume)
    }

    pub fn suspend(&mut self) -> HostResult<()> {
        self.fire(Trigger::Suspend)
    }

    pub fn release(&mut self) -> HostResult<()> {
        self.chained_prepare = None;
        self.fire(Trigger::Release)
    }

    /// Release if needed and end in `GoingDown`.
    pub fn shutdown(&mut self) -> HostResult<()> {
        self.chained_prepare = None;
        self.fire(Trigger::Shutdown)
    }

    pub fn disable(&mut self) -> HostResult<()> {
        self.fire(Trigger::Disable)
    }

    /// Finish a phase whose hook returned `Pending`. Returns false when the
    /// phase is no longer outstanding (a late or duplicate completion).
    pub fn complete(&mut self, phase: Phase, outcome: HookOutcome) -> bool {
        if self.pending != Some(phase) {
            debug!(device = %self.name, %phase, state = %self.state, "Ignoring stale completion");
            return false;
        }
        if outcome == HookOutcome::Pending {
            return false;
        }
        self.pending = None;
        if let Err(err) = self.settle(phase, outcome) {
            warn!(device = %self.name, %phase, error = %err, "Follow-up after completion failed");
        }
        true
    }

    // =========================================================================
    // Link input
    // =========================================================================

    /// Handle an event that arrived on one of this device's links.
    pub fn handle_event(&mut self, link: LinkId, event: DeviceEvent) -> HostResult<()> {
        if self.children.contains(link) {
            return match event {
                DeviceEvent::StateReport { state, error, .. } => {
                    self.on_child_report(link, state, error);
                    Ok(())
                }
                other => {
                    warn!(device = %self.name, link_id = %link, signal = ?other.signal(), "Ignoring command from child");
                    Ok(())
                }
            };
        }

        match event {
            DeviceEvent::StateReport { device, .. } => {
                debug!(device = %self.name, from = %device, "Ignoring state report from non-child");
                Ok(())
            }
            DeviceEvent::QueryState => {
                self.report_to(link);
                Ok(())
            }
            command => {
                let result = self.apply_command(command);
                if let Err(err) = &result {
                    // Every command gets an answer, even a rejected one.
                    let event = self.state_report(err.error_code());
                    self.outbox.push(Effect::Send { link, event });
                }
                result
            }
        }
    }

    fn apply_command(&mut self, command: DeviceEvent) -> HostResult<()> {
        match command {
            DeviceEvent::Schedule { window } => self.schedule(window),
            DeviceEvent::CancelSchedule => self.cancel_schedule(),
            DeviceEvent::Claim => self.claim(),
            DeviceEvent::Prepare { params } => self.prepare(params),
            DeviceEvent::Resume => self.resume(),
            DeviceEvent::Suspend => self.suspend(),
            DeviceEvent::Release => self.release(),
            DeviceEvent::Shutdown => self.shutdown(),
            DeviceEvent::QueryState | DeviceEvent::StateReport { .. } => Ok(()),
        }
    }

    /// A link went down. State never changes on transport loss.
    pub fn on_link_down(&mut self, link: LinkId) {
        if self.children.mark_disconnected(link) {
            info!(device = %self.name, link_id = %link, "Child disconnected");
            self.reevaluate_children();
        }
    }

    /// A link came back. Children are asked to re-report; parents and
    /// listeners get the current state.
    pub fn on_link_up(&mut self, link: LinkId) {
        if self.children.mark_connected(link) {
            info!(device = %self.name, link_id = %link, "Child reconnected");
            self.outbox.push(Effect::Send {
                link,
                event: DeviceEvent::QueryState,
            });
        } else if self.parent == Some(link) || self.listeners.contains(&link) {
            self.report_to(link);
        }
    }

    fn on_child_report(&mut self, link: LinkId, state: DeviceState, error: ErrorCode) {
        let target = self.pending.map(|p| p.settles_at());
        self.children.record_report(link, state, error, target);
        debug!(device = %self.name, link_id = %link, child_state = %state, "Child state cached");
        self.reevaluate_children();
    }

    fn reevaluate_children(&mut self) {
        let Some(phase) = self.pending else {
            return;
        };
        let mut ctx = HookContext::new(&self.name, &mut self.children, &mut self.outbox);
        if let Some(outcome) = self.behavior.on_child_state(&mut ctx, phase) {
            self.complete(phase, outcome);
        }
    }

    // =========================================================================
    // Transition machinery
    // =========================================================================

    fn check(&self, trigger: Trigger) -> HostResult<Step> {
        table::step(self.state, trigger).ok_or_else(|| {
            warn!(
                device = %self.name,
                state = %self.state,
                command = trigger.command(),
                "Command rejected in current state"
            );
            HostError::WrongState {
                device: self.name.to_string(),
                state: self.state,
                command: trigger.command(),
            }
        })
    }

    /// Apply a caller command.
    fn fire(&mut self, trigger: Trigger) -> HostResult<()> {
        let step = self.check(trigger)?;
        self.last_error = ErrorCode::OK;
        if trigger == Trigger::Shutdown {
            self.teardown = true;
        }
        self.apply(step)
    }

    /// Apply an internal completion trigger.
    fn advance(&mut self, trigger: Trigger) -> HostResult<()> {
        match table::step(self.state, trigger) {
            Some(step) => self.apply(step),
            None => {
                error!(device = %self.name, state = %self.state, ?trigger, "Completion does not fit current state");
                Err(HostError::WrongState {
                    device: self.name.to_string(),
                    state: self.state,
                    command: trigger.command(),
                })
            }
        }
    }

    fn apply(&mut self, step: Step) -> HostResult<()> {
        match step.action {
            Action::None => {
                self.enter(step.next);
                Ok(())
            }
            Action::MarkTeardown => {
                info!(device = %self.name, "Teardown requested during release");
                Ok(())
            }
            Action::RunResume | Action::RunSuspend => {
                let phase = if step.action == Action::RunResume {
                    Phase::Resume
                } else {
                    Phase::Suspend
                };
                if let HookOutcome::Failed(code) = self.run_hook(phase) {
                    self.last_error = code;
                    self.announce();
                    return Err(self.fault(code));
                }
                self.enter(step.next);
                Ok(())
            }
            Action::RunInitialize | Action::RunClaim | Action::RunPrepare | Action::RunRelease => {
                let phase = match step.action {
                    Action::RunInitialize => Phase::Initialize,
                    Action::RunClaim => Phase::Claim,
                    Action::RunPrepare => Phase::Prepare,
                    _ => Phase::Release,
                };
                self.enter(step.next);
                self.pending = None;
                match self.run_hook(phase) {
                    HookOutcome::Pending => {
                        debug!(device = %self.name, %phase, "Phase pending");
                        self.pending = Some(phase);
                        Ok(())
                    }
                    HookOutcome::Done => self.settle(phase, HookOutcome::Done),
                    HookOutcome::Failed(code) => {
                        self.settle(phase, HookOutcome::Failed(code))?;
                        Err(self.fault(code))
                    }
                }
            }
        }
    }

    fn settle(&mut self, phase: Phase, outcome: HookOutcome) -> HostResult<()> {
        let failed = match outcome {
            HookOutcome::Pending => return Ok(()),
            HookOutcome::Done => None,
            HookOutcome::Failed(code) => {
                warn!(device = %self.name, %phase, error = %code, "Phase failed");
                self.last_error = code;
                Some(code)
            }
        };

        match (phase, failed) {
            (Phase::Initialize, None) => self.advance(Trigger::InitializeDone),
            (Phase::Initialize, Some(_)) => self.advance(Trigger::InitializeFailed),
            (Phase::Claim, None) => {
                self.advance(Trigger::ClaimDone)?;
                match self.chained_prepare.take() {
                    Some(params) => self.prepare(params),
                    None => Ok(()),
                }
            }
            (Phase::Claim, Some(_)) => {
                self.chained_prepare = None;
                self.advance(Trigger::ClaimFailed)
            }
            (Phase::Prepare, None) => self.advance(Trigger::PrepareDone),
            (Phase::Prepare, Some(_)) => self.advance(Trigger::PrepareFailed),
            // Releasing cannot be refused; a failed release still ends it.
            (Phase::Release, _) => self.advance(Trigger::ReleaseDone {
                teardown: self.teardown,
            }),
            (Phase::Resume | Phase::Suspend, _) => Ok(()),
        }
    }

    fn run_hook(&mut self, phase: Phase) -> HookOutcome {
        let mut ctx = HookContext::new(&self.name, &mut self.children, &mut self.outbox);
        let outcome = match phase {
            Phase::Initialize => self.behavior.on_initialize(&mut ctx),
            Phase::Claim => self.behavior.on_claim(&mut ctx),
            Phase::Prepare => self.behavior.on_prepare(&mut ctx, &self.prepare_params),
            Phase::Resume => self.behavior.on_resume(&mut ctx),
            Phase::Suspend => self.behavior.on_suspend(&mut ctx),
            Phase::Release => self.behavior.on_release(&mut ctx),
        };
        match outcome {
            HookOutcome::Pending if !phase.is_deferrable() => HookOutcome::Done,
            other => other,
        }
    }

    fn enter(&mut self, next: DeviceState) {
        if next == self.state {
            return;
        }
        info!(
            device = %self.name,
            from = %self.state,
            to = %next,
            error = %self.last_error,
            "State transition"
        );
        self.state = next;
        if next.is_terminal() {
            self.pending = None;
        }
        self.announce();
    }

    /// Publish the current state to the status sink, parent and listeners.
    fn announce(&mut self) {
        self.outbox.push(Effect::Status {
            state: self.state,
            error: self.last_error,
        });
        let event = self.state_report(self.last_error);
        for link in self.parent.iter().chain(self.listeners.iter()) {
            self.outbox.push(Effect::Send {
                link: *link,
                event: event.clone(),
            });
        }
    }

    fn report_to(&mut self, link: LinkId) {
        let event = self.state_report(self.last_error);
        self.outbox.push(Effect::Send { link, event });
    }

    fn state_report(&self, error: ErrorCode) -> DeviceEvent {
        DeviceEvent::StateReport {
            device: self.name.clone(),
            device_type: self.device_type.clone(),
            state: self.state,
            error,
        }
    }

    fn fault(&self, code: ErrorCode) -> HostError {
        HostError::DeviceFault {
            device: self.name.to_string(),
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::SimulatedDevice;

    fn engine(device: SimulatedDevice) -> LifecycleEngine {
        let mut engine = LifecycleEngine::new(DeviceName::new("rx0").unwrap(), "receiver", Box::new(device));
        engine.initialize().unwrap();
        engine.take_effects();
        engine
    }

    fn states(effects: &[Effect]) -> Vec<DeviceState> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Status { state, .. } => Some(*state),
                Effect::Send { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_full_cycle_synchronous() {
        let mut e = engine(SimulatedDevice::new());
        e.claim().unwrap();
        e.prepare(Params::new().with("freq_mhz", 150)).unwrap();
        e.resume().unwrap();
        e.suspend().unwrap();
        e.release().unwrap();

        use DeviceState::*;
        assert_eq!(
            states(&e.take_effects()),
            vec![Claiming, Claimed, Preparing, Suspended, Active, Suspended, Releasing, Idle]
        );
        assert_eq!(e.state(), Idle);
    }

    #[test]
    fn test_wrong_state_leaves_device_untouched() {
        let mut e = engine(SimulatedDevice::new());
        let err = e.resume().unwrap_err();
        assert!(matches!(err, HostError::WrongState { command: "resume", .. }));
        assert_eq!(e.state(), DeviceState::Idle);
        assert!(e.take_effects().is_empty());
    }

    #[test]
    fn test_deferred_claim_completes_later() {
        let mut e = engine(SimulatedDevice::new().defer(Phase::Claim));
        e.claim().unwrap();
        assert_eq!(e.state(), DeviceState::Claiming);
        assert_eq!(e.pending_phase(), Some(Phase::Claim));

        assert!(!e.complete(Phase::Prepare, HookOutcome::Done));
        assert!(e.complete(Phase::Claim, HookOutcome::Done));
        assert_eq!(e.state(), DeviceState::Claimed);
        assert!(!e.complete(Phase::Claim, HookOutcome::Done));
    }

    #[test]
    fn test_prepare_failure_rolls_back_to_claimed() {
        let mut e = engine(SimulatedDevice::new().fail(Phase::Prepare, ErrorCode::new(140)));
        e.claim().unwrap();
        let err = e.prepare(Params::new()).unwrap_err();
        assert!(matches!(err, HostError::DeviceFault { .. }));
        assert_eq!(e.state(), DeviceState::Claimed);
        assert_eq!(e.last_error(), ErrorCode::new(140));
    }

    #[test]
    fn test_claim_failure_releases_automatically() {
        let mut e = engine(SimulatedDevice::new().fail(Phase::Claim, ErrorCode::DEVICE_FAULT));
        assert!(e.claim().is_err());
        assert_eq!(e.state(), DeviceState::Idle);
        assert_eq!(e.last_error(), ErrorCode::DEVICE_FAULT);
        assert_eq!(
            states(&e.take_effects()),
            vec![DeviceState::Claiming, DeviceState::Releasing, DeviceState::Idle]
        );
    }

    #[test]
    fn test_claim_and_prepare_chains() {
        let mut e = engine(SimulatedDevice::new().defer(Phase::Claim));
        e.claim_and_prepare(Params::new().with("slot", 3)).unwrap();
        assert_eq!(e.state(), DeviceState::Claiming);
        e.complete(Phase::Claim, HookOutcome::Done);
        assert_eq!(e.state(), DeviceState::Suspended);
    }

    #[test]
    fn test_shutdown_from_active_ends_going_down() {
        let mut e = engine(SimulatedDevice::new());
        e.claim_and_prepare(Params::new()).unwrap();
        e.resume().unwrap();
        e.shutdown().unwrap();
        assert_eq!(e.state(), DeviceState::GoingDown);
        assert!(e.is_terminal());
    }

    #[test]
    fn test_shutdown_during_deferred_release() {
        let mut e = engine(SimulatedDevice::new().defer(Phase::Release));
        e.claim().unwrap();
        e.release().unwrap();
        e.shutdown().unwrap();
        assert_eq!(e.state(), DeviceState::Releasing);
        e.complete(Phase::Release, HookOutcome::Done);
        assert_eq!(e.state(), DeviceState::GoingDown);
    }

    #[test]
    fn test_release_while_claim_pending_ignores_late_claim() {
        let mut e = engine(SimulatedDevice::new().defer(Phase::Claim));
        e.claim().unwrap();
        e.release().unwrap();
        assert_eq!(e.state(), DeviceState::Idle);
        assert!(!e.complete(Phase::Claim, HookOutcome::Done));
        assert_eq!(e.state(), DeviceState::Idle);
    }

    #[test]
    fn test_command_from_link_answers_rejection() {
        let mut e = engine(SimulatedDevice::new());
        let controller = LinkId::issue();
        e.add_listener(controller);
        assert!(e.handle_event(controller, DeviceEvent::Resume).is_err());

        let effects = e.take_effects();
        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::Send {
                link,
                event: DeviceEvent::StateReport { state, error, .. },
            } => {
                assert_eq!(*link, controller);
                assert_eq!(*state, DeviceState::Idle);
                assert_eq!(*error, ErrorCode::WRONG_STATE);
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[test]
    fn test_transitions_reported_to_parent_and_listeners() {
        let mut e = engine(SimulatedDevice::new());
        let parent = LinkId::issue();
        let listener = LinkId::issue();
        e.attach_parent(parent);
        e.add_listener(listener);
        e.claim().unwrap();

        let sent: Vec<LinkId> = e
            .take_effects()
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::Send { link, .. } => Some(link),
                Effect::Status { .. } => None,
            })
            .collect();
        assert_eq!(sent, vec![parent, listener, parent, listener]);
    }

    #[test]
    fn test_query_state_rereports() {
        let mut e = engine(SimulatedDevice::new());
        let parent = LinkId::issue();
        e.attach_parent(parent);
        e.handle_event(parent, DeviceEvent::QueryState).unwrap();
        assert!(matches!(
            e.take_effects().as_slice(),
            [Effect::Send { event: DeviceEvent::StateReport { state: DeviceState::Idle, .. }, .. }]
        ));
    }

    #[test]
    fn test_failed_initialize_disables() {
        let mut e = LifecycleEngine::new(
            DeviceName::new("rx9").unwrap(),
            "receiver",
            Box::new(SimulatedDevice::new().fail(Phase::Initialize, ErrorCode::CONFIGURATION)),
        );
        assert!(e.initialize().is_err());
        assert_eq!(e.state(), DeviceState::Disabled);
    }
}

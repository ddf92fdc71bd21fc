//! The host: every device, link, timer and arbiter belonging to one process.
//!
//! `Host` is synchronous. All mutation goes through `&mut self` calls made
//! by one cooperative loop (see [`crate::actors::HostActor`]); device
//! engines emit effects that the host routes until the system is quiet
//! again ([`Host::pump`]).

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_events::{DeviceEvent, DeviceState, Params, ScheduleWindow};
use fleet_id::{DeviceName, HostId, LinkId};
use tracing::{debug, error, info, warn};

use crate::arbiter::ResourceArbiter;
use crate::clock::Clock;
use crate::config::{ConfigSource, HostConfig};
use crate::error::{HostError, HostResult};
use crate::lifecycle::{Effect, HookOutcome, LifecycleEngine, Phase};
use crate::registry::{quorum_from_config, DeviceFactory, DeviceRegistry};
use crate::schedule::{
    CapacityAllocator, OutcomeRecord, ScheduleAction, ScheduleEntry, ScheduleManager,
    ScheduleUpdate, Submitted,
};
use crate::status::StatusSink;
use crate::transport::{Delivery, LinkEvent, LinkRole, LinkTable, ReconnectResult, Transport};

/// Upper bound on routing rounds in one pump. Hitting it means two devices
/// keep answering each other.
const MAX_PUMP_ROUNDS: usize = 10_000;

/// One process's share of the fleet.
pub struct Host {
    id: HostId,
    config: HostConfig,
    clock: Arc<dyn Clock>,
    status: Arc<dyn StatusSink>,
    registry: DeviceRegistry,
    links: LinkTable,
    arbiter: ResourceArbiter,
    schedule: ScheduleManager,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("host_name", &self.config.host_name)
            .field("registry", &self.registry)
            .field("links", &self.links)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn new(
        config: HostConfig,
        clock: Arc<dyn Clock>,
        status: Arc<dyn StatusSink>,
        params: Arc<dyn ConfigSource>,
    ) -> HostResult<Self> {
        let quorum = quorum_from_config(params.as_ref(), config.quorum)?;
        let registry = DeviceRegistry::with_builtin(params, quorum);
        let links = LinkTable::new(
            config.event_buffer_cap,
            config.reconnect.clone(),
            config.reconnect_warn_after,
        );
        let schedule = ScheduleManager::new(config.min_lead);
        let id = HostId::issue();
        info!(host_id = %id, host_name = %config.host_name, "Host created");
        Ok(Self {
            id,
            config,
            clock,
            status,
            registry,
            links,
            arbiter: ResourceArbiter::new(),
            schedule,
        })
    }

    pub fn with_allocator(mut self, allocator: Box<dyn CapacityAllocator>) -> Self {
        self.schedule.set_allocator(allocator);
        self
    }

    pub fn register_factory(&mut self, factory: Box<dyn DeviceFactory>) {
        self.registry.register(factory);
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn schedules(&self) -> &ScheduleManager {
        &self.schedule
    }

    pub fn device(&self, name: &DeviceName) -> HostResult<&LifecycleEngine> {
        self.registry.require(name)
    }

    // =========================================================================
    // Create / destroy / query
    // =========================================================================

    pub fn create_device(&mut self, device_type: &str, name: DeviceName, params: Params) -> HostResult<()> {
        let result = self.registry.create_device(device_type, name, params);
        self.pump();
        result
    }

    /// Shut the device down and drop its schedule. It leaves the registry
    /// once terminal.
    pub fn destroy_device(&mut self, name: &DeviceName) -> HostResult<()> {
        let result = self.registry.destroy_device(name);
        if result.is_ok() || self.registry.contains(name) {
            let now = self.now();
            let actions = self.schedule.cancel(name, now);
            self.run_actions(actions);
        }
        self.pump();
        result
    }

    pub fn get_state(&self, name: &DeviceName) -> HostResult<DeviceState> {
        self.registry.get_state(name)
    }

    /// Status string as published: state plus error, if any.
    pub fn get_status(&self, name: &DeviceName) -> HostResult<String> {
        self.registry.require(name).map(LifecycleEngine::status)
    }

    /// Idle devices with no schedule and no pin.
    pub fn teardown_candidates(&self) -> Vec<DeviceName> {
        let doomed = self.registry.pending_destruction();
        self.registry
            .iter()
            .filter(|e| e.state() == DeviceState::Idle)
            .filter(|e| !self.schedule.has_schedule(e.name()) && !self.schedule.is_pinned(e.name()))
            .filter(|e| !doomed.contains(&e.name()))
            .map(|e| e.name().clone())
            .collect()
    }

    pub fn pin(&mut self, name: DeviceName) {
        self.schedule.pin(name);
    }

    pub fn unpin(&mut self, name: &DeviceName) {
        self.schedule.unpin(name);
    }

    // =========================================================================
    // Device commands
    // =========================================================================

    /// Record `window` on the device and arm prepare/start/stop for it.
    pub fn schedule(&mut self, name: &DeviceName, window: ScheduleWindow, params: Params) -> HostResult<Submitted> {
        let entry = ScheduleEntry::from_window(name.clone(), params, window, self.config.prepare_lead);
        self.submit_schedule(entry)
    }

    /// Submit a fully specified entry. A device without a schedule must be
    /// `Idle` to take one.
    pub fn submit_schedule(&mut self, entry: ScheduleEntry) -> HostResult<Submitted> {
        entry.validate()?;
        let device = entry.device.clone();
        let engine = self.registry.require_mut(&device)?;
        if !self.schedule.has_schedule(&device) {
            engine.schedule(entry.window())?;
        }
        let now = self.now();
        let submitted = self.schedule.submit(entry, now);
        self.sync_window(&device);
        self.pump();
        submitted
    }

    pub fn update_schedule(&mut self, name: &DeviceName, update: &ScheduleUpdate) -> HostResult<()> {
        let now = self.now();
        self.schedule.update_schedule(name, update, now)?;
        self.sync_window(name);
        Ok(())
    }

    /// Point the device's recorded window at its current entry.
    fn sync_window(&mut self, name: &DeviceName) {
        let window = self.schedule.current_entry(name).map(ScheduleEntry::window);
        if let Some(engine) = self.registry.get_mut(name) {
            engine.set_window(window);
        }
    }

    /// Drop every schedule entry of the device. A claimed device is released.
    pub fn cancel_schedule(&mut self, name: &DeviceName) -> HostResult<()> {
        let engine = self.registry.require_mut(name)?;
        if engine.state() == DeviceState::Idle {
            engine.cancel_schedule()?;
        } else if !self.schedule.has_schedule(name) {
            return engine.cancel_schedule();
        }
        let now = self.now();
        let actions = self.schedule.cancel(name, now);
        self.sync_window(name);
        self.run_actions(actions);
        self.pump();
        Ok(())
    }

    pub fn claim(&mut self, name: &DeviceName) -> HostResult<()> {
        self.command(name, LifecycleEngine::claim)
    }

    pub fn claim_and_prepare(&mut self, name: &DeviceName, params: Params) -> HostResult<()> {
        self.command(name, |e| e.claim_and_prepare(params))
    }

    pub fn prepare(&mut self, name: &DeviceName, params: Params) -> HostResult<()> {
        self.command(name, |e| e.prepare(params))
    }

    pub fn resume(&mut self, name: &DeviceName) -> HostResult<()> {
        self.command(name, LifecycleEngine::resume)
    }

    pub fn suspend(&mut self, name: &DeviceName) -> HostResult<()> {
        self.command(name, LifecycleEngine::suspend)
    }

    pub fn release(&mut self, name: &DeviceName) -> HostResult<()> {
        self.command(name, LifecycleEngine::release)
    }

    pub fn shutdown(&mut self, name: &DeviceName) -> HostResult<()> {
        self.command(name, LifecycleEngine::shutdown)
    }

    pub fn disable(&mut self, name: &DeviceName) -> HostResult<()> {
        self.command(name, LifecycleEngine::disable)
    }

    /// Finish a deferred hook. Returns false for stale completions.
    pub fn complete(&mut self, name: &DeviceName, phase: Phase, outcome: HookOutcome) -> HostResult<bool> {
        let completed = self.registry.require_mut(name)?.complete(phase, outcome);
        self.pump();
        Ok(completed)
    }

    fn command(
        &mut self,
        name: &DeviceName,
        f: impl FnOnce(&mut LifecycleEngine) -> HostResult<()>,
    ) -> HostResult<()> {
        let result = f(self.registry.require_mut(name)?);
        self.pump();
        result
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Join the claimant list of `resource`. Returns true if now master.
    pub fn request_resource(&mut self, claimant: &DeviceName, resource: &str) -> bool {
        self.arbiter.request(claimant, resource)
    }

    /// Leave the claimant list. Returns the promoted master, if any.
    pub fn release_resource(&mut self, claimant: &DeviceName, resource: &str) -> Option<DeviceName> {
        self.arbiter.release(claimant, resource)
    }

    pub fn is_master(&self, claimant: &DeviceName, resource: &str) -> bool {
        self.arbiter.is_master(claimant, resource)
    }

    pub fn arbiter(&self) -> &ResourceArbiter {
        &self.arbiter
    }

    // =========================================================================
    // Links
    // =========================================================================

    /// Make `child` a child of `parent`, both in this host.
    pub fn connect_child(&mut self, parent: &DeviceName, child: &DeviceName) -> HostResult<(LinkId, LinkId)> {
        let child_type = self.registry.require(child)?.device_type().to_string();
        self.registry.require(parent)?;

        let (parent_end, child_end) = self.links.connect_local(parent, child);
        let parent_engine = self.registry.require_mut(parent)?;
        if !parent_engine.add_child(parent_end, child.clone(), child_type) {
            self.links.close(parent_end);
            return Err(HostError::AlreadyExists(format!("{parent} -> {child}")));
        }
        let child_engine = self.registry.require_mut(child)?;
        child_engine.attach_parent(child_end);
        // Seed the parent's cache with the child's current state.
        child_engine.on_link_up(child_end);
        self.pump();
        Ok((parent_end, child_end))
    }

    /// Add a child that lives behind a transport.
    pub fn attach_remote_child(
        &mut self,
        parent: &DeviceName,
        child: DeviceName,
        child_type: &str,
        transport: Box<dyn Transport>,
    ) -> HostResult<LinkId> {
        self.registry.require(parent)?;
        let now = self.now();
        let link = self
            .links
            .attach_remote(parent, &child, LinkRole::ToChild, transport, now);
        let engine = self.registry.require_mut(parent)?;
        if !engine.add_child(link, child, child_type) {
            self.links.close(link);
            return Err(HostError::AlreadyExists(link.to_string()));
        }
        if self.links.get(link).is_some_and(|l| !l.is_connected()) {
            engine.on_link_down(link);
        }
        self.pump();
        Ok(link)
    }

    /// Give `device` a parent that lives behind a transport.
    pub fn attach_remote_parent(
        &mut self,
        device: &DeviceName,
        parent: &DeviceName,
        transport: Box<dyn Transport>,
    ) -> HostResult<LinkId> {
        self.attach_observer(device, parent, LinkRole::ToParent, transport)
    }

    /// Register a listener (controller or monitor) for `device`'s state.
    pub fn register_listener(
        &mut self,
        device: &DeviceName,
        listener: &DeviceName,
        transport: Box<dyn Transport>,
    ) -> HostResult<LinkId> {
        self.attach_observer(device, listener, LinkRole::ToListener, transport)
    }

    fn attach_observer(
        &mut self,
        device: &DeviceName,
        peer: &DeviceName,
        role: LinkRole,
        transport: Box<dyn Transport>,
    ) -> HostResult<LinkId> {
        self.registry.require(device)?;
        let now = self.now();
        let link = self.links.attach_remote(device, peer, role, transport, now);
        let engine = self.registry.require_mut(device)?;
        match role {
            LinkRole::ToParent => engine.attach_parent(link),
            LinkRole::ToListener | LinkRole::ToChild => engine.add_listener(link),
        }
        engine.on_link_up(link);
        self.pump();
        Ok(link)
    }

    /// Close a link; both owners forget it.
    pub fn disconnect(&mut self, link: LinkId) -> HostResult<()> {
        let removed = self.links.close(link);
        if removed.is_empty() {
            return Err(HostError::UnknownLink(link));
        }
        for (end, owner) in removed {
            if let Some(engine) = self.registry.get_mut(&owner) {
                engine.detach(end);
            }
        }
        self.pump();
        Ok(())
    }

    /// Input from a transport.
    pub fn deliver(&mut self, link: LinkId, event: LinkEvent) -> HostResult<()> {
        let now = self.now();
        match event {
            LinkEvent::Connected => {
                if self.links.mark_connected(link, now)? {
                    self.link_up(link);
                }
            }
            LinkEvent::Disconnected => {
                self.links.mark_disconnected(link, now)?;
            }
            LinkEvent::Event(envelope) => {
                let owner = self
                    .links
                    .owner(link)
                    .cloned()
                    .ok_or(HostError::UnknownLink(link))?;
                self.dispatch(Delivery { link, owner, envelope });
            }
        }
        self.pump();
        Ok(())
    }

    fn link_up(&mut self, link: LinkId) {
        let Some(owner) = self.links.owner(link).cloned() else {
            return;
        };
        if let Some(engine) = self.registry.get_mut(&owner) {
            engine.on_link_up(link);
        }
    }

    fn dispatch(&mut self, delivery: Delivery) {
        let Delivery { link, owner, envelope } = delivery;
        match self.links.accept_inbound(link, &envelope) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                debug!(link_id = %link, error = %err, "Dropping event for closed link");
                return;
            }
        }
        let Some(engine) = self.registry.get_mut(&owner) else {
            debug!(device = %owner, link_id = %link, "Dropping event for removed device");
            return;
        };
        if let Err(err) = engine.handle_event(link, envelope.event) {
            debug!(device = %owner, from = %envelope.source, error = %err, "Linked command rejected");
        }
    }

    // =========================================================================
    // Time
    // =========================================================================

    /// Earliest schedule or reconnect deadline.
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        match (self.schedule.next_deadline(), self.links.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire everything due at the clock's current time, then collect
    /// terminal devices.
    pub fn advance(&mut self) {
        let now = self.now();
        for result in self.links.run_reconnects(now) {
            if let ReconnectResult::Connected { link, .. } = result {
                self.link_up(link);
            }
        }
        let actions = self.schedule.fire_due(now);
        self.run_actions(actions);
        self.pump();
        self.collect_garbage();
    }

    /// Remove terminal devices and everything that refers to them.
    pub fn collect_garbage(&mut self) -> Vec<DeviceName> {
        let mut removed = Vec::new();
        for engine in self.registry.collect_garbage() {
            let name = engine.name().clone();
            for (end, owner) in self.links.close_owned_by(&name) {
                if owner != name {
                    if let Some(peer) = self.registry.get_mut(&owner) {
                        peer.detach(end);
                    }
                }
            }
            for (resource, master) in self.arbiter.release_all(&name) {
                info!(resource = %resource, master = %master, "Mastership passed on removal");
            }
            self.schedule.remove_device(&name);
            removed.push(name);
        }
        if !removed.is_empty() {
            self.pump();
        }
        removed
    }

    pub fn schedule_outcomes(&self) -> &[OutcomeRecord] {
        self.schedule.outcomes()
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Route effects, local deliveries and schedule follow-ups until
    /// nothing is left.
    pub fn pump(&mut self) {
        let now = self.now();
        let mut actions = VecDeque::new();
        for round in 0.. {
            if round == MAX_PUMP_ROUNDS {
                error!(host_id = %self.id, "Event routing did not settle");
                break;
            }
            let mut progressed = false;

            let drained: Vec<(DeviceName, Vec<Effect>)> = self
                .registry
                .iter_mut()
                .filter_map(|engine| {
                    let effects = engine.take_effects();
                    (!effects.is_empty()).then(|| (engine.name().clone(), effects))
                })
                .collect();
            for (device, effects) in drained {
                progressed = true;
                for effect in effects {
                    self.route(&device, effect, now, &mut actions);
                }
            }

            for (link, owner) in self.links.take_downed() {
                progressed = true;
                if let Some(engine) = self.registry.get_mut(&owner) {
                    engine.on_link_down(link);
                }
            }

            if let Some(delivery) = self.links.pop_pending() {
                progressed = true;
                self.dispatch(delivery);
            }

            if let Some(action) = actions.pop_front() {
                progressed = true;
                let follow_ups = self.execute(action, now);
                actions.extend(follow_ups);
            }

            if !progressed {
                break;
            }
        }
    }

    fn route(&mut self, device: &DeviceName, effect: Effect, now: DateTime<Utc>, actions: &mut VecDeque<ScheduleAction>) {
        match effect {
            Effect::Status { state, error } => {
                self.status.publish_status(device.as_str(), state.as_str());
                actions.extend(self.schedule.observe(device, state, error, now));
            }
            Effect::Send { link, event } => {
                if let Err(err) = self.links.send(link, event, now) {
                    debug!(device = %device, error = %err, "Dropping event for closed link");
                }
            }
        }
    }

    fn run_actions(&mut self, actions: Vec<ScheduleAction>) {
        let now = self.now();
        let mut queue: VecDeque<ScheduleAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            let follow_ups = self.execute(action, now);
            queue.extend(follow_ups);
        }
    }

    /// Apply one schedule action to its device.
    fn execute(&mut self, action: ScheduleAction, now: DateTime<Utc>) -> Vec<ScheduleAction> {
        let device = action.device().clone();
        let kind = action.kind();
        let Some(engine) = self.registry.get_mut(&device) else {
            warn!(device = %device, action = kind, "Schedule action for unknown device");
            return self.schedule.fail(&device, None, fleet_events::ErrorCode::CONFIGURATION, now);
        };
        let state = engine.state();

        let result = match action {
            ScheduleAction::ClaimAndPrepare { params, generation, .. } => {
                return match engine.claim_and_prepare(params) {
                    Ok(()) => Vec::new(),
                    Err(err) => {
                        warn!(device = %device, error = %err, "Scheduled claim/prepare failed");
                        self.schedule.fail(&device, Some(generation), err.error_code(), now)
                    }
                };
            }
            ScheduleAction::Resume { .. }
                if matches!(state, DeviceState::Claiming | DeviceState::Preparing)
                    && self.schedule.hold_start(&device) =>
            {
                return Vec::new();
            }
            ScheduleAction::Resume { .. } if state == DeviceState::Active => {
                debug!(device = %device, "Already active");
                Ok(())
            }
            ScheduleAction::Resume { .. } => {
                return match engine.resume() {
                    Ok(()) => Vec::new(),
                    Err(err) => {
                        warn!(device = %device, %state, error = %err, "Scheduled start failed");
                        let generation = self.schedule.current_generation(&device);
                        self.schedule.fail(&device, generation, err.error_code(), now)
                    }
                };
            }
            ScheduleAction::Suspend { .. } if state == DeviceState::Active => engine.suspend(),
            ScheduleAction::Suspend { .. } => {
                debug!(device = %device, %state, "Nothing to suspend");
                Ok(())
            }
            ScheduleAction::Release { .. }
                if matches!(state, DeviceState::Idle | DeviceState::Releasing) || state.is_terminal() =>
            {
                debug!(device = %device, %state, "Nothing to release");
                Ok(())
            }
            ScheduleAction::Release { .. } => engine.release(),
        };
        if let Err(err) = result {
            warn!(device = %device, action = kind, error = %err, "Scheduled action failed");
        }
        Vec::new()
    }
}

/// Send a raw command to a device as if it came over `link`. Used by
/// transports that decode commands addressed to a device in this host.
pub fn command_event(host: &mut Host, link: LinkId, event: DeviceEvent) -> HostResult<()> {
    let owner = host
        .links
        .owner(link)
        .cloned()
        .ok_or(HostError::UnknownLink(link))?;
    let result = host.registry.require_mut(&owner)?.handle_event(link, event);
    host.pump();
    result
}

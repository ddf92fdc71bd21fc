//! Host actor - runs a [`Host`] on the cooperative loop.
//!
//! Every device command, transport callback and timer for this process goes
//! through the actor's mailbox, so the host itself never needs a lock.

use std::time::Duration;

use async_trait::async_trait;
use fleet_events::{DeviceState, Params, ScheduleWindow};
use fleet_id::{DeviceName, LinkId};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle};
use crate::error::{HostError, HostResult};
use crate::host::Host;
use crate::lifecycle::{HookOutcome, Phase};
use crate::schedule::{ScheduleEntry, ScheduleUpdate, Submitted};
use crate::transport::LinkEvent;

// =============================================================================
// Messages
// =============================================================================

/// Per-device commands.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    Schedule { window: ScheduleWindow, params: Params },
    CancelSchedule,
    Claim,
    Prepare(Params),
    Resume,
    Suspend,
    Release,
    Shutdown,
    Disable,
}

/// Messages handled by HostActor.
#[derive(Debug)]
pub enum HostMessage {
    CreateDevice {
        device_type: String,
        name: DeviceName,
        params: Params,
        reply_to: oneshot::Sender<HostResult<()>>,
    },

    DestroyDevice {
        name: DeviceName,
        reply_to: oneshot::Sender<HostResult<()>>,
    },

    Command {
        name: DeviceName,
        command: DeviceCommand,
        reply_to: oneshot::Sender<HostResult<()>>,
    },

    GetState {
        name: DeviceName,
        reply_to: oneshot::Sender<HostResult<DeviceState>>,
    },

    SubmitSchedule {
        entry: ScheduleEntry,
        reply_to: oneshot::Sender<HostResult<Submitted>>,
    },

    UpdateSchedule {
        name: DeviceName,
        update: ScheduleUpdate,
        reply_to: oneshot::Sender<HostResult<()>>,
    },

    /// A deferred hook finished.
    Complete {
        name: DeviceName,
        phase: Phase,
        outcome: HookOutcome,
    },

    /// Transport callback for one link.
    Link { link: LinkId, event: LinkEvent },

    /// Idle devices eligible for teardown.
    TeardownCandidates {
        reply_to: oneshot::Sender<Vec<DeviceName>>,
    },
}

// =============================================================================
// Actor
// =============================================================================

pub struct HostActor {
    host: Host,
}

impl HostActor {
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    fn run_command(&mut self, name: &DeviceName, command: DeviceCommand) -> HostResult<()> {
        match command {
            DeviceCommand::Schedule { window, params } => {
                self.host.schedule(name, window, params).map(|_| ())
            }
            DeviceCommand::CancelSchedule => self.host.cancel_schedule(name),
            DeviceCommand::Claim => self.host.claim(name),
            DeviceCommand::Prepare(params) => self.host.prepare(name, params),
            DeviceCommand::Resume => self.host.resume(name),
            DeviceCommand::Suspend => self.host.suspend(name),
            DeviceCommand::Release => self.host.release(name),
            DeviceCommand::Shutdown => self.host.shutdown(name),
            DeviceCommand::Disable => self.host.disable(name),
        }
    }
}

#[async_trait]
impl Actor for HostActor {
    type Message = HostMessage;

    fn name(&self) -> &str {
        "host"
    }

    async fn handle(&mut self, msg: HostMessage, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        match msg {
            HostMessage::CreateDevice {
                device_type,
                name,
                params,
                reply_to,
            } => {
                let _ = reply_to.send(self.host.create_device(&device_type, name, params));
            }
            HostMessage::DestroyDevice { name, reply_to } => {
                let _ = reply_to.send(self.host.destroy_device(&name));
            }
            HostMessage::Command {
                name,
                command,
                reply_to,
            } => {
                let result = self.run_command(&name, command);
                let _ = reply_to.send(result);
            }
            HostMessage::GetState { name, reply_to } => {
                let _ = reply_to.send(self.host.get_state(&name));
            }
            HostMessage::SubmitSchedule { entry, reply_to } => {
                let _ = reply_to.send(self.host.submit_schedule(entry));
            }
            HostMessage::UpdateSchedule {
                name,
                update,
                reply_to,
            } => {
                let _ = reply_to.send(self.host.update_schedule(&name, &update));
            }
            HostMessage::Complete {
                name,
                phase,
                outcome,
            } => match self.host.complete(&name, phase, outcome) {
                Ok(true) => {}
                Ok(false) => debug!(device = %name, %phase, "Completion was stale"),
                Err(e) => warn!(device = %name, %phase, error = %e, "Completion for unknown device"),
            },
            HostMessage::Link { link, event } => {
                if let Err(e) = self.host.deliver(link, event) {
                    debug!(link_id = %link, error = %e, "Link event dropped");
                }
            }
            HostMessage::TeardownCandidates { reply_to } => {
                let _ = reply_to.send(self.host.teardown_candidates());
            }
        }
        self.host.collect_garbage();
        Ok(true)
    }

    fn next_wakeup(&mut self) -> Option<Duration> {
        let deadline = self.host.next_deadline()?;
        let wait = (deadline - self.host.now()).to_std().unwrap_or(Duration::ZERO);
        Some(wait)
    }

    async fn on_wakeup(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        self.host.advance();
        Ok(())
    }

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        info!(
            host_id = %self.host.id(),
            host_name = %self.host.config().host_name,
            devices = self.host.registry().len(),
            "Host loop started"
        );
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        let names = self.host.registry().names();
        for name in &names {
            if let Err(e) = self.host.destroy_device(name) {
                debug!(device = %name, error = %e, "Shutdown on stop skipped");
            }
        }
        let removed = self.host.collect_garbage();
        info!(
            devices = names.len(),
            removed = removed.len(),
            "Host loop stopped"
        );
    }
}

// =============================================================================
// Client
// =============================================================================

/// Async front end for a running [`HostActor`].
#[derive(Clone)]
pub struct HostClient {
    handle: ActorHandle<HostMessage>,
}

impl HostClient {
    pub fn new(handle: ActorHandle<HostMessage>) -> Self {
        Self { handle }
    }

    pub async fn create_device(
        &self,
        device_type: impl Into<String>,
        name: DeviceName,
        params: Params,
    ) -> HostResult<()> {
        self.request(|reply_to| HostMessage::CreateDevice {
            device_type: device_type.into(),
            name,
            params,
            reply_to,
        })
        .await?
    }

    pub async fn destroy_device(&self, name: DeviceName) -> HostResult<()> {
        self.request(|reply_to| HostMessage::DestroyDevice { name, reply_to })
            .await?
    }

    pub async fn command(&self, name: DeviceName, command: DeviceCommand) -> HostResult<()> {
        self.request(|reply_to| HostMessage::Command {
            name,
            command,
            reply_to,
        })
        .await?
    }

    pub async fn get_state(&self, name: DeviceName) -> HostResult<DeviceState> {
        self.request(|reply_to| HostMessage::GetState { name, reply_to })
            .await?
    }

    pub async fn submit_schedule(&self, entry: ScheduleEntry) -> HostResult<Submitted> {
        self.request(|reply_to| HostMessage::SubmitSchedule { entry, reply_to })
            .await?
    }

    pub async fn update_schedule(&self, name: DeviceName, update: ScheduleUpdate) -> HostResult<()> {
        self.request(|reply_to| HostMessage::UpdateSchedule {
            name,
            update,
            reply_to,
        })
        .await?
    }

    pub async fn complete(&self, name: DeviceName, phase: Phase, outcome: HookOutcome) -> HostResult<()> {
        self.send(HostMessage::Complete {
            name,
            phase,
            outcome,
        })
        .await
    }

    pub async fn link_event(&self, link: LinkId, event: LinkEvent) -> HostResult<()> {
        self.send(HostMessage::Link { link, event }).await
    }

    pub async fn teardown_candidates(&self) -> HostResult<Vec<DeviceName>> {
        self.request(|reply_to| HostMessage::TeardownCandidates { reply_to })
            .await
    }

    async fn send(&self, msg: HostMessage) -> HostResult<()> {
        self.handle
            .send(msg)
            .await
            .map_err(|e| HostError::Transport(e.to_string()))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> HostMessage) -> HostResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await
            .map_err(|_| HostError::Transport("host loop stopped".into()))
    }
}

//! Controller actor - ticks a [`ReconciliationController`] on the loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_events::DeviceState;
use fleet_reconcile::{
    ControllerLauncher, ControllerRecord, ReconcileError, ReconciliationController, RecordFilter,
    RecordKey,
};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::framework::{Actor, ActorContext, ActorError};
use crate::clock::Clock;

/// Messages handled by ControllerActor.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Drive `key` at `endpoint` toward `state`.
    RequestState {
        key: RecordKey,
        endpoint: String,
        state: DeviceState,
    },

    /// A state report from the remote controller.
    Observe {
        key: RecordKey,
        state: DeviceState,
    },

    /// The remote controller ended for good.
    Finished {
        key: RecordKey,
        reply_to: oneshot::Sender<Result<ControllerRecord, ReconcileError>>,
    },

    Discard {
        key: RecordKey,
        reply_to: oneshot::Sender<Result<ControllerRecord, ReconcileError>>,
    },

    GetPendingRequests {
        filter: RecordFilter,
        reply_to: oneshot::Sender<Vec<ControllerRecord>>,
    },

    GetCompletedStates {
        since: chrono::DateTime<chrono::Utc>,
        reply_to: oneshot::Sender<Vec<ControllerRecord>>,
    },
}

pub struct ControllerActor {
    controller: ReconciliationController,
    launcher: Arc<dyn ControllerLauncher>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
}

impl ControllerActor {
    pub fn new(
        controller: ReconciliationController,
        launcher: Arc<dyn ControllerLauncher>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            controller,
            launcher,
            clock,
            tick_interval,
        }
    }
}

#[async_trait]
impl Actor for ControllerActor {
    type Message = ControllerMessage;

    fn name(&self) -> &str {
        "reconcile"
    }

    async fn handle(&mut self, msg: ControllerMessage, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        let now = self.clock.now();
        match msg {
            ControllerMessage::RequestState {
                key,
                endpoint,
                state,
            } => self.controller.request_state(key, endpoint, state, now),
            ControllerMessage::Observe { key, state } => {
                if let Err(e) = self.controller.observe(&key, state, now) {
                    debug!(controller = %key, error = %e, "Report for untracked controller");
                }
            }
            ControllerMessage::Finished { key, reply_to } => {
                let _ = reply_to.send(self.controller.finished(&key));
            }
            ControllerMessage::Discard { key, reply_to } => {
                let _ = reply_to.send(self.controller.discard(&key));
            }
            ControllerMessage::GetPendingRequests { filter, reply_to } => {
                let _ = reply_to.send(self.controller.get_pending_requests(&filter));
            }
            ControllerMessage::GetCompletedStates { since, reply_to } => {
                let _ = reply_to.send(self.controller.get_completed_states(since));
            }
        }
        Ok(true)
    }

    /// Wake at the controller's next deadline, but at least once per tick
    /// interval.
    fn next_wakeup(&mut self) -> Option<Duration> {
        let until_deadline = self
            .controller
            .next_deadline()
            .map(|at| (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO));
        Some(until_deadline.map_or(self.tick_interval, |d| d.min(self.tick_interval)))
    }

    async fn on_wakeup(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        let now = self.clock.now();
        let summary = self.controller.tick(now, self.launcher.as_ref()).await;
        if summary.attempted > 0 || summary.timed_out > 0 {
            info!(
                attempted = summary.attempted,
                failed = summary.failed,
                exhausted = summary.exhausted,
                timed_out = summary.timed_out,
                "Reconcile tick"
            );
        }
        Ok(())
    }
}

//! Launcher interface used by the controller to act on remote controllers.
//!
//! A mock implementation is provided for testing and development.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use fleet_events::DeviceState;
use thiserror::Error;
use tracing::{debug, info};

use crate::record::{ControllerRecord, RecordKey};

/// Why an attempt could not be dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The endpoint could not be reached.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The remote side refused the command.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Starts remote controllers and sends them state-change commands.
///
/// Implementations only dispatch; the resulting state arrives later
/// through [`ReconciliationController::observe`](crate::ReconciliationController::observe).
#[async_trait]
pub trait ControllerLauncher: Send + Sync {
    /// Start the controller process described by the record.
    async fn start(&self, record: &ControllerRecord) -> Result<(), LaunchError>;

    /// Ask a running controller to move to `state`.
    async fn request_state(
        &self,
        record: &ControllerRecord,
        state: DeviceState,
    ) -> Result<(), LaunchError>;
}

/// A call observed by [`MockLauncher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchCall {
    Start(RecordKey),
    RequestState(RecordKey, DeviceState),
}

/// Mock launcher for testing and development.
#[derive(Debug, Default)]
pub struct MockLauncher {
    calls: Mutex<Vec<LaunchCall>>,

    /// Number of upcoming calls that should fail.
    failures_remaining: AtomicU32,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A launcher whose next `n` calls fail with `Unreachable`.
    pub fn failing(n: u32) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures_remaining: AtomicU32::new(n),
        }
    }

    /// Calls made so far.
    pub fn calls(&self) -> Vec<LaunchCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: LaunchCall) -> Result<(), LaunchError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call.clone());

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            debug!(?call, "[MOCK] Launch failing");
            return Err(LaunchError::Unreachable("mock failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ControllerLauncher for MockLauncher {
    async fn start(&self, record: &ControllerRecord) -> Result<(), LaunchError> {
        info!(controller = %record.key, endpoint = %record.endpoint, "[MOCK] Starting controller");
        self.record(LaunchCall::Start(record.key.clone()))
    }

    async fn request_state(
        &self,
        record: &ControllerRecord,
        state: DeviceState,
    ) -> Result<(), LaunchError> {
        info!(controller = %record.key, %state, "[MOCK] Requesting controller state");
        self.record(LaunchCall::RequestState(record.key.clone(), state))
    }
}

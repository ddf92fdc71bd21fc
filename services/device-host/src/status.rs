//! Status sink: best-effort publication of device state names.

use std::sync::{Mutex, PoisonError};

use tracing::info;

/// Fire-and-forget status publication.
pub trait StatusSink: Send + Sync {
    fn publish_status(&self, device: &str, state: &str);
}

/// Publishes status as structured log records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn publish_status(&self, device: &str, state: &str) {
        info!(device, state, "status");
    }
}

/// Captures published status for assertions.
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// State names published for one device, in order.
    pub fn states_of(&self, device: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(d, _)| d == device)
            .map(|(_, s)| s)
            .collect()
    }
}

impl StatusSink for RecordingStatusSink {
    fn publish_status(&self, device: &str, state: &str) {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((device.to_string(), state.to_string()));
    }
}

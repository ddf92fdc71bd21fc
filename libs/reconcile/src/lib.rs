//! Desired-state reconciliation for remote device controllers.
//!
//! A caller tells the [`ReconciliationController`] that a named controller
//! process, on some host, should reach a state. On every tick the
//! controller compares requested and observed state for each record and,
//! when they differ and nothing is pending, acts to close the gap.
//!
//! - **Requested state**: what the caller asked for.
//! - **Observed state**: what the remote controller last reported.
//! - **Completion**: observed matches requested, or retries are exhausted.
//!
//! # Invariants
//!
//! - At most one attempt per record is in flight at any time
//! - A failed attempt is retried only after its backoff has elapsed
//! - A record whose retries are exhausted stays failed until the caller
//!   re-requests or discards it
//! - The controller never inspects device internals; it only sends
//!   start/state commands through a [`ControllerLauncher`]

mod backoff;
mod controller;
mod launcher;
mod record;

use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use backoff::BackoffPolicy;
pub use controller::{CompletionMode, ControllerConfig, ReconciliationController, TickSummary};
pub use launcher::{ControllerLauncher, LaunchCall, LaunchError, MockLauncher};
pub use record::{ControllerRecord, RecordFilter, RecordKey};

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// No record exists for the key.
    #[error("controller record not found: {0}")]
    NotFound(RecordKey),
}

/// Order-independent digest of a JSON value.
///
/// Object keys are fed to the hasher sorted, so two bundles holding the same
/// pairs produce the same fingerprint. Used to tell an identical resubmission
/// apart from a real change.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(value: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        feed(&mut hasher, value);
        let digest = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn feed(hasher: &mut Sha256, value: &serde_json::Value) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                feed(hasher, &Value::String(key.clone()));
                hasher.update(b":");
                feed(hasher, &map[key]);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                feed(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

/// Default interval between reconciliation ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default time to wait for a remote controller to report after a command.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

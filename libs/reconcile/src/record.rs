//! Controller records: requested vs observed state per remote controller.

use chrono::{DateTime, Utc};
use fleet_events::DeviceState;

/// Identity of a controller record: controller name plus partition key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub name: String,
    pub instance: String,
}

impl RecordKey {
    pub fn new(name: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: instance.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.name, self.instance)
    }
}

/// Tracking state for one remote controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerRecord {
    pub key: RecordKey,

    /// Where the controller runs (host address, queue name, ...).
    pub endpoint: String,

    pub requested_state: DeviceState,
    pub requested_at: DateTime<Utc>,

    /// `None` until the controller has reported at least once.
    pub observed_state: Option<DeviceState>,
    pub observed_at: Option<DateTime<Utc>>,

    /// Whether the most recent attempt failed.
    pub failed: bool,

    /// Earliest time the next attempt may run.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Failed attempts since the last request.
    pub retry_count: u32,

    /// Set while a dispatched command awaits the controller's report.
    pub in_flight_until: Option<DateTime<Utc>>,

    /// When the record converged or ran out of retries.
    pub completed_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
}

impl ControllerRecord {
    pub(crate) fn new(
        key: RecordKey,
        endpoint: String,
        requested_state: DeviceState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            endpoint,
            requested_state,
            requested_at: now,
            observed_state: None,
            observed_at: None,
            failed: false,
            next_retry_at: None,
            retry_count: 0,
            in_flight_until: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// Observed state matches the request.
    pub fn is_converged(&self) -> bool {
        self.observed_state == Some(self.requested_state)
    }

    /// Failed more often than the retry budget allows.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.failed && self.retry_count > max_retries
    }

    /// True once the record has a terminal outcome for the current request.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Filter for pending-request queries. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub name: Option<String>,
    pub instance: Option<String>,
    pub endpoint: Option<String>,
    /// Only records whose last attempt failed.
    pub failed_only: bool,
}

impl RecordFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ControllerRecord) -> bool {
        self.name.as_deref().map_or(true, |n| n == record.key.name)
            && self
                .instance
                .as_deref()
                .map_or(true, |i| i == record.key.instance)
            && self
                .endpoint
                .as_deref()
                .map_or(true, |e| e == record.endpoint)
            && (!self.failed_only || record.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ControllerRecord {
        ControllerRecord::new(
            RecordKey::new("beamctl", "site-a"),
            "host-a:7000".into(),
            DeviceState::Idle,
            Utc::now(),
        )
    }

    #[test]
    fn test_key_display() {
        assert_eq!(RecordKey::new("beamctl", "0").to_string(), "beamctl[0]");
    }

    #[test]
    fn test_converged() {
        let mut rec = record();
        assert!(!rec.is_converged());
        rec.observed_state = Some(DeviceState::Idle);
        assert!(rec.is_converged());
    }

    #[test]
    fn test_exhausted() {
        let mut rec = record();
        rec.failed = true;
        rec.retry_count = 3;
        assert!(!rec.is_exhausted(3));
        rec.retry_count = 4;
        assert!(rec.is_exhausted(3));
    }

    #[test]
    fn test_filter() {
        let mut rec = record();
        assert!(RecordFilter::default().matches(&rec));
        assert!(RecordFilter::by_name("beamctl").matches(&rec));
        assert!(!RecordFilter::by_name("other").matches(&rec));

        let failed_only = RecordFilter {
            failed_only: true,
            ..RecordFilter::default()
        };
        assert!(!failed_only.matches(&rec));
        rec.failed = true;
        assert!(failed_only.matches(&rec));
    }
}

//! Schedule entries.

use std::time::Duration;

use fleet_events::{Params, ScheduleWindow};
use fleet_id::DeviceName;
use fleet_reconcile::Fingerprint;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};

/// One of the three deadlines of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleField {
    Prepare,
    Start,
    Stop,
}

impl ScheduleField {
    pub const ALL: [ScheduleField; 3] = [
        ScheduleField::Prepare,
        ScheduleField::Start,
        ScheduleField::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleField::Prepare => "prepare",
            ScheduleField::Start => "start",
            ScheduleField::Stop => "stop",
        }
    }
}

impl std::fmt::Display for ScheduleField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finite shared capacity an activation needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapacityDemand {
    pub resource: String,
    pub amount: u64,
}

/// A planned activation of one device. Times are UNIX seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub device: DeviceName,
    pub params: Params,
    pub prepare_at: i64,
    pub start_at: i64,
    pub stop_at: i64,
    /// Higher wins when capacity is contended.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub demand: Option<CapacityDemand>,
}

impl ScheduleEntry {
    /// Build an entry, checking `prepare_at <= start_at <= stop_at`.
    pub fn new(
        device: DeviceName,
        params: Params,
        prepare_at: i64,
        start_at: i64,
        stop_at: i64,
    ) -> HostResult<Self> {
        let entry = Self {
            device,
            params,
            prepare_at,
            start_at,
            stop_at,
            priority: 0,
            demand: None,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// An entry for `window` whose prepare deadline is `lead` before start.
    pub fn from_window(device: DeviceName, params: Params, window: ScheduleWindow, lead: Duration) -> Self {
        let lead_secs = i64::try_from(lead.as_secs()).unwrap_or(i64::MAX);
        Self {
            device,
            params,
            prepare_at: window.start_at.saturating_sub(lead_secs),
            start_at: window.start_at,
            stop_at: window.stop_at,
            priority: 0,
            demand: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_demand(mut self, resource: impl Into<String>, amount: u64) -> Self {
        self.demand = Some(CapacityDemand {
            resource: resource.into(),
            amount,
        });
        self
    }

    pub fn validate(&self) -> HostResult<()> {
        if self.prepare_at > self.start_at {
            return Err(HostError::InvalidParameter {
                key: "prepare_at".into(),
                detail: format!("{} is after start {}", self.prepare_at, self.start_at),
            });
        }
        if self.start_at > self.stop_at {
            return Err(HostError::InvalidParameter {
                key: "start_at".into(),
                detail: format!("{} is after stop {}", self.start_at, self.stop_at),
            });
        }
        Ok(())
    }

    pub fn deadline(&self, field: ScheduleField) -> i64 {
        match field {
            ScheduleField::Prepare => self.prepare_at,
            ScheduleField::Start => self.start_at,
            ScheduleField::Stop => self.stop_at,
        }
    }

    pub fn window(&self) -> ScheduleWindow {
        ScheduleWindow {
            start_at: self.start_at,
            stop_at: self.stop_at,
        }
    }

    /// Content hash; identical resubmissions hash identically.
    pub fn fingerprint(&self) -> Fingerprint {
        let demand = self.demand.as_ref().map(|d| {
            serde_json::json!({ "resource": d.resource, "amount": d.amount })
        });
        Fingerprint::of(&serde_json::json!({
            "device": self.device.as_str(),
            "params": self.params.to_json(),
            "prepare_at": self.prepare_at,
            "start_at": self.start_at,
            "stop_at": self.stop_at,
            "priority": self.priority,
            "demand": demand,
        }))
    }
}

/// Partial update of an existing entry; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleUpdate {
    pub prepare_at: Option<i64>,
    pub start_at: Option<i64>,
    pub stop_at: Option<i64>,
    pub params: Option<Params>,
}

impl ScheduleUpdate {
    pub fn start_at(start_at: i64) -> Self {
        Self {
            start_at: Some(start_at),
            ..Self::default()
        }
    }

    pub fn stop_at(stop_at: i64) -> Self {
        Self {
            stop_at: Some(stop_at),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prepare_at.is_none()
            && self.start_at.is_none()
            && self.stop_at.is_none()
            && self.params.is_none()
    }

    /// `entry` with this update applied, validated.
    pub fn apply_to(&self, entry: &ScheduleEntry) -> HostResult<ScheduleEntry> {
        let mut updated = entry.clone();
        if let Some(prepare_at) = self.prepare_at {
            updated.prepare_at = prepare_at;
        }
        if let Some(start_at) = self.start_at {
            updated.start_at = start_at;
        }
        if let Some(stop_at) = self.stop_at {
            updated.stop_at = stop_at;
        }
        if let Some(params) = &self.params {
            updated.params = params.clone();
        }
        updated.validate()?;
        Ok(updated)
    }
}

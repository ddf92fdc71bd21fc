//! Device states, error codes, parameter bundles and lifecycle events.

use std::collections::BTreeMap;

use fleet_id::DeviceName;
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Device State
// =============================================================================

/// Lifecycle state of a logical device.
///
/// ```text
/// Initial -> Idle <-> { Claiming -> Claimed -> Preparing -> Suspended <-> Active }
///                                       -> Releasing -> Idle | GoingDown
/// Initial | Idle -> Disabled
/// ```
///
/// The discriminants are the wire codes and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DeviceState {
    Initial = 0,
    Idle = 1,
    Claiming = 2,
    Claimed = 3,
    Preparing = 4,
    Suspended = 5,
    Active = 6,
    Releasing = 7,
    Disabled = 8,
    GoingDown = 9,
}

impl DeviceState {
    /// Every state, in wire-code order.
    pub const ALL: [DeviceState; 10] = [
        DeviceState::Initial,
        DeviceState::Idle,
        DeviceState::Claiming,
        DeviceState::Claimed,
        DeviceState::Preparing,
        DeviceState::Suspended,
        DeviceState::Active,
        DeviceState::Releasing,
        DeviceState::Disabled,
        DeviceState::GoingDown,
    ];

    /// Stable status string for reporting.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Initial => "initial",
            DeviceState::Idle => "idle",
            DeviceState::Claiming => "claiming",
            DeviceState::Claimed => "claimed",
            DeviceState::Preparing => "preparing",
            DeviceState::Suspended => "suspended",
            DeviceState::Active => "active",
            DeviceState::Releasing => "releasing",
            DeviceState::Disabled => "disabled",
            DeviceState::GoingDown => "going_down",
        }
    }

    /// Wire code.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Decodes a wire code.
    pub fn from_code(code: u8) -> Result<Self, EventError> {
        Self::ALL
            .get(usize::from(code))
            .copied()
            .ok_or(EventError::UnknownStateCode(code))
    }

    /// Terminal states end the life of this device instance.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceState::Disabled | DeviceState::GoingDown)
    }

    /// States in which the device holds (or is acquiring) its resources.
    pub fn is_claimed(&self) -> bool {
        matches!(
            self,
            DeviceState::Claiming
                | DeviceState::Claimed
                | DeviceState::Preparing
                | DeviceState::Suspended
                | DeviceState::Active
        )
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceState {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| EventError::UnknownStateName(s.to_string()))
    }
}

// =============================================================================
// Error Code
// =============================================================================

/// Error code carried alongside a state result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(u16);

impl ErrorCode {
    pub const OK: Self = Self(0);
    /// A command arrived while the device could not accept it.
    pub const WRONG_STATE: Self = Self(1);
    /// Device-specific logic failed.
    pub const DEVICE_FAULT: Self = Self(2);
    /// Too few children reached the target state.
    pub const QUALITY_NOT_MET: Self = Self(3);
    /// The capacity allocator declined the request.
    pub const RESOURCE_EXHAUSTED: Self = Self(4);
    /// Capacity was reclaimed by a higher-priority reservation.
    pub const PREEMPTED: Self = Self(5);
    /// An operation did not complete in time.
    pub const TIMEOUT: Self = Self(6);
    /// Missing or invalid configuration.
    pub const CONFIGURATION: Self = Self(7);

    /// Wraps a raw code (device-specific codes start at 100).
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    pub const fn value(&self) -> u16 {
        self.0
    }

    pub fn is_ok(&self) -> bool {
        *self == Self::OK
    }

    /// Short reason string for well-known codes.
    pub fn reason(&self) -> &'static str {
        match self.0 {
            0 => "ok",
            1 => "wrong_state",
            2 => "device_fault",
            3 => "quality_not_met",
            4 => "resource_exhausted",
            5 => "preempted",
            6 => "timeout",
            7 => "configuration",
            _ => "device_specific",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.reason(), self.0)
    }
}

// =============================================================================
// Parameter Bundle
// =============================================================================

/// Opaque activation parameters handed to a device's prepare logic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, serde_json::Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// The bundle as a JSON object (used for fingerprinting).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

// =============================================================================
// Schedule Window
// =============================================================================

/// Activation window in UNIX seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub start_at: i64,
    pub stop_at: i64,
}

impl ScheduleWindow {
    pub fn new(start_at: i64, stop_at: i64) -> Result<Self, EventError> {
        if start_at > stop_at {
            return Err(EventError::InvalidPayload(format!(
                "window start {start_at} is after stop {stop_at}"
            )));
        }
        Ok(Self { start_at, stop_at })
    }

    /// True if the two windows share at least one instant.
    pub fn overlaps(&self, other: &ScheduleWindow) -> bool {
        self.start_at < other.stop_at && other.start_at < self.stop_at
    }
}

// =============================================================================
// Signals and Events
// =============================================================================

/// Opcode identifying an event kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Signal {
    Schedule = 1,
    CancelSchedule = 2,
    Claim = 3,
    Prepare = 4,
    Resume = 5,
    Suspend = 6,
    Release = 7,
    Shutdown = 8,
    QueryState = 9,
    StateReport = 10,
}

impl Signal {
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Result<Self, EventError> {
        Ok(match code {
            1 => Signal::Schedule,
            2 => Signal::CancelSchedule,
            3 => Signal::Claim,
            4 => Signal::Prepare,
            5 => Signal::Resume,
            6 => Signal::Suspend,
            7 => Signal::Release,
            8 => Signal::Shutdown,
            9 => Signal::QueryState,
            10 => Signal::StateReport,
            other => return Err(EventError::UnknownSignal(other)),
        })
    }
}

/// Events exchanged over links.
///
/// Commands flow from parents and controllers towards a device; state
/// reports flow back up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum DeviceEvent {
    Schedule { window: ScheduleWindow },
    CancelSchedule,
    Claim,
    Prepare { params: Params },
    Resume,
    Suspend,
    Release,
    Shutdown,
    /// Ask the peer to re-report its current state.
    QueryState,
    /// A device announcing its state to its parent and listeners.
    StateReport {
        device: DeviceName,
        device_type: String,
        state: DeviceState,
        #[serde(default)]
        error: ErrorCode,
    },
}

impl DeviceEvent {
    pub fn signal(&self) -> Signal {
        match self {
            DeviceEvent::Schedule { .. } => Signal::Schedule,
            DeviceEvent::CancelSchedule => Signal::CancelSchedule,
            DeviceEvent::Claim => Signal::Claim,
            DeviceEvent::Prepare { .. } => Signal::Prepare,
            DeviceEvent::Resume => Signal::Resume,
            DeviceEvent::Suspend => Signal::Suspend,
            DeviceEvent::Release => Signal::Release,
            DeviceEvent::Shutdown => Signal::Shutdown,
            DeviceEvent::QueryState => Signal::QueryState,
            DeviceEvent::StateReport { .. } => Signal::StateReport,
        }
    }

    /// True for events that ask the receiver to change state.
    pub fn is_command(&self) -> bool {
        !matches!(
            self,
            DeviceEvent::QueryState | DeviceEvent::StateReport { .. }
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

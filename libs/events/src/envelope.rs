//! Envelope - the common wrapper for every event sent over a link.

use chrono::{DateTime, Utc};
use fleet_id::{DeviceName, LinkSeq};
use serde::{Deserialize, Serialize};

use crate::{DeviceEvent, EventError, Signal};

/// An event in flight between two devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Position in the sending link's stream.
    pub seq: LinkSeq,

    /// When the event was handed to the link. While the link is down this
    /// doubles as the enqueue time of the buffered event.
    pub sent_at: DateTime<Utc>,

    /// Device that produced the event.
    pub source: DeviceName,

    /// Device the event is addressed to.
    pub destination: DeviceName,

    /// The event payload.
    pub event: DeviceEvent,
}

impl Envelope {
    /// Opcode of the wrapped event.
    pub fn signal(&self) -> Signal {
        self.event.signal()
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }
}

//! Links between devices and the transports behind them.
//!
//! Two flavors are interchangeable from a device's point of view:
//!
//! - **local**: both ends live in this host; events are dispatched through
//!   the host's FIFO queue
//! - **remote**: events go through a [`Transport`]; while it is down they
//!   wait in a bounded [`OutboundBuffer`] and the link reconnects with
//!   exponential backoff

mod buffer;
mod links;

use std::sync::{Arc, Mutex, PoisonError};

use fleet_events::Envelope;
use thiserror::Error;
use tokio::sync::mpsc;

pub use buffer::{BufferedEvent, OutboundBuffer};
pub use links::{Delivery, Link, LinkFlavor, LinkRole, LinkTable, ReconnectResult};

/// Transport failures. Never surfaced to device callers directly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("link closed")]
    Closed,

    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// Inbound callbacks from a transport, delivered to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Event(Envelope),
}

/// Outbound half of a networked link.
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);

    fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;
}

// =============================================================================
// Channel transport
// =============================================================================

/// Transport over an in-memory channel, carrying JSON-encoded envelopes.
/// Used to connect hosts running in one process.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
    open: bool,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx, open: false }
    }
}

impl Transport for ChannelTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.tx.is_closed() {
            return Err(TransportError::Unreachable("receiver dropped".into()));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let json = envelope
            .to_json()
            .map_err(|e| TransportError::Encoding(e.to_string()))?;
        self.tx.send(json).map_err(|_| {
            self.open = false;
            TransportError::Unreachable("receiver dropped".into())
        })
    }
}

// =============================================================================
// Mock transport
// =============================================================================

#[derive(Debug, Default)]
struct MockState {
    sent: Vec<Envelope>,
    open_calls: u32,
    close_calls: u32,
    failing_opens: u32,
    down: bool,
}

/// Scriptable transport for tests. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends fail until `set_down(false)`.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    /// The next `n` opens fail.
    pub fn fail_opens(&self, n: u32) {
        self.lock().failing_opens = n;
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.lock().sent.clone()
    }

    pub fn open_calls(&self) -> u32 {
        self.lock().open_calls
    }

    pub fn close_calls(&self) -> u32 {
        self.lock().close_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.open_calls += 1;
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(TransportError::Unreachable("scripted failure".into()));
        }
        state.down = false;
        Ok(())
    }

    fn close(&mut self) {
        self.lock().close_calls += 1;
    }

    fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.down {
            return Err(TransportError::Closed);
        }
        state.sent.push(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_events::DeviceEvent;
    use fleet_id::{DeviceName, LinkSeq};

    fn envelope() -> Envelope {
        Envelope {
            seq: LinkSeq::new(1),
            sent_at: Utc::now(),
            source: DeviceName::new("a").unwrap(),
            destination: DeviceName::new("b").unwrap(),
            event: DeviceEvent::Release,
        }
    }

    #[tokio::test]
    async fn test_channel_transport_carries_json() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = ChannelTransport::new(tx);
        assert_eq!(transport.send(&envelope()), Err(TransportError::Closed));

        transport.open().unwrap();
        transport.send(&envelope()).unwrap();
        let json = rx.recv().await.unwrap();
        assert_eq!(Envelope::from_json(&json).unwrap().event, DeviceEvent::Release);

        drop(rx);
        assert!(transport.send(&envelope()).is_err());
        assert!(transport.open().is_err());
    }

    #[test]
    fn test_mock_transport_scripted_failures() {
        let mock = MockTransport::new();
        let mut transport = mock.clone();
        mock.fail_opens(1);
        assert!(transport.open().is_err());
        assert!(transport.open().is_ok());
        mock.set_down(true);
        assert!(transport.send(&envelope()).is_err());
        assert_eq!(mock.open_calls(), 2);
        assert!(mock.sent().is_empty());
    }
}

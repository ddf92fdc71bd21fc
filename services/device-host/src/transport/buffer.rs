//! Bounded outbound buffer for links that are down.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use fleet_events::Envelope;
use fleet_id::DeviceName;

/// An event waiting for its link to come back.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedEvent {
    pub enqueued_at: DateTime<Utc>,
    pub destination: DeviceName,
    pub envelope: Envelope,
}

/// Oldest-first queue that drops its oldest entry once `cap` is exceeded.
#[derive(Debug, Clone)]
pub struct OutboundBuffer {
    cap: usize,
    events: VecDeque<BufferedEvent>,
    dropped: u64,
}

impl OutboundBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            events: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Queue an envelope. Returns the event dropped to make room, if any.
    pub fn push(&mut self, envelope: Envelope, now: DateTime<Utc>) -> Option<BufferedEvent> {
        let overflow = if self.events.len() >= self.cap {
            self.dropped += 1;
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(BufferedEvent {
            enqueued_at: now,
            destination: envelope.destination.clone(),
            envelope,
        });
        overflow
    }

    /// Put an event back at the head after a failed flush.
    pub fn push_front(&mut self, event: BufferedEvent) {
        self.events.push_front(event);
        while self.events.len() > self.cap {
            self.dropped += 1;
            self.events.pop_back();
        }
    }

    pub fn pop_front(&mut self) -> Option<BufferedEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Events dropped over the buffer's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedEvent> {
        self.events.iter()
    }
}

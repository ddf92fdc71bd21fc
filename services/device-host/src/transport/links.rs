//! The link table: every link end in this host, keyed by handle.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use fleet_events::{DeviceEvent, Envelope};
use fleet_id::{DeviceName, LinkId, LinkSeq};
use fleet_reconcile::BackoffPolicy;
use tracing::{debug, info, warn};

use super::buffer::OutboundBuffer;
use super::{Transport, TransportError};
use crate::error::{HostError, HostResult};
use crate::timer::{TimerHandle, TimerQueue};

/// What the owning device is to the peer on the other end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// The owner is the parent; the peer is its child.
    ToChild,
    /// The owner is a child; the peer is its parent.
    ToParent,
    /// The peer observes the owner (a controller or other listener).
    ToListener,
}

/// How events reach the other end.
pub enum LinkFlavor {
    /// The other end lives in this host.
    Local { peer_end: LinkId },
    /// The other end is behind a transport.
    Remote(Box<dyn Transport>),
}

impl std::fmt::Debug for LinkFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkFlavor::Local { peer_end } => f.debug_struct("Local").field("peer_end", peer_end).finish(),
            LinkFlavor::Remote(_) => f.write_str("Remote"),
        }
    }
}

/// One end of a link.
#[derive(Debug)]
pub struct Link {
    pub id: LinkId,
    pub owner: DeviceName,
    pub peer: DeviceName,
    pub role: LinkRole,
    flavor: LinkFlavor,
    connected: bool,
    next_seq: LinkSeq,
    last_received: LinkSeq,
    buffer: OutboundBuffer,
    failed_attempts: u32,
    reconnect: Option<TimerHandle>,
}

impl Link {
    fn new(id: LinkId, owner: DeviceName, peer: DeviceName, role: LinkRole, flavor: LinkFlavor, cap: usize) -> Self {
        Self {
            id,
            owner,
            peer,
            role,
            flavor,
            connected: true,
            next_seq: LinkSeq::ZERO,
            last_received: LinkSeq::ZERO,
            buffer: OutboundBuffer::new(cap),
            failed_attempts: 0,
            reconnect: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_local(&self) -> bool {
        matches!(self.flavor, LinkFlavor::Local { .. })
    }

    pub fn buffered(&self) -> &OutboundBuffer {
        &self.buffer
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }
}

/// An event ready for the device owning `link`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub link: LinkId,
    pub owner: DeviceName,
    pub envelope: Envelope,
}

/// Result of a reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectResult {
    Connected { link: LinkId, owner: DeviceName },
    Failed { link: LinkId, attempts: u32 },
}

/// All link ends in this host.
pub struct LinkTable {
    links: HashMap<LinkId, Link>,
    pending: VecDeque<Delivery>,
    reconnects: TimerQueue<LinkId>,
    downed: Vec<(LinkId, DeviceName)>,
    backoff: BackoffPolicy,
    buffer_cap: usize,
    warn_after: u32,
}

impl std::fmt::Debug for LinkTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkTable")
            .field("links", &self.links.len())
            .field("pending", &self.pending.len())
            .field("reconnects", &self.reconnects.len())
            .finish_non_exhaustive()
    }
}

impl LinkTable {
    pub fn new(buffer_cap: usize, backoff: BackoffPolicy, warn_after: u32) -> Self {
        Self {
            links: HashMap::new(),
            pending: VecDeque::new(),
            reconnects: TimerQueue::new(),
            downed: Vec::new(),
            backoff,
            buffer_cap,
            warn_after: warn_after.max(1),
        }
    }

    // =========================================================================
    // Creation and removal
    // =========================================================================

    /// Link a parent and a child inside this host. Returns
    /// `(parent_end, child_end)`.
    pub fn connect_local(&mut self, parent: &DeviceName, child: &DeviceName) -> (LinkId, LinkId) {
        let parent_end = LinkId::issue();
        let child_end = LinkId::issue();
        self.links.insert(
            parent_end,
            Link::new(
                parent_end,
                parent.clone(),
                child.clone(),
                LinkRole::ToChild,
                LinkFlavor::Local { peer_end: child_end },
                self.buffer_cap,
            ),
        );
        self.links.insert(
            child_end,
            Link::new(
                child_end,
                child.clone(),
                parent.clone(),
                LinkRole::ToParent,
                LinkFlavor::Local { peer_end: parent_end },
                self.buffer_cap,
            ),
        );
        info!(parent = %parent, child = %child, %parent_end, %child_end, "Local link created");
        (parent_end, child_end)
    }

    /// Attach a transport-backed link end owned by `owner`. A transport
    /// that fails to open starts disconnected with a reconnect pending.
    pub fn attach_remote(
        &mut self,
        owner: &DeviceName,
        peer: &DeviceName,
        role: LinkRole,
        mut transport: Box<dyn Transport>,
        now: DateTime<Utc>,
    ) -> LinkId {
        let id = LinkId::issue();
        let opened = transport.open();
        let mut link = Link::new(
            id,
            owner.clone(),
            peer.clone(),
            role,
            LinkFlavor::Remote(transport),
            self.buffer_cap,
        );
        info!(owner = %owner, peer = %peer, link_id = %id, ?role, "Remote link attached");
        if let Err(err) = opened {
            debug!(link_id = %id, error = %err, "Initial open failed");
            link.connected = false;
            link.failed_attempts = 1;
            link.reconnect = Some(self.reconnects.arm(now + self.backoff.delay_chrono(0), id));
        }
        self.links.insert(id, link);
        id
    }

    /// Close and forget one link end. A local link loses both ends.
    /// Returns every removed end with its owner.
    pub fn close(&mut self, id: LinkId) -> Vec<(LinkId, DeviceName)> {
        let mut removed = Vec::new();
        let Some(mut link) = self.links.remove(&id) else {
            return removed;
        };
        if let Some(handle) = link.reconnect.take() {
            self.reconnects.cancel(handle);
        }
        match &mut link.flavor {
            LinkFlavor::Remote(transport) => transport.close(),
            LinkFlavor::Local { peer_end } => {
                if let Some(mut peer) = self.links.remove(peer_end) {
                    if let Some(handle) = peer.reconnect.take() {
                        self.reconnects.cancel(handle);
                    }
                    removed.push((peer.id, peer.owner));
                }
            }
        }
        if !link.buffer.is_empty() {
            warn!(link_id = %id, dropped = link.buffer.len(), "Closing link with buffered events");
        }
        removed.insert(0, (link.id, link.owner));
        self.pending.retain(|d| !removed.iter().any(|(end, _)| *end == d.link));
        removed
    }

    /// Close every link end owned by `device`.
    pub fn close_owned_by(&mut self, device: &DeviceName) -> Vec<(LinkId, DeviceName)> {
        let owned: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| l.owner == *device)
            .map(|l| l.id)
            .collect();
        owned.into_iter().flat_map(|id| self.close(id)).collect()
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn owner(&self, id: LinkId) -> Option<&DeviceName> {
        self.links.get(&id).map(|l| &l.owner)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send `event` from the owner of `id` to its peer. Transport trouble is
    /// absorbed: the event is buffered and a reconnect is scheduled.
    pub fn send(&mut self, id: LinkId, event: DeviceEvent, now: DateTime<Utc>) -> HostResult<()> {
        let peer_owner = self.links_peer_owner(id);
        let link = self.links.get_mut(&id).ok_or(HostError::UnknownLink(id))?;
        link.next_seq = link.next_seq.next();
        let envelope = Envelope {
            seq: link.next_seq,
            sent_at: now,
            source: link.owner.clone(),
            destination: link.peer.clone(),
            event,
        };

        if !link.connected {
            buffer_event(link, envelope, now);
            return Ok(());
        }

        if let Err(err) = dispatch(link, &envelope, &mut self.pending, &peer_owner) {
            warn!(link_id = %id, error = %err, "Send failed; buffering and reconnecting");
            buffer_event(link, envelope, now);
            self.go_down(id, now);
        }
        Ok(())
    }

    fn links_peer_owner(&self, id: LinkId) -> Option<(LinkId, DeviceName)> {
        match &self.links.get(&id)?.flavor {
            LinkFlavor::Local { peer_end } => {
                let peer = self.links.get(peer_end)?;
                Some((peer.id, peer.owner.clone()))
            }
            LinkFlavor::Remote(_) => None,
        }
    }

    /// Next local delivery, in send order.
    pub fn pop_pending(&mut self) -> Option<Delivery> {
        self.pending.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Check an inbound envelope against the link's sequence. Replays of
    /// already-seen sequence numbers are dropped.
    pub fn accept_inbound(&mut self, id: LinkId, envelope: &Envelope) -> HostResult<bool> {
        let link = self.links.get_mut(&id).ok_or(HostError::UnknownLink(id))?;
        if envelope.seq <= link.last_received {
            debug!(link_id = %id, seq = %envelope.seq, "Dropping replayed event");
            return Ok(false);
        }
        link.last_received = envelope.seq;
        Ok(true)
    }

    // =========================================================================
    // Connectivity
    // =========================================================================

    /// The transport reported loss of the peer.
    pub fn mark_disconnected(&mut self, id: LinkId, now: DateTime<Utc>) -> HostResult<bool> {
        let link = self.links.get(&id).ok_or(HostError::UnknownLink(id))?;
        if !link.connected {
            return Ok(false);
        }
        self.go_down(id, now);
        Ok(true)
    }

    /// The transport reported the peer is reachable again.
    pub fn mark_connected(&mut self, id: LinkId, now: DateTime<Utc>) -> HostResult<bool> {
        let link = self.links.get_mut(&id).ok_or(HostError::UnknownLink(id))?;
        if link.connected {
            return Ok(false);
        }
        if let Some(handle) = link.reconnect.take() {
            self.reconnects.cancel(handle);
        }
        Ok(self.come_up(id, now))
    }

    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        self.reconnects.next_deadline()
    }

    /// Link ends that went down since the last call, with their owners.
    pub fn take_downed(&mut self) -> Vec<(LinkId, DeviceName)> {
        std::mem::take(&mut self.downed)
    }

    /// Run reconnect attempts that are due.
    pub fn run_reconnects(&mut self, now: DateTime<Utc>) -> Vec<ReconnectResult> {
        let mut results = Vec::new();
        for (handle, id) in self.reconnects.pop_due(now) {
            let Some(link) = self.links.get_mut(&id) else {
                continue;
            };
            if link.reconnect != Some(handle) || link.connected {
                continue;
            }
            link.reconnect = None;

            let opened = match &mut link.flavor {
                LinkFlavor::Remote(transport) => transport.open(),
                LinkFlavor::Local { .. } => Ok(()),
            };
            match opened {
                Ok(()) => {
                    if self.come_up(id, now) {
                        if let Some(link) = self.links.get(&id) {
                            results.push(ReconnectResult::Connected {
                                link: id,
                                owner: link.owner.clone(),
                            });
                        }
                    }
                }
                Err(err) => {
                    link.failed_attempts += 1;
                    let attempts = link.failed_attempts;
                    if attempts % self.warn_after == 0 {
                        warn!(link_id = %id, peer = %link.peer, attempts, error = %err, "Link still unreachable");
                    } else {
                        debug!(link_id = %id, attempts, error = %err, "Reconnect failed");
                    }
                    let delay = self.backoff.delay_chrono(attempts);
                    link.reconnect = Some(self.reconnects.arm(now + delay, id));
                    results.push(ReconnectResult::Failed { link: id, attempts });
                }
            }
        }
        results
    }

    fn go_down(&mut self, id: LinkId, now: DateTime<Utc>) {
        let Some(link) = self.links.get_mut(&id) else {
            return;
        };
        link.connected = false;
        if let LinkFlavor::Remote(transport) = &mut link.flavor {
            transport.close();
        }
        if let Some(handle) = link.reconnect.take() {
            self.reconnects.cancel(handle);
        }
        let delay = self.backoff.delay_chrono(link.failed_attempts);
        link.reconnect = Some(self.reconnects.arm(now + delay, id));
        info!(link_id = %id, peer = %link.peer, "Link down");
        self.downed.push((id, link.owner.clone()));
    }

    /// Mark connected and flush the buffer oldest-first. Returns false if a
    /// flush failure took the link straight back down.
    fn come_up(&mut self, id: LinkId, now: DateTime<Utc>) -> bool {
        let peer_owner = self.links_peer_owner(id);
        let Some(link) = self.links.get_mut(&id) else {
            return false;
        };
        link.connected = true;
        link.failed_attempts = 0;
        let buffered = link.buffer.len();

        while let Some(event) = link.buffer.pop_front() {
            if let Err(err) = dispatch(link, &event.envelope, &mut self.pending, &peer_owner) {
                warn!(link_id = %id, error = %err, "Flush failed");
                link.buffer.push_front(event);
                self.go_down(id, now);
                return false;
            }
        }
        info!(link_id = %id, flushed = buffered, "Link up");
        true
    }
}

fn buffer_event(link: &mut Link, envelope: Envelope, now: DateTime<Utc>) {
    if let Some(dropped) = link.buffer.push(envelope, now) {
        warn!(
            link_id = %link.id,
            cap = link.buffer.cap(),
            dropped_seq = %dropped.envelope.seq,
            enqueued_at = %dropped.enqueued_at,
            "Outbound buffer full; dropped oldest event"
        );
    }
}

fn dispatch(
    link: &mut Link,
    envelope: &Envelope,
    pending: &mut VecDeque<Delivery>,
    peer_owner: &Option<(LinkId, DeviceName)>,
) -> Result<(), TransportError> {
    match &mut link.flavor {
        LinkFlavor::Remote(transport) => transport.send(envelope),
        LinkFlavor::Local { .. } => {
            let (peer_end, owner) = peer_owner.clone().ok_or(TransportError::Closed)?;
            pending.push_back(Delivery {
                link: peer_end,
                owner,
                envelope: envelope.clone(),
            });
            Ok(())
        }
    }
}

//! Message ports: the transport substrate the fabric consumes.
//!
//! A [`Port`] is one half of a crossed pair of unbounded message pipes. Each
//! message is a [`Packet`]: an envelope serialized to JSON bytes plus an
//! out-of-band list of [`Transferable`]s whose ownership moves with the
//! packet. Posting never blocks; closing a port ends the peer's stream.
//!
//! A [`BroadcastPort`] is the named cross-context fan-out analog: every
//! member of a bus receives packets posted by any other member. Transferables
//! are rejected on a bus because a moved port can only have one new owner.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lazy_static::lazy_static;
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::FabricError;

/// An object whose underlying storage moves across the boundary rather than
/// being copied into the payload tree.
pub enum Transferable {
    Port(Port),
    Buffer(Bytes),
}

impl fmt::Debug for Transferable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transferable::Port(_) => write!(f, "Port"),
            Transferable::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
        }
    }
}

/// One framed message crossing a port: the serialized envelope plus the
/// transferables attached to this packet instance.
#[derive(Debug)]
pub struct Packet {
    pub frame: Bytes,
    pub transfers: Vec<Transferable>,
}

impl Packet {
    pub fn new(frame: Bytes, transfers: Vec<Transferable>) -> Self {
        Self { frame, transfers }
    }
}

/// One half of a bidirectional message pipe. Dropping or closing a half ends
/// the peer's incoming stream.
pub struct Port {
    tx: Option<mpsc::UnboundedSender<Packet>>,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl Port {
    /// Create two linked ports. Whatever is posted on one arrives, in order,
    /// on the other.
    pub fn pair() -> (Port, Port) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Port {
                tx: Some(b_tx),
                rx: a_rx,
            },
            Port {
                tx: Some(a_tx),
                rx: b_rx,
            },
        )
    }

    /// Post a packet to the peer. Fire-and-forget; never blocks.
    pub fn post(&self, packet: Packet) -> Result<(), FabricError> {
        self.tx
            .as_ref()
            .ok_or(FabricError::Closed)?
            .send(packet)
            .map_err(|_| FabricError::Closed)
    }

    /// Receive the next packet, or `None` once the peer has closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    /// A clonable handle on the outgoing half, used by send-only consumers.
    pub(crate) fn clone_tx(&self) -> Option<mpsc::UnboundedSender<Packet>> {
        self.tx.clone()
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port {{ open: {} }}", self.tx.is_some())
    }
}

struct BusMember {
    id: u64,
    tx: mpsc::UnboundedSender<Packet>,
}

/// A named fan-out bus. Members receive every frame posted by any other
/// member; the posting member does not hear its own frames.
pub struct BroadcastBus {
    name: String,
    members: Mutex<Vec<BusMember>>,
    next_member: AtomicU64,
}

impl BroadcastBus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Mutex::new(Vec::new()),
            next_member: AtomicU64::new(1),
        }
    }

    fn join(&self) -> (u64, mpsc::UnboundedReceiver<Packet>) {
        let id = self.next_member.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.members.lock().unwrap().push(BusMember { id, tx });
        debug!("member {} joined bus {}", id, self.name);
        (id, rx)
    }

    fn leave(&self, id: u64) {
        self.members.lock().unwrap().retain(|m| m.id != id);
        debug!("member {} left bus {}", id, self.name);
    }

    fn post_from(&self, sender: u64, frame: Bytes) {
        let mut members = self.members.lock().unwrap();
        members.retain(|member| {
            if member.id == sender {
                return true;
            }
            member
                .tx
                .send(Packet::new(frame.clone(), Vec::new()))
                .is_ok()
        });
    }
}

lazy_static! {
    static ref BUSES: Mutex<HashMap<String, Arc<BroadcastBus>>> = Mutex::new(HashMap::new());
}

fn bus(name: &str) -> Arc<BroadcastBus> {
    BUSES
        .lock()
        .unwrap()
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(BroadcastBus::new(name)))
        .clone()
}

/// A membership on a named broadcast bus, with the same post/recv surface as
/// a [`Port`] minus transferables.
pub struct BroadcastPort {
    bus: Arc<BroadcastBus>,
    member: u64,
    rx: mpsc::UnboundedReceiver<Packet>,
    open: bool,
}

impl BroadcastPort {
    pub fn open(name: &str) -> Self {
        let bus = bus(name);
        let (member, rx) = bus.join();
        Self {
            bus,
            member,
            rx,
            open: true,
        }
    }

    pub fn post(&self, packet: Packet) -> Result<(), FabricError> {
        if !self.open {
            return Err(FabricError::Closed);
        }
        if !packet.transfers.is_empty() {
            return Err(FabricError::Unsupported(
                "transferables cannot cross a broadcast bus".into(),
            ));
        }
        self.bus.post_from(self.member, packet.frame);
        Ok(())
    }

    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        if self.open {
            self.open = false;
            self.bus.leave(self.member);
            self.rx.close();
        }
    }

    pub(crate) fn clone_handle(&self) -> (Arc<BroadcastBus>, u64) {
        (self.bus.clone(), self.member)
    }
}

impl Drop for BroadcastPort {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for BroadcastPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BroadcastPort {{ bus: {} }}", self.bus.name)
    }
}

pub(crate) fn broadcast_post(
    bus: &Arc<BroadcastBus>,
    member: u64,
    packet: Packet,
) -> Result<(), FabricError> {
    if !packet.transfers.is_empty() {
        return Err(FabricError::Unsupported(
            "transferables cannot cross a broadcast bus".into(),
        ));
    }
    bus.post_from(member, packet.frame);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, mut b) = Port::pair();
        for i in 0..3u8 {
            a.post(Packet::new(Bytes::from(vec![i]), Vec::new())).unwrap();
        }
        for i in 0..3u8 {
            let packet = b.recv().await.unwrap();
            assert_eq!(packet.frame.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (mut a, mut b) = Port::pair();
        a.close();
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let mut a = BroadcastPort::open("test-bus-excludes");
        let mut b = BroadcastPort::open("test-bus-excludes");

        a.post(Packet::new(Bytes::from_static(b"from-a"), Vec::new()))
            .unwrap();
        b.post(Packet::new(Bytes::from_static(b"from-b"), Vec::new()))
            .unwrap();

        // Each member hears only the other's frame.
        assert_eq!(a.recv().await.unwrap().frame.as_ref(), b"from-b");
        assert_eq!(b.recv().await.unwrap().frame.as_ref(), b"from-a");

        a.close();
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_rejects_transferables() {
        let a = BroadcastPort::open("test-bus-transfers");
        let _b = BroadcastPort::open("test-bus-transfers");
        let (port, _keep) = Port::pair();
        let result = a.post(Packet::new(
            Bytes::from_static(b"x"),
            vec![Transferable::Port(port)],
        ));
        assert!(result.is_err());
    }
}

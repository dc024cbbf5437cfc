//! Codec-aware duplex channels over ports.
//!
//! A [`Channel`] owns one endpoint (a port half, a broadcast-bus membership,
//! or an in-process queue) together with the [`Wire`] used to encode outgoing
//! and decode incoming values. Send is fire-and-forget; receive is FIFO.
//! Sending a channel through another channel moves its underlying port.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::errors::FabricError;
use crate::port::{broadcast_post, BroadcastBus, BroadcastPort, Packet, Port, Transferable};
use crate::value::Value;
use crate::wire::{Codec, Envelope, Plain, TransferSlots, Wire};

enum Endpoint {
    Port(Port),
    Broadcast(BroadcastPort),
    Queue {
        tx: Option<mpsc::UnboundedSender<Value>>,
        rx: mpsc::UnboundedReceiver<Value>,
    },
}

/// An ordered duplex of values over a port, with codec-aware send/recv.
pub struct Channel {
    endpoint: Endpoint,
    wire: Wire,
}

impl Channel {
    /// Wrap a port received from elsewhere into a channel on the given wire.
    pub fn attach(port: Port, wire: Wire) -> Self {
        Self {
            endpoint: Endpoint::Port(port),
            wire,
        }
    }

    /// Two linked channels over a fresh port pair, on the standard wire.
    pub fn pair() -> (Channel, Channel) {
        Self::pair_on(&Wire::standard())
    }

    /// Two linked channels over a fresh port pair, on the given wire.
    pub fn pair_on(wire: &Wire) -> (Channel, Channel) {
        let (a, b) = Port::pair();
        (Channel::attach(a, wire.clone()), Channel::attach(b, wire.clone()))
    }

    /// A channel backed by the named cross-context broadcast bus.
    pub fn broadcast(name: &str) -> Channel {
        Self {
            endpoint: Endpoint::Broadcast(BroadcastPort::open(name)),
            wire: Wire::standard(),
        }
    }

    /// An in-process queue usable as sender and receiver at once. Values do
    /// not cross a serialization boundary.
    pub fn from_queue() -> Channel {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            endpoint: Endpoint::Queue { tx: Some(tx), rx },
            wire: Wire::standard(),
        }
    }

    pub fn wire(&self) -> &Wire {
        &self.wire
    }

    /// Encode a value, collect its transferables, and post the packet in a
    /// single operation. Never blocks.
    pub fn send(&self, value: Value) -> Result<(), FabricError> {
        match &self.endpoint {
            Endpoint::Port(port) => port.post(self.wire.seal(value)?),
            Endpoint::Broadcast(port) => port.post(self.wire.seal(value)?),
            Endpoint::Queue { tx, .. } => tx
                .as_ref()
                .ok_or(FabricError::Closed)?
                .send(value)
                .map_err(|_| FabricError::Closed),
        }
    }

    /// The next decoded incoming value, FIFO. `Closed` once the peer has
    /// closed and the queue is drained.
    pub async fn recv(&mut self) -> Result<Value, FabricError> {
        match &mut self.endpoint {
            Endpoint::Port(port) => {
                let packet = port.recv().await.ok_or(FabricError::Closed)?;
                self.wire.unseal(packet)
            }
            Endpoint::Broadcast(port) => {
                let packet = port.recv().await.ok_or(FabricError::Closed)?;
                self.wire.unseal(packet)
            }
            Endpoint::Queue { rx, .. } => rx.recv().await.ok_or(FabricError::Closed),
        }
    }

    /// Iteration form of `recv`: yields values until the channel closes,
    /// skipping (and logging) packets that fail to decode.
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            match self.recv().await {
                Ok(value) => return Some(value),
                Err(FabricError::Closed) => return None,
                Err(e) => {
                    warn!("dropping undecodable packet: {}", e);
                }
            }
        }
    }

    pub fn close(&mut self) {
        match &mut self.endpoint {
            Endpoint::Port(port) => port.close(),
            Endpoint::Broadcast(port) => port.close(),
            Endpoint::Queue { tx, rx } => {
                *tx = None;
                rx.close();
            }
        }
    }

    /// A clonable send-only handle on this channel.
    pub fn sender(&self) -> ChannelSender {
        let inner = match &self.endpoint {
            Endpoint::Port(port) => SenderInner::Port(port.clone_tx()),
            Endpoint::Broadcast(port) => {
                let (bus, member) = port.clone_handle();
                SenderInner::Broadcast(bus, member)
            }
            Endpoint::Queue { tx, .. } => SenderInner::Queue(tx.clone()),
        };
        ChannelSender {
            inner,
            wire: self.wire.clone(),
        }
    }

    /// Surrender the underlying port so it can be transferred. Only
    /// port-backed channels are transferable.
    pub fn detach(self) -> Result<Port, FabricError> {
        match self.endpoint {
            Endpoint::Port(port) => Ok(port),
            _ => Err(FabricError::Unsupported(
                "only port-backed channels are transferable".into(),
            )),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Port(_) => write!(f, "Channel(port)"),
            Endpoint::Broadcast(_) => write!(f, "Channel(broadcast)"),
            Endpoint::Queue { .. } => write!(f, "Channel(queue)"),
        }
    }
}

#[derive(Clone)]
enum SenderInner {
    Port(Option<mpsc::UnboundedSender<Packet>>),
    Broadcast(Arc<BroadcastBus>, u64),
    Queue(Option<mpsc::UnboundedSender<Value>>),
}

/// The clonable send half of a channel.
#[derive(Clone)]
pub struct ChannelSender {
    inner: SenderInner,
    wire: Wire,
}

impl ChannelSender {
    pub fn send(&self, value: Value) -> Result<(), FabricError> {
        match &self.inner {
            SenderInner::Port(tx) => {
                let tx = tx.as_ref().ok_or(FabricError::Closed)?;
                tx.send(self.wire.seal(value)?)
                    .map_err(|_| FabricError::Closed)
            }
            SenderInner::Broadcast(bus, member) => {
                broadcast_post(bus, *member, self.wire.seal(value)?)
            }
            SenderInner::Queue(tx) => tx
                .as_ref()
                .ok_or(FabricError::Closed)?
                .send(value)
                .map_err(|_| FabricError::Closed),
        }
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelSender")
    }
}

/// Fan-in of several receivers into one receiver of `(input index, value)`.
/// Per-input order is preserved; there is no ordering across inputs. Closing
/// the composite closes every input.
pub struct Select {
    rx: mpsc::UnboundedReceiver<(usize, Value)>,
    forwarders: Vec<JoinHandle<()>>,
}

/// Merge the given channels into a [`Select`].
pub fn select(channels: Vec<Channel>) -> Select {
    let (tx, rx) = mpsc::unbounded_channel();
    let forwarders = channels
        .into_iter()
        .enumerate()
        .map(|(index, mut channel)| {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(value) = channel.next().await {
                    if tx.send((index, value)).is_err() {
                        channel.close();
                        break;
                    }
                }
            })
        })
        .collect();
    Select { rx, forwarders }
}

impl Select {
    /// The next value from whichever input produced one, tagged with the
    /// input's index. `Closed` once every input has closed.
    pub async fn recv(&mut self) -> Result<(usize, Value), FabricError> {
        self.rx.recv().await.ok_or(FabricError::Closed)
    }

    pub fn close(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for Select {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fan-out over several channels used as senders: `send` forwards to all,
/// `close` propagates to all. Values must be clonable to fan out.
pub struct Multicast {
    outputs: Vec<Channel>,
}

pub fn multicast(outputs: Vec<Channel>) -> Multicast {
    Multicast { outputs }
}

impl Multicast {
    pub fn send(&self, value: Value) -> Result<(), FabricError> {
        let (last, rest) = match self.outputs.split_last() {
            Some(split) => split,
            None => return Ok(()),
        };
        for output in rest {
            output.send(value.try_clone()?)?;
        }
        last.send(value)
    }

    pub fn close(&mut self) {
        for output in &mut self.outputs {
            output.close();
        }
    }
}

/// A channel crosses the wire as its underlying port, moved through a
/// transfer slot. Decoding re-wraps the port on the receiving wire.
pub struct ChannelCodec;

impl Codec for ChannelCodec {
    fn name(&self) -> &str {
        "channel"
    }

    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Channel(_))
    }

    fn encode(
        &self,
        value: Value,
        _wire: &Wire,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Envelope, FabricError> {
        let channel = value
            .into_channel()
            .ok_or_else(|| FabricError::Unsupported("channel codec fed a non-channel".into()))?;
        let port = channel.detach()?;
        transfers.push(Transferable::Port(port));
        Ok(Envelope::plain(Plain::Transfer((transfers.len() - 1) as u32)))
    }

    fn decode(
        &self,
        payload: Envelope,
        wire: &Wire,
        slots: &mut TransferSlots,
    ) -> Result<Value, FabricError> {
        match payload {
            Envelope::Plain {
                value: Plain::Transfer(index),
            } => match slots.take(index)? {
                Transferable::Port(port) => Ok(Value::Channel(Channel::attach(port, wire.clone()))),
                Transferable::Buffer(_) => Err(FabricError::ProtocolViolation(
                    "channel payload must reference a port".into(),
                )),
            },
            _ => Err(FabricError::ProtocolViolation(
                "malformed channel payload".into(),
            )),
        }
    }
}

/// Buffer values arriving out of band, preserving insertion order. Used by
/// consumers that drain a channel into an ordered backlog.
#[derive(Debug, Default)]
pub(crate) struct Backlog {
    items: VecDeque<Value>,
}

impl Backlog {
    pub fn push(&mut self, value: Value) {
        self.items.push_back(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.items.pop_front()
    }

    /// Remove and return the first buffered value satisfying the predicate,
    /// leaving the relative order of the rest untouched.
    pub fn take_matching(&mut self, pred: impl Fn(&Value) -> bool) -> Option<Value> {
        let index = self.items.iter().position(|v| pred(v))?;
        self.items.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_echo() {
        let (a, mut b) = Channel::pair();
        a.send(Value::record([("n", Value::Int(42))])).unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got, Value::record([("n", Value::Int(42))]));
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (a, mut b) = Channel::pair();
        for i in 0..10 {
            a.send(Value::Int(i)).unwrap();
        }
        for i in 0..10 {
            assert_eq!(b.recv().await.unwrap(), Value::Int(i));
        }
    }

    #[tokio::test]
    async fn test_close_surfaces_to_receiver() {
        let (mut a, mut b) = Channel::pair();
        a.send(Value::Int(1)).unwrap();
        a.close();
        assert_eq!(b.recv().await.unwrap(), Value::Int(1));
        assert!(matches!(b.recv().await, Err(FabricError::Closed)));
    }

    #[tokio::test]
    async fn test_sending_a_channel_moves_it() {
        let (a, mut b) = Channel::pair();
        let (inner_near, inner_far) = Channel::pair();

        a.send(Value::Channel(inner_far)).unwrap();
        let mut moved = b.recv().await.unwrap().into_channel().unwrap();

        inner_near.send(Value::text("through")).unwrap();
        assert_eq!(moved.recv().await.unwrap(), Value::text("through"));
    }

    #[tokio::test]
    async fn test_from_queue_loops_back() {
        let mut queue = Channel::from_queue();
        queue.send(Value::Int(7)).unwrap();
        assert_eq!(queue.recv().await.unwrap(), Value::Int(7));
    }

    #[tokio::test]
    async fn test_select_fans_in() {
        let (a_tx, a_rx) = Channel::pair();
        let (b_tx, b_rx) = Channel::pair();
        let mut merged = select(vec![a_rx, b_rx]);

        a_tx.send(Value::Int(1)).unwrap();
        b_tx.send(Value::Int(2)).unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (index, value) = merged.recv().await.unwrap();
            seen.push((index, value.as_int().unwrap()));
        }
        seen.sort();
        assert_eq!(seen, vec![(0, 1), (1, 2)]);
    }

    #[tokio::test]
    async fn test_broadcast_channel_fans_out() {
        let speaker = Channel::broadcast("channel-test-bus");
        let mut listener_a = Channel::broadcast("channel-test-bus");
        let mut listener_b = Channel::broadcast("channel-test-bus");

        speaker.send(Value::record([("n", Value::Int(3))])).unwrap();
        assert_eq!(
            listener_a.recv().await.unwrap(),
            Value::record([("n", Value::Int(3))])
        );
        assert_eq!(
            listener_b.recv().await.unwrap(),
            Value::record([("n", Value::Int(3))])
        );

        // Transfer-bearing values cannot fan out.
        let (inner, _keep) = Channel::pair();
        assert!(speaker.send(Value::Channel(inner)).is_err());
    }

    #[tokio::test]
    async fn test_multicast_forwards_to_all() {
        let (out1, mut in1) = Channel::pair();
        let (out2, mut in2) = Channel::pair();
        let fan = multicast(vec![out1, out2]);
        fan.send(Value::Int(9)).unwrap();
        assert_eq!(in1.recv().await.unwrap(), Value::Int(9));
        assert_eq!(in2.recv().await.unwrap(), Value::Int(9));
    }
}

//! The wire: a registry of codecs and the envelope tree they produce.
//!
//! `encode` walks a live [`Value`]. If a registered codec claims the value,
//! the codec's payload is wrapped as `Encoded { codec, value }` with the
//! codec name as the wire discriminant; otherwise primitives become plain
//! leaves and lists/maps recurse member-wise. Transferables are collected
//! bottom-up into an out-of-band list; the payload tree references them by
//! slot index only. `decode` mirrors the walk, consuming each slot exactly
//! once.
//!
//! Codec precedence is first-match in registration order; re-registering a
//! name replaces the earlier codec in place. A codec may call back into the
//! wire for its children. The plain branch never re-enters a codec for the
//! same sub-value, so mutual recursion terminates.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ChannelCodec};
use crate::errors::FabricError;
use crate::port::{Packet, Transferable};
use crate::remote::{FaultCodec, FuncCodec, ObjectCodec};
use crate::value::Value;

/// One node of the wire tree. `Plain` payloads are interpreted structurally;
/// `Encoded` payloads are opaque to everything but the named codec.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Envelope {
    Plain { value: Plain },
    Encoded { codec: String, value: Box<Envelope> },
}

impl Envelope {
    pub fn plain(value: Plain) -> Self {
        Envelope::Plain { value }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum Plain {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Envelope>),
    Map(BTreeMap<String, Envelope>),
    /// Reference to a transfer slot riding out-of-band with the packet.
    Transfer(u32),
    /// A payload with explicitly attached transfer slots.
    Attached { value: Box<Envelope>, slots: Vec<u32> },
}

/// The transferables of one packet during decode. Every slot must be taken
/// exactly once; a missing or reused slot is a protocol violation.
pub struct TransferSlots {
    slots: Vec<Option<Transferable>>,
}

impl TransferSlots {
    pub fn new(transfers: Vec<Transferable>) -> Self {
        Self {
            slots: transfers.into_iter().map(Some).collect(),
        }
    }

    pub fn take(&mut self, index: u32) -> Result<Transferable, FabricError> {
        self.slots
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or_else(|| {
                FabricError::ProtocolViolation(format!("transfer slot {} missing or reused", index))
            })
    }
}

/// A bidirectional translator between one class of live values and a wire
/// payload plus transferables. `name` is the on-wire discriminant.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// Codecs must answer `false` for values outside their domain; the first
    /// registered codec answering `true` wins.
    fn can_handle(&self, value: &Value) -> bool;

    fn encode(
        &self,
        value: Value,
        wire: &Wire,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Envelope, FabricError>;

    fn decode(
        &self,
        payload: Envelope,
        wire: &Wire,
        slots: &mut TransferSlots,
    ) -> Result<Value, FabricError>;
}

/// The codec registry. Cheap to clone; clones share the registry, so a codec
/// registered after a channel is created is visible to that channel too.
#[derive(Clone)]
pub struct Wire {
    codecs: Arc<RwLock<Vec<Arc<dyn Codec>>>>,
}

impl Wire {
    /// A wire with no codecs: only plain data and explicit transfers cross.
    pub fn empty() -> Self {
        Self {
            codecs: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// A wire with the built-in codecs: channel, func, object, fault.
    pub fn standard() -> Self {
        let wire = Wire::empty();
        wire.register(Arc::new(ChannelCodec));
        wire.register(Arc::new(FuncCodec));
        wire.register(Arc::new(ObjectCodec));
        wire.register(Arc::new(FaultCodec));
        wire
    }

    /// Add a codec. A codec with the same name as an earlier one replaces it
    /// in place, keeping its precedence position.
    pub fn register(&self, codec: Arc<dyn Codec>) {
        let mut codecs = self.codecs.write().unwrap();
        if let Some(slot) = codecs.iter_mut().find(|c| c.name() == codec.name()) {
            *slot = codec;
        } else {
            codecs.push(codec);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Codec>> {
        self.codecs.read().unwrap().clone()
    }

    /// Encode a value into an envelope and its transferable list.
    pub fn encode(&self, value: Value) -> Result<(Envelope, Vec<Transferable>), FabricError> {
        let mut transfers = Vec::new();
        let envelope = self.encode_into(value, &mut transfers)?;
        Ok((envelope, transfers))
    }

    /// Recursion entry point for codecs encoding their children.
    pub fn encode_into(
        &self,
        value: Value,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Envelope, FabricError> {
        for codec in self.snapshot() {
            if codec.can_handle(&value) {
                let name = codec.name().to_string();
                let payload = codec.encode(value, self, transfers)?;
                return Ok(Envelope::Encoded {
                    codec: name,
                    value: Box::new(payload),
                });
            }
        }

        let plain = match value {
            Value::Null => Plain::Null,
            Value::Bool(b) => Plain::Bool(b),
            Value::Int(n) => Plain::Int(n),
            Value::Float(n) => Plain::Float(n),
            Value::Text(s) => Plain::Text(s),
            Value::Binary(b) => Plain::Bytes(b.to_vec()),
            Value::List(items) => Plain::List(
                items
                    .into_iter()
                    .map(|item| self.encode_into(item, transfers))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => Plain::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.encode_into(v, transfers)?)))
                    .collect::<Result<_, FabricError>>()?,
            ),
            Value::Moved(transferable) => {
                transfers.push(transferable);
                Plain::Transfer((transfers.len() - 1) as u32)
            }
            Value::Attached(inner, attached) => {
                let mut indices = Vec::with_capacity(attached.len());
                for transferable in attached {
                    transfers.push(transferable);
                    indices.push((transfers.len() - 1) as u32);
                }
                Plain::Attached {
                    value: Box::new(self.encode_into(*inner, transfers)?),
                    slots: indices,
                }
            }
            other @ (Value::Channel(_)
            | Value::Func(_)
            | Value::Object(_)
            | Value::Fault(_)) => {
                return Err(FabricError::Serialization(format!(
                    "no codec registered for {:?}",
                    other
                )))
            }
        };
        Ok(Envelope::plain(plain))
    }

    /// Decode an envelope together with its transferable list.
    pub fn decode(
        &self,
        envelope: Envelope,
        transfers: Vec<Transferable>,
    ) -> Result<Value, FabricError> {
        let mut slots = TransferSlots::new(transfers);
        self.decode_from(envelope, &mut slots)
    }

    /// Recursion entry point for codecs decoding their children.
    pub fn decode_from(
        &self,
        envelope: Envelope,
        slots: &mut TransferSlots,
    ) -> Result<Value, FabricError> {
        match envelope {
            Envelope::Encoded { codec, value } => {
                let found = self
                    .snapshot()
                    .into_iter()
                    .find(|c| c.name() == codec)
                    .ok_or_else(|| {
                        FabricError::ProtocolViolation(format!("unknown codec: {}", codec))
                    })?;
                found.decode(*value, self, slots)
            }
            Envelope::Plain { value } => match value {
                Plain::Null => Ok(Value::Null),
                Plain::Bool(b) => Ok(Value::Bool(b)),
                Plain::Int(n) => Ok(Value::Int(n)),
                Plain::Float(n) => Ok(Value::Float(n)),
                Plain::Text(s) => Ok(Value::Text(s)),
                Plain::Bytes(b) => Ok(Value::Binary(Bytes::from(b))),
                Plain::List(items) => Ok(Value::List(
                    items
                        .into_iter()
                        .map(|item| self.decode_from(item, slots))
                        .collect::<Result<_, _>>()?,
                )),
                Plain::Map(entries) => Ok(Value::Map(
                    entries
                        .into_iter()
                        .map(|(k, v)| Ok((k, self.decode_from(v, slots)?)))
                        .collect::<Result<_, FabricError>>()?,
                )),
                Plain::Transfer(index) => match slots.take(index)? {
                    Transferable::Port(port) => Ok(Value::Channel(Channel::attach(port, self.clone()))),
                    Transferable::Buffer(buffer) => Ok(Value::Binary(buffer)),
                },
                Plain::Attached { value, slots: indices } => {
                    let inner = self.decode_from(*value, slots)?;
                    let attached = indices
                        .into_iter()
                        .map(|index| slots.take(index))
                        .collect::<Result<_, _>>()?;
                    Ok(Value::Attached(Box::new(inner), attached))
                }
            },
        }
    }

    /// Associate transferables with a value so they ride along out-of-band
    /// when the value is encoded.
    pub fn transfer(value: Value, transfers: Vec<Transferable>) -> Value {
        Value::Attached(Box::new(value), transfers)
    }

    /// Encode a value all the way to a packet: envelope serialized to a JSON
    /// frame, transferables alongside.
    pub fn seal(&self, value: Value) -> Result<Packet, FabricError> {
        let (envelope, transfers) = self.encode(value)?;
        let frame = serde_json::to_vec(&envelope)
            .map_err(|e| FabricError::Serialization(e.to_string()))?;
        Ok(Packet::new(Bytes::from(frame), transfers))
    }

    /// Decode a packet back into a live value. A frame that does not parse
    /// as an envelope is a protocol violation.
    pub fn unseal(&self, packet: Packet) -> Result<Value, FabricError> {
        let envelope: Envelope = serde_json::from_slice(&packet.frame)
            .map_err(|e| FabricError::ProtocolViolation(format!("malformed envelope: {}", e)))?;
        self.decode(envelope, packet.transfers)
    }
}

impl Default for Wire {
    fn default() -> Self {
        Wire::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;

    fn sample() -> Value {
        Value::record([
            ("n", Value::Int(42)),
            ("f", Value::Float(1.5)),
            ("s", Value::text("hello")),
            (
                "nested",
                Value::List(vec![Value::Null, Value::Bool(true), Value::text("x")]),
            ),
        ])
    }

    #[test]
    fn test_plain_roundtrip() {
        let wire = Wire::empty();
        let expected = sample();
        let (envelope, transfers) = wire.encode(sample()).unwrap();
        assert!(transfers.is_empty());
        let decoded = wire.decode(envelope, transfers).unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_frame_roundtrip_through_json() {
        let wire = Wire::empty();
        let packet = wire.seal(sample()).unwrap();
        let decoded = wire.unseal(packet).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_transfer_slots_collected_once() {
        let wire = Wire::empty();
        let (a, _keep_a) = Port::pair();
        let (b, _keep_b) = Port::pair();
        let value = Value::List(vec![
            Value::Moved(Transferable::Port(a)),
            Value::Moved(Transferable::Port(b)),
        ]);
        let (envelope, transfers) = wire.encode(value).unwrap();
        assert_eq!(transfers.len(), 2);
        match envelope {
            Envelope::Plain {
                value: Plain::List(items),
            } => {
                assert_eq!(
                    items,
                    vec![
                        Envelope::plain(Plain::Transfer(0)),
                        Envelope::plain(Plain::Transfer(1)),
                    ]
                );
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_attached_transferables_ride_along() {
        let wire = Wire::empty();
        let value = Wire::transfer(
            Value::text("payload"),
            vec![Transferable::Buffer(Bytes::from_static(b"blob"))],
        );
        let (envelope, transfers) = wire.encode(value).unwrap();
        assert_eq!(transfers.len(), 1);
        let decoded = wire.decode(envelope, transfers).unwrap();
        match decoded {
            Value::Attached(inner, attached) => {
                assert_eq!(*inner, Value::text("payload"));
                assert_eq!(attached.len(), 1);
            }
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_codec_is_protocol_violation() {
        let wire = Wire::empty();
        let envelope = Envelope::Encoded {
            codec: "no-such-codec".to_string(),
            value: Box::new(Envelope::plain(Plain::Null)),
        };
        match wire.decode(envelope, Vec::new()) {
            Err(FabricError::ProtocolViolation(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_registration_overrides_same_name() {
        struct Nope;
        impl Codec for Nope {
            fn name(&self) -> &str {
                "fault"
            }
            fn can_handle(&self, _value: &Value) -> bool {
                false
            }
            fn encode(
                &self,
                _value: Value,
                _wire: &Wire,
                _transfers: &mut Vec<Transferable>,
            ) -> Result<Envelope, FabricError> {
                unreachable!()
            }
            fn decode(
                &self,
                _payload: Envelope,
                _wire: &Wire,
                _slots: &mut TransferSlots,
            ) -> Result<Value, FabricError> {
                unreachable!()
            }
        }

        let wire = Wire::standard();
        wire.register(Arc::new(Nope));
        // The override refuses faults, so encoding one now fails.
        let result = wire.encode(Value::Fault(crate::errors::RemoteFault::new("E", "m")));
        assert!(result.is_err());
    }
}

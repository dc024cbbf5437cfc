//! The remote-value protocol: transparent proxies over a duplex channel.
//!
//! A value promoted by the wire (a callable or a reflective object) stays on
//! its home side; what crosses is a freshly paired port. A *handler* loop
//! runs beside the real value, executing reflective operations; a *proxy* on
//! the far side synthesizes requests and selectively receives the matching
//! response by `(id, seq)`. A handler-side error is wrapped as a fault value
//! before encoding, so awaiting the proxy re-raises it with its name and
//! message preserved. A handler result that is itself promotable spawns a
//! fresh handler/proxy pair — remotes compose transparently.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::errors::{FabricError, RemoteFault};
use crate::mailbox::Mailbox;
use crate::port::Transferable;
use crate::value::Value;
use crate::wire::{Codec, Envelope, Plain, TransferSlots, Wire};

/// The closed reflective operation set a remote value exposes. Implement the
/// operations the target supports; the defaults refuse.
#[async_trait]
pub trait Reflect: Send + Sync {
    async fn get(&self, key: &str) -> Result<Value, FabricError> {
        Err(FabricError::Unsupported(format!("get {:?}", key)))
    }

    async fn set(&self, key: &str, _value: Value) -> Result<(), FabricError> {
        Err(FabricError::Unsupported(format!("set {:?}", key)))
    }

    async fn delete(&self, key: &str) -> Result<(), FabricError> {
        Err(FabricError::Unsupported(format!("delete {:?}", key)))
    }

    async fn apply(&self, _args: Vec<Value>) -> Result<Value, FabricError> {
        Err(FabricError::Unsupported("apply".into()))
    }

    async fn construct(&self, _args: Vec<Value>) -> Result<Value, FabricError> {
        Err(FabricError::Unsupported("construct".into()))
    }
}

/// Run a handler loop beside `target`, executing each reflective request
/// arriving on `channel` and replying on the same channel. The loop survives
/// operation failures (they become fault replies) and ends when the channel
/// closes.
pub fn spawn_handler(target: Value, mut channel: Channel) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(mut request) = channel.next().await {
            let id = request
                .get("id")
                .and_then(Value::as_text)
                .map(str::to_string);
            let seq = request.get("seq").and_then(Value::as_int);
            let (id, seq) = match (id, seq) {
                (Some(id), Some(seq)) => (id, seq),
                _ => {
                    warn!("dropping remote request without id/seq");
                    continue;
                }
            };
            let value = match perform(&target, &mut request).await {
                Ok(value) => value,
                Err(error) => Value::Fault(error.into_fault()),
            };
            let reply = Value::record([
                ("id", Value::Text(id)),
                ("seq", Value::Int(seq)),
                ("value", value),
            ]);
            if channel.send(reply).is_err() {
                break;
            }
        }
        debug!("remote handler finished");
    })
}

async fn perform(target: &Value, request: &mut Value) -> Result<Value, FabricError> {
    let op = request
        .get("op")
        .and_then(Value::as_text)
        .ok_or_else(|| FabricError::ProtocolViolation("request missing op".into()))?
        .to_string();

    match op.as_str() {
        "get" => target_object(target)?.get(&required_key(request)?).await,
        "set" => {
            let key = required_key(request)?;
            let value = request
                .take("value")
                .ok_or_else(|| FabricError::ProtocolViolation("set missing value".into()))?;
            target_object(target)?.set(&key, value).await?;
            Ok(Value::Null)
        }
        "delete" => {
            target_object(target)?.delete(&required_key(request)?).await?;
            Ok(Value::Null)
        }
        "apply" => {
            let args = required_args(request)?;
            match target {
                Value::Func(f) => f(args).await,
                Value::Object(object) => object.apply(args).await,
                _ => Err(FabricError::Unsupported("target is not callable".into())),
            }
        }
        "construct" => target_object(target)?.construct(required_args(request)?).await,
        other => Err(FabricError::ProtocolViolation(format!(
            "unknown remote op: {}",
            other
        ))),
    }
}

fn target_object(target: &Value) -> Result<&Arc<dyn Reflect>, FabricError> {
    match target {
        Value::Object(object) => Ok(object),
        _ => Err(FabricError::Unsupported(
            "target has no reflective surface".into(),
        )),
    }
}

fn required_key(request: &Value) -> Result<String, FabricError> {
    request
        .get("key")
        .and_then(Value::as_text)
        .map(str::to_string)
        .ok_or_else(|| FabricError::ProtocolViolation("request missing key".into()))
}

fn required_args(request: &mut Value) -> Result<Vec<Value>, FabricError> {
    match request.take("args") {
        Some(Value::List(args)) => Ok(args),
        _ => Err(FabricError::ProtocolViolation("request missing args".into())),
    }
}

/// The proxy half of a remoted value: every operation is forwarded over the
/// channel and the response matched back by `(id, seq)`.
pub struct RemoteProxy {
    mailbox: Mailbox,
    id: String,
    seq: AtomicU64,
}

impl RemoteProxy {
    pub fn attach(channel: Channel, id: String) -> Self {
        Self {
            mailbox: Mailbox::wrap(channel),
            id,
            seq: AtomicU64::new(0),
        }
    }

    async fn round_trip(
        &self,
        op: &str,
        fields: Vec<(&str, Value)>,
    ) -> Result<Value, FabricError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) as i64;
        let mut request: BTreeMap<String, Value> = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        request.insert("op".into(), Value::text(op));
        request.insert("id".into(), Value::text(self.id.clone()));
        request.insert("seq".into(), Value::Int(seq));
        self.mailbox.send(Value::Map(request))?;

        let id = self.id.clone();
        let mut reply = self
            .mailbox
            .recv_matching(move |v| {
                v.get("id").and_then(Value::as_text) == Some(id.as_str())
                    && v.get("seq").and_then(Value::as_int) == Some(seq)
            })
            .await?;
        match reply.take("value") {
            Some(Value::Fault(fault)) => Err(FabricError::Thrown(fault)),
            Some(value) => Ok(value),
            None => Err(FabricError::ProtocolViolation(
                "response missing value".into(),
            )),
        }
    }

    pub async fn get_value(&self, key: &str) -> Result<Value, FabricError> {
        self.round_trip("get", vec![("key", Value::text(key))]).await
    }

    pub async fn set_value(&self, key: &str, value: Value) -> Result<(), FabricError> {
        self.round_trip("set", vec![("key", Value::text(key)), ("value", value)])
            .await
            .map(|_| ())
    }

    pub async fn delete_value(&self, key: &str) -> Result<(), FabricError> {
        self.round_trip("delete", vec![("key", Value::text(key))])
            .await
            .map(|_| ())
    }

    pub async fn apply_value(&self, args: Vec<Value>) -> Result<Value, FabricError> {
        self.round_trip("apply", vec![("args", Value::List(args))])
            .await
    }

    pub async fn construct_value(&self, args: Vec<Value>) -> Result<Value, FabricError> {
        self.round_trip("construct", vec![("args", Value::List(args))])
            .await
    }

    /// Drop both ends: the handler loop on the far side terminates when it
    /// observes the close.
    pub fn close(&self) {
        self.mailbox.close();
    }
}

#[async_trait]
impl Reflect for RemoteProxy {
    async fn get(&self, key: &str) -> Result<Value, FabricError> {
        self.get_value(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), FabricError> {
        self.set_value(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), FabricError> {
        self.delete_value(key).await
    }

    async fn apply(&self, args: Vec<Value>) -> Result<Value, FabricError> {
        self.apply_value(args).await
    }

    async fn construct(&self, args: Vec<Value>) -> Result<Value, FabricError> {
        self.construct_value(args).await
    }
}

fn promote(value: Value, wire: &Wire, transfers: &mut Vec<Transferable>) -> Result<Envelope, FabricError> {
    let id = Uuid::new_v4().to_string();
    let (near, far) = Channel::pair_on(wire);
    spawn_handler(value, near);
    let port = far.detach()?;
    transfers.push(Transferable::Port(port));
    let mut payload = BTreeMap::new();
    payload.insert("id".to_string(), Envelope::plain(Plain::Text(id)));
    payload.insert(
        "port".to_string(),
        Envelope::plain(Plain::Transfer((transfers.len() - 1) as u32)),
    );
    Ok(Envelope::plain(Plain::Map(payload)))
}

fn demote(
    payload: Envelope,
    wire: &Wire,
    slots: &mut TransferSlots,
) -> Result<RemoteProxy, FabricError> {
    let mut entries = match payload {
        Envelope::Plain {
            value: Plain::Map(entries),
        } => entries,
        _ => {
            return Err(FabricError::ProtocolViolation(
                "malformed remote payload".into(),
            ))
        }
    };
    let id = match entries.remove("id") {
        Some(Envelope::Plain {
            value: Plain::Text(id),
        }) => id,
        _ => {
            return Err(FabricError::ProtocolViolation(
                "remote payload missing id".into(),
            ))
        }
    };
    let port = match entries.remove("port") {
        Some(Envelope::Plain {
            value: Plain::Transfer(index),
        }) => match slots.take(index)? {
            Transferable::Port(port) => port,
            Transferable::Buffer(_) => {
                return Err(FabricError::ProtocolViolation(
                    "remote payload must reference a port".into(),
                ))
            }
        },
        _ => {
            return Err(FabricError::ProtocolViolation(
                "remote payload missing port".into(),
            ))
        }
    };
    Ok(RemoteProxy::attach(Channel::attach(port, wire.clone()), id))
}

/// Callables cross as a handler/proxy pair; the decoded value is a callable
/// that forwards its arguments over the wire.
pub struct FuncCodec;

impl Codec for FuncCodec {
    fn name(&self) -> &str {
        "func"
    }

    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Func(_))
    }

    fn encode(
        &self,
        value: Value,
        wire: &Wire,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Envelope, FabricError> {
        promote(value, wire, transfers)
    }

    fn decode(
        &self,
        payload: Envelope,
        wire: &Wire,
        slots: &mut TransferSlots,
    ) -> Result<Value, FabricError> {
        let proxy = Arc::new(demote(payload, wire, slots)?);
        Ok(Value::Func(Arc::new(move |args| {
            let proxy = proxy.clone();
            Box::pin(async move { proxy.apply_value(args).await })
        })))
    }
}

/// Reflective objects cross as a handler/proxy pair; the decoded value is an
/// object whose whole operation set round-trips to the handler.
pub struct ObjectCodec;

impl Codec for ObjectCodec {
    fn name(&self) -> &str {
        "object"
    }

    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Object(_))
    }

    fn encode(
        &self,
        value: Value,
        wire: &Wire,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Envelope, FabricError> {
        promote(value, wire, transfers)
    }

    fn decode(
        &self,
        payload: Envelope,
        wire: &Wire,
        slots: &mut TransferSlots,
    ) -> Result<Value, FabricError> {
        Ok(Value::Object(Arc::new(demote(payload, wire, slots)?)))
    }
}

/// Faults cross by value, preserving name, message, and detail.
pub struct FaultCodec;

impl Codec for FaultCodec {
    fn name(&self) -> &str {
        "fault"
    }

    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Fault(_))
    }

    fn encode(
        &self,
        value: Value,
        _wire: &Wire,
        _transfers: &mut Vec<Transferable>,
    ) -> Result<Envelope, FabricError> {
        let fault = match value {
            Value::Fault(fault) => fault,
            _ => return Err(FabricError::Unsupported("fault codec fed a non-fault".into())),
        };
        let mut payload = BTreeMap::new();
        payload.insert("name".to_string(), Envelope::plain(Plain::Text(fault.name)));
        payload.insert(
            "message".to_string(),
            Envelope::plain(Plain::Text(fault.message)),
        );
        if let Some(detail) = fault.detail {
            payload.insert("detail".to_string(), Envelope::plain(Plain::Text(detail)));
        }
        Ok(Envelope::plain(Plain::Map(payload)))
    }

    fn decode(
        &self,
        payload: Envelope,
        _wire: &Wire,
        _slots: &mut TransferSlots,
    ) -> Result<Value, FabricError> {
        let mut entries = match payload {
            Envelope::Plain {
                value: Plain::Map(entries),
            } => entries,
            _ => {
                return Err(FabricError::ProtocolViolation(
                    "malformed fault payload".into(),
                ))
            }
        };
        let mut text_field = |key: &str| match entries.remove(key) {
            Some(Envelope::Plain {
                value: Plain::Text(text),
            }) => Some(text),
            _ => None,
        };
        let name = text_field("name")
            .ok_or_else(|| FabricError::ProtocolViolation("fault payload missing name".into()))?;
        let message = text_field("message")
            .ok_or_else(|| FabricError::ProtocolViolation("fault payload missing message".into()))?;
        let mut fault = RemoteFault::new(name, message);
        if let Some(detail) = text_field("detail") {
            fault = fault.with_detail(detail);
        }
        Ok(Value::Fault(fault))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_function_over_the_wire() {
        let (a, mut b) = Channel::pair();

        let add = Value::func(|args| {
            Box::pin(async move {
                let x = args[0].as_int().unwrap_or(0);
                let y = args[1].as_int().unwrap_or(0);
                Ok(Value::Int(x + y))
            })
        });
        a.send(add).unwrap();

        let proxy = b.recv().await.unwrap().into_func().unwrap();
        let sum = proxy(vec![Value::Int(2), Value::Int(3)]).await.unwrap();
        assert_eq!(sum, Value::Int(5));
    }

    #[tokio::test]
    async fn test_remote_throw_preserves_fault() {
        let (a, mut b) = Channel::pair();

        let boom = Value::func(|_args| {
            Box::pin(async move {
                Err(FabricError::Thrown(RemoteFault::new("Error", "boom")))
            })
        });
        a.send(boom).unwrap();

        let proxy = b.recv().await.unwrap().into_func().unwrap();
        match proxy(vec![]).await {
            Err(FabricError::Thrown(fault)) => {
                assert_eq!(fault.name, "Error");
                assert_eq!(fault.message, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    struct Counter {
        count: std::sync::Mutex<i64>,
    }

    #[async_trait]
    impl Reflect for Counter {
        async fn get(&self, key: &str) -> Result<Value, FabricError> {
            match key {
                "count" => Ok(Value::Int(*self.count.lock().unwrap())),
                _ => Err(FabricError::Unsupported(format!("get {:?}", key))),
            }
        }

        async fn set(&self, key: &str, value: Value) -> Result<(), FabricError> {
            match (key, value.as_int()) {
                ("count", Some(n)) => {
                    *self.count.lock().unwrap() = n;
                    Ok(())
                }
                _ => Err(FabricError::Unsupported(format!("set {:?}", key))),
            }
        }

        async fn apply(&self, args: Vec<Value>) -> Result<Value, FabricError> {
            let step = args.first().and_then(Value::as_int).unwrap_or(1);
            let mut count = self.count.lock().unwrap();
            *count += step;
            Ok(Value::Int(*count))
        }
    }

    #[tokio::test]
    async fn test_object_proxy_transparency() {
        let (a, mut b) = Channel::pair();
        a.send(Value::object(Arc::new(Counter {
            count: std::sync::Mutex::new(0),
        })))
        .unwrap();

        let proxy = b.recv().await.unwrap().into_object().unwrap();
        assert_eq!(proxy.apply(vec![Value::Int(5)]).await.unwrap(), Value::Int(5));
        proxy.set("count", Value::Int(40)).await.unwrap();
        assert_eq!(proxy.apply(vec![Value::Int(2)]).await.unwrap(), Value::Int(42));
        assert_eq!(proxy.get("count").await.unwrap(), Value::Int(42));
        assert!(proxy.delete("count").await.is_err());
    }

    #[tokio::test]
    async fn test_remote_result_composes() {
        let (a, mut b) = Channel::pair();

        // A callable whose result is itself a callable.
        let make_adder = Value::func(|args| {
            Box::pin(async move {
                let base = args.first().and_then(Value::as_int).unwrap_or(0);
                Ok(Value::func(move |args| {
                    let base = base;
                    Box::pin(async move {
                        let n = args.first().and_then(Value::as_int).unwrap_or(0);
                        Ok(Value::Int(base + n))
                    })
                }))
            })
        });
        a.send(make_adder).unwrap();

        let factory = b.recv().await.unwrap().into_func().unwrap();
        let adder = factory(vec![Value::Int(10)])
            .await
            .unwrap()
            .into_func()
            .unwrap();
        assert_eq!(adder(vec![Value::Int(4)]).await.unwrap(), Value::Int(14));
    }
}

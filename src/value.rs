//! The live value vocabulary of the fabric.
//!
//! A [`Value`] is what callers hand to `send` and what `recv` yields. Besides
//! plain data it can carry live resources: a channel half, an async callable,
//! or a reflective object. The live variants are exactly the values the wire
//! promotes into remote proxies when they cross a stage boundary; plain data
//! is cloned structurally. Constructing a `Func` or `Object` value *is* the
//! promotion marker, so no user-controlled key can collide with it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::channel::Channel;
use crate::errors::{FabricError, RemoteFault};
use crate::port::Transferable;
use crate::remote::Reflect;

/// An async callable that can cross stage boundaries as a remote proxy.
pub type NativeFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, FabricError>> + Send + Sync>;

pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Binary(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A channel half. Encoding one moves its underlying port.
    Channel(Channel),
    /// An async callable, promoted to a handler/proxy pair on encode.
    Func(NativeFn),
    /// A reflective object, promoted to a handler/proxy pair on encode.
    Object(Arc<dyn Reflect>),
    /// A structured remote error, re-raised when decoded from a response.
    Fault(RemoteFault),
    /// A transferable whose ownership moves across the boundary instead of
    /// being copied into the payload.
    Moved(Transferable),
    /// A payload with explicitly attached transferables that ride along
    /// out-of-band when the value is encoded.
    Attached(Box<Value>, Vec<Transferable>),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Build a map value from literal entries.
    pub fn record<const N: usize>(entries: [(&str, Value); N]) -> Self {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    /// Wrap an async closure as a callable value.
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, FabricError>>
            + Send
            + Sync
            + 'static,
    {
        Value::Func(Arc::new(f))
    }

    /// Wrap a reflective object as an object value.
    pub fn object(target: Arc<dyn Reflect>) -> Self {
        Value::Object(target)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_fault(&self) -> Option<&RemoteFault> {
        match self {
            Value::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Map-field accessor; `None` for non-map values or missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Remove and return a map field, for consuming protocol messages.
    pub fn take(&mut self, key: &str) -> Option<Value> {
        match self {
            Value::Map(entries) => entries.remove(key),
            _ => None,
        }
    }

    pub fn into_channel(self) -> Option<Channel> {
        match self {
            Value::Channel(channel) => Some(channel),
            _ => None,
        }
    }

    pub fn into_func(self) -> Option<NativeFn> {
        match self {
            Value::Func(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<Arc<dyn Reflect>> {
        match self {
            Value::Object(target) => Some(target),
            _ => None,
        }
    }

    /// Clone the value if it is clonable. Plain data clones structurally;
    /// `Func` and `Object` clone their shared handle; values owning a port
    /// (`Channel`, `Moved`, `Attached`) cannot be duplicated because port
    /// ownership moves on send.
    pub fn try_clone(&self) -> Result<Value, FabricError> {
        match self {
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Int(n) => Ok(Value::Int(*n)),
            Value::Float(n) => Ok(Value::Float(*n)),
            Value::Text(s) => Ok(Value::Text(s.clone())),
            Value::Binary(b) => Ok(Value::Binary(b.clone())),
            Value::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(Value::try_clone)
                    .collect::<Result<_, _>>()?,
            )),
            Value::Map(entries) => Ok(Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.try_clone()?)))
                    .collect::<Result<_, FabricError>>()?,
            )),
            Value::Func(f) => Ok(Value::Func(f.clone())),
            Value::Object(target) => Ok(Value::Object(target.clone())),
            Value::Fault(fault) => Ok(Value::Fault(fault.clone())),
            Value::Channel(_) | Value::Moved(_) | Value::Attached(..) => Err(
                FabricError::Unsupported("value owns a transferable and cannot be cloned".into()),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Structural equality on the plain subset; shared handles compare by
/// identity; port-owning values never compare equal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Fault(a), Value::Fault(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(n) => write!(f, "Float({})", n),
            Value::Text(s) => write!(f, "Text({:?})", s),
            Value::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
            Value::Channel(_) => write!(f, "Channel"),
            Value::Func(_) => write!(f, "Func"),
            Value::Object(_) => write!(f, "Object"),
            Value::Fault(fault) => write!(f, "Fault({})", fault),
            Value::Moved(t) => write!(f, "Moved({:?})", t),
            Value::Attached(value, transfers) => {
                write!(f, "Attached({:?}, {} transfers)", value, transfers.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_get() {
        let v = Value::record([("a", Value::Int(1)), ("b", Value::text("two"))]);
        assert_eq!(v.get("a").and_then(Value::as_int), Some(1));
        assert_eq!(v.get("b").and_then(Value::as_text), Some("two"));
        assert!(v.get("c").is_none());
    }

    #[test]
    fn test_try_clone_plain() {
        let v = Value::List(vec![Value::Int(1), Value::text("x")]);
        let cloned = v.try_clone().unwrap();
        assert_eq!(v, cloned);
    }

    #[test]
    fn test_try_clone_rejects_channel() {
        let (a, _b) = Channel::pair();
        assert!(Value::Channel(a).try_clone().is_err());
    }
}

use crate::id::{ActorId, StageId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// # Fabric Error
///
/// Represents specific error conditions that can occur in the messaging
/// fabric. These structured errors allow callers to distinguish recoverable
/// conditions (an unknown actor, a closed channel) from protocol-level
/// failures.
#[derive(Error, Debug, Clone)]
pub enum FabricError {
    /// A link or envelope violated the stage protocol: the first packet on a
    /// link was not a stage identification, an envelope failed to parse, or
    /// an envelope named a codec this wire does not know.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A datagram addressed this stage but no actor with that ID exists here
    #[error("unknown actor: {0}")]
    UnknownActor(ActorId),

    /// A lookup alias with no local registration and no linked stage to ask
    #[error("unknown actor name: {0}")]
    UnknownName(String),

    /// A stage referenced in a command is not linked
    #[error("unknown stage: {0}")]
    UnknownStage(StageId),

    /// Operation on a closed channel, port, or mailbox
    #[error("channel closed")]
    Closed,

    /// An exception raised by a remote handler, re-raised at the proxy
    #[error("remote fault: {0}")]
    Thrown(RemoteFault),

    /// Failed to serialize or deserialize a wire value
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The target value does not support the requested reflective operation
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The stage command loop is no longer running
    #[error("stage stopped")]
    StageStopped,
}

impl FabricError {
    /// Collapse any fabric error into the serializable fault shape carried
    /// by the fault codec. A `Thrown` error passes its fault through
    /// unchanged so faults survive repeated hops.
    pub fn into_fault(self) -> RemoteFault {
        match self {
            FabricError::Thrown(fault) => fault,
            other => RemoteFault::new(error_name(&other), other.to_string()),
        }
    }
}

fn error_name(error: &FabricError) -> &'static str {
    match error {
        FabricError::ProtocolViolation(_) => "ProtocolViolation",
        FabricError::UnknownActor(_) => "UnknownActor",
        FabricError::UnknownName(_) => "UnknownName",
        FabricError::UnknownStage(_) => "UnknownStage",
        FabricError::Closed => "Closed",
        FabricError::Thrown(_) => "Thrown",
        FabricError::Serialization(_) => "Serialization",
        FabricError::Unsupported(_) => "Unsupported",
        FabricError::StageStopped => "StageStopped",
    }
}

impl From<serde_json::Error> for FabricError {
    fn from(error: serde_json::Error) -> Self {
        FabricError::Serialization(error.to_string())
    }
}

/// The well-known error shape exchanged over the wire: name and message are
/// always preserved, detail is an optional opaque rendering of anything else
/// the raising side attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub detail: Option<String>,
}

impl RemoteFault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteFault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_roundtrip_through_error() {
        let fault = RemoteFault::new("Error", "boom");
        let error = FabricError::Thrown(fault.clone());
        assert_eq!(error.into_fault(), fault);
    }

    #[test]
    fn test_fault_from_plain_error() {
        let fault = FabricError::Closed.into_fault();
        assert_eq!(fault.name, "Closed");
        assert_eq!(fault.message, "channel closed");
    }
}

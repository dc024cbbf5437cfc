//! Stage protocol packets and the commands consumed by the stage loop.
//!
//! Four packet kinds cross a link: `Stage` (identification and readiness),
//! `WhoisActor` (name or id lookup), `Actor` (lookup reply), and `Send` (an
//! actor-to-actor datagram). Everything else arriving on a link is stage-level
//! request/response traffic and lands in the stage's internal mailbox.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::channel::Channel;
use crate::errors::FabricError;
use crate::id::{ActorAddress, ActorId, StageId};
use crate::stage::actor::{ActorRef, Role};
use crate::stage::LinkRole;
use crate::value::Value;

/// A lookup key: an alias registered on some stage, or a bare actor id.
/// On the wire both travel as a single string; a string that parses as a
/// UUID is treated as an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Whois {
    Alias(String),
    Id(ActorId),
}

impl Whois {
    pub fn as_text(&self) -> String {
        match self {
            Whois::Alias(name) => name.clone(),
            Whois::Id(id) => id.to_string(),
        }
    }

    pub fn from_text(s: &str) -> Self {
        match ActorId::parse(s) {
            Ok(id) => Whois::Id(id),
            Err(_) => Whois::Alias(s.to_string()),
        }
    }
}

impl From<&str> for Whois {
    fn from(s: &str) -> Self {
        Whois::from_text(s)
    }
}

impl From<String> for Whois {
    fn from(s: String) -> Self {
        Whois::from_text(&s)
    }
}

impl From<ActorId> for Whois {
    fn from(id: ActorId) -> Self {
        Whois::Id(id)
    }
}

impl fmt::Display for Whois {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

/// An actor-to-actor message in flight. `origin` and `seq` are stamped once
/// by the sending stage and identify the datagram for cycle breaking.
#[derive(Debug)]
pub struct Datagram {
    pub to: ActorAddress,
    pub origin: StageId,
    pub seq: u64,
    pub message: Value,
}

#[derive(Debug)]
pub enum StageMessage {
    /// Link identification; re-sent to parents when the stage becomes ready.
    Stage { stage: StageId },
    /// Lookup request carrying the reply correlation id.
    WhoisActor { whois: Whois, reply: Uuid },
    /// Lookup reply.
    Actor { reply: Uuid, actor: ActorAddress },
    /// Routed datagram.
    Send(Datagram),
}

/// Outcome of classifying a value received on a link.
#[derive(Debug)]
pub enum Parsed {
    Protocol(StageMessage),
    /// Not a protocol packet; belongs in the stage's internal mailbox.
    Other(Value),
}

fn address_value(address: ActorAddress) -> Value {
    Value::record([
        ("actor", Value::text(address.actor.to_string())),
        ("stage", Value::text(address.stage.to_string())),
    ])
}

fn address_from(value: &Value) -> Option<ActorAddress> {
    let actor = ActorId::parse(value.get("actor")?.as_text()?).ok()?;
    let stage = StageId::parse(value.get("stage")?.as_text()?).ok()?;
    Some(ActorAddress::new(actor, stage))
}

impl StageMessage {
    pub fn into_value(self) -> Value {
        match self {
            StageMessage::Stage { stage } => Value::record([
                ("type", Value::text("stage")),
                ("stage", Value::text(stage.to_string())),
            ]),
            StageMessage::WhoisActor { whois, reply } => Value::record([
                ("type", Value::text("whois-actor")),
                ("whois", Value::text(whois.as_text())),
                ("reply", Value::text(reply.to_string())),
            ]),
            StageMessage::Actor { reply, actor } => Value::record([
                ("type", Value::text("actor")),
                ("reply", Value::text(reply.to_string())),
                ("actor", address_value(actor)),
            ]),
            StageMessage::Send(datagram) => Value::record([
                ("type", Value::text("send")),
                ("to", address_value(datagram.to)),
                ("origin", Value::text(datagram.origin.to_string())),
                ("seq", Value::Int(datagram.seq as i64)),
                ("message", datagram.message),
            ]),
        }
    }

    /// Classify a received value. A value that does not carry a known
    /// protocol tag is handed back untouched; a tagged-but-malformed packet
    /// is a protocol violation.
    pub fn parse(value: Value) -> Result<Parsed, FabricError> {
        let kind = match value.get("type").and_then(Value::as_text) {
            Some(kind @ ("stage" | "whois-actor" | "actor" | "send")) => kind.to_string(),
            _ => return Ok(Parsed::Other(value)),
        };
        let malformed =
            |what: &str| FabricError::ProtocolViolation(format!("malformed {} packet", what));

        match kind.as_str() {
            "stage" => {
                let stage = value
                    .get("stage")
                    .and_then(Value::as_text)
                    .and_then(|s| StageId::parse(s).ok())
                    .ok_or_else(|| malformed("stage"))?;
                Ok(Parsed::Protocol(StageMessage::Stage { stage }))
            }
            "whois-actor" => {
                let whois = value
                    .get("whois")
                    .and_then(Value::as_text)
                    .map(Whois::from_text)
                    .ok_or_else(|| malformed("whois-actor"))?;
                let reply = value
                    .get("reply")
                    .and_then(Value::as_text)
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| malformed("whois-actor"))?;
                Ok(Parsed::Protocol(StageMessage::WhoisActor { whois, reply }))
            }
            "actor" => {
                let reply = value
                    .get("reply")
                    .and_then(Value::as_text)
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| malformed("actor"))?;
                let actor = value
                    .get("actor")
                    .and_then(address_from)
                    .ok_or_else(|| malformed("actor"))?;
                Ok(Parsed::Protocol(StageMessage::Actor { reply, actor }))
            }
            "send" => {
                let mut value = value;
                let to = value
                    .get("to")
                    .and_then(address_from)
                    .ok_or_else(|| malformed("send"))?;
                let origin = value
                    .get("origin")
                    .and_then(Value::as_text)
                    .and_then(|s| StageId::parse(s).ok())
                    .ok_or_else(|| malformed("send"))?;
                let seq = value
                    .get("seq")
                    .and_then(Value::as_int)
                    .ok_or_else(|| malformed("send"))? as u64;
                let message = value.take("message").ok_or_else(|| malformed("send"))?;
                Ok(Parsed::Protocol(StageMessage::Send(Datagram {
                    to,
                    origin,
                    seq,
                    message,
                })))
            }
            _ => unreachable!("kind was checked above"),
        }
    }
}

/// The status of an actor as seen by its stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActorStatus {
    Running,
    Stopped,
}

/// Commands consumed by the stage's command loop.
pub enum StageCommand {
    SpawnActor {
        role: Box<dyn Role>,
        name: Option<String>,
        response_tx: oneshot::Sender<Result<ActorRef, FabricError>>,
    },
    ResolveActor {
        whois: Whois,
        response_tx: oneshot::Sender<Result<ActorRef, FabricError>>,
    },
    /// Install a resolved remote address in the actor cache.
    CacheActor { address: ActorAddress },
    SendMessage {
        to: ActorAddress,
        message: Value,
        response_tx: oneshot::Sender<Result<(), FabricError>>,
    },
    /// A datagram from a router (or re-entering from local send).
    Deliver {
        datagram: Datagram,
        arrived_on: Option<StageId>,
    },
    /// Answer a lookup received on a link, on that same link.
    WhoisLookup {
        whois: Whois,
        reply: Uuid,
        link: StageId,
    },
    /// Register a handshaken link and start its router.
    InstallLink {
        stage: StageId,
        role: LinkRole,
        channel: Channel,
        response_tx: oneshot::Sender<Result<StageId, FabricError>>,
    },
    MarkReady {
        response_tx: oneshot::Sender<Result<(), FabricError>>,
    },
    Forget { actor: ActorId },
    GetActorStatus {
        actor: ActorId,
        response_tx: oneshot::Sender<ActorStatus>,
    },
    LinkClosed { stage: StageId },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

impl StageCommand {
    pub fn to_log(&self) -> String {
        match self {
            StageCommand::SpawnActor { name, .. } => match name {
                Some(name) => format!("SpawnActor: {}", name),
                None => "SpawnActor".to_string(),
            },
            StageCommand::ResolveActor { whois, .. } => {
                format!("ResolveActor: {}", whois)
            }
            StageCommand::CacheActor { address } => {
                format!("CacheActor: {}", address)
            }
            StageCommand::SendMessage { to, .. } => {
                format!("SendMessage: {}", to)
            }
            StageCommand::Deliver { datagram, .. } => {
                format!("Deliver: {} (origin {})", datagram.to, datagram.origin)
            }
            StageCommand::WhoisLookup { whois, link, .. } => {
                format!("WhoisLookup: {} from {}", whois, link)
            }
            StageCommand::InstallLink { stage, role, .. } => {
                format!("InstallLink: {} ({:?})", stage, role)
            }
            StageCommand::MarkReady { .. } => "MarkReady".to_string(),
            StageCommand::Forget { actor } => format!("Forget: {}", actor),
            StageCommand::GetActorStatus { actor, .. } => {
                format!("GetActorStatus: {}", actor)
            }
            StageCommand::LinkClosed { stage } => format!("LinkClosed: {}", stage),
            StageCommand::Shutdown { .. } => "Shutdown".to_string(),
        }
    }
}

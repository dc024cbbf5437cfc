//! # Troupe
//!
//! An actor runtime and object-capability messaging fabric. A *stage* is the
//! runtime bound to one execution context; stages link into a tree, host
//! actors addressed by globally unique `{actor, stage}` identity, and route
//! messages among them. Values crossing a stage boundary pass through a
//! pluggable codec registry that promotes non-clonable things (channels,
//! callables, reflective objects) into transparent remote proxies.
//!
//! The layers, leaves first:
//!
//! - [`wire`] — codec registry; encode/decode with transferable collection.
//! - [`channel`] — typed ordered send/receive duplex over a port.
//! - [`mailbox`] — buffered selective receive on top of a channel.
//! - [`worker`] — spawning and connecting peer execution contexts.
//! - [`remote`] — the request/response proxy protocol over a channel.
//! - [`stage`] — identity, routing, spawn, register, actor routines.
//!
//! ```rust,no_run
//! use troupe::{Stage, StageConfig, ContextKind, Value};
//!
//! # async fn example() -> Result<(), troupe::FabricError> {
//! let stage = Stage::spawn(StageConfig::default(), ContextKind::Main);
//! stage
//!     .dedicated(|child| async move {
//!         // register actors on the child stage, then:
//!         let _ = child.ready().await;
//!     })
//!     .await?;
//! let actor = stage.actor("worker").await?;
//! actor.send(Value::text("hello")).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod errors;
pub mod id;
pub mod logging;
pub mod mailbox;
pub mod messages;
pub mod port;
pub mod remote;
pub mod shutdown;
pub mod stage;
pub mod value;
pub mod wire;
pub mod worker;

pub use channel::{multicast, select, Channel, ChannelSender, Multicast, Select};
pub use config::{LoggingConfig, StageConfig};
pub use errors::{FabricError, RemoteFault};
pub use id::{ActorAddress, ActorId, StageId};
pub use mailbox::Mailbox;
pub use messages::{ActorStatus, Datagram, StageMessage, Whois};
pub use port::{Packet, Port, Transferable};
pub use remote::{spawn_handler, Reflect, RemoteProxy};
pub use shutdown::{ShutdownController, ShutdownReceiver, ShutdownSignal};
pub use stage::{live, ActorCtx, ActorRef, Filter, LinkRole, Role, Stage, StageHandle, Step};
pub use value::{NativeFn, Value};
pub use wire::{Codec, Envelope, Plain, TransferSlots, Wire};
pub use worker::ContextKind;

//! The stage: one actor runtime per execution context.
//!
//! A stage owns its name table, its actor table, and its links to other
//! stages; all of that state lives inside a single command-loop task, and the
//! cloneable [`StageHandle`] is the public way in. Stages link into a tree:
//! each link is handshaken with a `Stage` identification packet and then
//! consumed by a router. Datagrams for unknown stages flood every other link,
//! gated by a bounded seen-set so cycles do not storm.

pub mod actor;
pub(crate) mod router;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex as StdMutex;

use lazy_static::lazy_static;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelSender};
use crate::config::StageConfig;
use crate::errors::FabricError;
use crate::id::{ActorAddress, ActorId, StageId};
use crate::mailbox::Mailbox;
use crate::messages::{ActorStatus, Datagram, Parsed, StageCommand, StageMessage, Whois};
use crate::shutdown::ShutdownController;
use crate::value::Value;
use crate::worker::{self, ContextKind};

pub use actor::{ActorCtx, ActorRef, Filter, Role, Step};

/// How a link was formed, seen from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Parent,
    Child,
}

struct Link {
    role: LinkRole,
    sender: ChannelSender,
    #[allow(dead_code)]
    router: JoinHandle<()>,
}

enum ActorEntry {
    Local { mailbox: Mailbox, task: JoinHandle<()> },
    Remote(ActorAddress),
}

/// A cloneable handle on a running stage. All stage state is owned by the
/// stage's command loop; the handle only carries the command sender, the
/// internal mailbox, and immutable identity.
#[derive(Clone)]
pub struct StageHandle {
    id: StageId,
    context: ContextKind,
    commands: mpsc::UnboundedSender<StageCommand>,
    inbox: Mailbox,
}

impl StageHandle {
    pub fn id(&self) -> StageId {
        self.id
    }

    /// Which kind of execution context this stage is bound to.
    pub fn context_kind(&self) -> ContextKind {
        self.context
    }

    fn command(&self, command: StageCommand) -> Result<(), FabricError> {
        self.commands
            .send(command)
            .map_err(|_| FabricError::StageStopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StageCommand,
    ) -> Result<T, FabricError> {
        let (tx, rx) = oneshot::channel();
        self.command(build(tx))?;
        rx.await.map_err(|_| FabricError::StageStopped)
    }

    /// Spawn an anonymous local actor.
    pub async fn spawn<R: Role>(&self, role: R) -> Result<ActorRef, FabricError> {
        self.request(|tx| StageCommand::SpawnActor {
            role: Box::new(role),
            name: None,
            response_tx: tx,
        })
        .await?
    }

    /// Spawn a local actor and install `name` as a stage-local alias for it.
    pub async fn register<R: Role>(&self, name: &str, role: R) -> Result<ActorRef, FabricError> {
        self.request(|tx| StageCommand::SpawnActor {
            role: Box::new(role),
            name: Some(name.to_string()),
            response_tx: tx,
        })
        .await?
    }

    /// Resolve an actor by alias or id: locally if known, otherwise by
    /// broadcasting a lookup and waiting for the first reply. Resolved
    /// remote actors are cached until [`forget`](Self::forget).
    pub async fn actor(&self, whois: impl Into<Whois>) -> Result<ActorRef, FabricError> {
        let whois = whois.into();
        self.request(|tx| StageCommand::ResolveActor {
            whois,
            response_tx: tx,
        })
        .await?
    }

    /// Route a message to an actor anywhere in the federation.
    pub async fn send(&self, to: ActorAddress, message: Value) -> Result<(), FabricError> {
        self.request(|tx| StageCommand::SendMessage {
            to,
            message,
            response_tx: tx,
        })
        .await?
    }

    /// Mark this stage ready. The first call re-sends the stage
    /// identification to every parent link; later calls do nothing.
    pub async fn ready(&self) -> Result<(), FabricError> {
        self.request(|tx| StageCommand::MarkReady { response_tx: tx })
            .await?
    }

    /// Evict a cached remote actor. Local actors are unaffected.
    pub fn forget(&self, actor: ActorId) -> Result<(), FabricError> {
        self.command(StageCommand::Forget { actor })
    }

    pub async fn actor_status(&self, actor: ActorId) -> Result<ActorStatus, FabricError> {
        self.request(|tx| StageCommand::GetActorStatus {
            actor,
            response_tx: tx,
        })
        .await
    }

    /// Link this stage to a peer over `channel`: exchange identification
    /// packets, then hand the link to a router. The first packet received
    /// must be the peer's identification.
    pub async fn adopt_link(
        &self,
        mut channel: Channel,
        role: LinkRole,
    ) -> Result<StageId, FabricError> {
        channel.send(StageMessage::Stage { stage: self.id }.into_value())?;
        let first = channel.recv().await?;
        let peer = match StageMessage::parse(first)? {
            Parsed::Protocol(StageMessage::Stage { stage }) => stage,
            other => {
                return Err(FabricError::ProtocolViolation(format!(
                    "expected stage identification, got {:?}",
                    other
                )))
            }
        };
        self.request(|tx| StageCommand::InstallLink {
            stage: peer,
            role,
            channel,
            response_tx: tx,
        })
        .await?
    }

    /// Spawn a dedicated child context running `boot` on a fresh stage
    /// linked under this one. Resolves once the child has marked itself
    /// ready, so `boot` must call [`ready`](Self::ready).
    pub async fn dedicated<F, Fut>(&self, boot: F) -> Result<StageId, FabricError>
    where
        F: FnOnce(StageHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let near = worker::spawn_dedicated(move |far| async move {
            let child = Stage::spawn(StageConfig::default(), ContextKind::Dedicated);
            match child.adopt_link(far, LinkRole::Parent).await {
                Ok(_) => boot(child).await,
                Err(e) => warn!("dedicated context failed to link: {}", e),
            }
        });
        let child = self.adopt_link(near, LinkRole::Child).await?;
        self.await_ready(child).await?;
        Ok(child)
    }

    /// Wait for the readiness notification of a linked stage: the stage
    /// re-sending its identification once its boot completes.
    pub async fn await_ready(&self, stage: StageId) -> Result<(), FabricError> {
        self.inbox
            .recv_matching(move |value| {
                value.get("type").and_then(Value::as_text) == Some("stage")
                    && value
                        .get("stage")
                        .and_then(Value::as_text)
                        .and_then(|s| StageId::parse(s).ok())
                        == Some(stage)
            })
            .await?;
        Ok(())
    }

    /// Connect to (or lazily start) the named shared context. Each connect
    /// gets its own link; the shared stage adopts every client as a parent.
    pub async fn shared<F, Fut>(&self, name: &str, boot: F) -> Result<StageId, FabricError>
    where
        F: FnOnce(StageHandle) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let near = worker::connect_shared(name, move |mut clients| async move {
            let shared = Stage::spawn(StageConfig::default(), ContextKind::Shared);
            boot(shared.clone()).await;
            while let Some(channel) = clients.accept().await {
                if let Err(e) = shared.adopt_link(channel, LinkRole::Parent).await {
                    warn!("shared context failed to adopt a client: {}", e);
                }
            }
        });
        self.adopt_link(near, LinkRole::Child).await
    }

    /// Stop the stage: close every actor mailbox, stop the routers, drop
    /// the links, and end the command loop.
    pub async fn shutdown(&self) -> Result<(), FabricError> {
        self.request(|tx| StageCommand::Shutdown { response_tx: tx })
            .await
    }
}

lazy_static! {
    static ref LIVE: StdMutex<Option<StageHandle>> = StdMutex::new(None);
}

/// The process-wide stage. The first call creates it (and therefore must run
/// inside the async runtime); later calls return the same handle.
pub fn live() -> StageHandle {
    let mut live = LIVE.lock().unwrap();
    live.get_or_insert_with(|| Stage::spawn(StageConfig::default(), ContextKind::Main))
        .clone()
}

/// The stage state, owned by its command loop.
pub struct Stage {
    id: StageId,
    names: HashMap<String, ActorId>,
    actors: HashMap<ActorId, ActorEntry>,
    links: HashMap<StageId, Link>,
    is_ready: bool,
    next_seq: u64,
    seen: router::SeenSet,
    inbox: Mailbox,
    handle: StageHandle,
    shutdown: ShutdownController,
}

impl Stage {
    /// Create a stage and start its command loop, returning the handle.
    pub fn spawn(config: StageConfig, context: ContextKind) -> StageHandle {
        let id = StageId::generate();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let inbox = Mailbox::from_queue();
        let handle = StageHandle {
            id,
            context,
            commands: commands_tx,
            inbox: inbox.clone(),
        };
        let stage = Stage {
            id,
            names: HashMap::new(),
            actors: HashMap::new(),
            links: HashMap::new(),
            is_ready: false,
            next_seq: 0,
            seen: router::SeenSet::new(config.seen_capacity),
            inbox,
            handle: handle.clone(),
            shutdown: ShutdownController::new(),
        };
        tokio::spawn(stage.run(commands_rx));
        match &config.name {
            Some(name) => info!("stage {} ({}) started ({:?})", id, name, context),
            None => info!("stage {} started ({:?})", id, context),
        }
        handle
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<StageCommand>) {
        while let Some(command) = commands.recv().await {
            debug!("stage {} command: {}", self.id, command.to_log());
            match command {
                StageCommand::SpawnActor {
                    role,
                    name,
                    response_tx,
                } => {
                    let _ = response_tx.send(Ok(self.spawn_actor(role, name)));
                }
                StageCommand::ResolveActor { whois, response_tx } => {
                    self.resolve_actor(whois, response_tx);
                }
                StageCommand::CacheActor { address } => {
                    self.actors
                        .entry(address.actor)
                        .or_insert(ActorEntry::Remote(address));
                }
                StageCommand::SendMessage {
                    to,
                    message,
                    response_tx,
                } => {
                    let datagram = self.stamp(to, message);
                    let _ = response_tx.send(self.route(datagram, None));
                }
                StageCommand::Deliver {
                    datagram,
                    arrived_on,
                } => {
                    if let Err(e) = self.route(datagram, arrived_on) {
                        warn!("failed to route datagram: {}", e);
                    }
                }
                StageCommand::WhoisLookup { whois, reply, link } => {
                    self.answer_whois(whois, reply, link);
                }
                StageCommand::InstallLink {
                    stage,
                    role,
                    channel,
                    response_tx,
                } => {
                    let _ = response_tx.send(Ok(self.install_link(stage, role, channel)));
                }
                StageCommand::MarkReady { response_tx } => {
                    let _ = response_tx.send(self.mark_ready());
                }
                StageCommand::Forget { actor } => {
                    if matches!(self.actors.get(&actor), Some(ActorEntry::Remote(_))) {
                        self.actors.remove(&actor);
                    }
                }
                StageCommand::GetActorStatus { actor, response_tx } => {
                    let status = match self.actors.get(&actor) {
                        Some(ActorEntry::Local { task, .. }) if !task.is_finished() => {
                            ActorStatus::Running
                        }
                        _ => ActorStatus::Stopped,
                    };
                    let _ = response_tx.send(status);
                }
                StageCommand::LinkClosed { stage } => {
                    info!("link to stage {} closed", stage);
                    self.links.remove(&stage);
                }
                StageCommand::Shutdown { response_tx } => {
                    self.wind_down().await;
                    let _ = response_tx.send(());
                    break;
                }
            }
        }
        info!("stage {} stopped", self.id);
    }

    fn spawn_actor(&mut self, role: Box<dyn Role>, name: Option<String>) -> ActorRef {
        let actor = ActorId::generate();
        let address = ActorAddress::new(actor, self.id);
        let mailbox = Mailbox::from_queue();
        let ctx = ActorCtx::new(address, self.handle.clone());
        let task = actor::spawn_actor_loop(role, ctx, mailbox.clone());
        self.actors.insert(actor, ActorEntry::Local { mailbox, task });
        if let Some(name) = name {
            info!("registered actor {} as {:?}", actor, name);
            self.names.insert(name, actor);
        }
        ActorRef::new(address, self.handle.clone())
    }

    fn lookup(&self, whois: &Whois) -> Option<ActorAddress> {
        match whois {
            Whois::Alias(name) => self
                .names
                .get(name)
                .map(|actor| ActorAddress::new(*actor, self.id)),
            Whois::Id(id) => self.actors.get(id).map(|entry| match entry {
                ActorEntry::Local { .. } => ActorAddress::new(*id, self.id),
                ActorEntry::Remote(address) => *address,
            }),
        }
    }

    fn resolve_actor(
        &mut self,
        whois: Whois,
        response_tx: oneshot::Sender<Result<ActorRef, FabricError>>,
    ) {
        if let Some(address) = self.lookup(&whois) {
            let _ = response_tx.send(Ok(ActorRef::new(address, self.handle.clone())));
            return;
        }
        if self.links.is_empty() {
            let _ = response_tx.send(Err(match whois {
                Whois::Id(id) => FabricError::UnknownActor(id),
                Whois::Alias(name) => FabricError::UnknownName(name),
            }));
            return;
        }

        let reply = Uuid::new_v4();
        for (stage, link) in &self.links {
            let packet = StageMessage::WhoisActor {
                whois: whois.clone(),
                reply,
            }
            .into_value();
            if let Err(e) = link.sender.send(packet) {
                warn!("failed to query link {}: {}", stage, e);
            }
        }

        // Wait for the first matching reply off the loop, so resolution does
        // not stall routing.
        let inbox = self.inbox.clone();
        let handle = self.handle.clone();
        let reply_text = reply.to_string();
        tokio::spawn(async move {
            let received = inbox
                .recv_matching(|value| {
                    value.get("type").and_then(Value::as_text) == Some("actor")
                        && value.get("reply").and_then(Value::as_text)
                            == Some(reply_text.as_str())
                })
                .await;
            let response = match received {
                Ok(value) => match StageMessage::parse(value) {
                    Ok(Parsed::Protocol(StageMessage::Actor { actor, .. })) => {
                        let _ = handle.command(StageCommand::CacheActor { address: actor });
                        Ok(ActorRef::new(actor, handle.clone()))
                    }
                    _ => Err(FabricError::ProtocolViolation(
                        "malformed lookup reply".into(),
                    )),
                },
                Err(e) => Err(e),
            };
            let _ = response_tx.send(response);
        });
    }

    fn answer_whois(&mut self, whois: Whois, reply: Uuid, link: StageId) {
        let address = match self.lookup(&whois) {
            Some(address) => address,
            None => {
                debug!("no answer for whois {}", whois);
                return;
            }
        };
        if let Some(link) = self.links.get(&link) {
            let packet = StageMessage::Actor {
                reply,
                actor: address,
            }
            .into_value();
            if let Err(e) = link.sender.send(packet) {
                warn!("failed to answer lookup: {}", e);
            }
        }
    }

    fn stamp(&mut self, to: ActorAddress, message: Value) -> Datagram {
        let seq = self.next_seq;
        self.next_seq += 1;
        Datagram {
            to,
            origin: self.id,
            seq,
            message,
        }
    }

    fn route(&mut self, datagram: Datagram, arrived_on: Option<StageId>) -> Result<(), FabricError> {
        if datagram.to.stage == self.id {
            return match self.actors.get(&datagram.to.actor) {
                Some(ActorEntry::Local { mailbox, .. }) => mailbox.send(datagram.message),
                _ => Err(FabricError::UnknownActor(datagram.to.actor)),
            };
        }

        if let Some(link) = self.links.get(&datagram.to.stage) {
            debug!("forwarding datagram for {}", datagram.to);
            return link.sender.send(StageMessage::Send(datagram).into_value());
        }

        // No direct route: flood every other link, once per datagram
        // identity.
        if !self.seen.insert((datagram.origin, datagram.seq)) {
            debug!(
                "dropping already-broadcast datagram {} from {}",
                datagram.seq, datagram.origin
            );
            return Ok(());
        }
        let targets: Vec<StageId> = self
            .links
            .keys()
            .filter(|stage| Some(**stage) != arrived_on)
            .copied()
            .collect();
        if targets.is_empty() {
            warn!("no route for datagram addressed to {}", datagram.to);
            return Ok(());
        }

        let Datagram {
            to,
            origin,
            seq,
            message,
        } = datagram;
        let mut payloads = Vec::with_capacity(targets.len());
        for _ in 1..targets.len() {
            payloads.push(message.try_clone()?);
        }
        payloads.push(message);
        for (stage, payload) in targets.iter().zip(payloads) {
            if let Some(link) = self.links.get(stage) {
                let packet = StageMessage::Send(Datagram {
                    to,
                    origin,
                    seq,
                    message: payload,
                })
                .into_value();
                if let Err(e) = link.sender.send(packet) {
                    warn!("broadcast to stage {} failed: {}", stage, e);
                }
            }
        }
        Ok(())
    }

    fn install_link(&mut self, stage: StageId, role: LinkRole, channel: Channel) -> StageId {
        let sender = channel.sender();
        let router = router::spawn_router(
            stage,
            channel,
            self.handle.commands.clone(),
            self.inbox.clone(),
            self.shutdown.subscribe(),
        );
        info!("linked stage {} as {:?}", stage, role);
        self.links.insert(
            stage,
            Link {
                role,
                sender,
                router,
            },
        );
        stage
    }

    fn mark_ready(&mut self) -> Result<(), FabricError> {
        if self.is_ready {
            debug!("stage {} already marked ready", self.id);
            return Ok(());
        }
        self.is_ready = true;
        info!("stage {} ready", self.id);
        for (stage, link) in &self.links {
            if link.role == LinkRole::Parent {
                let packet = StageMessage::Stage { stage: self.id }.into_value();
                if let Err(e) = link.sender.send(packet) {
                    warn!("failed to notify parent {}: {}", stage, e);
                }
            }
        }
        Ok(())
    }

    async fn wind_down(&mut self) {
        info!("stage {} shutting down", self.id);
        for (_, entry) in self.actors.drain() {
            if let ActorEntry::Local { mailbox, .. } = entry {
                mailbox.close();
            }
        }
        self.names.clear();
        let controller = std::mem::take(&mut self.shutdown);
        controller.signal_shutdown().await;
        self.links.clear();
        self.inbox.close();
    }
}

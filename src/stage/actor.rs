//! The actor execution model.
//!
//! A [`Role`] is a suspendable step routine: the engine advances it once at
//! boot and then once per delivered message, and each advance returns what to
//! wait for next — any message, a message matching a filter, or nothing
//! (done). Driving a role against its mailbox gives selective receive with
//! the filter decided step by step.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::errors::FabricError;
use crate::id::ActorAddress;
use crate::mailbox::Mailbox;
use crate::stage::StageHandle;
use crate::value::Value;

/// A message filter yielded by a role to request selective receive.
pub type Filter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// What a role waits for after an advance.
pub enum Step {
    /// Wait for the next message, whatever it is.
    Receive,
    /// Wait for the first message satisfying the filter.
    ReceiveMatching(Filter),
    /// The routine has terminated.
    Done,
}

impl Step {
    /// Shorthand for yielding a filter.
    pub fn matching<F>(pred: F) -> Step
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Step::ReceiveMatching(Arc::new(pred))
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Receive => write!(f, "Receive"),
            Step::ReceiveMatching(_) => write!(f, "ReceiveMatching"),
            Step::Done => write!(f, "Done"),
        }
    }
}

/// The behavior of a local actor.
#[async_trait]
pub trait Role: Send + 'static {
    /// Advanced once before any message is delivered.
    async fn boot(&mut self, _ctx: &ActorCtx) -> Result<Step, FabricError> {
        Ok(Step::Receive)
    }

    /// Advanced once per delivered message.
    async fn step(&mut self, ctx: &ActorCtx, message: Value) -> Result<Step, FabricError>;
}

/// What a role sees of itself: its own address and the stage hosting it.
pub struct ActorCtx {
    address: ActorAddress,
    stage: StageHandle,
}

impl ActorCtx {
    pub(crate) fn new(address: ActorAddress, stage: StageHandle) -> Self {
        Self { address, stage }
    }

    pub fn address(&self) -> ActorAddress {
        self.address
    }

    /// A sendable reference to this actor itself.
    pub fn self_ref(&self) -> ActorRef {
        ActorRef::new(self.address, self.stage.clone())
    }

    pub fn stage(&self) -> &StageHandle {
        &self.stage
    }
}

/// A handle on an actor anywhere in the federation: its address plus a stage
/// that can route to it. Local and remote actors expose the same surface.
#[derive(Clone)]
pub struct ActorRef {
    address: ActorAddress,
    stage: StageHandle,
}

impl ActorRef {
    pub(crate) fn new(address: ActorAddress, stage: StageHandle) -> Self {
        Self { address, stage }
    }

    pub fn address(&self) -> ActorAddress {
        self.address
    }

    /// Route a message to this actor, wherever it lives.
    pub async fn send(&self, message: Value) -> Result<(), FabricError> {
        self.stage.send(self.address, message).await
    }
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorRef({})", self.address)
    }
}

/// Drive a role against its mailbox until it finishes or the mailbox closes.
pub(crate) fn spawn_actor_loop(
    mut role: Box<dyn Role>,
    ctx: ActorCtx,
    mailbox: Mailbox,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut step = match role.boot(&ctx).await {
            Ok(step) => step,
            Err(e) => {
                error!("actor {} failed to boot: {}", ctx.address(), e);
                return;
            }
        };

        loop {
            let received = match &step {
                Step::Done => break,
                Step::Receive => mailbox.recv().await,
                Step::ReceiveMatching(filter) => {
                    let filter = filter.clone();
                    mailbox.recv_matching(move |value| filter(value)).await
                }
            };
            let message = match received {
                Ok(message) => message,
                // Mailbox closed underneath the actor; wind down quietly.
                Err(FabricError::Closed) => break,
                Err(e) => {
                    error!("actor {} receive failed: {}", ctx.address(), e);
                    break;
                }
            };
            step = match role.step(&ctx, message).await {
                Ok(step) => step,
                Err(e) => {
                    error!("actor {} step failed: {}", ctx.address(), e);
                    break;
                }
            };
        }
        debug!("actor {} finished", ctx.address());
    })
}

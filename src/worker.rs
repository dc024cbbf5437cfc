//! Execution-context adapter: spawn dedicated peer contexts and connect to
//! named shared ones, each behind a channel.
//!
//! A dedicated context is a fresh task owning the far half of a port pair; a
//! shared context is started once per name and accepts one fresh port pair
//! per connect. What runs inside the context is up to the caller (the stage
//! layer boots a child stage there).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use lazy_static::lazy_static;
use tokio::sync::mpsc;

use crate::channel::Channel;

/// Which kind of execution context a stage is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// The root context of the process.
    Main,
    /// A context spawned for exactly one parent.
    Dedicated,
    /// A named context shared by every connector.
    Shared,
}

/// Spawn a dedicated context running `body` against the far half of a fresh
/// channel pair, returning the near half.
pub fn spawn_dedicated<F, Fut>(body: F) -> Channel
where
    F: FnOnce(Channel) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (near, far) = Channel::pair();
    tokio::spawn(async move {
        body(far).await;
    });
    near
}

/// The stream of client channels arriving at a shared context.
pub struct SharedClients {
    rx: mpsc::UnboundedReceiver<Channel>,
}

impl SharedClients {
    /// The next connecting client, or `None` once the registry entry has
    /// been replaced.
    pub async fn accept(&mut self) -> Option<Channel> {
        self.rx.recv().await
    }
}

lazy_static! {
    static ref SHARED: Mutex<HashMap<String, mpsc::UnboundedSender<Channel>>> =
        Mutex::new(HashMap::new());
}

/// Connect to the named shared context, starting it with `body` if this is
/// the first connect (or the previous context has gone away). Returns the
/// near half of a channel whose far half is handed to the context.
pub fn connect_shared<F, Fut>(name: &str, body: F) -> Channel
where
    F: FnOnce(SharedClients) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (near, far) = Channel::pair();
    let mut registry = SHARED.lock().unwrap();

    let far = match registry.get(name) {
        Some(tx) => match tx.send(far) {
            Ok(()) => return near,
            // The context died; fall through and start a fresh one.
            Err(mpsc::error::SendError(far)) => far,
        },
        None => far,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(far);
    registry.insert(name.to_string(), tx);
    tokio::spawn(async move {
        body(SharedClients { rx }).await;
    });
    near
}

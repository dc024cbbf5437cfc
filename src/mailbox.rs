//! Mailboxes: channels with buffered selective receive.
//!
//! `recv_matching` is the selective-receive primitive: it returns the first
//! buffered-or-incoming message satisfying the predicate, stashing earlier
//! non-matching messages in arrival order. A later `recv` drains the stash
//! before reading fresh from the channel.
//!
//! Any number of receivers may wait concurrently. Each scans the stash under
//! a short-held lock; the channel itself is drained by whichever waiter
//! holds the receive slot, and every stashed arrival wakes the rest to
//! re-scan. A message is delivered to exactly one receiver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{watch, Mutex};

use crate::channel::{Backlog, Channel, ChannelSender};
use crate::errors::FabricError;
use crate::value::Value;

/// A channel wrapper adding an out-of-order buffer. Cheap to clone; clones
/// share the channel, the stash, and the close latch.
#[derive(Clone)]
pub struct Mailbox {
    sender: ChannelSender,
    /// The receive slot: at most one waiter drains the channel at a time.
    channel: Arc<Mutex<Channel>>,
    stash: Arc<StdMutex<Backlog>>,
    closed: Arc<AtomicBool>,
    /// Bumped on every stash push and on close, waking waiters to re-scan.
    events: Arc<watch::Sender<u64>>,
}

impl Mailbox {
    pub fn wrap(channel: Channel) -> Self {
        let (events, _) = watch::channel(0);
        Self {
            sender: channel.sender(),
            channel: Arc::new(Mutex::new(channel)),
            stash: Arc::new(StdMutex::new(Backlog::default())),
            closed: Arc::new(AtomicBool::new(false)),
            events: Arc::new(events),
        }
    }

    /// A mailbox over an in-process queue, the usual shape for an actor's
    /// private inbox.
    pub fn from_queue() -> Self {
        Self::wrap(Channel::from_queue())
    }

    fn bump(&self) {
        self.events.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Send on the wrapped channel. Does not contend with receivers.
    pub fn send(&self, value: Value) -> Result<(), FabricError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FabricError::Closed);
        }
        self.sender.send(value)
    }

    /// The oldest stashed message, or the next from the channel.
    pub async fn recv(&self) -> Result<Value, FabricError> {
        self.recv_matching(|_| true).await
    }

    /// The first buffered-or-incoming message satisfying `pred`. Messages
    /// that arrive while waiting and do not match are stashed in order and
    /// offered to every other waiter. Fails with `Closed` if the channel
    /// closes before a match arrives.
    pub async fn recv_matching<F>(&self, pred: F) -> Result<Value, FabricError>
    where
        F: Fn(&Value) -> bool,
    {
        loop {
            let mut events = self.events.subscribe();
            events.borrow_and_update();

            if let Some(value) = self.stash.lock().unwrap().take_matching(&pred) {
                return Ok(value);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(FabricError::Closed);
            }

            tokio::select! {
                mut channel = self.channel.lock() => {
                    // A match may have been stashed while waiting for the
                    // receive slot.
                    if let Some(value) = self.stash.lock().unwrap().take_matching(&pred) {
                        return Ok(value);
                    }
                    let mut slot_events = self.events.subscribe();
                    if self.closed.load(Ordering::SeqCst) {
                        channel.close();
                        return Err(FabricError::Closed);
                    }
                    tokio::select! {
                        received = channel.recv() => match received {
                            Ok(value) => {
                                if pred(&value) {
                                    return Ok(value);
                                }
                                self.stash.lock().unwrap().push(value);
                                self.bump();
                            }
                            Err(FabricError::Closed) => {
                                self.closed.store(true, Ordering::SeqCst);
                                self.bump();
                                return Err(FabricError::Closed);
                            }
                            Err(e) => return Err(e),
                        },
                        _ = slot_events.changed() => {
                            if self.closed.load(Ordering::SeqCst) {
                                channel.close();
                                return Err(FabricError::Closed);
                            }
                        }
                    }
                }
                _ = events.changed() => {}
            }
        }
    }

    /// Iteration form of `recv`: `None` once the channel has closed and the
    /// stash is drained.
    pub async fn next(&self) -> Option<Value> {
        self.recv().await.ok()
    }

    /// Close the mailbox: wakes every waiting receiver with `Closed` and
    /// releases the underlying channel.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut channel) = self.channel.try_lock() {
            channel.close();
        }
        self.bump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_selective_receive_preserves_order() {
        let mailbox = Mailbox::from_queue();
        for v in [
            Value::Int(1),
            Value::text("skip"),
            Value::Int(2),
            Value::text("skip"),
        ] {
            mailbox.send(v).unwrap();
        }

        let is_number = |v: &Value| v.as_int().is_some();
        assert_eq!(mailbox.recv_matching(is_number).await.unwrap(), Value::Int(1));
        assert_eq!(mailbox.recv_matching(is_number).await.unwrap(), Value::Int(2));
        // The stashed non-matches come back before anything fresh.
        assert_eq!(mailbox.recv().await.unwrap(), Value::text("skip"));
        assert_eq!(mailbox.recv().await.unwrap(), Value::text("skip"));
    }

    #[tokio::test]
    async fn test_match_waits_for_late_arrival() {
        let mailbox = Mailbox::from_queue();
        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                mailbox
                    .recv_matching(|v| v.as_text() == Some("wanted"))
                    .await
            })
        };

        mailbox.send(Value::text("noise")).unwrap();
        mailbox.send(Value::text("wanted")).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), Value::text("wanted"));
        assert_eq!(mailbox.recv().await.unwrap(), Value::text("noise"));
    }

    #[tokio::test]
    async fn test_concurrent_matchers_resolve_independently() {
        let mailbox = Mailbox::from_queue();

        let first = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                mailbox
                    .recv_matching(|v| v.as_text() == Some("alpha"))
                    .await
            })
        };
        let second = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                mailbox
                    .recv_matching(|v| v.as_text() == Some("beta"))
                    .await
            })
        };
        tokio::task::yield_now().await;

        // The second waiter's match arrives first; it must resolve even
        // though the first waiter is still pending.
        mailbox.send(Value::text("beta")).unwrap();
        let got = timeout(Duration::from_secs(1), second)
            .await
            .expect("second matcher starved behind the first")
            .unwrap()
            .unwrap();
        assert_eq!(got, Value::text("beta"));

        mailbox.send(Value::text("alpha")).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Value::text("alpha"));
    }

    #[tokio::test]
    async fn test_match_fails_on_close() {
        let mailbox = Mailbox::from_queue();
        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.recv_matching(|_| false).await })
        };
        tokio::task::yield_now().await;
        mailbox.close();
        assert!(matches!(waiter.await.unwrap(), Err(FabricError::Closed)));
    }

    #[tokio::test]
    async fn test_wrapped_pair_delivers_from_peer() {
        let (near, far) = Channel::pair();
        let mailbox = Mailbox::wrap(far);
        near.send(Value::Int(5)).unwrap();
        assert_eq!(mailbox.recv().await.unwrap(), Value::Int(5));
    }
}

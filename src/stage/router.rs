//! The per-link router and the broadcast cycle breaker.
//!
//! One router task runs for every link. Lookup requests and datagrams are
//! handed to the stage loop; identification packets and anything that is not
//! stage protocol land in the stage's internal mailbox.

use std::collections::{HashSet, VecDeque};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::id::StageId;
use crate::mailbox::Mailbox;
use crate::messages::{Parsed, StageCommand, StageMessage};
use crate::shutdown::ShutdownReceiver;

/// Bounded filter of datagram identities already broadcast, keyed by
/// `(origin stage, sequence)`. Consulted ahead of the broadcast fan-out so a
/// datagram travelling a cycle is dropped instead of re-emitted. Oldest
/// entries are evicted first once the capacity is reached.
pub(crate) struct SeenSet {
    capacity: usize,
    order: VecDeque<(StageId, u64)>,
    seen: HashSet<(StageId, u64)>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record the key. Returns `true` if it was not seen before.
    pub fn insert(&mut self, key: (StageId, u64)) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key);
        self.seen.insert(key);
        true
    }
}

/// Consume one link continuously, dispatching each received message.
pub(crate) fn spawn_router(
    link: StageId,
    mut channel: Channel,
    commands: mpsc::UnboundedSender<StageCommand>,
    inbox: Mailbox,
    shutdown: ShutdownReceiver,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = shutdown.wait_for_shutdown();
        tokio::pin!(shutdown);

        loop {
            let value = tokio::select! {
                signal = &mut shutdown => {
                    debug!("router for link {} shutting down", link);
                    channel.close();
                    signal.acknowledge();
                    return;
                }
                received = channel.next() => match received {
                    Some(value) => value,
                    None => break,
                },
            };

            match StageMessage::parse(value) {
                Ok(Parsed::Protocol(StageMessage::WhoisActor { whois, reply })) => {
                    if commands
                        .send(StageCommand::WhoisLookup { whois, reply, link })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Parsed::Protocol(StageMessage::Send(datagram))) => {
                    if commands
                        .send(StageCommand::Deliver {
                            datagram,
                            arrived_on: Some(link),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                // Identification and lookup replies are stage-level traffic.
                Ok(Parsed::Protocol(other)) => {
                    if inbox.send(other.into_value()).is_err() {
                        break;
                    }
                }
                Ok(Parsed::Other(value)) => {
                    if inbox.send(value).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("dropping malformed packet on link {}: {}", link, e);
                }
            }
        }

        debug!("link {} closed", link);
        let _ = commands.send(StageCommand::LinkClosed { stage: link });
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_set_rejects_duplicates() {
        let mut seen = SeenSet::new(8);
        let key = (StageId::generate(), 1);
        assert!(seen.insert(key));
        assert!(!seen.insert(key));
    }

    #[test]
    fn test_seen_set_evicts_oldest() {
        let mut seen = SeenSet::new(2);
        let a = (StageId::generate(), 1);
        let b = (StageId::generate(), 2);
        let c = (StageId::generate(), 3);
        assert!(seen.insert(a));
        assert!(seen.insert(b));
        assert!(seen.insert(c));
        // `a` fell out of the window, so it reads as new again.
        assert!(seen.insert(a));
        // `c` is still inside the window.
        assert!(!seen.insert(c));
    }
}

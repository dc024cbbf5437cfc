use tokio::sync::oneshot;
use tracing::debug;

/// A signal telling a component to stop, with an optional ack the component
/// fires once it has wound down.
#[derive(Debug)]
pub struct ShutdownSignal {
    pub sender: Option<oneshot::Sender<()>>,
}

impl ShutdownSignal {
    /// Acknowledge completion to whoever signaled, if they asked for it.
    pub fn acknowledge(self) {
        if let Some(sender) = self.sender {
            let _ = sender.send(());
        }
    }
}

/// Controller that can broadcast shutdown signals to multiple receivers and
/// wait for each to acknowledge.
pub struct ShutdownController {
    subscribers: Vec<oneshot::Sender<ShutdownSignal>>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Get a new receiver for this controller
    pub fn subscribe(&mut self) -> ShutdownReceiver {
        let (sender, receiver) = oneshot::channel();
        self.subscribers.push(sender);
        ShutdownReceiver { receiver }
    }

    /// Signal all receivers and wait for their acknowledgements.
    pub async fn signal_shutdown(self) {
        debug!("signaling shutdown to all subscribers");
        let mut acks = Vec::new();
        for subscriber in self.subscribers {
            let (responder, ack) = oneshot::channel();
            if subscriber
                .send(ShutdownSignal {
                    sender: Some(responder),
                })
                .is_ok()
            {
                acks.push(ack);
            }
        }
        for ack in acks {
            if let Err(e) = ack.await {
                debug!("subscriber dropped before acknowledging shutdown: {:?}", e);
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that can wait for a shutdown signal
pub struct ShutdownReceiver {
    receiver: oneshot::Receiver<ShutdownSignal>,
}

impl ShutdownReceiver {
    /// Wait for a shutdown signal to be received. A dropped controller
    /// counts as a shutdown with nobody waiting on the ack.
    pub async fn wait_for_shutdown(self) -> ShutdownSignal {
        match self.receiver.await {
            Ok(signal) => signal,
            Err(_) => ShutdownSignal { sender: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_reaches_every_subscriber() {
        let mut controller = ShutdownController::new();
        let a = controller.subscribe();
        let b = controller.subscribe();

        let worker = |receiver: ShutdownReceiver| {
            tokio::spawn(async move {
                receiver.wait_for_shutdown().await.acknowledge();
            })
        };
        let ta = worker(a);
        let tb = worker(b);

        controller.signal_shutdown().await;
        ta.await.unwrap();
        tb.await.unwrap();
    }
}

//! In-process safety channel backed by a tokio broadcast channel.
//!
//! Used when several instances share one process (local cluster mode and
//! integration tests). Every member observes every envelope, including its
//! own, which matches a broker that echoes to the publisher.

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::error::EnvError;
use crate::network::MessageBus;
use crate::types::{BusEnvelope, InstanceId};

/// Shared hub that hands out bus handles for one topic.
#[derive(Clone)]
pub struct LocalBusHub {
    topic: String,
    tx: broadcast::Sender<BusEnvelope>,
}

impl LocalBusHub {
    /// Creates a hub with room for `capacity` undelivered envelopes per member.
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            topic: topic.into(),
            tx,
        }
    }

    /// Joins the hub as the given instance.
    pub fn join(&self, instance: InstanceId) -> LocalBus {
        LocalBus {
            instance,
            topic: self.topic.clone(),
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
        }
    }
}

/// One member's handle on a `LocalBusHub`.
pub struct LocalBus {
    instance: InstanceId,
    topic: String,
    tx: broadcast::Sender<BusEnvelope>,
    rx: Mutex<broadcast::Receiver<BusEnvelope>>,
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, envelope: BusEnvelope) -> Result<(), EnvError> {
        self.tx.send(envelope).map(|_| ()).map_err(|_| EnvError::BusClosed)
    }

    async fn recv(&self) -> Option<BusEnvelope> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Loss is tolerated by the protocol; keep going.
                    warn!(instance = %self.instance, skipped, "local bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

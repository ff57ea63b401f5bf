//! Messaging and neighbor-query abstractions for pendulum instances.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{BusEnvelope, InstanceId, NeighborReading};

/// The shared publish/subscribe safety channel.
///
/// # Implementations
///
/// - **Production**: zenoh session on a single key expression
/// - **In-process**: `LocalBus` over a tokio broadcast channel
/// - **Simulation**: lossy in-memory bus with fault injection
///
/// # Delivery
///
/// ```text
/// Instance 3                 Topic                 Instance 1..5
///   |                          |                        |
///   |-- publish(HALT ...) ---->|                        |
///   |                          |-- [best effort] ------>|-- recv() -> envelope
///   |<-------------------- [echo, maybe] ---------------|
/// ```
///
/// Delivery is best effort and unordered; publishers may or may not observe
/// their own messages.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publishes an envelope to every subscriber of the topic.
    ///
    /// # Returns
    /// * `Ok(())` - Envelope handed to the transport
    /// * `Err(EnvError)` - Immediate failure; the envelope is dropped
    ///
    /// # Note
    /// Success does not guarantee delivery.
    async fn publish(&self, envelope: BusEnvelope) -> Result<(), EnvError>;

    /// Receives the next envelope from the topic.
    ///
    /// Returns `None` once the channel is closed.
    async fn recv(&self) -> Option<BusEnvelope>;

    /// Returns the topic this bus is bound to.
    fn topic(&self) -> &str;
}

/// Read-only query of a neighbor's published position and radius.
#[async_trait]
pub trait NeighborSource: Send + Sync + 'static {
    /// Fetches the latest reading of the given instance.
    ///
    /// Implementations should not retry; the caller applies its own timeout.
    async fn fetch(&self, instance: InstanceId) -> Result<NeighborReading, EnvError>;
}

/// Fault injection for simulated networks.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two instance sets.
    fn partition(&self, group_a: &[InstanceId], group_b: &[InstanceId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets delivery latency for a specific link.
    fn set_link_latency(&self, from: InstanceId, to: InstanceId, latency_ms: u64);

    /// Sets message loss probability for a link (0.0 - 1.0).
    fn set_link_loss(&self, from: InstanceId, to: InstanceId, loss_rate: f64);
}

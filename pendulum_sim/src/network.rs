//! Simulated safety channel with fault injection.

use pendulum_env::{BusEnvelope, InstanceId, NetworkController};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delivery counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Envelopes published
    pub published: u64,

    /// Per-recipient copies queued for delivery
    pub queued: u64,

    /// Per-recipient copies lost to partitions or loss
    pub dropped: u64,

    /// Per-recipient copies handed to an instance
    pub delivered: u64,
}

/// The in-memory topic shared by every simulated instance.
///
/// Publishing fans an envelope out to each member through the controller's
/// link rules; copies sit in a time-ordered queue until the world's clock
/// reaches their delivery time. Ties are broken by publish order, so a run
/// is fully determined by the seed.
pub struct SimNetwork {
    controller: Arc<SimNetworkController>,
    members: Vec<InstanceId>,
    in_flight: BTreeMap<(u64, u64), (InstanceId, BusEnvelope)>,
    seq: u64,
    stats: NetworkStats,
}

impl SimNetwork {
    /// Creates a topic with the given members.
    pub fn new(controller: Arc<SimNetworkController>, members: Vec<InstanceId>) -> Self {
        Self {
            controller,
            members,
            in_flight: BTreeMap::new(),
            seq: 0,
            stats: NetworkStats::default(),
        }
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        &self.controller
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    /// Number of copies still in flight.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Publishes to every member, including the sender.
    ///
    /// Each copy is independently subject to partitions, loss and latency.
    pub fn publish<R: Rng>(&mut self, envelope: BusEnvelope, now_ns: u64, rng: &mut R) {
        self.stats.published += 1;
        let from = envelope.from;

        for &to in &self.members {
            if from != to {
                if !self.controller.can_communicate(from, to) {
                    trace!(%from, %to, "copy dropped by partition");
                    self.stats.dropped += 1;
                    continue;
                }
                let loss = self.controller.get_loss(from, to);
                if loss > 0.0 && rng.gen_bool(loss) {
                    trace!(%from, %to, loss, "copy lost");
                    self.stats.dropped += 1;
                    continue;
                }
            }

            let latency_ns = self.controller.get_latency(from, to) * 1_000_000;
            self.in_flight
                .insert((now_ns + latency_ns, self.seq), (to, envelope.clone()));
            self.seq += 1;
            self.stats.queued += 1;
        }
    }

    /// Pops the next copy whose delivery time has come.
    pub fn pop_due(&mut self, now_ns: u64) -> Option<(InstanceId, BusEnvelope)> {
        let (&(deliver_at, _), _) = self.in_flight.first_key_value()?;
        if deliver_at > now_ns {
            return None;
        }
        let (_, copy) = self.in_flight.pop_first()?;
        self.stats.delivered += 1;
        Some(copy)
    }
}

/// Network controller for fault injection.
pub struct SimNetworkController {
    /// Per-link latency in milliseconds
    link_latency: Mutex<HashMap<(InstanceId, InstanceId), u64>>,

    /// Per-link message loss rate (0.0 - 1.0)
    link_loss: Mutex<HashMap<(InstanceId, InstanceId), f64>>,

    /// Active partitions (instances that cannot communicate)
    partitions: Mutex<Vec<(Vec<InstanceId>, Vec<InstanceId>)>>,
}

impl SimNetworkController {
    /// Creates a controller with every link healthy.
    pub fn new() -> Self {
        Self {
            link_latency: Mutex::new(HashMap::new()),
            link_loss: Mutex::new(HashMap::new()),
            partitions: Mutex::new(Vec::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Checks if two instances can communicate (not partitioned).
    pub fn can_communicate(&self, from: InstanceId, to: InstanceId) -> bool {
        let partitions = lock(&self.partitions);

        !partitions.iter().any(|(group_a, group_b)| {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            (from_in_a && to_in_b) || (from_in_b && to_in_a)
        })
    }

    /// Gets the latency for a link (default 0).
    pub fn get_latency(&self, from: InstanceId, to: InstanceId) -> u64 {
        lock(&self.link_latency).get(&(from, to)).copied().unwrap_or(0)
    }

    /// Gets the loss rate for a link (default 0.0).
    pub fn get_loss(&self, from: InstanceId, to: InstanceId) -> f64 {
        lock(&self.link_loss).get(&(from, to)).copied().unwrap_or(0.0)
    }
}

impl Default for SimNetworkController {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, group_a: &[InstanceId], group_b: &[InstanceId]) {
        lock(&self.partitions).push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        lock(&self.partitions).clear();
    }

    fn set_link_latency(&self, from: InstanceId, to: InstanceId, latency_ms: u64) {
        lock(&self.link_latency).insert((from, to), latency_ms);
    }

    fn set_link_loss(&self, from: InstanceId, to: InstanceId, loss_rate: f64) {
        lock(&self.link_loss).insert((from, to), loss_rate.clamp(0.0, 1.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn ids(range: std::ops::RangeInclusive<u32>) -> Vec<InstanceId> {
        range.map(InstanceId).collect()
    }

    fn drain(net: &mut SimNetwork, now_ns: u64) -> Vec<InstanceId> {
        std::iter::from_fn(|| net.pop_due(now_ns)).map(|(to, _)| to).collect()
    }

    #[test]
    fn test_network_controller_partition() {
        let controller = SimNetworkController::new();
        let (a, b, c) = (InstanceId(1), InstanceId(2), InstanceId(3));

        assert!(controller.can_communicate(a, b));
        controller.partition(&[a], &[b, c]);

        assert!(!controller.can_communicate(a, b));
        assert!(!controller.can_communicate(c, a));
        assert!(controller.can_communicate(b, c));

        controller.heal_all();
        assert!(controller.can_communicate(a, b));
    }

    #[test]
    fn test_network_controller_latency_is_directional() {
        let controller = SimNetworkController::new();
        let (a, b) = (InstanceId(1), InstanceId(2));

        controller.set_link_latency(a, b, 100);
        assert_eq!(controller.get_latency(a, b), 100);
        assert_eq!(controller.get_latency(b, a), 0);
    }

    #[test]
    fn test_publish_reaches_every_member_including_sender() {
        let mut net = SimNetwork::new(SimNetworkController::shared(), ids(1..=3));
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        net.publish(BusEnvelope::new(InstanceId(2), "HALT"), 0, &mut rng);
        assert_eq!(drain(&mut net, 0), ids(1..=3));
        assert_eq!(net.stats().delivered, 3);
    }

    #[test]
    fn test_latency_holds_copy_until_due() {
        let controller = SimNetworkController::shared();
        controller.set_link_latency(InstanceId(1), InstanceId(2), 50);
        let mut net = SimNetwork::new(controller, ids(1..=2));
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        net.publish(BusEnvelope::new(InstanceId(1), "RESTART"), 0, &mut rng);
        assert_eq!(drain(&mut net, 10_000_000), vec![InstanceId(1)]);
        assert_eq!(net.pending(), 1);
        assert_eq!(drain(&mut net, 50_000_000), vec![InstanceId(2)]);
    }

    #[test]
    fn test_total_loss_and_partition_drop_copies() {
        let controller = SimNetworkController::shared();
        controller.set_link_loss(InstanceId(3), InstanceId(1), 1.0);
        controller.partition(&[InstanceId(3)], &[InstanceId(2)]);
        let mut net = SimNetwork::new(controller, ids(1..=3));
        let mut rng = ChaCha8Rng::seed_from_u64(9);

        net.publish(BusEnvelope::new(InstanceId(3), "RESTART"), 0, &mut rng);
        assert_eq!(drain(&mut net, 0), vec![InstanceId(3)]);
        assert_eq!(net.stats().dropped, 2);
    }

    #[test]
    fn test_partial_loss_is_seed_deterministic() {
        let run = |seed| {
            let controller = SimNetworkController::shared();
            for to in 2..=5 {
                controller.set_link_loss(InstanceId(1), InstanceId(to), 0.5);
            }
            let mut net = SimNetwork::new(controller, ids(1..=5));
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            for _ in 0..20 {
                net.publish(BusEnvelope::new(InstanceId(1), "HALT"), 0, &mut rng);
            }
            drain(&mut net, 0)
        };
        assert_eq!(run(42), run(42));
    }
}

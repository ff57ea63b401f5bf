//! Agent Runtime - runs one `Simulation` against a real environment.
//!
//! The state machine decides; this module executes. It owns the cancellable
//! ticker, fans neighbor probes out under a concurrency cap, publishes
//! safety messages and feeds bus traffic back in.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      PendulumAgent                           │
//! │   HTTP PUT ──┐                                               │
//! │   ticker  ───┼──► Mutex<Simulation> ──► Effects              │
//! │   probes  ───┤        (one writer)       • StartTicker       │
//! │   bus recv ──┘                           • StopTicker        │
//! │                                          • Publish           │
//! │                                          • ProbeNeighbors    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every input takes the same lock, so the state is never torn. Publishing
//! and probing happen in their own tasks and never hold it.
//!
//! # Usage
//!
//! ```ignore
//! use pendulum_core::{PendulumAgent, SimulationConfig};
//! use pendulum_env::TokioContext;
//!
//! let agent = PendulumAgent::new(TokioContext::shared(), bus, neighbors, config)?;
//! agent.start();
//! agent.apply_update(update).await;
//! ```

use pendulum_env::{InstanceId, MessageBus, NeighborSource, PendulumContext};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::collision::NeighborSample;
use crate::config::SimulationConfig;
use crate::error::PendulumError;
use crate::protocol::ProtocolMessage;
use crate::simulation::{Effect, Simulation};
use crate::state::{PendulumSnapshot, PendulumUpdate, Status};

struct AgentInner {
    sim: Simulation,
    ticker: Option<JoinHandle<()>>,
}

impl AgentInner {
    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// One pendulum instance wired to its environment.
///
/// Generic over the context, the safety channel and the neighbor source, so
/// the same agent runs in production (tokio, zenoh, HTTP) or fully
/// in-process in tests.
pub struct PendulumAgent<Ctx, Bus, Nbr>
where
    Ctx: PendulumContext,
    Bus: MessageBus,
    Nbr: NeighborSource,
{
    instance_id: InstanceId,
    context: Arc<Ctx>,
    bus: Arc<Bus>,
    neighbors: Arc<Nbr>,
    inner: Mutex<AgentInner>,
    probe_permits: Arc<Semaphore>,
    tick_interval: Duration,
    probe_timeout: Duration,
}

impl<Ctx, Bus, Nbr> PendulumAgent<Ctx, Bus, Nbr>
where
    Ctx: PendulumContext,
    Bus: MessageBus,
    Nbr: NeighborSource,
{
    /// Creates a stopped agent. Call [`start`](Self::start) to subscribe.
    pub fn new(
        context: Arc<Ctx>,
        bus: Arc<Bus>,
        neighbors: Arc<Nbr>,
        config: SimulationConfig,
    ) -> Result<Arc<Self>, PendulumError> {
        let sim = Simulation::new(config.clone())?;

        Ok(Arc::new(Self {
            instance_id: config.instance_id,
            context,
            bus,
            neighbors,
            inner: Mutex::new(AgentInner { sim, ticker: None }),
            probe_permits: Arc::new(Semaphore::new(config.max_inflight_probes.max(1))),
            tick_interval: config.tick_interval,
            probe_timeout: config.probe_timeout,
        }))
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn topic(&self) -> &str {
        self.bus.topic()
    }

    /// Returns a consistent copy of the current state.
    pub async fn snapshot(&self) -> PendulumSnapshot {
        self.inner.lock().await.sim.snapshot()
    }

    pub async fn status(&self) -> Status {
        self.inner.lock().await.sim.status()
    }

    /// Applies a client update and returns the resulting state.
    pub async fn apply_update(self: &Arc<Self>, update: PendulumUpdate) -> PendulumSnapshot {
        let mut inner = self.inner.lock().await;
        let effects = inner.sim.apply_update(&update);
        self.execute(&mut inner, effects);
        inner.sim.snapshot()
    }

    /// Starts the safety channel subscription.
    ///
    /// When the channel closes the instance keeps ticking; it just stops
    /// hearing from its peers.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let agent = Arc::downgrade(self);
        let bus = self.bus.clone();
        let instance = self.instance_id;

        self.context.spawn("safety-subscription", async move {
            loop {
                let Some(envelope) = bus.recv().await else {
                    warn!(%instance, topic = bus.topic(), "safety channel closed, coordination lost");
                    return;
                };
                let Some(agent) = agent.upgrade() else {
                    return;
                };
                let mut inner = agent.inner.lock().await;
                let effects = inner.sim.handle_envelope(&envelope);
                agent.execute(&mut inner, effects);
            }
        })
    }

    /// Cancels the ticker. State is left as is.
    pub async fn shutdown(&self) {
        self.inner.lock().await.stop_ticker();
    }

    fn execute(self: &Arc<Self>, inner: &mut AgentInner, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartTicker { epoch } => {
                    inner.stop_ticker();
                    inner.ticker = Some(self.spawn_ticker(epoch));
                }
                Effect::StopTicker => inner.stop_ticker(),
                Effect::Publish(message) => self.spawn_publish(message),
                Effect::ProbeNeighbors { epoch, neighbors } => {
                    for neighbor in neighbors {
                        self.spawn_probe(epoch, neighbor);
                    }
                }
            }
        }
    }

    fn spawn_ticker(self: &Arc<Self>, epoch: u64) -> JoinHandle<()> {
        let agent = Arc::downgrade(self);
        let context = self.context.clone();
        let interval = self.tick_interval;

        self.context.spawn("ticker", async move {
            loop {
                context.sleep(interval).await;
                let Some(agent) = agent.upgrade() else {
                    return;
                };
                if !agent.on_tick(epoch).await {
                    return;
                }
            }
        })
    }

    /// Returns false once the ticker's epoch is no longer current.
    async fn on_tick(self: &Arc<Self>, epoch: u64) -> bool {
        let mut inner = self.inner.lock().await;
        let effects = inner.sim.tick(epoch);
        self.execute(&mut inner, effects);
        inner.sim.epoch() == epoch
    }

    fn spawn_publish(&self, message: ProtocolMessage) {
        let bus = self.bus.clone();
        let instance = self.instance_id;

        // Detached so a ticker aborting itself can't cancel the send.
        self.context.spawn("publish", async move {
            let body = message.body();
            match bus.publish(message.to_envelope()).await {
                Ok(()) => debug!(%instance, %body, "safety message published"),
                Err(err) => warn!(%instance, %body, error = %err, "safety message dropped"),
            }
        });
    }

    fn spawn_probe(self: &Arc<Self>, epoch: u64, neighbor: InstanceId) {
        let Ok(permit) = self.probe_permits.clone().try_acquire_owned() else {
            debug!(instance = %self.instance_id, %neighbor, "probe skipped, too many in flight");
            return;
        };

        let agent = Arc::downgrade(self);
        let source = self.neighbors.clone();
        let timeout = self.probe_timeout;
        let instance = self.instance_id;

        self.context.spawn("neighbor-probe", async move {
            let _permit = permit;
            let reading = match tokio::time::timeout(timeout, source.fetch(neighbor)).await {
                Ok(Ok(reading)) => reading,
                Ok(Err(err)) if err.is_transient() => {
                    debug!(%instance, %neighbor, error = %err, "neighbor probe failed");
                    return;
                }
                Ok(Err(err)) => {
                    warn!(%instance, %neighbor, error = %err, "neighbor answered with garbage");
                    return;
                }
                Err(_) => {
                    debug!(%instance, %neighbor, ?timeout, "neighbor probe timed out");
                    return;
                }
            };

            // Trust the instance we asked, not the one the reply claims.
            let sample = NeighborSample {
                instance: neighbor,
                ..NeighborSample::from(reading)
            };
            Self::deliver_sample(agent, epoch, sample).await;
        });
    }

    async fn deliver_sample(agent: Weak<Self>, epoch: u64, sample: NeighborSample) {
        let Some(agent) = agent.upgrade() else {
            return;
        };
        let mut inner = agent.inner.lock().await;
        let effects = inner.sim.observe_neighbor(epoch, sample);
        agent.execute(&mut inner, effects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pendulum_env::{EnvError, LocalBus, LocalBusHub, NeighborReading, TokioContext};
    use std::collections::HashMap;
    use std::sync::RwLock;
    use tokio::time::Instant;

    /// Neighbors that never answer.
    struct Silent;

    #[async_trait]
    impl NeighborSource for Silent {
        async fn fetch(&self, instance: InstanceId) -> Result<NeighborReading, EnvError> {
            Err(EnvError::unreachable(instance))
        }
    }

    fn agent(id: u32, hub: &LocalBusHub) -> Arc<PendulumAgent<TokioContext, LocalBus, Silent>> {
        PendulumAgent::new(
            TokioContext::shared(),
            Arc::new(hub.join(InstanceId(id))),
            Arc::new(Silent),
            SimulationConfig::for_instance(id, 3),
        )
        .unwrap()
    }

    fn start_at(x: f64) -> PendulumUpdate {
        PendulumUpdate {
            x_anchor: Some(0.0),
            y_anchor: Some(0.0),
            x_initial: Some(x),
            y_initial: Some(150.0),
            radius: Some(10.0),
            status: Some("Running".into()),
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let hub = LocalBusHub::new("t", 4);
        let result = PendulumAgent::new(
            TokioContext::shared(),
            Arc::new(hub.join(InstanceId(4))),
            Arc::new(Silent),
            SimulationConfig::for_instance(4, 3),
        );
        assert!(matches!(result, Err(PendulumError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_advances_and_stop_cancels() {
        let hub = LocalBusHub::new("t", 16);
        let agent = agent(1, &hub);

        let snap = agent.apply_update(start_at(40.0)).await;
        assert_eq!(snap.status, Status::Running);
        assert_eq!(snap.seconds, 0.0);

        tokio::time::sleep(Duration::from_millis(1050)).await;
        let snap = agent.snapshot().await;
        assert!((snap.seconds - 1.0).abs() < 1e-6, "seconds = {}", snap.seconds);

        let snap = agent
            .apply_update(PendulumUpdate {
                status: Some("Stopped".into()),
                ..start_at(40.0)
            })
            .await;
        assert_eq!(snap.seconds, 0.0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let snap = agent.snapshot().await;
        assert_eq!(snap.status, Status::Stopped);
        assert_eq!(snap.seconds, 0.0);
        assert_eq!((snap.x, snap.y), (snap.x_initial, snap.y_initial));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_clock() {
        let hub = LocalBusHub::new("t", 16);
        let agent = agent(2, &hub);
        agent.apply_update(start_at(-30.0)).await;

        tokio::time::sleep(Duration::from_millis(350)).await;
        let paused = agent
            .apply_update(PendulumUpdate {
                status: Some("Paused".into()),
                ..Default::default()
            })
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(agent.snapshot().await, paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_halt_stops_motion() {
        let hub = LocalBusHub::new("t", 16);
        let agent = agent(1, &hub);
        agent.start();
        agent.apply_update(start_at(50.0)).await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        let outsider = hub.join(InstanceId(3));
        outsider
            .publish(pendulum_env::BusEnvelope::new(InstanceId(3), "HALT from 3"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let halted = agent.snapshot().await;
        assert_eq!(halted.status, Status::Halted);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let later = agent.snapshot().await;
        assert_eq!((later.x, later.y), (halted.x, halted.y));
        assert!(later.seconds > halted.seconds);
    }

    type SwarmAgent = PendulumAgent<TokioContext, LocalBus, Directory>;

    /// Answers neighbor queries straight from the other agents' state.
    #[derive(Default)]
    struct Directory {
        agents: RwLock<HashMap<InstanceId, Weak<SwarmAgent>>>,
    }

    #[async_trait]
    impl NeighborSource for Directory {
        async fn fetch(&self, instance: InstanceId) -> Result<NeighborReading, EnvError> {
            let agent = self
                .agents
                .read()
                .unwrap()
                .get(&instance)
                .and_then(Weak::upgrade)
                .ok_or_else(|| EnvError::unreachable(instance))?;
            let snap = agent.snapshot().await;
            Ok(NeighborReading {
                instance: snap.instance,
                x: snap.x,
                y: snap.y,
                radius: snap.radius,
            })
        }
    }

    /// Five hanging pendulums; 3 is released 28 degrees away from 4 and
    /// swings into it about 0.8 s later.
    fn layout(id: InstanceId) -> PendulumUpdate {
        let anchor_x = [0.0, 100.0, 300.0, 400.0, 500.0][id.get() as usize - 1];
        let theta: f64 = if id.get() == 3 { -28f64.to_radians() } else { 0.0 };
        PendulumUpdate {
            x_anchor: Some(anchor_x),
            y_anchor: Some(0.0),
            x_initial: Some(anchor_x + 200.0 * theta.sin()),
            y_initial: Some(200.0 * theta.cos()),
            radius: Some(10.0),
            status: Some("Running".into()),
        }
    }

    async fn swarm() -> Vec<Arc<SwarmAgent>> {
        let hub = LocalBusHub::new("pendulum/test/safety", 64);
        let directory = Arc::new(Directory::default());
        let mut agents = Vec::new();

        for id in 1..=5 {
            let agent = PendulumAgent::new(
                TokioContext::shared(),
                Arc::new(hub.join(InstanceId(id))),
                directory.clone(),
                SimulationConfig::for_instance(id, 5),
            )
            .unwrap();
            directory
                .agents
                .write()
                .unwrap()
                .insert(InstanceId(id), Arc::downgrade(&agent));
            agent.start();
            agents.push(agent);
        }
        for agent in &agents {
            agent.apply_update(layout(agent.instance_id())).await;
        }
        agents
    }

    async fn wait_for(agent: &SwarmAgent, status: Status, within: Duration) -> PendulumSnapshot {
        let deadline = Instant::now() + within;
        loop {
            let snap = agent.snapshot().await;
            if snap.status == status {
                return snap;
            }
            assert!(
                Instant::now() < deadline,
                "instance {} stuck in {} waiting for {status}",
                snap.instance,
                snap.status
            );
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn statuses(agents: &[Arc<SwarmAgent>]) -> Vec<Status> {
        let mut out = Vec::new();
        for agent in agents {
            out.push(agent.status().await);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_swarm_halts_and_restarts_on_quorum() {
        let agents = swarm().await;
        let third = &agents[2];

        let halted = wait_for(third, Status::Halted, Duration::from_secs(2)).await;
        assert!(halted.seconds > 0.7 && halted.seconds < 0.95, "halted at {}", halted.seconds);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(statuses(&agents).await, vec![Status::Halted; 5]);

        // Frozen while halted
        let frozen = third.snapshot().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let still = third.snapshot().await;
        assert_eq!((still.x, still.y), (frozen.x, frozen.y));

        let resumed = wait_for(third, Status::Running, Duration::from_secs(7)).await;
        assert_eq!(resumed.seconds, 0.0);
        assert_eq!((resumed.x, resumed.y), (resumed.x_initial, resumed.y_initial));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(statuses(&agents).await, vec![Status::Running; 5]);

        // Same release, same collision
        let again = wait_for(third, Status::Halted, Duration::from_secs(2)).await;
        assert!(again.seconds > 0.7 && again.seconds < 0.95);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_during_halt_blocks_quorum() {
        let agents = swarm().await;
        wait_for(&agents[2], Status::Halted, Duration::from_secs(2)).await;

        let stopped = agents[2]
            .apply_update(PendulumUpdate {
                status: Some("Stopped".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(stopped.status, Status::Stopped);
        assert_eq!(stopped.seconds, 0.0);
        assert_eq!((stopped.x, stopped.y), (stopped.x_initial, stopped.y_initial));

        tokio::time::sleep(Duration::from_secs(8)).await;
        let after = statuses(&agents).await;
        assert_eq!(after[2], Status::Stopped);
        for (i, status) in after.iter().enumerate().filter(|(i, _)| *i != 2) {
            assert_eq!(*status, Status::Restarting, "instance {}", i + 1);
        }
    }
}

//! SimWorld - the simulation harness container.
//!
//! Holds one `Simulation` per instance and drives them all from a single
//! virtual clock. Each step:
//!
//! 1. advance the clock by one tick
//! 2. deliver bus copies that have come due
//! 3. tick every instance whose ticker is armed
//! 4. answer the neighbor probes those ticks asked for
//! 5. deliver whatever the step itself published
//!
//! Probes read neighbors after every instance has ticked, so no instance
//! sees a half-advanced swarm.

use pendulum_core::collision::edge_gap;
use pendulum_core::{
    ConfigError, Effect, MessageKind, NeighborSample, PendulumSnapshot, PendulumUpdate, QuorumMode,
    Simulation, SimulationConfig, Status,
};
use pendulum_env::{BusEnvelope, InstanceId, PendulumContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::SimContext;
use crate::exporter::{SimEvent, SimFrame};
use crate::network::{NetworkStats, SimNetwork, SimNetworkController};

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of instances to spawn
    pub instances: u32,

    pub tick_interval: Duration,
    pub halt_timeout: Duration,
    pub safety_distance: f64,
    pub quorum_mode: QuorumMode,

    /// Record a frame every this many ticks (0 = never)
    pub frame_interval: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        let defaults = SimulationConfig::default();
        Self {
            seed: 42,
            instances: defaults.instance_count,
            tick_interval: defaults.tick_interval,
            halt_timeout: defaults.halt_timeout,
            safety_distance: defaults.safety_distance,
            quorum_mode: defaults.quorum_mode,
            frame_interval: 0,
        }
    }
}

impl SimConfig {
    /// Per-instance configuration for instance `id`.
    pub fn instance_config(&self, id: u32) -> SimulationConfig {
        SimulationConfig::for_instance(id, self.instances)
            .with_tick_interval(self.tick_interval)
            .with_probe_timeout(self.tick_interval / 2)
            .with_halt_timeout(self.halt_timeout)
            .with_safety_distance(self.safety_distance)
            .with_quorum_mode(self.quorum_mode)
    }
}

/// A status change observed by the world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub time_secs: f64,
    pub instance: InstanceId,
    pub from: Status,
    pub to: Status,
}

impl Transition {
    /// True for the quorum release out of a halt episode.
    pub fn is_resume(&self) -> bool {
        self.from.in_halt_episode() && self.to == Status::Running
    }
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldMetrics {
    pub halts_published: u64,
    pub restarts_published: u64,
    pub resumes: u64,

    /// Ground-truth smallest edge gap between any two bodies
    pub min_gap: f64,

    pub network: NetworkStats,
}

struct Slot {
    sim: Simulation,

    /// Epoch the instance's ticker is bound to, if armed
    ticker: Option<u64>,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    config: SimConfig,
    context: SimContext,
    network: SimNetwork,
    slots: Vec<Slot>,
    pending_probes: Vec<(usize, u64, Vec<InstanceId>)>,
    tick_count: u64,
    transitions: Vec<Transition>,
    events: Vec<SimEvent>,
    frames: Vec<SimFrame>,
    halts_published: u64,
    restarts_published: u64,
    min_gap: f64,
}

impl SimWorld {
    /// Creates a world with every instance Stopped at the origin.
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        config.instance_config(1).validate()?;

        let slots = (1..=config.instances)
            .map(|id| {
                Simulation::new(config.instance_config(id)).map(|sim| Slot { sim, ticker: None })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let members = (1..=config.instances).map(InstanceId).collect();
        let network = SimNetwork::new(SimNetworkController::shared(), members);
        let context = SimContext::new(config.seed);

        info!(
            seed = config.seed,
            instances = config.instances,
            quorum = %config.quorum_mode,
            "sim world created"
        );

        Ok(Self {
            config,
            context,
            network,
            slots,
            pending_probes: Vec::new(),
            tick_count: 0,
            transitions: Vec::new(),
            events: Vec::new(),
            frames: Vec::new(),
            halts_published: 0,
            restarts_published: 0,
            min_gap: f64::INFINITY,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn context(&self) -> &SimContext {
        &self.context
    }

    /// Fault injection handle for the simulated bus.
    pub fn controller(&self) -> Arc<SimNetworkController> {
        self.network.controller().clone()
    }

    pub fn now_secs(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Simulation> {
        self.index_of(id).map(|idx| &self.slots[idx].sim)
    }

    pub fn snapshots(&self) -> Vec<PendulumSnapshot> {
        self.slots.iter().map(|slot| slot.sim.snapshot()).collect()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.slots.iter().map(|slot| slot.sim.status()).collect()
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    pub fn take_frames(&mut self) -> Vec<SimFrame> {
        std::mem::take(&mut self.frames)
    }

    /// Number of quorum releases seen by `id`.
    pub fn resumes_of(&self, id: InstanceId) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.instance == id && t.is_resume())
            .count()
    }

    pub fn metrics(&self) -> WorldMetrics {
        WorldMetrics {
            halts_published: self.halts_published,
            restarts_published: self.restarts_published,
            resumes: self.transitions.iter().filter(|t| t.is_resume()).count() as u64,
            min_gap: self.min_gap,
            network: self.network.stats(),
        }
    }

    /// Applies a client update to one instance, as a PUT would.
    pub fn apply_update(&mut self, id: InstanceId, update: &PendulumUpdate) -> Option<PendulumSnapshot> {
        let idx = self.index_of(id)?;
        let before = self.slots[idx].sim.status();
        let effects = self.slots[idx].sim.apply_update(update);
        self.record_transition(idx, before);
        self.execute(idx, effects);
        self.deliver_due();
        Some(self.slots[idx].sim.snapshot())
    }

    /// Puts an arbitrary envelope on the bus, as if `envelope.from` sent it.
    pub fn inject(&mut self, envelope: BusEnvelope) {
        warn!(from = %envelope.from, body = %envelope.body, "injecting envelope");
        self.events.push(
            SimEvent::new(
                self.now_secs(),
                Some(envelope.from.get()),
                format!("injected: {}", envelope.body),
            )
            .warning(),
        );
        let now_ns = self.context.time_ns();
        self.context
            .with_rng(|rng| self.network.publish(envelope, now_ns, rng));
        self.deliver_due();
    }

    /// Advances the world by one tick.
    pub fn step(&mut self) {
        self.context.advance_time(self.config.tick_interval);
        self.tick_count += 1;
        self.deliver_due();

        for idx in 0..self.slots.len() {
            let Some(epoch) = self.slots[idx].ticker else {
                continue;
            };
            let before = self.slots[idx].sim.status();
            let effects = self.slots[idx].sim.tick(epoch);
            self.record_transition(idx, before);
            self.execute(idx, effects);
        }

        self.resolve_probes();
        self.deliver_due();
        self.observe_gaps();

        if self.config.frame_interval > 0 && self.tick_count % self.config.frame_interval == 0 {
            let frame = self.frame();
            self.frames.push(frame);
        }
    }

    /// Steps for (at least) the given simulated duration.
    pub fn run_for(&mut self, duration: Duration) {
        let ticks = (duration.as_secs_f64() / self.config.tick_interval.as_secs_f64()).round() as u64;
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Steps until `done` holds or `limit` of simulated time has passed.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&SimWorld) -> bool) -> bool {
        let deadline = self.context.now() + limit;
        while self.context.now() < deadline {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Captures the current state as an export frame.
    pub fn frame(&self) -> SimFrame {
        SimFrame {
            time_sec: self.now_secs(),
            instances: self.snapshots(),
            min_gap: self.current_min_gap(),
        }
    }

    fn index_of(&self, id: InstanceId) -> Option<usize> {
        let idx = (id.get() as usize).checked_sub(1)?;
        (idx < self.slots.len()).then_some(idx)
    }

    fn execute(&mut self, idx: usize, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartTicker { epoch } => self.slots[idx].ticker = Some(epoch),
                Effect::StopTicker => self.slots[idx].ticker = None,
                Effect::Publish(message) => {
                    match message.kind {
                        MessageKind::Halt => self.halts_published += 1,
                        MessageKind::Restart => self.restarts_published += 1,
                    }
                    let body = message.body();
                    debug!(from = %message.from, %body, "publish");
                    self.events
                        .push(SimEvent::new(self.now_secs(), Some(message.from.get()), body));

                    let now_ns = self.context.time_ns();
                    let envelope = message.to_envelope();
                    self.context
                        .with_rng(|rng| self.network.publish(envelope, now_ns, rng));
                }
                Effect::ProbeNeighbors { epoch, neighbors } => {
                    self.pending_probes.push((idx, epoch, neighbors));
                }
            }
        }
    }

    fn deliver_due(&mut self) {
        let now_ns = self.context.time_ns();
        while let Some((to, envelope)) = self.network.pop_due(now_ns) {
            let Some(idx) = self.index_of(to) else {
                continue;
            };
            let before = self.slots[idx].sim.status();
            let effects = self.slots[idx].sim.handle_envelope(&envelope);
            self.record_transition(idx, before);
            self.execute(idx, effects);
        }
    }

    fn resolve_probes(&mut self) {
        let probes = std::mem::take(&mut self.pending_probes);
        for (idx, epoch, neighbors) in probes {
            let me = self.slots[idx].sim.instance_id();
            for neighbor in neighbors {
                if !self.network.controller().can_communicate(me, neighbor) {
                    debug!(instance = %me, %neighbor, "probe blocked by partition");
                    continue;
                }
                let Some(sample) = self.sample_of(neighbor) else {
                    continue;
                };
                let before = self.slots[idx].sim.status();
                let effects = self.slots[idx].sim.observe_neighbor(epoch, sample);
                self.record_transition(idx, before);
                self.execute(idx, effects);
            }
        }
    }

    fn sample_of(&self, id: InstanceId) -> Option<NeighborSample> {
        let state = self.instance(id)?.state();
        Some(NeighborSample {
            instance: id,
            position: state.current,
            radius: state.radius,
        })
    }

    fn record_transition(&mut self, idx: usize, before: Status) {
        let after = self.slots[idx].sim.status();
        if after == before {
            return;
        }
        let transition = Transition {
            time_secs: self.now_secs(),
            instance: self.slots[idx].sim.instance_id(),
            from: before,
            to: after,
        };
        let mut event = SimEvent::new(
            transition.time_secs,
            Some(transition.instance.get()),
            format!("{before} -> {after}"),
        );
        if after == Status::Halted {
            event = event.warning();
        }
        self.events.push(event);
        self.transitions.push(transition);
    }

    fn current_min_gap(&self) -> f64 {
        let mut min_gap = f64::INFINITY;
        for (i, a) in self.slots.iter().enumerate() {
            for b in &self.slots[i + 1..] {
                let (a, b) = (a.sim.state(), b.sim.state());
                min_gap = min_gap.min(edge_gap(&a.current, a.radius, &b.current, b.radius));
            }
        }
        min_gap
    }

    fn observe_gaps(&mut self) {
        self.min_gap = self.min_gap.min(self.current_min_gap());
    }
}

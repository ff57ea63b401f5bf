//! Simulation Loop - the per-instance state machine
//!
//! `Simulation` is sans-IO: every input (client command, tick, neighbor
//! sample, bus message) is a method call, and every side effect the outside
//! world must perform comes back as an [`Effect`]. The async runtime and the
//! deterministic harness both drive the same machine.
//!
//! ```text
//!            Running ──pause──► Paused
//!   Stopped ─┘  ▲ │  ◄──run───┘
//!      ▲        │ │ violation / HALT
//!      │  quorum│ ▼
//!      │     Halted ──timeout──► Restarting
//!      │        └──────quorum──────┘
//!      └──────── stop (from any) ────────
//! ```
//!
//! Every status change bumps the epoch. Ticks and neighbor samples carry
//! the epoch they were issued under and are dropped when it no longer
//! matches, so nothing scheduled before a transition can write after it.

use pendulum_env::{BusEnvelope, InstanceId};
use tracing::{debug, info, trace, warn};

use crate::collision::{CollisionDetector, NeighborSample, Violation};
use crate::config::SimulationConfig;
use crate::error::ConfigError;
use crate::kinematics::{PendulumMotion, Point};
use crate::protocol::{MessageKind, ProtocolMessage, QuorumTracker};
use crate::state::{ClientMode, PendulumSnapshot, PendulumState, PendulumUpdate, Status};

/// Work the driver must carry out after a state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Replace any running ticker with one bound to `epoch`.
    StartTicker { epoch: u64 },

    /// Cancel the ticker.
    StopTicker,

    /// Publish on the safety channel.
    Publish(ProtocolMessage),

    /// Query these neighbors; feed results back with `epoch`.
    ProbeNeighbors { epoch: u64, neighbors: Vec<InstanceId> },
}

/// The per-instance state machine.
#[derive(Debug, Clone)]
pub struct Simulation {
    config: SimulationConfig,
    state: PendulumState,
    motion: PendulumMotion,
    detector: CollisionDetector,
    quorum: QuorumTracker,
    neighbors: Vec<InstanceId>,
    epoch: u64,

    /// Whether our own RESTART went out in the current halt episode
    restart_announced: bool,
}

impl Simulation {
    /// Creates a stopped instance.
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let state = PendulumState::new(config.instance_id);
        let detector = CollisionDetector::new(config.safety_distance);
        let quorum = QuorumTracker::new(config.quorum_mode, config.instance_id, config.instance_count);
        let neighbors = detector.neighbors_of(config.instance_id, config.instance_count);

        Ok(Self {
            motion: PendulumMotion::new(state.anchor, state.initial),
            config,
            state,
            detector,
            quorum,
            neighbors,
            epoch: 0,
            restart_announced: false,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn state(&self) -> &PendulumState {
        &self.state
    }

    pub fn status(&self) -> Status {
        self.state.status
    }

    pub fn instance_id(&self) -> InstanceId {
        self.state.instance_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn snapshot(&self) -> PendulumSnapshot {
        self.state.snapshot()
    }

    /// Applies a client update: geometry first (only while Stopped), then mode.
    pub fn apply_update(&mut self, update: &PendulumUpdate) -> Vec<Effect> {
        if !self.set_geometry(update.anchor(), update.initial(), update.radius()) {
            debug!(
                instance = %self.state.instance_id,
                status = %self.state.status,
                "geometry change ignored outside Stopped"
            );
        }
        match update.mode() {
            Some(mode) => self.request_mode(mode),
            None => Vec::new(),
        }
    }

    /// Replaces anchor, release point and radius. Only allowed while Stopped.
    pub fn set_geometry(&mut self, anchor: Point, initial: Point, radius: f64) -> bool {
        if self.state.status != Status::Stopped {
            return false;
        }
        self.state.anchor = anchor;
        self.state.initial = initial;
        self.state.radius = radius;
        self.state.current = initial;
        self.motion = PendulumMotion::new(anchor, initial);
        true
    }

    /// Handles a client mode request.
    pub fn request_mode(&mut self, mode: ClientMode) -> Vec<Effect> {
        match (self.state.status, mode) {
            (Status::Stopped, ClientMode::Running) => {
                self.state.current = self.motion.position_at(0.0);
                self.state.elapsed_seconds = 0.0;
                self.transition(Status::Running);
                vec![Effect::StartTicker { epoch: self.epoch }]
            }
            (Status::Paused, ClientMode::Running) => {
                self.transition(Status::Running);
                vec![Effect::StartTicker { epoch: self.epoch }]
            }
            (Status::Running, ClientMode::Paused) => {
                self.transition(Status::Paused);
                vec![Effect::StopTicker]
            }
            (
                Status::Running | Status::Paused | Status::Halted | Status::Restarting,
                ClientMode::Stopped,
            ) => {
                self.state.reset_to_initial();
                self.end_episode();
                self.transition(Status::Stopped);
                vec![Effect::StopTicker]
            }
            (status, mode) => {
                debug!(instance = %self.state.instance_id, %status, ?mode, "mode request has no effect");
                Vec::new()
            }
        }
    }

    /// Advances one tick issued under `epoch`.
    pub fn tick(&mut self, epoch: u64) -> Vec<Effect> {
        if epoch != self.epoch || !self.state.status.is_active() {
            trace!(instance = %self.state.instance_id, epoch, current = self.epoch, "stale tick dropped");
            return Vec::new();
        }

        self.state.elapsed_seconds += self.config.tick_seconds();

        match self.state.status {
            Status::Running => {
                self.state.current = self.motion.position_at(self.state.elapsed_seconds);
                if self.neighbors.is_empty() {
                    Vec::new()
                } else {
                    vec![Effect::ProbeNeighbors {
                        epoch,
                        neighbors: self.neighbors.clone(),
                    }]
                }
            }
            Status::Halted => {
                let waited = self.state.elapsed_seconds - self.state.halt_start_seconds;
                if waited > self.config.halt_timeout.as_secs_f64() {
                    self.begin_restart()
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Feeds back one neighbor sample obtained under `epoch`.
    pub fn observe_neighbor(&mut self, epoch: u64, sample: NeighborSample) -> Vec<Effect> {
        if epoch != self.epoch || self.state.status != Status::Running {
            debug!(
                instance = %self.state.instance_id,
                neighbor = %sample.instance,
                "late neighbor sample discarded"
            );
            return Vec::new();
        }

        match self.detector.check(
            self.state.instance_id,
            &self.state.current,
            self.state.radius,
            &sample,
        ) {
            Some(violation) => {
                warn!(
                    instance = %violation.instance,
                    neighbor = %violation.neighbor,
                    gap = violation.gap,
                    "SAFETY HALT triggered"
                );
                self.enter_halt(Some(violation))
            }
            None => Vec::new(),
        }
    }

    /// Handles an envelope from the safety channel.
    pub fn handle_envelope(&mut self, envelope: &BusEnvelope) -> Vec<Effect> {
        match ProtocolMessage::from_envelope(envelope) {
            Some(message) => self.handle_message(&message),
            None => {
                debug!(from = %envelope.from, body = %envelope.body, "unrecognized message ignored");
                Vec::new()
            }
        }
    }

    /// Handles a decoded protocol message.
    pub fn handle_message(&mut self, message: &ProtocolMessage) -> Vec<Effect> {
        match (message.kind, self.state.status) {
            // Already Halted means this is an echo or a duplicate of the same episode.
            (MessageKind::Halt, Status::Running | Status::Restarting) => {
                info!(instance = %self.state.instance_id, from = %message.from, "HALT received");
                self.enter_halt(None)
            }
            (MessageKind::Restart, Status::Halted | Status::Restarting) => {
                if !self.quorum.record(message.from) {
                    return Vec::new();
                }
                self.state.restart_acks_received = self.quorum.count();
                debug!(
                    instance = %self.state.instance_id,
                    from = %message.from,
                    acks = self.quorum.count(),
                    required = self.quorum.required(),
                    "RESTART acknowledged"
                );
                self.try_resume()
            }
            (kind, status) => {
                trace!(instance = %self.state.instance_id, ?kind, %status, "message ignored");
                Vec::new()
            }
        }
    }

    fn enter_halt(&mut self, violation: Option<Violation>) -> Vec<Effect> {
        self.state.halt_start_seconds = self.state.elapsed_seconds;
        self.state.restart_acks_received = 0;
        self.quorum.reset();
        self.restart_announced = false;
        self.transition(Status::Halted);

        let mut effects = vec![Effect::StartTicker { epoch: self.epoch }];
        if let Some(violation) = violation {
            effects.push(Effect::Publish(ProtocolMessage::halt(&violation)));
        }
        effects
    }

    fn begin_restart(&mut self) -> Vec<Effect> {
        self.transition(Status::Restarting);
        self.restart_announced = true;

        let mut effects = vec![
            Effect::StartTicker { epoch: self.epoch },
            Effect::Publish(ProtocolMessage::restart(self.state.instance_id)),
        ];
        effects.extend(self.try_resume());
        effects
    }

    fn try_resume(&mut self) -> Vec<Effect> {
        if !self.quorum.is_met() {
            return Vec::new();
        }

        // Peers are counting on our RESTART too, even if theirs reached us first.
        let mut effects = Vec::new();
        if !self.restart_announced {
            effects.push(Effect::Publish(ProtocolMessage::restart(self.state.instance_id)));
        }

        self.state.reset_to_initial();
        self.end_episode();
        self.transition(Status::Running);
        effects.push(Effect::StartTicker { epoch: self.epoch });
        effects
    }

    fn end_episode(&mut self) {
        self.state.clear_episode();
        self.quorum.reset();
        self.restart_announced = false;
    }

    fn transition(&mut self, next: Status) {
        info!(
            instance = %self.state.instance_id,
            from = %self.state.status,
            to = %next,
            seconds = self.state.elapsed_seconds,
            "status transition"
        );
        self.state.status = next;
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QuorumMode;
    use approx::assert_relative_eq;

    fn stopped(id: u32) -> Simulation {
        let mut sim = Simulation::new(SimulationConfig::for_instance(id, 5)).unwrap();
        sim.set_geometry(Point::new(300.0, 0.0), Point::new(350.0, 190.0), 10.0);
        sim
    }

    fn running(id: u32) -> Simulation {
        let mut sim = stopped(id);
        sim.request_mode(ClientMode::Running);
        sim
    }

    fn ticks(sim: &mut Simulation, n: usize) -> Vec<Effect> {
        (0..n).flat_map(|_| sim.tick(sim.epoch())).collect()
    }

    fn published(effects: &[Effect]) -> Vec<MessageKind> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Publish(m) => Some(m.kind),
                _ => None,
            })
            .collect()
    }

    fn restart_from(id: u32) -> ProtocolMessage {
        ProtocolMessage::restart(InstanceId(id))
    }

    fn halted(id: u32) -> Simulation {
        let mut sim = running(id);
        ticks(&mut sim, 3);
        sim.handle_message(&ProtocolMessage {
            from: InstanceId(5),
            kind: MessageKind::Halt,
            detail: String::new(),
        });
        sim
    }

    #[test]
    fn test_start_snapshots_initial() {
        let mut sim = stopped(1);
        let effects = sim.request_mode(ClientMode::Running);

        assert_eq!(sim.status(), Status::Running);
        assert_eq!(effects, vec![Effect::StartTicker { epoch: sim.epoch() }]);
        assert_relative_eq!(sim.state().current.x, 350.0, epsilon = 1e-9);
        assert_relative_eq!(sim.state().current.y, 190.0, epsilon = 1e-9);
        assert_eq!(sim.state().elapsed_seconds, 0.0);
    }

    #[test]
    fn test_running_tick_advances_and_probes() {
        let mut sim = running(3);
        let effects = sim.tick(sim.epoch());

        assert_relative_eq!(sim.state().elapsed_seconds, 0.1);
        assert_ne!(sim.state().current, sim.state().initial);
        assert_eq!(
            effects,
            vec![Effect::ProbeNeighbors {
                epoch: sim.epoch(),
                neighbors: vec![InstanceId(4), InstanceId(5)],
            }]
        );
    }

    #[test]
    fn test_highest_instance_has_nobody_to_probe() {
        let mut sim = running(5);
        assert!(sim.tick(sim.epoch()).is_empty());
    }

    #[test]
    fn test_stop_resets_regardless_of_elapsed() {
        let mut sim = running(2);
        ticks(&mut sim, 37);
        assert!(sim.state().elapsed_seconds > 3.0);

        let effects = sim.request_mode(ClientMode::Stopped);
        assert_eq!(effects, vec![Effect::StopTicker]);
        assert_eq!(sim.status(), Status::Stopped);
        assert_eq!(sim.state().current, sim.state().initial);
        assert_eq!(sim.state().elapsed_seconds, 0.0);
    }

    #[test]
    fn test_pause_freezes_then_resumes() {
        let mut sim = running(1);
        ticks(&mut sim, 4);
        let frozen = sim.state().clone();

        assert_eq!(sim.request_mode(ClientMode::Paused), vec![Effect::StopTicker]);
        let stale_epoch = sim.epoch() - 1;
        assert!(sim.tick(stale_epoch).is_empty());
        assert!(sim.tick(sim.epoch()).is_empty());
        assert_eq!(sim.state().current, frozen.current);
        assert_eq!(sim.state().elapsed_seconds, frozen.elapsed_seconds);

        sim.request_mode(ClientMode::Running);
        sim.tick(sim.epoch());
        assert_relative_eq!(sim.state().elapsed_seconds, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_stale_tick_after_stop_is_dropped() {
        let mut sim = running(1);
        let old_epoch = sim.epoch();
        sim.request_mode(ClientMode::Stopped);

        assert!(sim.tick(old_epoch).is_empty());
        assert_eq!(sim.state().elapsed_seconds, 0.0);
        assert_eq!(sim.state().current, sim.state().initial);
    }

    #[test]
    fn test_geometry_only_changes_while_stopped() {
        let mut sim = running(1);
        let update = PendulumUpdate {
            x_anchor: Some(1.0),
            x_initial: Some(2.0),
            status: Some("Running".into()),
            ..Default::default()
        };
        sim.apply_update(&update);
        assert_eq!(sim.state().anchor, Point::new(300.0, 0.0));

        sim.request_mode(ClientMode::Stopped);
        sim.apply_update(&update);
        assert_eq!(sim.state().anchor, Point::new(1.0, 0.0));
        assert_eq!(sim.status(), Status::Running);
    }

    #[test]
    fn test_bogus_status_stops() {
        let mut sim = running(1);
        sim.apply_update(&PendulumUpdate {
            status: Some("Bogus".into()),
            ..Default::default()
        });
        assert_eq!(sim.status(), Status::Stopped);
    }

    #[test]
    fn test_client_cannot_request_protocol_states() {
        let mut sim = running(1);
        sim.apply_update(&PendulumUpdate {
            status: Some("Halted".into()),
            ..Default::default()
        });
        assert_eq!(sim.status(), Status::Running);

        let mut sim = halted(1);
        sim.request_mode(ClientMode::Running);
        assert_eq!(sim.status(), Status::Halted);
        sim.request_mode(ClientMode::Paused);
        assert_eq!(sim.status(), Status::Halted);
    }

    #[test]
    fn test_violation_halts_and_broadcasts_once() {
        let mut sim = running(3);
        let epoch = sim.epoch();
        ticks(&mut sim, 2);
        let here = sim.state().current;
        let close = NeighborSample {
            instance: InstanceId(4),
            position: Point::new(here.x + 24.0, here.y),
            radius: 10.0,
        };

        let effects = sim.observe_neighbor(epoch, close);
        assert_eq!(sim.status(), Status::Halted);
        assert_eq!(published(&effects), vec![MessageKind::Halt]);
        assert_relative_eq!(sim.state().halt_start_seconds, 0.2, epsilon = 1e-9);

        // Second sample from the same tick and an echo of our own HALT
        assert!(sim.observe_neighbor(epoch, close).is_empty());
        assert!(sim.observe_neighbor(sim.epoch(), close).is_empty());
        let echo = ProtocolMessage::halt(&Violation {
            instance: InstanceId(3),
            neighbor: InstanceId(4),
            gap: 4.0,
        });
        assert!(sim.handle_message(&echo).is_empty());
        assert_eq!(sim.status(), Status::Halted);
    }

    #[test]
    fn test_clear_gap_keeps_running() {
        let mut sim = running(3);
        sim.tick(sim.epoch());
        let here = sim.state().current;
        let sample = NeighborSample {
            instance: InstanceId(4),
            position: Point::new(here.x, here.y + 31.0),
            radius: 10.0,
        };
        assert!(sim.observe_neighbor(sim.epoch(), sample).is_empty());
        assert_eq!(sim.status(), Status::Running);
    }

    #[test]
    fn test_remote_halt_does_not_rebroadcast() {
        let sim = halted(2);
        assert_eq!(sim.status(), Status::Halted);
        assert_relative_eq!(sim.state().halt_start_seconds, 0.3, epsilon = 1e-9);
        assert_eq!(sim.state().restart_acks_received, 0);
    }

    #[test]
    fn test_stopped_and_paused_ignore_protocol() {
        let mut sim = stopped(1);
        assert!(sim.handle_message(&ProtocolMessage {
            from: InstanceId(2),
            kind: MessageKind::Halt,
            detail: String::new(),
        })
        .is_empty());
        assert!(sim.handle_message(&restart_from(2)).is_empty());
        assert_eq!(sim.status(), Status::Stopped);

        let mut sim = running(1);
        sim.request_mode(ClientMode::Paused);
        sim.handle_envelope(&BusEnvelope::new(InstanceId(3), "HALT from 3"));
        assert_eq!(sim.status(), Status::Paused);
        assert_eq!(sim.state().restart_acks_received, 0);
    }

    #[test]
    fn test_timeout_enters_restarting_and_announces_once() {
        let mut sim = halted(1);
        let effects = ticks(&mut sim, 49);
        assert!(published(&effects).is_empty());
        assert_eq!(sim.status(), Status::Halted);

        let effects = ticks(&mut sim, 3);
        assert_eq!(sim.status(), Status::Restarting);
        assert_eq!(published(&effects), vec![MessageKind::Restart]);

        // Restarting keeps ticking without re-announcing
        assert!(published(&ticks(&mut sim, 100)).is_empty());
        assert_eq!(sim.status(), Status::Restarting);
    }

    #[test]
    fn test_quorum_requires_all_other_instances() {
        let mut sim = halted(1);
        ticks(&mut sim, 52);
        assert_eq!(sim.status(), Status::Restarting);

        for id in [2, 3, 4] {
            sim.handle_message(&restart_from(id));
        }
        // Duplicates and our own echo don't count
        sim.handle_message(&restart_from(4));
        sim.handle_message(&restart_from(1));
        assert_eq!(sim.state().restart_acks_received, 3);
        assert_eq!(sim.status(), Status::Restarting);

        let effects = sim.handle_message(&restart_from(5));
        assert_eq!(sim.status(), Status::Running);
        assert!(published(&effects).is_empty());
        assert_eq!(sim.state().elapsed_seconds, 0.0);
        assert_eq!(sim.state().current, sim.state().initial);
        assert_eq!(sim.state().restart_acks_received, 0);
        assert_eq!(sim.state().halt_start_seconds, 0.0);
    }

    #[test]
    fn test_restart_from_outside_swarm_is_not_counted() {
        let mut sim = halted(1);
        ticks(&mut sim, 52);
        for id in [2, 3, 4, 99] {
            sim.handle_message(&restart_from(id));
        }
        assert_eq!(sim.status(), Status::Restarting);
        assert_eq!(sim.state().restart_acks_received, 3);

        sim.handle_message(&restart_from(5));
        assert_eq!(sim.status(), Status::Running);
    }

    #[test]
    fn test_quorum_while_halted_announces_before_resuming() {
        let mut sim = halted(2);
        for id in [1, 3, 4] {
            assert!(sim.handle_message(&restart_from(id)).is_empty());
        }
        let effects = sim.handle_message(&restart_from(5));

        assert_eq!(published(&effects), vec![MessageKind::Restart]);
        assert_eq!(sim.status(), Status::Running);
    }

    #[test]
    fn test_raw_quorum_double_counts() {
        let config = SimulationConfig::for_instance(1, 3).with_quorum_mode(QuorumMode::RawCount);
        let mut sim = Simulation::new(config).unwrap();
        sim.set_geometry(Point::new(0.0, 0.0), Point::new(10.0, 100.0), 10.0);
        sim.request_mode(ClientMode::Running);
        sim.handle_message(&ProtocolMessage {
            from: InstanceId(3),
            kind: MessageKind::Halt,
            detail: String::new(),
        });

        sim.handle_message(&restart_from(2));
        sim.handle_message(&restart_from(2));
        assert_eq!(sim.status(), Status::Running);
    }

    #[test]
    fn test_halt_while_restarting_starts_new_episode() {
        let mut sim = halted(1);
        ticks(&mut sim, 52);
        assert_eq!(sim.status(), Status::Restarting);
        sim.handle_message(&restart_from(2));
        let waiting_since = sim.state().elapsed_seconds;

        // A peer that already resumed ran into a neighbor again
        let effects = sim.handle_message(&ProtocolMessage {
            from: InstanceId(4),
            kind: MessageKind::Halt,
            detail: String::new(),
        });
        assert_eq!(sim.status(), Status::Halted);
        assert!(published(&effects).is_empty());
        assert_eq!(sim.state().restart_acks_received, 0);
        assert_relative_eq!(sim.state().halt_start_seconds, waiting_since);

        // The new episode announces its own RESTART after a fresh timeout
        let effects = ticks(&mut sim, 52);
        assert_eq!(sim.status(), Status::Restarting);
        assert_eq!(published(&effects), vec![MessageKind::Restart]);
    }

    #[test]
    fn test_restart_after_resume_is_ignored() {
        let mut sim = halted(1);
        for id in 2..=5 {
            sim.handle_message(&restart_from(id));
        }
        assert_eq!(sim.status(), Status::Running);
        assert!(sim.handle_message(&restart_from(3)).is_empty());
        assert_eq!(sim.state().restart_acks_received, 0);
    }

    #[test]
    fn test_manual_stop_cancels_episode() {
        let mut sim = halted(3);
        sim.handle_message(&restart_from(4));
        let effects = sim.request_mode(ClientMode::Stopped);

        assert_eq!(effects, vec![Effect::StopTicker]);
        assert_eq!(sim.status(), Status::Stopped);
        assert_eq!(sim.state().restart_acks_received, 0);
        assert_eq!(sim.state().elapsed_seconds, 0.0);
        assert_eq!(sim.state().current, sim.state().initial);
    }
}

//! Scenario runner - executes safety protocol scenarios.

use crate::exporter::{SimEvent, SimExport, SimFrame};
use crate::scenarios::{release, ScenarioId, SWINGING_INSTANCE};
use crate::world::{SimConfig, SimWorld, WorldMetrics};

use pendulum_core::{PendulumUpdate, QuorumMode, Status};
use pendulum_env::{BusEnvelope, InstanceId, NetworkController, PendulumContext};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScenarioMetrics {
    /// Envelopes published on the safety channel
    pub messages_published: u64,

    /// Per-recipient copies lost to faults
    pub messages_dropped: u64,

    pub halts: u64,
    pub restarts: u64,

    /// Quorum releases across all instances
    pub resumes: u64,

    /// Smallest ground-truth edge gap between any two bodies
    pub min_gap: f64,
}

impl From<WorldMetrics> for ScenarioMetrics {
    fn from(metrics: WorldMetrics) -> Self {
        Self {
            messages_published: metrics.network.published,
            messages_dropped: metrics.network.dropped,
            halts: metrics.halts_published,
            restarts: metrics.restarts_published,
            resumes: metrics.resumes,
            min_gap: metrics.min_gap,
        }
    }
}

type Verdict = Result<(), String>;

/// Runs safety protocol scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of instances
    instances: u32,

    /// Simulated duration per scenario
    duration: Duration,

    quorum_mode: QuorumMode,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, instances: u32) -> Self {
        Self {
            seed,
            instances,
            duration: Duration::from_secs(10),
            quorum_mode: QuorumMode::default(),
        }
    }

    /// Sets the simulated duration. Scenarios that need longer get longer.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration = Duration::from_secs_f64(secs.max(0.0));
        self
    }

    pub fn with_quorum_mode(mut self, mode: QuorumMode) -> Self {
        self.quorum_mode = mode;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, 0).0
    }

    /// Runs a scenario, recording a frame every tick.
    pub fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let (result, frames, events) = self.execute(scenario, 1);

        let mut export = SimExport::new(scenario.name(), self.seed);
        for frame in frames {
            export.add_frame(frame);
        }
        export.finalize(events, result.passed, result.failure_reason.clone());
        (result, export)
    }

    fn execute(&self, scenario: ScenarioId, frame_interval: u64) -> (ScenarioResult, Vec<SimFrame>, Vec<SimEvent>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let instances = self.instances.max(scenario.min_instances());
        if instances != self.instances {
            warn!(requested = self.instances, instances, "scenario needs a larger swarm");
        }
        let duration = self.duration.max(scenario.min_duration());
        if duration != self.duration {
            debug!(?duration, "extending run to the scenario minimum");
        }

        let config = SimConfig {
            seed: self.seed,
            instances,
            quorum_mode: self.quorum_mode,
            frame_interval,
            ..SimConfig::default()
        };
        let mut world = match SimWorld::new(config) {
            Ok(world) => world,
            Err(err) => {
                let result = ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    failure_reason: Some(format!("invalid configuration: {err}")),
                    metrics: ScenarioMetrics::default(),
                };
                return (result, Vec::new(), Vec::new());
            }
        };

        let verdict = match scenario {
            ScenarioId::NearMiss => self.run_near_miss(&mut world, duration),
            ScenarioId::ClearSwing => self.run_clear_swing(&mut world, duration),
            ScenarioId::LostRestart => self.run_lost_restart(&mut world, duration),
            ScenarioId::DuplicateRestart => self.run_duplicate_restart(&mut world, duration),
            ScenarioId::ManualReset => self.run_manual_reset(&mut world, duration),
        };

        let metrics = ScenarioMetrics::from(world.metrics());
        info!(
            "{} complete: {} halts, {} restarts, {} resumes, min gap {:.2}",
            scenario.name(),
            metrics.halts,
            metrics.restarts,
            metrics.resumes,
            metrics.min_gap
        );

        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: verdict.is_ok(),
            total_ticks: world.tick_count(),
            final_time_secs: world.now_secs(),
            failure_reason: verdict.err(),
            metrics,
        };
        let events = world.events().to_vec();
        (result, world.take_frames(), events)
    }

    /// DST-001: NearMiss - detection, swarm-wide halt, quorum restart.
    ///
    /// **Assertion**: the swinging instance raises the halt, bodies never
    /// overlap, and every instance is released by quorum.
    fn run_near_miss(&self, world: &mut SimWorld, duration: Duration) -> Verdict {
        info!("DST-001: NearMiss");
        start_all(world, ScenarioId::NearMiss);
        world.run_for(duration);

        let first_halt = world
            .transitions()
            .iter()
            .find(|t| t.to == Status::Halted)
            .copied()
            .ok_or("no safety halt fired")?;
        if first_halt.instance != SWINGING_INSTANCE {
            return Err(format!(
                "instance {} halted first, expected {}",
                first_halt.instance, SWINGING_INSTANCE
            ));
        }

        let min_gap = world.metrics().min_gap;
        if min_gap <= 0.0 {
            return Err(format!("bodies overlapped (min gap {min_gap:.2})"));
        }
        every_instance_resumed(world, 1..=world.config().instances)
    }

    /// DST-002: ClearSwing - no false positives.
    ///
    /// **Assertion**: no halt, everyone still Running, gap never below the
    /// safety distance.
    fn run_clear_swing(&self, world: &mut SimWorld, duration: Duration) -> Verdict {
        info!("DST-002: ClearSwing");
        start_all(world, ScenarioId::ClearSwing);
        world.run_for(duration);

        let metrics = world.metrics();
        if metrics.halts_published > 0 {
            return Err(format!("{} halts fired on a clear swing", metrics.halts_published));
        }
        if let Some(status) = world.statuses().into_iter().find(|s| *s != Status::Running) {
            return Err(format!("an instance ended {status}"));
        }
        let safety = world.config().safety_distance;
        if metrics.min_gap < safety {
            return Err(format!("gap {:.2} below safety distance {safety}", metrics.min_gap));
        }
        Ok(())
    }

    /// DST-003: LostRestart - one dead link blocks one instance's quorum.
    ///
    /// **Assertion**: instance 1 never resumes while everyone else does.
    /// Once the others run into each other again, their new HALT pulls
    /// instance 1 into a fresh episode, so it may end Halted or Restarting.
    fn run_lost_restart(&self, world: &mut SimWorld, duration: Duration) -> Verdict {
        info!("DST-003: LostRestart");
        let last = InstanceId(world.config().instances);
        let blocked = InstanceId(1);
        world.controller().set_link_loss(last, blocked, 1.0);

        start_all(world, ScenarioId::LostRestart);
        world.run_for(duration);

        let status = status_of(world, blocked)?;
        if !status.in_halt_episode() || world.resumes_of(blocked) > 0 {
            return Err(format!(
                "instance {blocked} ended {status} after {} resumes without {last}'s RESTART",
                world.resumes_of(blocked)
            ));
        }
        every_instance_resumed(world, 2..=last.get())
    }

    /// DST-004: DuplicateRestart - replayed RESTARTs during a halt.
    ///
    /// **Assertion**: nobody resumes before every instance has timed out.
    fn run_duplicate_restart(&self, world: &mut SimWorld, duration: Duration) -> Verdict {
        info!("DST-004: DuplicateRestart");
        start_all(world, ScenarioId::DuplicateRestart);

        let halted = world.run_until(Duration::from_secs(2), |w| {
            w.statuses().iter().all(|s| *s == Status::Halted)
        });
        if !halted {
            return Err("swarm never halted".to_string());
        }

        let replayer = InstanceId(2);
        for _ in 0..world.config().instances {
            world.inject(BusEnvelope::new(replayer, "RESTART replayed"));
        }
        world.run_for(duration.saturating_sub(world.context().now()));

        let n = world.config().instances as usize;
        let first_resume = world
            .transitions()
            .iter()
            .find(|t| t.is_resume())
            .copied()
            .ok_or("swarm never resumed")?;
        let timed_out: BTreeSet<InstanceId> = world
            .transitions()
            .iter()
            .filter(|t| t.to == Status::Restarting && t.time_secs <= first_resume.time_secs)
            .map(|t| t.instance)
            .collect();

        if timed_out.len() < n {
            return Err(format!(
                "instance {} resumed at {:.2}s while only {} of {} instances had timed out",
                first_resume.instance,
                first_resume.time_secs,
                timed_out.len(),
                n
            ));
        }
        Ok(())
    }

    /// DST-005: ManualReset - a client stops the trigger instance mid-halt.
    ///
    /// **Assertion**: the stopped instance is back at its release point with
    /// the clock at zero, and the rest wait in Restarting.
    fn run_manual_reset(&self, world: &mut SimWorld, duration: Duration) -> Verdict {
        info!("DST-005: ManualReset");
        start_all(world, ScenarioId::ManualReset);

        let halted = world.run_until(Duration::from_secs(2), |w| {
            w.instance(SWINGING_INSTANCE).map(|s| s.status()) == Some(Status::Halted)
        });
        if !halted {
            return Err("instance 3 never halted".to_string());
        }
        world.run_for(Duration::from_secs(1));

        let stop = PendulumUpdate {
            status: Some("Stopped".to_string()),
            ..Default::default()
        };
        let snap = world
            .apply_update(SWINGING_INSTANCE, &stop)
            .ok_or("instance 3 missing")?;
        if snap.status != Status::Stopped
            || snap.seconds != 0.0
            || (snap.x, snap.y) != (snap.x_initial, snap.y_initial)
        {
            return Err(format!("stop did not reset instance 3: {snap:?}"));
        }

        world.run_for(duration.saturating_sub(world.context().now()));

        for id in 1..=world.config().instances {
            let id = InstanceId(id);
            let expected = if id == SWINGING_INSTANCE {
                Status::Stopped
            } else {
                Status::Restarting
            };
            let status = status_of(world, id)?;
            if status != expected {
                return Err(format!("instance {id} ended {status}, expected {expected}"));
            }
        }
        Ok(())
    }
}

fn start_all(world: &mut SimWorld, scenario: ScenarioId) {
    for id in 1..=world.config().instances {
        let id = InstanceId(id);
        world.apply_update(id, &release(id, scenario.swing_degrees()));
    }
}

fn status_of(world: &SimWorld, id: InstanceId) -> Result<Status, String> {
    world
        .instance(id)
        .map(|sim| sim.status())
        .ok_or_else(|| format!("instance {id} missing"))
}

fn every_instance_resumed(world: &SimWorld, ids: std::ops::RangeInclusive<u32>) -> Verdict {
    match ids.map(InstanceId).find(|id| world.resumes_of(*id) == 0) {
        Some(id) => Err(format!("instance {id} never resumed")),
        None => Ok(()),
    }
}

//! Instance configuration.

use pendulum_env::InstanceId;
use std::time::Duration;

use crate::collision::DEFAULT_SAFETY_DISTANCE;
use crate::error::ConfigError;
use crate::protocol::QuorumMode;

/// Configuration shared by the state machine and the runtime.
///
/// Tick interval, halt timeout and safety distance must be identical on
/// every instance of a swarm.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// This instance's identity (1..=instance_count)
    pub instance_id: InstanceId,

    /// Number of instances in the swarm (N)
    pub instance_count: u32,

    /// Fixed tick interval (default: 100ms)
    pub tick_interval: Duration,

    /// Time spent Halted before requesting a restart (default: 5s)
    pub halt_timeout: Duration,

    /// Minimum edge-to-edge gap (default: 10)
    pub safety_distance: f64,

    /// Per-neighbor query deadline, shorter than the tick (default: 80ms)
    pub probe_timeout: Duration,

    /// Maximum outstanding neighbor queries (default: 8)
    pub max_inflight_probes: usize,

    pub quorum_mode: QuorumMode,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            instance_id: InstanceId(1),
            instance_count: 5,
            tick_interval: Duration::from_millis(100),
            halt_timeout: Duration::from_secs(5),
            safety_distance: DEFAULT_SAFETY_DISTANCE,
            probe_timeout: Duration::from_millis(80),
            max_inflight_probes: 8,
            quorum_mode: QuorumMode::DistinctInstances,
        }
    }
}

impl SimulationConfig {
    /// Config for `instance_id` in a swarm of `instance_count`.
    pub fn for_instance(instance_id: u32, instance_count: u32) -> Self {
        Self {
            instance_id: InstanceId(instance_id),
            instance_count,
            ..Self::default()
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_halt_timeout(mut self, timeout: Duration) -> Self {
        self.halt_timeout = timeout;
        self
    }

    pub fn with_safety_distance(mut self, distance: f64) -> Self {
        self.safety_distance = distance;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_max_inflight_probes(mut self, max: usize) -> Self {
        self.max_inflight_probes = max;
        self
    }

    pub fn with_quorum_mode(mut self, mode: QuorumMode) -> Self {
        self.quorum_mode = mode;
        self
    }

    /// Tick interval in simulated seconds.
    pub fn tick_seconds(&self) -> f64 {
        self.tick_interval.as_secs_f64()
    }

    /// Number of RESTART acknowledgements needed to resume.
    pub fn quorum_size(&self) -> u32 {
        self.instance_count.saturating_sub(1)
    }

    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_count == 0 {
            return Err(ConfigError::NoInstances);
        }
        let id = self.instance_id.get();
        if id == 0 || id > self.instance_count {
            return Err(ConfigError::InstanceOutOfRange {
                id,
                count: self.instance_count,
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        if self.probe_timeout >= self.tick_interval {
            return Err(ConfigError::ProbeTimeoutTooLong {
                probe_ms: self.probe_timeout.as_millis(),
                tick_ms: self.tick_interval.as_millis(),
            });
        }
        if self.halt_timeout.is_zero() {
            return Err(ConfigError::ZeroHaltTimeout);
        }
        if !self.safety_distance.is_finite() {
            return Err(ConfigError::InvalidSafetyDistance(self.safety_distance));
        }
        Ok(())
    }
}

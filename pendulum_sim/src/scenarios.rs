//! Safety protocol scenarios for DST.
//!
//! Every scenario uses the same row of pendulums hanging 100 px apart, with
//! a wider 200 px bay in front of the swinging instance so it can only ever
//! reach its higher neighbor:
//!
//! ```text
//!   x:   0     100          300    400    500   ...
//!        1      2            3 ~>   4      5
//! ```

use pendulum_core::PendulumUpdate;
use pendulum_env::InstanceId;
use std::time::Duration;

/// The instance released off-vertical.
pub const SWINGING_INSTANCE: InstanceId = InstanceId(3);

/// Pendulum length in pixels (one metre).
pub const ROD_LENGTH: f64 = 200.0;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DST-001: one body swings into its neighbor; swarm halts and restarts
    NearMiss,

    /// DST-002: small swing that never gets within the safety distance
    ClearSwing,

    /// DST-003: one RESTART link is dead; the receiver never resumes
    LostRestart,

    /// DST-004: replayed RESTARTs during a halt must not release anyone early
    DuplicateRestart,

    /// DST-005: a client stops the trigger instance mid-halt
    ManualReset,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::NearMiss,
            ScenarioId::ClearSwing,
            ScenarioId::LostRestart,
            ScenarioId::DuplicateRestart,
            ScenarioId::ManualReset,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::NearMiss => "near_miss",
            ScenarioId::ClearSwing => "clear_swing",
            ScenarioId::LostRestart => "lost_restart",
            ScenarioId::DuplicateRestart => "duplicate_restart",
            ScenarioId::ManualReset => "manual_reset",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::NearMiss => "Instance 3 swings within 10 px of 4, all halt, quorum restart",
            ScenarioId::ClearSwing => "Instance 3 swings 10 degrees, no halt ever fires",
            ScenarioId::LostRestart => "RESTART from the last instance never reaches instance 1",
            ScenarioId::DuplicateRestart => "Replayed RESTARTs from instance 2 arrive mid-halt",
            ScenarioId::ManualReset => "Instance 3 is stopped by a client during the halt",
        }
    }

    /// Release angle of the swinging instance, in degrees (negative = away from its higher neighbor).
    pub fn swing_degrees(&self) -> f64 {
        match self {
            ScenarioId::ClearSwing => -10.0,
            _ => -28.0,
        }
    }

    /// Shortest run that lets the scenario's outcome show.
    pub fn min_duration(&self) -> Duration {
        match self {
            ScenarioId::ClearSwing => Duration::from_secs(3),
            ScenarioId::ManualReset => Duration::from_secs(7),
            _ => Duration::from_secs(8),
        }
    }

    /// Smallest swarm the layout needs.
    pub fn min_instances(&self) -> u32 {
        SWINGING_INSTANCE.get() + 1
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "near_miss" | "nearmiss" | "dst-001" => Ok(ScenarioId::NearMiss),
            "clear_swing" | "clearswing" | "dst-002" => Ok(ScenarioId::ClearSwing),
            "lost_restart" | "lostrestart" | "dst-003" => Ok(ScenarioId::LostRestart),
            "duplicate_restart" | "duplicaterestart" | "dst-004" => Ok(ScenarioId::DuplicateRestart),
            "manual_reset" | "manualreset" | "dst-005" => Ok(ScenarioId::ManualReset),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

/// Anchor x coordinate of an instance in the scenario row.
pub fn anchor_x(id: InstanceId) -> f64 {
    let slot = f64::from(id.get().saturating_sub(1)) * 100.0;
    if id >= SWINGING_INSTANCE {
        slot + 100.0
    } else {
        slot
    }
}

/// Start command for an instance: the swinging instance is released at
/// `swing_degrees`, everyone else hangs still.
pub fn release(id: InstanceId, swing_degrees: f64) -> PendulumUpdate {
    let theta = if id == SWINGING_INSTANCE {
        swing_degrees.to_radians()
    } else {
        0.0
    };
    let anchor = anchor_x(id);
    PendulumUpdate {
        x_anchor: Some(anchor),
        y_anchor: Some(0.0),
        x_initial: Some(anchor + ROD_LENGTH * theta.sin()),
        y_initial: Some(ROD_LENGTH * theta.cos()),
        radius: Some(10.0),
        status: Some("Running".to_string()),
    }
}

//! Error types for the pendulum core.

use thiserror::Error;

/// Invalid instance configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Instance count must be at least 1")]
    NoInstances,

    #[error("Instance id {id} outside 1..={count}")]
    InstanceOutOfRange { id: u32, count: u32 },

    #[error("Tick interval must be non-zero")]
    ZeroTick,

    #[error("Probe timeout {probe_ms}ms must be shorter than the tick interval {tick_ms}ms")]
    ProbeTimeoutTooLong { probe_ms: u128, tick_ms: u128 },

    #[error("Halt timeout must be non-zero")]
    ZeroHaltTimeout,

    #[error("Safety distance must be finite, got {0}")]
    InvalidSafetyDistance(f64),
}

/// Errors surfaced by the pendulum core.
#[derive(Debug, Error)]
pub enum PendulumError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

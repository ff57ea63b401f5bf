//! Error types for the pendulum environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
///
/// None of these are fatal to an instance: callers log them and skip the
/// optional work for the current tick.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Network send or fetch failed (connection refused, bad status, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Neighbor instance could not be reached (down, or partitioned in simulation)
    #[error("Neighbor unreachable: {0}")]
    NeighborUnreachable(String),

    /// Envelope or neighbor payload could not be encoded/decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The safety channel has been closed
    #[error("Message bus closed")]
    BusClosed,

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(instance: impl std::fmt::Display) -> Self {
        Self::NeighborUnreachable(instance.to_string())
    }

    /// Returns true for failures that are expected to clear up on their own.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::SerializationError(_) | Self::BusClosed)
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

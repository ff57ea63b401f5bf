//! Pendulum Core - kinematics and the distributed safety protocol
//!
//! Each process simulates one planar pendulum and cooperates with its peers
//! to keep every pair of bodies apart:
//! 1. **Kinematics**: small-angle motion around a fixed anchor
//! 2. **Collision Detection**: each instance checks its higher-indexed neighbors
//! 3. **Coordination**: a HALT broadcast freezes the swarm, and a RESTART
//!    quorum releases it once every instance has waited out its timeout
//!
//! `Simulation` is the sans-IO state machine; `PendulumAgent` runs it against
//! a `PendulumContext`, a `MessageBus` and a `NeighborSource`.

pub mod agent_runtime;
pub mod collision;
pub mod config;
pub mod error;
pub mod kinematics;
pub mod protocol;
pub mod simulation;
pub mod state;

// Re-export key types for convenience
pub use agent_runtime::PendulumAgent;
pub use collision::{CollisionDetector, NeighborSample, Violation};
pub use config::SimulationConfig;
pub use error::{ConfigError, PendulumError};
pub use kinematics::{PendulumMotion, Point};
pub use protocol::{MessageKind, ProtocolMessage, QuorumMode, QuorumTracker};
pub use simulation::{Effect, Simulation};
pub use state::{ClientMode, PendulumSnapshot, PendulumState, PendulumUpdate, Status};

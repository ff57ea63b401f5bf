//! Pendulum Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the pendulum engine run
//! both as a **Production** process (tokio, zenoh, HTTP neighbors) and inside
//! the deterministic **Simulation** harness.
//!
//! # Core Concept: The Reactor Pattern
//!
//! Every source of I/O an instance depends on is intercepted here:
//! - Time (`now()`, `sleep()`, `spawn()`)
//! - The shared safety channel (`publish()`, `recv()`)
//! - Read-only neighbor queries (`fetch()`)
//!
//! # Example
//!
//! ```ignore
//! use pendulum_env::{PendulumContext, MessageBus};
//!
//! async fn subscription_loop<Ctx: PendulumContext, Bus: MessageBus>(ctx: &Ctx, bus: &Bus) {
//!     while let Some(envelope) = bus.recv().await {
//!         handle(envelope, ctx.now());
//!     }
//! }
//! ```

mod context;
mod error;
mod local_bus;
mod network;
mod tokio_impl;
mod types;

pub use context::PendulumContext;
pub use error::EnvError;
pub use local_bus::{LocalBus, LocalBusHub};
pub use network::{MessageBus, NeighborSource, NetworkController};
pub use tokio_impl::TokioContext;
pub use types::{BusEnvelope, InstanceId, NeighborReading};

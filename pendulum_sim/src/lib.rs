//! Pendulum Deterministic Simulation Testing (DST) Harness
//!
//! This crate provides a controlled environment where a whole swarm of
//! pendulum instances runs deterministically inside one thread.
//!
//! # Core Principle: The Reactor Pattern
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances one tick per world step
//! - **Network**: In-memory topic with per-link latency, loss and partitions
//! - **Randomness**: All loss decisions drawn from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (Virtual Clock + Seeded RNG)              │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────┐              ┌────▼────┐                       │
//! │  │Instance │◄────────────►│Instance │     ...               │
//! │  │   #1    │  SimNetwork  │   #2    │                       │
//! │  └─────────┘              └─────────┘                       │
//! │       ▲                        ▲                            │
//! │  ┌────┴────────────────────────┴────┐                       │
//! │  │   Ground-truth gap tracking      │                       │
//! │  └──────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use pendulum_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 5).run(ScenarioId::NearMiss);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod network;
mod runner;
pub mod scenarios;
mod world;

pub use context::SimContext;
pub use exporter::{SimEvent, SimExport, SimFrame};
pub use network::{NetworkStats, SimNetwork, SimNetworkController};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimConfig, SimWorld, Transition, WorldMetrics};

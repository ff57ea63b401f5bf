//! JSON timeline exporter.
//!
//! Exports simulation frames as JSON so a run can be replayed or plotted
//! outside the harness.

use pendulum_core::PendulumSnapshot;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Every instance's published state
    pub instances: Vec<PendulumSnapshot>,

    /// Smallest edge gap between adjacent bodies at this instant
    pub min_gap: f64,
}

/// Simulation event (transitions, publishes, injected faults).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimEvent {
    pub time_sec: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<u32>,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn new(time_sec: f64, instance: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            time_sec,
            instance,
            message: message.into(),
            level: None,
        }
    }

    pub fn warning(mut self) -> Self {
        self.level = Some("warn".to_string());
        self
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// Sampled frames
    pub frames: Vec<SimFrame>,

    /// Every recorded event, in order
    pub events: Vec<SimEvent>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            events: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, events: Vec<SimEvent>, passed: bool, failure_reason: Option<String>) {
        self.events = events;
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

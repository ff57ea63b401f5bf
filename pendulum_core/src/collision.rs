//! Collision Detector - pairwise edge-to-edge gap checks against neighbors.

use pendulum_env::{InstanceId, NeighborReading};

use crate::kinematics::Point;

/// Default minimum allowed gap between two bodies.
pub const DEFAULT_SAFETY_DISTANCE: f64 = 10.0;

/// A neighbor's published position and size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborSample {
    pub instance: InstanceId,
    pub position: Point,
    pub radius: f64,
}

impl From<NeighborReading> for NeighborSample {
    fn from(reading: NeighborReading) -> Self {
        Self {
            instance: reading.instance,
            position: Point::new(reading.x, reading.y),
            radius: reading.radius,
        }
    }
}

/// A gap below the safety distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Violation {
    /// The instance that measured the gap
    pub instance: InstanceId,
    pub neighbor: InstanceId,
    pub gap: f64,
}

/// Distance between two circle edges (negative when they overlap).
pub fn edge_gap(a: &Point, radius_a: f64, b: &Point, radius_b: f64) -> f64 {
    nalgebra::distance(a, b) - (radius_a + radius_b)
}

/// Checks samples from higher-indexed neighbors against a safety margin.
///
/// Pair `(i, j)` is only evaluated by `i` when `i < j`, so each pair is
/// checked once across the whole swarm.
#[derive(Debug, Clone, Copy)]
pub struct CollisionDetector {
    safety_distance: f64,
}

impl CollisionDetector {
    pub fn new(safety_distance: f64) -> Self {
        Self { safety_distance }
    }

    pub fn safety_distance(&self) -> f64 {
        self.safety_distance
    }

    /// Neighbors `instance` is responsible for probing.
    pub fn neighbors_of(&self, instance: InstanceId, instance_count: u32) -> Vec<InstanceId> {
        instance.higher_neighbors(instance_count).collect()
    }

    /// Compares our body against one neighbor sample.
    ///
    /// A gap exactly equal to the safety distance is allowed. Samples from
    /// lower or equal indices, and non-finite gaps, never trigger.
    pub fn check(
        &self,
        instance: InstanceId,
        position: &Point,
        radius: f64,
        sample: &NeighborSample,
    ) -> Option<Violation> {
        if sample.instance <= instance {
            return None;
        }
        let gap = edge_gap(position, radius, &sample.position, sample.radius);
        (gap < self.safety_distance).then_some(Violation {
            instance,
            neighbor: sample.instance,
            gap,
        })
    }
}

impl Default for CollisionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SAFETY_DISTANCE)
    }
}

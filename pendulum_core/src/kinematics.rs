//! The "KINEMATICS" Engine - small-angle pendulum motion
//!
//! Pure, deterministic mapping from (pivot, initial displacement, elapsed
//! time) to the body's current position. Lengths are in screen units, so
//! the period is a calibrated visual period rather than an SI one.
//!
//! Screen coordinates grow downward: a body hanging below its anchor has a
//! larger `y`, and `θ = 0` is straight down.

use nalgebra::Point2;
use std::f64::consts::TAU;

/// A position in the simulation plane.
pub type Point = Point2<f64>;

/// Screen units per "meter" used when converting length into a period.
pub const LENGTH_SCALE: f64 = 200.0;

/// Gravitational acceleration (m/s²).
pub const GRAVITY: f64 = 9.807;

/// Distance from anchor to body.
pub fn pendulum_length(anchor: &Point, initial: &Point) -> f64 {
    nalgebra::distance(anchor, initial)
}

/// Angular displacement of `initial` from the downward vertical through `anchor`.
///
/// Zero-length pendulums have no defined angle and report 0.
pub fn initial_angle(anchor: &Point, initial: &Point) -> f64 {
    let offset = initial - anchor;
    if offset.x == 0.0 && offset.y == 0.0 {
        return 0.0;
    }
    offset.x.atan2(offset.y)
}

/// Oscillation period for a pendulum of the given length.
///
/// Returns `None` for zero, negative or non-finite lengths.
pub fn period(length: f64) -> Option<f64> {
    if !length.is_finite() || length <= 0.0 {
        return None;
    }
    Some(TAU * ((length / LENGTH_SCALE) / GRAVITY).sqrt())
}

/// Undamped simple-harmonic angle at time `seconds`.
pub fn angle_at(theta0: f64, period: f64, seconds: f64) -> f64 {
    theta0 * (TAU * seconds / period).cos()
}

/// Position of the body at `seconds` after release from `initial`.
///
/// A zero-length pendulum is stationary at its anchor. Negative times are
/// clamped to zero.
pub fn position_at(anchor: &Point, initial: &Point, seconds: f64) -> Point {
    PendulumMotion::new(*anchor, *initial).position_at(seconds)
}

/// Precomputed motion parameters for one release.
///
/// The tick loop evaluates the same release many times; this keeps the
/// square roots and `atan2` out of the per-tick path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendulumMotion {
    anchor: Point,
    length: f64,
    theta0: f64,
    period: Option<f64>,
}

impl PendulumMotion {
    /// Creates the motion for a body released at `initial` around `anchor`.
    pub fn new(anchor: Point, initial: Point) -> Self {
        let length = pendulum_length(&anchor, &initial);
        let period = period(length);
        let theta0 = if period.is_some() {
            initial_angle(&anchor, &initial)
        } else {
            0.0
        };

        Self {
            anchor,
            length,
            theta0,
            period,
        }
    }

    /// Returns the pendulum length.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Returns the initial angular displacement (radians).
    pub fn theta0(&self) -> f64 {
        self.theta0
    }

    /// Returns the period, or `None` for a stationary pendulum.
    pub fn period(&self) -> Option<f64> {
        self.period
    }

    /// Position of the body at `seconds`.
    pub fn position_at(&self, seconds: f64) -> Point {
        let Some(period) = self.period else {
            return self.anchor;
        };
        let theta = angle_at(self.theta0, period, seconds.max(0.0));
        Point::new(
            self.anchor.x + theta.sin() * self.length,
            self.anchor.y + theta.cos() * self.length,
        )
    }
}

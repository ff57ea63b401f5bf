//! Instance State - the per-process pendulum record and its wire forms.

use pendulum_env::InstanceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::kinematics::Point;

/// Body radius used until a client supplies one.
pub const DEFAULT_RADIUS: f64 = 10.0;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Stopped,
    Running,
    Paused,
    Halted,
    Restarting,
}

impl Status {
    /// Returns the status name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Status::Stopped => "Stopped",
            Status::Running => "Running",
            Status::Paused => "Paused",
            Status::Halted => "Halted",
            Status::Restarting => "Restarting",
        }
    }

    /// True while the tick clock advances.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Running | Status::Halted | Status::Restarting)
    }

    /// True between entering Halted and resuming Running.
    pub fn in_halt_episode(&self) -> bool {
        matches!(self, Status::Halted | Status::Restarting)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A mode a client may ask for.
///
/// Halted and Restarting belong to the safety protocol and can't be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Stopped,
    Running,
    Paused,
}

impl ClientMode {
    /// Maps a requested status string onto a client mode.
    ///
    /// Missing or unrecognized values mean Stopped. Protocol-owned statuses
    /// return `None`, leaving the current mode untouched.
    pub fn from_request(raw: Option<&str>) -> Option<ClientMode> {
        match raw {
            Some("Running") => Some(ClientMode::Running),
            Some("Paused") => Some(ClientMode::Paused),
            Some("Halted") | Some("Restarting") => None,
            _ => Some(ClientMode::Stopped),
        }
    }
}

/// The per-instance pendulum record.
///
/// Owned by exactly one `Simulation`; everyone else sees a `PendulumSnapshot`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendulumState {
    /// Static identity, 1..N
    pub instance_id: InstanceId,

    /// Fixed pivot
    pub anchor: Point,

    /// Displacement at time zero
    pub initial: Point,

    /// Position at the current simulated time
    pub current: Point,

    /// Body size used for edge-to-edge distance
    pub radius: f64,

    /// Simulated time since release (or since the last quorum restart)
    pub elapsed_seconds: f64,

    pub status: Status,

    /// `elapsed_seconds` at the moment Halted was entered
    pub halt_start_seconds: f64,

    /// RESTART acknowledgements counted in the current halt episode
    pub restart_acks_received: u32,
}

impl PendulumState {
    /// Creates a stopped pendulum at the origin.
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            anchor: Point::origin(),
            initial: Point::origin(),
            current: Point::origin(),
            radius: DEFAULT_RADIUS,
            elapsed_seconds: 0.0,
            status: Status::Stopped,
            halt_start_seconds: 0.0,
            restart_acks_received: 0,
        }
    }

    /// Puts the body back at its release point with the clock at zero.
    pub fn reset_to_initial(&mut self) {
        self.current = self.initial;
        self.elapsed_seconds = 0.0;
    }

    /// Clears halt-episode bookkeeping.
    pub fn clear_episode(&mut self) {
        self.halt_start_seconds = 0.0;
        self.restart_acks_received = 0;
    }

    /// Returns the wire projection of this state.
    pub fn snapshot(&self) -> PendulumSnapshot {
        PendulumSnapshot {
            x_anchor: self.anchor.x,
            y_anchor: self.anchor.y,
            x_initial: self.initial.x,
            y_initial: self.initial.y,
            x: self.current.x,
            y: self.current.y,
            radius: self.radius,
            seconds: self.elapsed_seconds,
            status: self.status,
            instance: self.instance_id,
        }
    }
}

/// JSON document served by `GET /pendulum`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendulumSnapshot {
    pub x_anchor: f64,
    pub y_anchor: f64,
    pub x_initial: f64,
    pub y_initial: f64,
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    pub seconds: f64,
    pub status: Status,
    pub instance: InstanceId,
}

/// JSON body accepted by `PUT /pendulum`.
///
/// Every field is optional; parsing never rejects a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PendulumUpdate {
    pub x_anchor: Option<f64>,
    pub y_anchor: Option<f64>,
    pub x_initial: Option<f64>,
    pub y_initial: Option<f64>,
    pub radius: Option<f64>,
    pub status: Option<String>,
}

impl PendulumUpdate {
    /// Parses a request body field by field.
    ///
    /// A field that is missing or has the wrong type falls back to its
    /// default on its own; the rest of the body still applies. A body that
    /// isn't a JSON object is an empty update.
    pub fn from_slice_lenient(body: &[u8]) -> Self {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Self::default();
        }
        let fields = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                warn!(body = %other, "pendulum update is not an object, using defaults");
                return Self::default();
            }
            Err(err) => {
                warn!(error = %err, "malformed pendulum update, using defaults");
                return Self::default();
            }
        };

        let number = |name: &str| -> Option<f64> {
            let value = fields.get(name)?;
            let parsed = value.as_f64();
            if parsed.is_none() && !value.is_null() {
                warn!(field = name, %value, "ignoring non-numeric field");
            }
            parsed
        };
        let status = fields.get("status").and_then(|value| {
            let parsed = value.as_str().map(str::to_string);
            if parsed.is_none() && !value.is_null() {
                warn!(%value, "ignoring non-string status");
            }
            parsed
        });

        Self {
            x_anchor: number("xAnchor"),
            y_anchor: number("yAnchor"),
            x_initial: number("xInitial"),
            y_initial: number("yInitial"),
            radius: number("radius"),
            status,
        }
    }

    /// Requested pivot; missing coordinates are 0.
    pub fn anchor(&self) -> Point {
        Point::new(self.x_anchor.unwrap_or(0.0), self.y_anchor.unwrap_or(0.0))
    }

    /// Requested release point; missing coordinates are 0.
    pub fn initial(&self) -> Point {
        Point::new(self.x_initial.unwrap_or(0.0), self.y_initial.unwrap_or(0.0))
    }

    /// Requested radius; missing or non-positive values fall back to the default.
    pub fn radius(&self) -> f64 {
        self.radius
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(DEFAULT_RADIUS)
    }

    /// Requested client mode, if any.
    pub fn mode(&self) -> Option<ClientMode> {
        ClientMode::from_request(self.status.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_stopped_at_origin() {
        let state = PendulumState::new(InstanceId(2));
        assert_eq!(state.status, Status::Stopped);
        assert_eq!(state.current, Point::origin());
        assert_eq!(state.radius, DEFAULT_RADIUS);
        assert_eq!(state.elapsed_seconds, 0.0);
    }

    #[test]
    fn test_snapshot_wire_names() {
        let mut state = PendulumState::new(InstanceId(3));
        state.anchor = Point::new(300.0, 0.0);
        state.current = Point::new(310.0, 190.0);
        state.status = Status::Halted;

        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["xAnchor"], 300.0);
        assert_eq!(json["x"], 310.0);
        assert_eq!(json["status"], "Halted");
        assert_eq!(json["instance"], 3);
        assert!(json.get("seconds").is_some());
    }

    #[test]
    fn test_client_mode_mapping() {
        assert_eq!(ClientMode::from_request(Some("Running")), Some(ClientMode::Running));
        assert_eq!(ClientMode::from_request(Some("Paused")), Some(ClientMode::Paused));
        assert_eq!(ClientMode::from_request(Some("Stopped")), Some(ClientMode::Stopped));
        assert_eq!(ClientMode::from_request(Some("Bogus")), Some(ClientMode::Stopped));
        assert_eq!(ClientMode::from_request(Some("running")), Some(ClientMode::Stopped));
        assert_eq!(ClientMode::from_request(None), Some(ClientMode::Stopped));
        assert_eq!(ClientMode::from_request(Some("Halted")), None);
    }

    #[test]
    fn test_update_defaults() {
        let update = PendulumUpdate::from_slice_lenient(br#"{"xAnchor": 5, "status": "Running"}"#);
        assert_eq!(update.anchor(), Point::new(5.0, 0.0));
        assert_eq!(update.initial(), Point::origin());
        assert_eq!(update.radius(), DEFAULT_RADIUS);
        assert_eq!(update.mode(), Some(ClientMode::Running));
    }

    #[test]
    fn test_update_malformed_body() {
        let update = PendulumUpdate::from_slice_lenient(b"{not json");
        assert_eq!(update, PendulumUpdate::default());
        assert_eq!(update.mode(), Some(ClientMode::Stopped));

        let update = PendulumUpdate::from_slice_lenient(br#"{"radius": "big"}"#);
        assert_eq!(update, PendulumUpdate::default());

        assert_eq!(PendulumUpdate::from_slice_lenient(b""), PendulumUpdate::default());
        assert_eq!(PendulumUpdate::from_slice_lenient(b"[1, 2]"), PendulumUpdate::default());
    }

    #[test]
    fn test_update_bad_field_keeps_the_rest() {
        let update = PendulumUpdate::from_slice_lenient(
            br#"{"xAnchor": 300, "yInitial": null, "radius": "10", "status": "Running"}"#,
        );
        assert_eq!(update.x_anchor, Some(300.0));
        assert_eq!(update.y_initial, None);
        assert_eq!(update.radius(), DEFAULT_RADIUS);
        assert_eq!(update.mode(), Some(ClientMode::Running));

        let update = PendulumUpdate::from_slice_lenient(br#"{"radius": 12, "status": 7}"#);
        assert_eq!(update.radius(), 12.0);
        assert_eq!(update.mode(), Some(ClientMode::Stopped));
    }
}

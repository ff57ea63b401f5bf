//! Common types for the pendulum environment abstraction.

use serde::{Deserialize, Serialize};

/// Static identity of a pendulum instance, `1..=N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl InstanceId {
    /// Returns the raw index.
    pub fn get(self) -> u32 {
        self.0
    }

    /// Iterates the instances with a strictly higher index, up to `count`.
    pub fn higher_neighbors(self, count: u32) -> impl Iterator<Item = InstanceId> {
        (self.0 + 1..=count).map(InstanceId)
    }
}

impl From<u32> for InstanceId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope carried on the safety channel.
///
/// `body` is free text starting with a message keyword; everything after the
/// keyword is diagnostic. `from` is structured so receivers never have to
/// parse the text to learn who sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Sending instance
    pub from: InstanceId,

    /// Free-text payload, e.g. `HALT instance 3 ...`
    pub body: String,
}

impl BusEnvelope {
    /// Creates an envelope.
    pub fn new(from: InstanceId, body: impl Into<String>) -> Self {
        Self {
            from,
            body: body.into(),
        }
    }

    /// Encodes the envelope for a byte/string transport.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes an envelope received from a byte/string transport.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// What an instance learns about a neighbor from a read-only query.
///
/// Deserializes from the full `GET /pendulum` document; extra fields are
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeighborReading {
    pub instance: InstanceId,
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

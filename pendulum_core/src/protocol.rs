//! Coordination Protocol - HALT broadcast and quorum restart
//!
//! Messages travel as `BusEnvelope`s on one shared topic. The body is free
//! text whose first word is the message keyword; anything after it is for
//! humans reading logs. Control decisions look only at that keyword and at
//! the envelope's structured sender.

use pendulum_env::{BusEnvelope, InstanceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::collision::Violation;

/// Keyword opening a halt message.
pub const HALT_KEYWORD: &str = "HALT";

/// Keyword opening a restart message.
pub const RESTART_KEYWORD: &str = "RESTART";

/// Kinds of safety message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Halt,
    Restart,
}

impl MessageKind {
    /// Classifies a body by its leading keyword.
    ///
    /// The keyword must be followed by the end of the body or a
    /// non-alphanumeric character, so `HALTED` is not a halt.
    pub fn parse(body: &str) -> Option<Self> {
        let body = body.trim_start();
        [(HALT_KEYWORD, MessageKind::Halt), (RESTART_KEYWORD, MessageKind::Restart)]
            .into_iter()
            .find(|(keyword, _)| {
                body.strip_prefix(keyword)
                    .is_some_and(|rest| !rest.starts_with(|c: char| c.is_alphanumeric()))
            })
            .map(|(_, kind)| kind)
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            MessageKind::Halt => HALT_KEYWORD,
            MessageKind::Restart => RESTART_KEYWORD,
        }
    }
}

/// A decoded safety message.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    pub from: InstanceId,
    pub kind: MessageKind,

    /// Diagnostic text after the keyword
    pub detail: String,
}

impl ProtocolMessage {
    /// HALT announcing a measured violation.
    pub fn halt(violation: &Violation) -> Self {
        Self {
            from: violation.instance,
            kind: MessageKind::Halt,
            detail: format!(
                "triggered by instance {}: distance to neighbor {} is {:.2}",
                violation.instance, violation.neighbor, violation.gap
            ),
        }
    }

    /// RESTART announcing that `from` has waited out its halt timeout.
    pub fn restart(from: InstanceId) -> Self {
        Self {
            from,
            kind: MessageKind::Restart,
            detail: format!("requested by instance {from}"),
        }
    }

    /// Full free-text body, keyword first.
    pub fn body(&self) -> String {
        if self.detail.is_empty() {
            self.kind.keyword().to_string()
        } else {
            format!("{} {}", self.kind.keyword(), self.detail)
        }
    }

    pub fn to_envelope(&self) -> BusEnvelope {
        BusEnvelope::new(self.from, self.body())
    }

    /// Decodes an envelope; unknown keywords yield `None`.
    pub fn from_envelope(envelope: &BusEnvelope) -> Option<Self> {
        let kind = MessageKind::parse(&envelope.body)?;
        let detail = envelope.body.trim_start()[kind.keyword().len()..]
            .trim()
            .to_string();
        Some(Self {
            from: envelope.from,
            kind,
            detail,
        })
    }
}

/// How RESTART acknowledgements are counted toward quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumMode {
    /// Each other instance counts once per halt episode.
    #[default]
    DistinctInstances,

    /// Every RESTART arrival counts, including duplicates and our own echo.
    RawCount,
}

impl std::str::FromStr for QuorumMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "distinct" | "distinct_instances" => Ok(QuorumMode::DistinctInstances),
            "raw" | "raw_count" => Ok(QuorumMode::RawCount),
            _ => Err(format!("Unknown quorum mode: {}", s)),
        }
    }
}

impl std::fmt::Display for QuorumMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuorumMode::DistinctInstances => f.write_str("distinct"),
            QuorumMode::RawCount => f.write_str("raw"),
        }
    }
}

/// Counts RESTART acknowledgements within one halt episode.
#[derive(Debug, Clone)]
pub struct QuorumTracker {
    mode: QuorumMode,
    local: InstanceId,
    instance_count: u32,
    required: u32,
    acknowledged: BTreeSet<InstanceId>,
    arrivals: u32,
}

impl QuorumTracker {
    /// Tracker needing acknowledgements from all `instance_count - 1` others.
    pub fn new(mode: QuorumMode, local: InstanceId, instance_count: u32) -> Self {
        Self {
            mode,
            local,
            instance_count,
            required: instance_count.saturating_sub(1),
            acknowledged: BTreeSet::new(),
            arrivals: 0,
        }
    }

    /// Records a RESTART from `from`. Returns true if it changed the count.
    ///
    /// Distinct counting only accepts swarm members other than ourselves.
    pub fn record(&mut self, from: InstanceId) -> bool {
        match self.mode {
            QuorumMode::DistinctInstances => {
                from != self.local
                    && (1..=self.instance_count).contains(&from.get())
                    && self.acknowledged.insert(from)
            }
            QuorumMode::RawCount => {
                self.arrivals = self.arrivals.saturating_add(1);
                true
            }
        }
    }

    pub fn count(&self) -> u32 {
        match self.mode {
            QuorumMode::DistinctInstances => self.acknowledged.len() as u32,
            QuorumMode::RawCount => self.arrivals,
        }
    }

    pub fn required(&self) -> u32 {
        self.required
    }

    pub fn is_met(&self) -> bool {
        self.count() >= self.required
    }

    pub fn reset(&mut self) {
        self.acknowledged.clear();
        self.arrivals = 0;
    }

    pub fn mode(&self) -> QuorumMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_parsing() {
        assert_eq!(MessageKind::parse("HALT"), Some(MessageKind::Halt));
        assert_eq!(MessageKind::parse("HALT instance 3"), Some(MessageKind::Halt));
        assert_eq!(MessageKind::parse("  RESTART: now"), Some(MessageKind::Restart));
        assert_eq!(MessageKind::parse("HALTED"), None);
        assert_eq!(MessageKind::parse("halt"), None);
        assert_eq!(MessageKind::parse("please HALT"), None);
        assert_eq!(MessageKind::parse(""), None);
    }

    #[test]
    fn test_detail_is_not_interpreted() {
        // A restart whose diagnostic mentions HALT is still a restart
        let envelope = BusEnvelope::new(InstanceId(2), "RESTART after HALT from 3");
        let msg = ProtocolMessage::from_envelope(&envelope).unwrap();
        assert_eq!(msg.kind, MessageKind::Restart);
        assert_eq!(msg.from, InstanceId(2));
        assert_eq!(msg.detail, "after HALT from 3");
    }

    #[test]
    fn test_halt_body_carries_diagnostics() {
        let msg = ProtocolMessage::halt(&Violation {
            instance: InstanceId(3),
            neighbor: InstanceId(4),
            gap: 4.0,
        });
        let envelope = msg.to_envelope();
        assert_eq!(envelope.from, InstanceId(3));
        assert!(envelope.body.starts_with("HALT "));
        assert!(envelope.body.contains("neighbor 4"));
        assert!(envelope.body.contains("4.00"));
    }

    #[test]
    fn test_distinct_quorum_ignores_duplicates_and_self() {
        let mut tracker = QuorumTracker::new(QuorumMode::DistinctInstances, InstanceId(1), 3);
        assert_eq!(tracker.required(), 2);

        assert!(tracker.record(InstanceId(2)));
        assert!(!tracker.record(InstanceId(2)));
        assert!(!tracker.record(InstanceId(1)));
        assert!(!tracker.is_met());

        assert!(tracker.record(InstanceId(3)));
        assert!(tracker.is_met());

        tracker.reset();
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_distinct_quorum_ignores_non_members() {
        let mut tracker = QuorumTracker::new(QuorumMode::DistinctInstances, InstanceId(1), 5);
        for id in [2, 3, 4] {
            assert!(tracker.record(InstanceId(id)));
        }
        assert!(!tracker.record(InstanceId(99)));
        assert!(!tracker.record(InstanceId(6)));
        assert!(!tracker.record(InstanceId(0)));
        assert_eq!(tracker.count(), 3);
        assert!(!tracker.is_met());

        assert!(tracker.record(InstanceId(5)));
        assert!(tracker.is_met());
    }

    #[test]
    fn test_raw_quorum_counts_every_arrival() {
        let mut tracker = QuorumTracker::new(QuorumMode::RawCount, InstanceId(1), 3);
        tracker.record(InstanceId(2));
        tracker.record(InstanceId(2));
        assert!(tracker.is_met());
    }

    #[test]
    fn test_quorum_mode_from_str() {
        assert_eq!("raw".parse::<QuorumMode>().unwrap(), QuorumMode::RawCount);
        assert_eq!("distinct".parse::<QuorumMode>().unwrap(), QuorumMode::DistinctInstances);
        assert!("majority".parse::<QuorumMode>().is_err());
    }
}

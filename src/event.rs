//! Breath event model shared by detectors, the scorer and the relay

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Relay-assigned participant identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which input produced a breath event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreathSource {
    Mic,
    Touch,
}

impl BreathSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreathSource::Mic => "mic",
            BreathSource::Touch => "touch",
        }
    }
}

/// Phase label carried over the relay.
///
/// `Exhale` marks a completed cycle and is the only phase that is scored.
/// `Inhale` is the rising edge, relayed so other clients can animate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreathPhase {
    Inhale,
    Exhale,
}

impl BreathPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreathPhase::Inhale => "inhale",
            BreathPhase::Exhale => "exhale",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "inhale" => Some(BreathPhase::Inhale),
            "exhale" => Some(BreathPhase::Exhale),
            _ => None,
        }
    }
}

/// One energy reading from the sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergySample {
    pub timestamp_ms: u64,
    pub normalized_volume: f32,
}

impl EnergySample {
    pub fn new(timestamp_ms: u64, normalized_volume: f32) -> Self {
        Self {
            timestamp_ms,
            normalized_volume,
        }
    }
}

/// A completed breath cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreathEvent {
    pub participant_id: ParticipantId,
    pub source: BreathSource,
    /// Milliseconds on the session clock of the client that observed it
    pub timestamp_ms: u64,
    /// Per-participant sequence number, starting at 1
    pub seq: u64,
}

impl BreathEvent {
    /// Key used to drop relay echoes and redeliveries
    pub fn dedup_key(&self) -> (ParticipantId, u64) {
        (self.participant_id, self.seq)
    }
}

/// Per-participant sequence shared by every local detector.
///
/// Cloning hands out another handle to the same counter, so switching
/// from microphone to touch input never reuses a sequence number.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    next: Arc<AtomicU64>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next sequence number
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last allocated number (0 if none yet)
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_shared_between_clones() {
        let seq = SequenceCounter::new();
        let other = seq.clone();

        assert_eq!(seq.next(), 1);
        assert_eq!(other.next(), 2);
        assert_eq!(seq.current(), 2);
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(BreathPhase::from_str("EXHALE"), Some(BreathPhase::Exhale));
        assert_eq!(BreathPhase::from_str("hold"), None);
        assert_eq!(BreathPhase::Inhale.as_str(), "inhale");
    }

    #[test]
    fn test_event_wire_format() {
        let event = BreathEvent {
            participant_id: ParticipantId(7),
            source: BreathSource::Touch,
            timestamp_ms: 1500,
            seq: 3,
        };
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["participant_id"], 7);
        assert_eq!(json["source"], "touch");
    }
}

//! Manual press/release breath input for when no microphone is available

use super::DetectorState;
use crate::event::{BreathEvent, BreathSource, ParticipantId, SequenceCounter};
use tracing::debug;

/// Touch-driven detector: press starts a breath, release completes it
pub struct TouchFallbackDetector {
    participant_id: ParticipantId,
    sequence: SequenceCounter,
    state: DetectorState,
    pressed_at: Option<u64>,
}

impl TouchFallbackDetector {
    pub fn new(participant_id: ParticipantId, sequence: SequenceCounter) -> Self {
        Self {
            participant_id,
            sequence,
            state: DetectorState::Quiet,
            pressed_at: None,
        }
    }

    /// Returns true if this press started a breath
    pub fn press(&mut self, timestamp_ms: u64) -> bool {
        if self.state == DetectorState::Breathing {
            return false;
        }
        self.state = DetectorState::Breathing;
        self.pressed_at = Some(timestamp_ms);
        true
    }

    /// Completes the breath started by the last press
    pub fn release(&mut self, timestamp_ms: u64) -> Option<BreathEvent> {
        if self.state != DetectorState::Breathing {
            return None;
        }
        self.state = DetectorState::Quiet;

        let held = self
            .pressed_at
            .take()
            .map(|at| timestamp_ms.saturating_sub(at))
            .unwrap_or_default();

        let event = BreathEvent {
            participant_id: self.participant_id,
            source: BreathSource::Touch,
            timestamp_ms,
            seq: self.sequence.next(),
        };
        debug!(participant = %self.participant_id, seq = event.seq, held_ms = held, "Touch breath complete");
        Some(event)
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_press_release_emits_once() {
        let mut touch = TouchFallbackDetector::new(ParticipantId(3), SequenceCounter::new());

        assert!(touch.press(100));
        assert!(!touch.press(150));
        assert_eq!(touch.state(), DetectorState::Breathing);

        let event = touch.release(900).unwrap();
        assert_eq!(event.source, BreathSource::Touch);
        assert_eq!(event.timestamp_ms, 900);
        assert_eq!(event.seq, 1);

        assert!(touch.release(950).is_none());
        assert_eq!(touch.state(), DetectorState::Quiet);
    }

    #[test]
    fn test_release_without_press() {
        let mut touch = TouchFallbackDetector::new(ParticipantId(3), SequenceCounter::new());
        assert!(touch.release(10).is_none());
    }

    #[test]
    fn test_shares_sequence_with_other_detectors() {
        let seq = SequenceCounter::new();
        seq.next();
        let mut touch = TouchFallbackDetector::new(ParticipantId(3), seq.clone());

        touch.press(0);
        assert_eq!(touch.release(10).unwrap().seq, 2);
    }
}

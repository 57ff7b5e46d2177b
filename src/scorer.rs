//! Rolling group breathing synchrony score
//!
//! Local and remote breath events land in a trailing window. Each tick the
//! window is pruned and the score is nudged toward a blend of two cheap
//! signals: how balanced the local/remote counts are and how many breaths
//! landed close together. Remote events are stamped with the local receipt
//! time, so other devices' clocks never enter the calculation.

use crate::event::{BreathEvent, ParticipantId};
use std::collections::{HashSet, VecDeque};
use tracing::trace;

/// Scoring constants
#[derive(Debug, Clone, PartialEq)]
pub struct ScorerConfig {
    /// Trailing window length
    pub window_ms: u64,
    /// Multiplier applied per tick when fewer than two events are in the window
    pub decay: f32,
    /// Adjacent breaths closer than this count as coincident
    pub coincidence_ms: u64,
    /// Timing credit per coincident pair
    pub coincidence_bonus: f32,
    pub balance_weight: f32,
    pub timing_weight: f32,
    /// Weight kept from the previous score each tick
    pub smoothing: f32,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            window_ms: 2000,
            decay: 0.98,
            coincidence_ms: 300,
            coincidence_bonus: 0.2,
            balance_weight: 0.6,
            timing_weight: 0.4,
            smoothing: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    participant_id: ParticipantId,
    origin: Origin,
    at_ms: u64,
}

/// Count ratio between the two sides, in [0, 1]
pub fn balance(a: usize, b: usize) -> f32 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    if high == 0 {
        return 0.0;
    }
    low as f32 / high as f32
}

/// Credit for adjacent breaths closer than `coincidence_ms`, capped at 1.
///
/// `timestamps` must be sorted ascending.
pub fn timing_score(timestamps: &[u64], coincidence_ms: u64, bonus: f32) -> f32 {
    let score: f32 = timestamps
        .windows(2)
        .filter(|pair| pair[1] - pair[0] < coincidence_ms)
        .map(|_| bonus)
        .sum();
    score.min(1.0)
}

/// Synchrony scorer for one client's view of the session
pub struct SynchronyScorer {
    config: ScorerConfig,
    window: VecDeque<WindowEntry>,
    /// Every (participant, seq) recorded this session
    seen: HashSet<(ParticipantId, u64)>,
    score: f32,
    best: f32,
}

impl SynchronyScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            seen: HashSet::new(),
            score: 0.0,
            best: 0.0,
        }
    }

    /// Record a breath observed on this client; false if already seen
    pub fn record_local(&mut self, event: &BreathEvent) -> bool {
        self.record(event.participant_id, event.seq, event.timestamp_ms, Origin::Local)
    }

    /// Record a relayed breath at its local receipt time; false if already seen.
    ///
    /// Echoes of our own events carry our participant id and sequence and are
    /// dropped here.
    pub fn record_remote(&mut self, participant_id: ParticipantId, seq: u64, received_at_ms: u64) -> bool {
        self.record(participant_id, seq, received_at_ms, Origin::Remote)
    }

    fn record(&mut self, participant_id: ParticipantId, seq: u64, at_ms: u64, origin: Origin) -> bool {
        if !self.seen.insert((participant_id, seq)) {
            trace!(participant = %participant_id, seq, "Duplicate breath dropped");
            return false;
        }
        self.window.push_back(WindowEntry {
            participant_id,
            origin,
            at_ms,
        });
        true
    }

    /// Advance the score to `now_ms` and return it
    pub fn tick(&mut self, now_ms: u64) -> f32 {
        let cutoff = now_ms.saturating_sub(self.config.window_ms);
        self.window.retain(|e| e.at_ms >= cutoff);

        if self.window.len() < 2 {
            self.score *= self.config.decay;
            return self.score;
        }

        let local = self.window.iter().filter(|e| e.origin == Origin::Local).count();
        let remote = self.window.len() - local;
        let balance = balance(local, remote);

        let mut timestamps: Vec<u64> = self.window.iter().map(|e| e.at_ms).collect();
        timestamps.sort_unstable();
        let timing = timing_score(
            &timestamps,
            self.config.coincidence_ms,
            self.config.coincidence_bonus,
        );

        let raw = balance * self.config.balance_weight + timing * self.config.timing_weight;
        let smoothing = self.config.smoothing;
        self.score = (self.score * smoothing + raw * (1.0 - smoothing)).clamp(0.0, 1.0);
        self.best = self.best.max(self.score);

        trace!(local, remote, balance, timing, score = self.score, "Synchrony tick");
        self.score
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    /// Peak score since creation or the last reset
    pub fn best(&self) -> f32 {
        self.best
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Participants with at least one breath in the window
    pub fn active_participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self.window.iter().map(|e| e.participant_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Discard the window, de-duplication memory and current score.
    /// The peak is kept for end-of-session reporting.
    pub fn clear_window(&mut self) {
        self.window.clear();
        self.seen.clear();
        self.score = 0.0;
    }

    /// Discard the window, de-duplication memory and scores
    pub fn reset(&mut self) {
        self.window.clear();
        self.seen.clear();
        self.score = 0.0;
        self.best = 0.0;
    }
}

impl Default for SynchronyScorer {
    fn default() -> Self {
        Self::new(ScorerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::BreathSource;

    const LOCAL: ParticipantId = ParticipantId(1);
    const REMOTE: ParticipantId = ParticipantId(2);

    fn local_event(seq: u64, at: u64) -> BreathEvent {
        BreathEvent {
            participant_id: LOCAL,
            source: BreathSource::Mic,
            timestamp_ms: at,
            seq,
        }
    }

    #[test]
    fn test_balance_is_symmetric() {
        for (a, b) in [(0, 0), (1, 3), (4, 4), (7, 2), (0, 5)] {
            assert_eq!(balance(a, b), balance(b, a));
        }
        assert_eq!(balance(2, 4), 0.5);
        assert_eq!(balance(3, 3), 1.0);
        assert_eq!(balance(0, 0), 0.0);
    }

    #[test]
    fn test_timing_score_caps_at_one() {
        assert_eq!(timing_score(&[0, 500, 1000], 300, 0.2), 0.0);
        assert!((timing_score(&[0, 100, 1000, 1050], 300, 0.2) - 0.4).abs() < 1e-6);

        let dense: Vec<u64> = (0..20).map(|i| i * 10).collect();
        assert_eq!(timing_score(&dense, 300, 0.2), 1.0);
    }

    #[test]
    fn test_duplicate_events_are_dropped() {
        let mut scorer = SynchronyScorer::default();

        assert!(scorer.record_local(&local_event(1, 100)));
        // Relay echo of the same event
        assert!(!scorer.record_remote(LOCAL, 1, 140));
        assert!(scorer.record_remote(REMOTE, 1, 150));
        assert!(!scorer.record_remote(REMOTE, 1, 160));

        assert_eq!(scorer.window_len(), 2);
    }

    #[test]
    fn test_late_echo_is_still_a_duplicate() {
        let mut scorer = SynchronyScorer::default();
        assert!(scorer.record_local(&local_event(1, 0)));
        scorer.tick(10_001);
        assert_eq!(scorer.window_len(), 0);

        // Echo and redelivery long after the original left the window
        assert!(!scorer.record_remote(LOCAL, 1, 10_002));
        assert!(scorer.record_remote(REMOTE, 1, 10_003));
        scorer.tick(60_000);
        assert!(!scorer.record_remote(REMOTE, 1, 60_001));
        assert_eq!(scorer.window_len(), 0);
    }

    #[test]
    fn test_score_stays_in_unit_range() {
        let mut scorer = SynchronyScorer::default();
        let mut seq = 0u64;

        // Irregular bursts from several participants, including duplicates
        for now in (0..30_000u64).step_by(16) {
            let burst = (now / 16 * 7919 % 13) as usize;
            for i in 0..burst {
                seq += 1;
                if i % 2 == 0 {
                    scorer.record_local(&local_event(seq, now));
                } else {
                    scorer.record_remote(ParticipantId(2 + (i as u64 % 3)), seq / 2, now);
                }
            }
            let score = scorer.tick(now);
            assert!((0.0..=1.0).contains(&score), "score {} at {}", score, now);
            assert!(scorer.best() <= 1.0);
        }
    }

    #[test]
    fn test_empty_window_decays_monotonically() {
        let mut scorer = SynchronyScorer::default();
        scorer.record_local(&local_event(1, 0));
        scorer.record_remote(REMOTE, 1, 50);
        for t in 0..40 {
            scorer.tick(t * 16);
        }
        let peak = scorer.score();
        assert!(peak > 0.5);

        let mut previous = peak;
        for t in 0..200 {
            let score = scorer.tick(5_000 + t * 16);
            assert!(score < previous);
            assert!(score >= 0.0);
            previous = score;
        }
        assert!(previous < peak * 0.05);
        assert_eq!(scorer.window_len(), 0);
        assert_eq!(scorer.best(), peak);
    }

    #[test]
    fn test_single_event_only_decays() {
        let mut scorer = SynchronyScorer::default();
        scorer.record_local(&local_event(1, 0));
        assert_eq!(scorer.tick(10), 0.0);
        assert_eq!(scorer.window_len(), 1);
    }

    #[test]
    fn test_offset_pair_converges_to_balance_weight() {
        let mut scorer = SynchronyScorer::default();
        let mut local_seq = 0;
        let mut remote_seq = 0;

        // Each side breathes every 1000ms, half a period apart
        for now in (0..=4500u64).step_by(20) {
            if now % 1000 == 0 && local_seq < 5 {
                local_seq += 1;
                scorer.record_local(&local_event(local_seq, now));
            }
            if now % 1000 == 500 && remote_seq < 5 {
                remote_seq += 1;
                scorer.record_remote(REMOTE, remote_seq, now);
            }
            scorer.tick(now);
        }

        assert!((scorer.score() - 0.6).abs() < 0.05, "score {}", scorer.score());
    }

    #[test]
    fn test_simultaneous_breathing_scores_higher() {
        let mut together = SynchronyScorer::default();
        let mut apart = SynchronyScorer::default();

        for (i, now) in (0..=10_000u64).step_by(20).enumerate() {
            if now % 1000 == 0 {
                let seq = i as u64 + 1;
                together.record_local(&local_event(seq, now));
                together.record_remote(REMOTE, seq, now + 40);
                apart.record_local(&local_event(seq, now));
                apart.record_remote(REMOTE, seq, now + 500);
            }
            together.tick(now);
            apart.tick(now);
        }

        assert!(together.score() > apart.score());
        assert!(together.score() <= 1.0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut scorer = SynchronyScorer::default();
        scorer.record_local(&local_event(1, 0));
        scorer.record_remote(REMOTE, 1, 10);
        scorer.tick(20);
        assert!(scorer.best() > 0.0);

        scorer.reset();
        assert_eq!(scorer.window_len(), 0);
        assert_eq!(scorer.score(), 0.0);
        assert_eq!(scorer.best(), 0.0);
        assert!(scorer.record_local(&local_event(1, 30)));
    }

    #[test]
    fn test_clear_window_keeps_peak() {
        let mut scorer = SynchronyScorer::default();
        scorer.record_local(&local_event(1, 0));
        scorer.record_remote(REMOTE, 1, 10);
        let peak = scorer.tick(20);

        scorer.clear_window();
        assert_eq!(scorer.window_len(), 0);
        assert_eq!(scorer.score(), 0.0);
        assert_eq!(scorer.best(), peak);
    }

    #[test]
    fn test_departed_participant_ages_out() {
        let mut scorer = SynchronyScorer::default();
        scorer.record_remote(REMOTE, 1, 0);
        scorer.record_remote(ParticipantId(3), 1, 10);
        scorer.tick(100);
        assert_eq!(scorer.active_participants(), vec![REMOTE, ParticipantId(3)]);

        scorer.tick(2_011);
        assert!(scorer.active_participants().is_empty());
    }
}

//! Microphone breath-cycle detector
//!
//! Smooths the energy stream and emits one event per exhale on the falling
//! edge of each excursion above threshold. Detection runs from the first
//! sample on the initial floor and threshold; a single calibration pass later
//! replaces both with values measured from the ambient level.

use super::DetectorState;
use crate::event::{BreathEvent, BreathSource, EnergySample, ParticipantId, SequenceCounter};
use tracing::{debug, info, trace};

/// Tuning for [`BreathCycleDetector`]
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Weight kept from the previous smoothed value (α)
    pub smoothing: f32,
    /// Noise floor used until calibration fires
    pub initial_noise_floor: f32,
    /// Threshold used until calibration fires
    pub initial_threshold: f32,
    /// Time after the first sample at which the noise floor is measured
    pub calibration_delay_ms: u64,
    /// Calibrated floor = smoothed ambient level * this
    pub noise_floor_multiplier: f32,
    /// Calibrated threshold = floor + this
    pub threshold_margin: f32,
    /// Minimum time between two emitted events
    pub cooldown_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.75,
            initial_noise_floor: 0.03,
            initial_threshold: 0.08,
            calibration_delay_ms: 1000,
            noise_floor_multiplier: 1.5,
            threshold_margin: 0.05,
            cooldown_ms: 400,
        }
    }
}

/// Adaptive state owned by one detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationState {
    pub noise_floor: f32,
    pub threshold: f32,
    pub smoothed_volume: f32,
    pub calibrated: bool,
}

/// Turns energy samples into breath events for one local participant
pub struct BreathCycleDetector {
    config: DetectorConfig,
    participant_id: ParticipantId,
    sequence: SequenceCounter,
    calibration: CalibrationState,
    state: DetectorState,
    /// Timestamp of the first sample seen
    origin_ms: Option<u64>,
    last_event_ms: Option<u64>,
    events_emitted: u64,
}

impl BreathCycleDetector {
    /// Create a detector; calibration is scheduled relative to the first sample
    pub fn new(config: DetectorConfig, participant_id: ParticipantId, sequence: SequenceCounter) -> Self {
        let calibration = CalibrationState {
            noise_floor: config.initial_noise_floor,
            threshold: config.initial_threshold,
            smoothed_volume: 0.0,
            calibrated: false,
        };

        Self {
            config,
            participant_id,
            sequence,
            calibration,
            state: DetectorState::Quiet,
            origin_ms: None,
            last_event_ms: None,
            events_emitted: 0,
        }
    }

    /// Feed one sample; returns an event when an exhale has just completed
    pub fn process(&mut self, sample: EnergySample) -> Option<BreathEvent> {
        let now = sample.timestamp_ms;
        let origin = *self.origin_ms.get_or_insert(now);

        // Measure the floor from the ambient level before this sample lands
        if !self.calibration.calibrated
            && now.saturating_sub(origin) >= self.config.calibration_delay_ms
        {
            self.calibrate();
        }

        let alpha = self.config.smoothing;
        self.calibration.smoothed_volume =
            self.calibration.smoothed_volume * alpha + sample.normalized_volume * (1.0 - alpha);

        let above = self.level() > self.calibration.threshold;

        match self.state {
            DetectorState::Quiet => {
                if above {
                    trace!(participant = %self.participant_id, at = now, "Breath started");
                    self.state = DetectorState::Breathing;
                }
                None
            }
            DetectorState::Breathing => {
                if above {
                    return None;
                }

                self.state = DetectorState::Quiet;
                if !self.cooldown_elapsed(now) {
                    debug!(participant = %self.participant_id, at = now, "Breath inside cooldown ignored");
                    return None;
                }

                Some(self.emit(now))
            }
        }
    }

    fn calibrate(&mut self) {
        let ambient = self.calibration.smoothed_volume;
        self.calibration.noise_floor = ambient * self.config.noise_floor_multiplier;
        self.calibration.threshold = self.calibration.noise_floor + self.config.threshold_margin;
        self.calibration.calibrated = true;

        info!(
            "Calibrated: noise floor {:.4}, threshold {:.4}",
            self.calibration.noise_floor, self.calibration.threshold
        );
    }

    fn cooldown_elapsed(&self, now: u64) -> bool {
        match self.last_event_ms {
            Some(last) => now.saturating_sub(last) >= self.config.cooldown_ms,
            None => true,
        }
    }

    fn emit(&mut self, now: u64) -> BreathEvent {
        self.last_event_ms = Some(now);
        self.events_emitted += 1;

        let event = BreathEvent {
            participant_id: self.participant_id,
            source: BreathSource::Mic,
            timestamp_ms: now,
            seq: self.sequence.next(),
        };
        debug!(participant = %self.participant_id, seq = event.seq, at = now, "Breath cycle complete");
        event
    }

    /// Smoothed volume above the noise floor
    pub fn level(&self) -> f32 {
        self.calibration.smoothed_volume - self.calibration.noise_floor
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn calibration(&self) -> &CalibrationState {
        &self.calibration
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted
    }
}

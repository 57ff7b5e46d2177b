//! Breath detectors
//!
//! Both detectors share one shape: QUIET until a breath starts, BREATHING
//! until it ends, and exactly one event per completed breath.

pub mod breath;
pub mod touch;

pub use breath::{BreathCycleDetector, CalibrationState, DetectorConfig};
pub use touch::TouchFallbackDetector;

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Quiet,
    Breathing,
}

impl DetectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorState::Quiet => "quiet",
            DetectorState::Breathing => "breathing",
        }
    }
}

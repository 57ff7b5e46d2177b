//! Configuration management for BreathSync
//!
//! Loads settings from environment variables (.env file)

use crate::audio::{DeviceClass, SamplerConfig};
use crate::detector::DetectorConfig;
use crate::scorer::ScorerConfig;
use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Name shown to other participants
    pub display_name: String,
    /// Prefix for generated session codes
    pub session_code_prefix: String,
    /// Members per session, host included
    pub max_participants: usize,
    /// Microphone settings
    pub sampler: SamplerConfig,
    /// How often the energy source is polled
    pub sample_interval_ms: u64,
    /// How often the synchrony score is advanced
    pub score_tick_ms: u64,
    pub detector: DetectorConfig,
    pub scorer: ScorerConfig,
    /// End the session locally when the host leaves
    pub end_on_host_leave: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: "Host".to_string(),
            session_code_prefix: "BRTH".to_string(),
            max_participants: 8,
            sampler: SamplerConfig::default(),
            sample_interval_ms: 20,
            score_tick_ms: 16,
            detector: DetectorConfig::default(),
            scorer: ScorerConfig::default(),
            end_on_host_leave: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup; unset keys take defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

        let display_name = get("DISPLAY_NAME").unwrap_or(defaults.display_name);

        let session_code_prefix = match get("SESSION_CODE_PREFIX") {
            Some(prefix) => {
                let prefix = prefix.trim().to_uppercase();
                if prefix.is_empty()
                    || prefix.len() > 6
                    || !prefix.chars().all(|c| c.is_ascii_alphabetic())
                {
                    return Err(invalid("SESSION_CODE_PREFIX", prefix));
                }
                prefix
            }
            None => defaults.session_code_prefix,
        };

        let max_participants: usize = parse(&get, "MAX_PARTICIPANTS", defaults.max_participants)?;
        if max_participants == 0 {
            return Err(invalid("MAX_PARTICIPANTS", "0"));
        }

        let device_class = match get("DEVICE_CLASS") {
            Some(s) => DeviceClass::from_str(s.trim()).ok_or_else(|| invalid("DEVICE_CLASS", s))?,
            None => DeviceClass::default(),
        };
        let volume_multiplier = get("VOLUME_MULTIPLIER")
            .map(|s| {
                s.trim()
                    .parse::<f32>()
                    .ok()
                    .filter(|m| *m > 0.0)
                    .ok_or_else(|| invalid("VOLUME_MULTIPLIER", s))
            })
            .transpose()?;
        let sampler = SamplerConfig {
            device_class,
            volume_multiplier,
            device_name: get("INPUT_DEVICE"),
            ..defaults.sampler
        };

        let sample_interval_ms = parse(&get, "SAMPLE_INTERVAL_MS", defaults.sample_interval_ms)?;
        let score_tick_ms = parse(&get, "SCORE_TICK_MS", defaults.score_tick_ms)?;
        if sample_interval_ms == 0 {
            return Err(invalid("SAMPLE_INTERVAL_MS", "0"));
        }
        if score_tick_ms == 0 {
            return Err(invalid("SCORE_TICK_MS", "0"));
        }

        let smoothing: f32 = parse(&get, "BREATH_SMOOTHING", defaults.detector.smoothing)?;
        if !(0.0..1.0).contains(&smoothing) {
            return Err(invalid("BREATH_SMOOTHING", smoothing.to_string()));
        }
        let detector = DetectorConfig {
            smoothing,
            calibration_delay_ms: parse(
                &get,
                "BREATH_CALIBRATION_MS",
                defaults.detector.calibration_delay_ms,
            )?,
            threshold_margin: parse(
                &get,
                "BREATH_THRESHOLD_MARGIN",
                defaults.detector.threshold_margin,
            )?,
            cooldown_ms: parse(&get, "BREATH_COOLDOWN_MS", defaults.detector.cooldown_ms)?,
            ..defaults.detector
        };

        let window_ms: u64 = parse(&get, "SYNC_WINDOW_MS", defaults.scorer.window_ms)?;
        if window_ms == 0 {
            return Err(invalid("SYNC_WINDOW_MS", "0"));
        }
        let scorer = ScorerConfig {
            window_ms,
            ..defaults.scorer
        };

        let end_on_host_leave = parse(&get, "END_ON_HOST_LEAVE", defaults.end_on_host_leave)?;

        Ok(Self {
            display_name,
            session_code_prefix,
            max_participants,
            sampler,
            sample_interval_ms,
            score_tick_ms,
            detector,
            scorer,
            end_on_host_leave,
        })
    }
}

fn invalid(key: &str, value: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue(key.to_string(), value.into())
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| invalid(key, raw)),
        None => Ok(default),
    }
}

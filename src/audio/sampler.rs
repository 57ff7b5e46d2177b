//! Microphone capture turned into a stream of energy samples
//!
//! The device is an explicitly owned resource: `acquire` opens it, `release`
//! (or drop) closes it. Nothing here is a process-wide singleton.

use super::spectrum::SpectrumAnalyzer;
use crate::event::EnergySample;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplerError {
    #[error("No input device available")]
    NoDevice,
    #[error("Input device not found: {0}")]
    DeviceNotFound(String),
    #[error("Input device error: {0}")]
    Device(String),
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("Audio capture has been released")]
    Released,
}

/// Rough class of the capturing device, used to pick a volume multiplier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    Mobile,
    #[default]
    Desktop,
}

impl DeviceClass {
    /// Empirically tuned compensation for small built-in microphones
    pub fn default_multiplier(&self) -> f32 {
        match self {
            DeviceClass::Mobile => 3.0,
            DeviceClass::Desktop => 1.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Desktop => "desktop",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mobile" => Some(DeviceClass::Mobile),
            "desktop" => Some(DeviceClass::Desktop),
            _ => None,
        }
    }
}

/// Sampler settings
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub device_class: DeviceClass,
    /// Overrides the device-class multiplier when set
    pub volume_multiplier: Option<f32>,
    /// Samples per analysis block
    pub fft_size: usize,
    /// Input device name; the host default when unset
    pub device_name: Option<String>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            device_class: DeviceClass::default(),
            volume_multiplier: None,
            fft_size: 1024,
            device_name: None,
        }
    }
}

impl SamplerConfig {
    pub fn multiplier(&self) -> f32 {
        self.volume_multiplier
            .unwrap_or_else(|| self.device_class.default_multiplier())
    }
}

/// Anything that can be polled for energy samples
pub trait EnergySource: Send {
    fn next_sample(&mut self, timestamp_ms: u64) -> Result<EnergySample, SamplerError>;

    /// Give up the underlying device. Further samples fail with `Released`.
    fn release(&mut self);
}

/// Newest mono samples written by the capture callback
type SharedFrames = Arc<Mutex<VecDeque<f32>>>;

struct Capture {
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

/// Live microphone energy sampler
pub struct AudioSampler {
    frames: SharedFrames,
    analyzer: SpectrumAnalyzer,
    multiplier: f32,
    scratch: Vec<f32>,
    capture: Option<Capture>,
    device_name: String,
}

impl AudioSampler {
    /// Open the input device and start capturing.
    ///
    /// `cpal::Stream` is not `Send`, so it lives on its own thread for its
    /// whole life; this call waits for that thread to report whether the
    /// device could be opened.
    pub async fn acquire(config: SamplerConfig) -> Result<Self, SamplerError> {
        let capacity = config.fft_size.max(2);
        let frames: SharedFrames = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_frames = frames.clone();
        let wanted = config.device_name.clone();
        let thread = std::thread::Builder::new()
            .name("breath-capture".to_string())
            .spawn(move || {
                let stream = match open_stream(wanted.as_deref(), thread_frames, capacity) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Hold the stream until released
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Capture thread stopped");
            })
            .map_err(|e| SamplerError::Device(e.to_string()))?;

        let device_name = match ready_rx.await {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                warn!("Microphone unavailable: {}", e);
                return Err(e);
            }
            Err(_) => return Err(SamplerError::Device("capture thread exited".to_string())),
        };

        info!(
            "Microphone acquired: {} (multiplier {:.1})",
            device_name,
            config.multiplier()
        );

        Ok(Self {
            frames,
            analyzer: SpectrumAnalyzer::new(capacity),
            multiplier: config.multiplier(),
            scratch: Vec::with_capacity(capacity),
            capture: Some(Capture {
                stop_tx,
                thread: Some(thread),
            }),
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl EnergySource for AudioSampler {
    fn next_sample(&mut self, timestamp_ms: u64) -> Result<EnergySample, SamplerError> {
        if self.capture.is_none() {
            return Err(SamplerError::Released);
        }

        self.scratch.clear();
        self.scratch.extend(self.frames.lock().iter().copied());

        let volume = (self.analyzer.rms(&self.scratch) * self.multiplier).clamp(0.0, 1.0);
        Ok(EnergySample::new(timestamp_ms, volume))
    }

    fn release(&mut self) {
        if let Some(capture) = self.capture.take() {
            stop_capture(capture);
            self.frames.lock().clear();
            info!("Microphone released: {}", self.device_name);
        }
    }
}

impl Drop for AudioSampler {
    fn drop(&mut self) {
        self.release();
    }
}

/// Signal the capture thread to stop and reap it.
///
/// Inside a tokio runtime the join runs on the blocking pool so a worker is
/// never parked on device teardown.
fn stop_capture(mut capture: Capture) {
    let _ = capture.stop_tx.send(());
    let Some(thread) = capture.thread.take() else {
        return;
    };

    let join = move || {
        if thread.join().is_err() {
            error!("Capture thread panicked");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

/// Names of the host's input devices
pub fn list_input_devices() -> Vec<String> {
    cpal::default_host()
        .input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

fn open_stream(
    wanted: Option<&str>,
    frames: SharedFrames,
    capacity: usize,
) -> Result<(cpal::Stream, String), SamplerError> {
    let host = cpal::default_host();

    let device = match wanted {
        Some(name) => host
            .input_devices()
            .map_err(|e| SamplerError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| SamplerError::DeviceNotFound(name.to_string()))?,
        None => host.default_input_device().ok_or(SamplerError::NoDevice)?,
    };

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    let supported = device
        .default_input_config()
        .map_err(|e| SamplerError::Device(e.to_string()))?;
    debug!("Input config for {}: {:?}", device_name, supported);

    // The raw input stream is used as-is; no noise suppression is applied,
    // since it attenuates the breath signal along with the noise.
    let channels = supported.channels() as usize;
    let stream_config: cpal::StreamConfig = supported.config();

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                push_frames(&frames, data, channels, capacity, |s| s)
            },
            stream_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push_frames(&frames, data, channels, capacity, |s| s as f32 / 32768.0)
            },
            stream_error,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                push_frames(&frames, data, channels, capacity, |s| {
                    (s as f32 - 32768.0) / 32768.0
                })
            },
            stream_error,
            None,
        ),
        format => return Err(SamplerError::UnsupportedFormat(format!("{:?}", format))),
    }
    .map_err(|e| SamplerError::Device(e.to_string()))?;

    stream
        .play()
        .map_err(|e| SamplerError::Device(e.to_string()))?;

    Ok((stream, device_name))
}

fn stream_error(err: cpal::StreamError) {
    error!("Audio stream error: {}", err);
}

/// Down-mix interleaved frames to mono and keep the newest `capacity`
fn push_frames<T: Copy>(
    frames: &SharedFrames,
    data: &[T],
    channels: usize,
    capacity: usize,
    to_f32: impl Fn(T) -> f32,
) {
    let channels = channels.max(1);
    let mut buffer = frames.lock();
    for frame in data.chunks(channels) {
        let mono = frame.iter().map(|&s| to_f32(s)).sum::<f32>() / frame.len() as f32;
        if buffer.len() >= capacity {
            buffer.pop_front();
        }
        buffer.push_back(mono);
    }
}

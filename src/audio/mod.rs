//! Audio module for microphone capture and energy extraction
//!
//! Turns a live input device into a stream of normalized energy samples

pub mod sampler;
pub mod spectrum;

pub use sampler::{
    list_input_devices, AudioSampler, DeviceClass, EnergySource, SamplerConfig, SamplerError,
};
pub use spectrum::SpectrumAnalyzer;

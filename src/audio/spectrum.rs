//! Magnitude spectrum and energy of a block of mono samples

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Bottom of the decibel range mapped onto [0, 1]
pub const MIN_DECIBELS: f32 = -100.0;
/// Top of the decibel range mapped onto [0, 1]
pub const MAX_DECIBELS: f32 = -30.0;

/// Hann-windowed forward FFT with byte-spectrum style scaling.
///
/// Each bin's magnitude is converted to decibels and mapped linearly from
/// [`MIN_DECIBELS`, `MAX_DECIBELS`] onto [0, 1], clamped at both ends.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    size: usize,
    window: Vec<f32>,
    buffer: Vec<Complex32>,
    magnitudes: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(size: usize) -> Self {
        let size = size.max(2);
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(size);
        let window = (0..size)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / size as f32).cos())
            .collect();

        Self {
            fft,
            size,
            window,
            buffer: vec![Complex32::new(0.0, 0.0); size],
            magnitudes: vec![0.0; size / 2],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Scaled magnitudes of the lower half of the spectrum.
    ///
    /// Uses the newest `size` samples; shorter input is zero-padded in front.
    pub fn magnitudes(&mut self, samples: &[f32]) -> &[f32] {
        let take = samples.len().min(self.size);
        let pad = self.size - take;
        let recent = &samples[samples.len() - take..];

        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let value = if i < pad { 0.0 } else { recent[i - pad] };
            *slot = Complex32::new(value * self.window[i], 0.0);
        }

        self.fft.process(&mut self.buffer);

        let norm = 1.0 / self.size as f32;
        for (bin, magnitude) in self.magnitudes.iter_mut().enumerate() {
            let amplitude = self.buffer[bin].norm() * norm;
            *magnitude = scale_decibels(amplitude);
        }

        &self.magnitudes
    }

    /// Root mean square of the scaled magnitudes
    pub fn rms(&mut self, samples: &[f32]) -> f32 {
        let bins = self.magnitudes(samples);
        if bins.is_empty() {
            return 0.0;
        }
        let sum: f32 = bins.iter().map(|m| m * m).sum();
        (sum / bins.len() as f32).sqrt()
    }
}

fn scale_decibels(amplitude: f32) -> f32 {
    if amplitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * amplitude.log10();
    ((db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(size: usize, bin: usize, amplitude: f32) -> Vec<f32> {
        (0..size)
            .map(|i| amplitude * (2.0 * PI * bin as f32 * i as f32 / size as f32).sin())
            .collect()
    }

    #[test]
    fn test_silence_has_no_energy() {
        let mut analyzer = SpectrumAnalyzer::new(256);
        assert_eq!(analyzer.rms(&[0.0; 256]), 0.0);
        assert_eq!(analyzer.rms(&[]), 0.0);
    }

    #[test]
    fn test_peak_lands_in_signal_bin() {
        let mut analyzer = SpectrumAnalyzer::new(256);
        let bins = analyzer.magnitudes(&sine(256, 16, 0.5)).to_vec();

        let peak = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
        assert!(bins[100] < 0.2);
    }

    #[test]
    fn test_louder_input_has_more_energy() {
        let mut analyzer = SpectrumAnalyzer::new(512);
        let quiet = analyzer.rms(&sine(512, 20, 0.01));
        let loud = analyzer.rms(&sine(512, 20, 0.5));

        assert!(quiet > 0.0);
        assert!(loud > quiet);
        assert!(loud <= 1.0);
    }

    #[test]
    fn test_short_input_is_padded() {
        let mut analyzer = SpectrumAnalyzer::new(128);
        let energy = analyzer.rms(&sine(64, 8, 0.3));
        assert!(energy > 0.0);
    }
}

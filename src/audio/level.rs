//! Microphone level meter
//!
//! Behaves like a 256-point analyser node: the newest samples are windowed,
//! transformed, smoothed over time per bin and mapped from decibels onto
//! `[0, 1]`. The level is the mean over all bins.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

pub const FFT_SIZE: usize = 256;
pub const SMOOTHING: f32 = 0.8;
pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;

pub struct LevelMeter {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
}

impl LevelMeter {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        Self {
            fft,
            window: blackman(FFT_SIZE),
            smoothed: vec![0.0; FFT_SIZE / 2],
            spectrum: vec![Complex::new(0.0, 0.0); FFT_SIZE],
        }
    }

    /// Feed the latest samples and return the new level
    ///
    /// Only the last [`FFT_SIZE`] samples are used; shorter input is
    /// zero-padded at the front.
    pub fn process(&mut self, samples: &[f32]) -> f32 {
        let tail = &samples[samples.len().saturating_sub(FFT_SIZE)..];
        let offset = FFT_SIZE - tail.len();

        for (i, slot) in self.spectrum.iter_mut().enumerate() {
            let sample = if i < offset { 0.0 } else { tail[i - offset] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.spectrum);

        let scale = 1.0 / FFT_SIZE as f32;
        let mut total = 0.0;
        for (bin, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.spectrum[bin].norm() * scale;
            *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;
            total += to_unit(*smoothed);
        }

        (total / self.smoothed.len() as f32).clamp(0.0, 1.0)
    }

    /// Forget the smoothing history
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|value| *value = 0.0);
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

fn to_unit(magnitude: f32) -> f32 {
    if magnitude <= 0.0 || !magnitude.is_finite() {
        return 0.0;
    }

    let db = 20.0 * magnitude.log10();
    ((db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS)).clamp(0.0, 1.0)
}

fn blackman(size: usize) -> Vec<f32> {
    let a0 = 0.42;
    let a1 = 0.5;
    let a2 = 0.08;
    let n = size as f32;

    (0..size)
        .map(|i| {
            let x = i as f32 / n;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize) -> Vec<f32> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
            })
            .collect()
    }

    #[test]
    fn test_silence_is_zero() {
        let mut meter = LevelMeter::new();
        assert_eq!(meter.process(&[0.0; FFT_SIZE]), 0.0);
        assert_eq!(meter.process(&[]), 0.0);
    }

    #[test]
    fn test_noise_raises_level() {
        let mut meter = LevelMeter::new();
        let samples = noise(FFT_SIZE * 8);

        let mut level = 0.0;
        for frame in samples.chunks(FFT_SIZE) {
            level = meter.process(frame);
        }

        assert!(level > 0.2, "level was {}", level);
        assert!(level <= 1.0);
    }

    #[test]
    fn test_level_decays_after_reset() {
        let mut meter = LevelMeter::new();
        meter.process(&noise(FFT_SIZE));
        meter.reset();
        assert_eq!(meter.process(&[0.0; FFT_SIZE]), 0.0);
    }

    #[test]
    fn test_full_scale_is_clamped() {
        let mut meter = LevelMeter::new();
        let square: Vec<f32> = (0..FFT_SIZE)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        for _ in 0..20 {
            let level = meter.process(&square);
            assert!((0.0..=1.0).contains(&level));
        }
    }
}

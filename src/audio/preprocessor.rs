use crate::audio::resampler::StreamResampler;
use crate::Result;
use tracing::debug;

/// Rate every outgoing chunk is encoded at
pub const TARGET_SAMPLE_RATE: u32 = 48_000;

const AGC_TARGET_RMS: f32 = 0.1;
const AGC_MAX_GAIN: f32 = 10.0;
/// Per-sample step towards a lower gain
const AGC_ATTACK: f32 = 0.002;
/// Per-sample step towards a higher gain
const AGC_RELEASE: f32 = 0.0001;
/// Below this level a chunk is treated as silence and leaves the gain alone
const AGC_NOISE_FLOOR: f32 = 1e-4;

/// Pole of the DC blocking filter; about 8 Hz at 48 kHz
const DC_POLE: f32 = 0.999;

/// Prepares raw mono microphone samples for a chunk
///
/// Removes DC offset, resamples to [`TARGET_SAMPLE_RATE`] and, when enabled,
/// applies a software gain control. Filter and gain state carry over from one
/// chunk to the next, so chunk boundaries leave no steps in the signal.
pub struct CapturePreprocessor {
    dc: DcBlocker,
    resampler: Option<StreamResampler>,
    gain: Option<AutoGain>,
}

impl CapturePreprocessor {
    pub fn new(input_sample_rate: u32, auto_gain: bool) -> Result<Self> {
        let resampler = if input_sample_rate != TARGET_SAMPLE_RATE {
            Some(StreamResampler::new(input_sample_rate, TARGET_SAMPLE_RATE)?)
        } else {
            None
        };

        debug!(
            "Capture preprocessor: {} Hz -> {} Hz, agc={}",
            input_sample_rate, TARGET_SAMPLE_RATE, auto_gain
        );

        Ok(Self {
            dc: DcBlocker::default(),
            resampler,
            gain: auto_gain.then(AutoGain::default),
        })
    }

    /// Process the samples gathered since the last chunk
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let no_dc = self.dc.process(input);

        let resampled = match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&no_dc)?,
            None => no_dc,
        };

        Ok(self.apply_gain(resampled))
    }

    /// Drain the resampler's buffered tail
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let tail = match self.resampler.as_mut() {
            Some(resampler) => resampler.flush()?,
            None => Vec::new(),
        };

        Ok(self.apply_gain(tail))
    }

    pub fn target_sample_rate(&self) -> u32 {
        TARGET_SAMPLE_RATE
    }

    fn apply_gain(&mut self, mut samples: Vec<f32>) -> Vec<f32> {
        if let Some(gain) = self.gain.as_mut() {
            gain.process(&mut samples);
        }
        samples
    }
}

/// Average interleaved frames down to one channel
pub fn downmix(input: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return input.to_vec();
    }

    input
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// One-pole high-pass that strips DC offset
#[derive(Debug, Default)]
struct DcBlocker {
    last_input: f32,
    last_output: f32,
}

impl DcBlocker {
    fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        samples
            .iter()
            .map(|&x| {
                let y = x - self.last_input + DC_POLE * self.last_output;
                self.last_input = x;
                self.last_output = y;
                y
            })
            .collect()
    }
}

/// Boosts quiet input towards a target level, never below unity gain
///
/// The gain glides per sample towards the value the chunk's RMS asks for,
/// falling faster than it rises.
#[derive(Debug)]
struct AutoGain {
    gain: f32,
}

impl Default for AutoGain {
    fn default() -> Self {
        Self { gain: 1.0 }
    }
}

impl AutoGain {
    fn process(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }

        let rms = (samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        let wanted = if rms > AGC_NOISE_FLOOR {
            (AGC_TARGET_RMS / rms).clamp(1.0, AGC_MAX_GAIN)
        } else {
            self.gain
        };

        for sample in samples.iter_mut() {
            let rate = if wanted < self.gain {
                AGC_ATTACK
            } else {
                AGC_RELEASE
            };
            self.gain += (wanted - self.gain) * rate;
            *sample = (*sample * self.gain).clamp(-1.0, 1.0);
        }
    }

    #[cfg(test)]
    fn gain(&self) -> f32 {
        self.gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    fn sine(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 48_000.0).sin() * amplitude)
            .collect()
    }

    #[test]
    fn test_downmix() {
        let input = vec![1.0, -1.0, 0.5, -0.5, 0.8, -0.8];
        let output = downmix(&input, 2);
        assert_eq!(output, vec![0.0, 0.0, 0.0]);
        assert_eq!(downmix(&input, 1), input);
    }

    #[test]
    fn test_dc_offset_is_removed() {
        let mut dc = DcBlocker::default();
        let input: Vec<f32> = sine(48_000, 0.1).iter().map(|s| s + 0.3).collect();

        let output = dc.process(&input);
        let tail = &output[output.len() - 4800..];
        let mean: f32 = tail.iter().sum::<f32>() / tail.len() as f32;
        assert!(mean.abs() < 0.005, "mean {}", mean);
    }

    #[test]
    fn test_chunk_boundaries_leave_no_trace() {
        let input: Vec<f32> = sine(12_000, 0.2).iter().map(|s| s + 0.05).collect();

        let mut whole = CapturePreprocessor::new(TARGET_SAMPLE_RATE, false).unwrap();
        let expected = whole.process(&input).unwrap();

        let mut split = CapturePreprocessor::new(TARGET_SAMPLE_RATE, false).unwrap();
        let mut actual = Vec::new();
        for chunk in input.chunks(3000) {
            actual.extend(split.process(chunk).unwrap());
        }

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_quiet_input_is_boosted_up_to_the_cap() {
        let mut agc = AutoGain::default();
        for _ in 0..20 {
            let mut chunk = sine(12_000, 0.001);
            agc.process(&mut chunk);
        }
        assert!((agc.gain() - AGC_MAX_GAIN).abs() < 0.1);

        let mut chunk = sine(12_000, 0.001);
        agc.process(&mut chunk);
        assert!((rms(&chunk) - 0.001 / 2f32.sqrt() * AGC_MAX_GAIN).abs() < 1e-3);
    }

    #[test]
    fn test_loud_input_is_not_attenuated() {
        let mut agc = AutoGain::default();
        let input = sine(12_000, 0.5);
        let mut chunk = input.clone();
        agc.process(&mut chunk);

        assert_eq!(agc.gain(), 1.0);
        assert_eq!(chunk, input);
    }

    #[test]
    fn test_gain_glides_between_chunks() {
        let mut agc = AutoGain::default();
        let mut quiet = sine(12_000, 0.01);
        agc.process(&mut quiet);
        let after_quiet = agc.gain();
        assert!(after_quiet > 1.0);

        // A loud chunk pulls the gain down gradually, not in one jump
        let input = sine(100, 0.5);
        let mut loud = input.clone();
        agc.process(&mut loud);
        assert!((loud[1] / input[1] - after_quiet).abs() < 0.05);
        assert!(agc.gain() < after_quiet);
        assert!(agc.gain() > 1.0);
    }

    #[test]
    fn test_native_rate_keeps_length() {
        let mut preprocessor = CapturePreprocessor::new(TARGET_SAMPLE_RATE, false).unwrap();
        let input = sine(480, 0.25);
        assert_eq!(preprocessor.process(&input).unwrap().len(), input.len());
        assert!(preprocessor.flush().unwrap().is_empty());
    }

    #[test]
    fn test_resampled_tail_comes_out_on_flush() {
        let mut preprocessor = CapturePreprocessor::new(16_000, true).unwrap();
        let input: Vec<f32> = (0..400).map(|i| (i as f32 * 0.1).sin() * 0.3).collect();

        let mut output = preprocessor.process(&input).unwrap();
        assert!(output.is_empty());

        output.extend(preprocessor.flush().unwrap());
        assert!(!output.is_empty());
        assert!(output.len() <= 1200);
    }
}

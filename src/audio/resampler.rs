use crate::{AgentVoxError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Frames fed to the sinc resampler per call
const CHUNK_FRAMES: usize = 1024;

/// Streaming mono resampler
///
/// Microphone audio arrives in callbacks of arbitrary length, so input is
/// buffered until a whole resampler chunk is available; the tail is only
/// zero-padded on [`flush`](Self::flush).
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Create a new mono resampler
    ///
    /// # Arguments
    /// * `input_rate` - Device sample rate
    /// * `output_rate` - Rate the chunks are sent at
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(AgentVoxError::ConfigError(
                "Sample rates must be greater than 0".into(),
            ));
        }

        let resample_ratio = output_rate as f64 / input_rate as f64;

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(resample_ratio, 2.0, params, CHUNK_FRAMES, 1)
            .map_err(|e| {
                AgentVoxError::AudioDeviceError(format!("Failed to create resampler: {}", e))
            })?;

        debug!("Created resampler: {} Hz -> {} Hz", input_rate, output_rate);

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            pending: Vec::with_capacity(CHUNK_FRAMES * 2),
        })
    }

    /// Resample as much buffered input as fills whole chunks
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        while self.pending.len() >= CHUNK_FRAMES {
            let chunk: Vec<f32> = self.pending.drain(..CHUNK_FRAMES).collect();
            output.extend(self.run(chunk, CHUNK_FRAMES)?);
        }

        Ok(output)
    }

    /// Resample whatever input is left, padding the last chunk with silence
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let frames = self.pending.len();
        let mut chunk = std::mem::take(&mut self.pending);
        chunk.resize(CHUNK_FRAMES, 0.0);

        let output = self.run(chunk, frames)?;
        self.resampler.reset();
        Ok(output)
    }

    fn run(&mut self, chunk: Vec<f32>, real_frames: usize) -> Result<Vec<f32>> {
        let wave_in = vec![chunk];
        let output_planar = self
            .resampler
            .process(&wave_in, None)
            .map_err(|e| AgentVoxError::AudioDeviceError(format!("Resampling failed: {}", e)))?;

        let mut samples = output_planar.into_iter().next().unwrap_or_default();

        // Only keep the output that corresponds to real (non-padded) input
        if real_frames < CHUNK_FRAMES {
            let ratio = self.output_rate as f64 / self.input_rate as f64;
            let keep = ((real_frames as f64) * ratio).ceil() as usize;
            samples.truncate(keep);
        }

        Ok(samples)
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

use crate::{AgentVoxError, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

/// Encode mono samples as a self-contained 16-bit PCM WAV file in memory
pub fn encode_wav_chunk(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut bytes = Vec::with_capacity(44 + samples.len() * 2);
    {
        let mut writer = WavWriter::new(Cursor::new(&mut bytes), spec)
            .map_err(|e| AgentVoxError::AudioDeviceError(format!("Failed to create WAV writer: {}", e)))?;

        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(value)
                .map_err(|e| AgentVoxError::AudioDeviceError(format!("Failed to write sample: {}", e)))?;
        }

        writer
            .finalize()
            .map_err(|e| AgentVoxError::AudioDeviceError(format!("Failed to finalize WAV: {}", e)))?;
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;

    #[test]
    fn test_chunk_is_readable_wav() {
        let samples: Vec<f32> = (0..480).map(|i| (i as f32 * 0.05).sin() * 0.5).collect();
        let bytes = encode_wav_chunk(&samples, 48_000).unwrap();

        let reader = WavReader::new(Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 48_000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 480);
    }

    #[test]
    fn test_out_of_range_samples_are_clipped() {
        let bytes = encode_wav_chunk(&[2.0, -2.0], 16_000).unwrap();
        let mut reader = WavReader::new(Cursor::new(bytes)).unwrap();
        let values: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(values, vec![i16::MAX, -i16::MAX]);
    }
}

pub mod buffer;
pub mod capture;
#[cfg(feature = "audio-io")]
pub mod input;
pub mod level;
pub mod memory;
#[cfg(feature = "audio-io")]
pub mod output;
pub mod playback;
pub mod preprocessor;
pub mod resampler;
pub mod wav;

pub use buffer::AnalysisWindow;
pub use capture::{
    AudioCapture, AudioChunk, CaptureCallbacks, CaptureConfig, CaptureConstraints, CaptureError,
    CaptureFault, CaptureSource, CaptureStream, SampleSink,
};
#[cfg(feature = "audio-io")]
pub use input::CpalSource;
pub use level::LevelMeter;
pub use memory::{MemoryCaptureSource, MemorySink};
#[cfg(feature = "audio-io")]
pub use output::RodioSink;
pub use playback::{AudioPlayer, AudioSink, FinishSignal, PlaybackProgress, PlayerCallbacks};
pub use preprocessor::CapturePreprocessor;
pub use resampler::StreamResampler;
pub use wav::encode_wav_chunk;

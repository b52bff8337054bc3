//! Microphone capture pipeline
//!
//! [`AudioCapture`] acquires a device through a [`CaptureSource`], collects
//! its samples through a [`SampleSink`] and turns them into timed WAV chunks
//! plus a live level. Two loops run while capture is active: one emits a
//! chunk every `chunk_interval`, the other samples the level every
//! `level_interval`.

use crate::audio::buffer::AnalysisWindow;
use crate::audio::level::{LevelMeter, FFT_SIZE};
use crate::audio::preprocessor::CapturePreprocessor;
use crate::audio::wav::encode_wav_chunk;
use crate::AgentVoxError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Audio capture unsupported: {0}")]
    Unsupported(String),

    #[error("Audio device error: {0}")]
    Device(String),
}

impl From<CaptureError> for AgentVoxError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => {
                AgentVoxError::PermissionError("Microphone permission denied".into())
            }
            CaptureError::Unsupported(msg) => AgentVoxError::UnsupportedError(msg),
            CaptureError::Device(msg) => AgentVoxError::AudioDeviceError(msg),
        }
    }
}

/// What the microphone is asked for
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: 48_000,
            channel_count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub chunk_interval: Duration,
    pub level_interval: Duration,
    pub constraints: CaptureConstraints,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_interval: Duration::from_millis(250),
            level_interval: Duration::from_millis(50),
            constraints: CaptureConstraints::default(),
        }
    }
}

/// One encoded slice of microphone audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub is_final: bool,
}

/// Error reported by a device while it is running
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFault {
    /// The device stopped producing audio
    pub fatal: bool,
    pub message: String,
}

struct SinkShared {
    active: AtomicBool,
    pending: Mutex<Vec<f32>>,
    window: AnalysisWindow,
}

/// Where a device delivers mono samples and reports faults
#[derive(Clone)]
pub struct SampleSink {
    shared: Arc<SinkShared>,
    faults: mpsc::UnboundedSender<CaptureFault>,
}

impl SampleSink {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<CaptureFault>) {
        let (faults, fault_rx) = mpsc::unbounded_channel();
        let sink = Self {
            shared: Arc::new(SinkShared {
                active: AtomicBool::new(true),
                pending: Mutex::new(Vec::new()),
                window: AnalysisWindow::new(FFT_SIZE),
            }),
            faults,
        };
        (sink, fault_rx)
    }

    /// Append mono samples; ignored once capture has stopped
    pub fn push(&self, samples: &[f32]) {
        if !self.is_active() {
            return;
        }
        self.shared.pending.lock().extend_from_slice(samples);
        self.shared.window.write(samples);
    }

    pub fn fault(&self, fault: CaptureFault) {
        let _ = self.faults.send(fault);
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.shared.active.store(false, Ordering::Release);
        self.shared.window.clear();
    }

    fn take_pending(&self) -> Vec<f32> {
        std::mem::take(&mut *self.shared.pending.lock())
    }

    fn window(&self) -> &AnalysisWindow {
        &self.shared.window
    }
}

/// Hands out microphone streams
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
        sink: SampleSink,
    ) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// A running microphone stream
pub trait CaptureStream: Send {
    /// Rate of the samples pushed into the sink
    fn sample_rate(&self) -> u32;

    /// Stop the device; safe to call more than once
    fn release(&mut self);
}

pub type ChunkCallback = Arc<dyn Fn(AudioChunk) + Send + Sync>;
pub type CaptureErrorCallback = Arc<dyn Fn(CaptureError) + Send + Sync>;

#[derive(Clone)]
pub struct CaptureCallbacks {
    pub on_chunk: ChunkCallback,
    pub on_error: CaptureErrorCallback,
}

struct ActiveCapture {
    stream: Box<dyn CaptureStream>,
    sink: SampleSink,
    preprocessor: Arc<Mutex<CapturePreprocessor>>,
    task: JoinHandle<()>,
}

enum CaptureState {
    Idle,
    /// Acquiring the device for the numbered start attempt
    Starting(u64),
    Active(ActiveCapture),
}

pub struct AudioCapture {
    source: Arc<dyn CaptureSource>,
    config: CaptureConfig,
    callbacks: CaptureCallbacks,
    state: Arc<Mutex<CaptureState>>,
    level: Arc<watch::Sender<f32>>,
    start_attempts: AtomicU64,
}

impl AudioCapture {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        config: CaptureConfig,
        callbacks: CaptureCallbacks,
    ) -> Self {
        let (level, _) = watch::channel(0.0);
        Self {
            source,
            config,
            callbacks,
            state: Arc::new(Mutex::new(CaptureState::Idle)),
            level: Arc::new(level),
            start_attempts: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Acquire the microphone and start producing chunks
    ///
    /// Calling it again while capture is starting or active does nothing.
    /// A [`stop`](Self::stop) that lands while the device is being acquired
    /// cancels the start: the device is released and `Ok` is returned with
    /// capture still inactive.
    pub async fn start(&self) -> Result<(), CaptureError> {
        let attempt = self.start_attempts.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            if !matches!(*state, CaptureState::Idle) {
                debug!("Capture already running");
                return Ok(());
            }
            *state = CaptureState::Starting(attempt);
        }

        let (sink, faults) = SampleSink::new();
        let acquired = self
            .source
            .acquire(&self.config.constraints, sink.clone())
            .await;

        let mut stream = match acquired {
            Ok(stream) => stream,
            Err(e) => {
                self.abandon_start(attempt);
                warn!("Failed to acquire microphone: {}", e);
                return Err(e);
            }
        };

        let preprocessor = match CapturePreprocessor::new(
            stream.sample_rate(),
            self.config.constraints.auto_gain_control,
        ) {
            Ok(preprocessor) => Arc::new(Mutex::new(preprocessor)),
            Err(e) => {
                stream.release();
                self.abandon_start(attempt);
                return Err(CaptureError::Device(e.to_string()));
            }
        };

        let mut state = self.state.lock();
        if !matches!(*state, CaptureState::Starting(current) if current == attempt) {
            debug!("Capture start cancelled while acquiring the device");
            sink.deactivate();
            stream.release();
            return Ok(());
        }

        let task = tokio::spawn(run_capture(
            self.config.clone(),
            sink.clone(),
            Arc::clone(&preprocessor),
            faults,
            self.callbacks.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.level),
        ));

        info!(
            "Capture started at {} Hz, {:?} chunks",
            stream.sample_rate(),
            self.config.chunk_interval
        );

        *state = CaptureState::Active(ActiveCapture {
            stream,
            sink,
            preprocessor,
            task,
        });

        Ok(())
    }

    /// Stop the loops, release the device and emit the final chunk
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), CaptureState::Idle);

        let ActiveCapture {
            mut stream,
            sink,
            preprocessor,
            task,
        } = match previous {
            CaptureState::Active(active) => active,
            CaptureState::Starting(_) => {
                debug!("Capture stopped while starting");
                return;
            }
            CaptureState::Idle => return,
        };

        task.abort();
        sink.deactivate();
        stream.release();

        // A tick already running on another worker checks `is_active` under
        // this lock, so whatever it emits lands before the final chunk
        let mut preprocessor = preprocessor.lock();
        self.level.send_replace(0.0);

        let remaining = sink.take_pending();
        let mut samples = match preprocessor.process(&remaining) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Dropping final audio: {}", e);
                Vec::new()
            }
        };
        match preprocessor.flush() {
            Ok(tail) => samples.extend(tail),
            Err(e) => warn!("Dropping resampler tail: {}", e),
        }
        let data = encode_samples(&samples, preprocessor.target_sample_rate());

        info!("Capture stopped");
        (self.callbacks.on_chunk)(AudioChunk {
            data,
            is_final: true,
        });
    }

    fn abandon_start(&self, attempt: u64) {
        let mut state = self.state.lock();
        if matches!(*state, CaptureState::Starting(current) if current == attempt) {
            *state = CaptureState::Idle;
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.state.lock(), CaptureState::Active(_))
    }

    /// Latest level in `[0, 1]`; 0 while inactive
    pub fn current_level(&self) -> f32 {
        if self.is_active() {
            *self.level.borrow()
        } else {
            0.0
        }
    }

    pub fn subscribe_level(&self) -> watch::Receiver<f32> {
        self.level.subscribe()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let CaptureState::Active(mut active) =
            std::mem::replace(&mut *self.state.lock(), CaptureState::Idle)
        {
            active.task.abort();
            active.sink.deactivate();
            active.stream.release();
        }
    }
}

fn encode_samples(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    if samples.is_empty() {
        return Vec::new();
    }

    match encode_wav_chunk(samples, sample_rate) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to encode chunk: {}", e);
            Vec::new()
        }
    }
}

/// Encode and emit whatever arrived since the last tick
///
/// Returns false once capture has stopped. The activity check and the
/// emission both happen under the preprocessor lock that `stop` holds while
/// it emits the final chunk.
fn emit_chunk(
    sink: &SampleSink,
    preprocessor: &Mutex<CapturePreprocessor>,
    callbacks: &CaptureCallbacks,
) -> bool {
    let mut preprocessor = preprocessor.lock();
    if !sink.is_active() {
        return false;
    }

    let samples = sink.take_pending();
    if samples.is_empty() {
        return true;
    }

    let data = match preprocessor.process(&samples) {
        Ok(processed) => encode_samples(&processed, preprocessor.target_sample_rate()),
        Err(e) => {
            warn!("Dropping audio chunk: {}", e);
            Vec::new()
        }
    };

    if !data.is_empty() {
        (callbacks.on_chunk)(AudioChunk {
            data,
            is_final: false,
        });
    }
    true
}

fn publish_level(
    sink: &SampleSink,
    preprocessor: &Mutex<CapturePreprocessor>,
    level: &watch::Sender<f32>,
    value: f32,
) -> bool {
    let _guard = preprocessor.lock();
    if !sink.is_active() {
        return false;
    }
    level.send_replace(value);
    true
}

async fn run_capture(
    config: CaptureConfig,
    sink: SampleSink,
    preprocessor: Arc<Mutex<CapturePreprocessor>>,
    mut faults: mpsc::UnboundedReceiver<CaptureFault>,
    callbacks: CaptureCallbacks,
    state: Arc<Mutex<CaptureState>>,
    level: Arc<watch::Sender<f32>>,
) {
    let now = Instant::now();
    let mut chunk_ticker = interval_at(now + config.chunk_interval, config.chunk_interval);
    let mut level_ticker = interval_at(now + config.level_interval, config.level_interval);
    let mut meter = LevelMeter::new();

    loop {
        tokio::select! {
            _ = chunk_ticker.tick() => {
                if !emit_chunk(&sink, &preprocessor, &callbacks) {
                    break;
                }
            }
            _ = level_ticker.tick() => {
                let value = meter.process(&sink.window().snapshot());
                if !publish_level(&sink, &preprocessor, &level, value) {
                    break;
                }
            }
            Some(fault) = faults.recv() => {
                if !fault.fatal {
                    warn!("Audio input error: {}", fault.message);
                    continue;
                }

                error!("Audio input failed: {}", fault.message);
                if let CaptureState::Active(mut active) =
                    std::mem::replace(&mut *state.lock(), CaptureState::Idle)
                {
                    active.sink.deactivate();
                    active.stream.release();
                }
                level.send_replace(0.0);
                (callbacks.on_error)(CaptureError::Device(fault.message));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::MemoryCaptureSource;
    use std::io::Cursor;

    struct Recorded {
        chunks: Arc<Mutex<Vec<AudioChunk>>>,
        errors: Arc<Mutex<Vec<CaptureError>>>,
    }

    fn capture_with(source: &MemoryCaptureSource) -> (AudioCapture, Recorded) {
        capture_with_config(source, CaptureConfig::default())
    }

    fn capture_with_config(
        source: &MemoryCaptureSource,
        config: CaptureConfig,
    ) -> (AudioCapture, Recorded) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let callbacks = CaptureCallbacks {
            on_chunk: {
                let chunks = Arc::clone(&chunks);
                Arc::new(move |chunk: AudioChunk| chunks.lock().push(chunk))
            },
            on_error: {
                let errors = Arc::clone(&errors);
                Arc::new(move |err: CaptureError| errors.lock().push(err))
            },
        };
        let capture = AudioCapture::new(Arc::new(source.clone()), config, callbacks);
        (capture, Recorded { chunks, errors })
    }

    fn tone(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.07).sin() * 0.4).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_after_interval() {
        let source = MemoryCaptureSource::new(48_000);
        let (capture, recorded) = capture_with(&source);

        capture.start().await.unwrap();
        assert!(capture.is_active());
        assert!(source.push(&tone(4800)));

        tokio::time::sleep(Duration::from_millis(240)).await;
        assert!(recorded.chunks.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let chunks = recorded.chunks.lock().clone();
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].is_final);

        let reader = hound::WavReader::new(Cursor::new(chunks[0].data.clone())).unwrap();
        assert_eq!(reader.spec().sample_rate, 48_000);
        assert_eq!(reader.len(), 4800);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_ticks_emit_nothing() {
        let source = MemoryCaptureSource::new(48_000);
        let (capture, recorded) = capture_with(&source);

        capture.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(recorded.chunks.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_final_chunk_once() {
        let source = MemoryCaptureSource::new(48_000);
        let (capture, recorded) = capture_with(&source);

        capture.start().await.unwrap();
        source.push(&tone(1000));
        capture.stop();
        capture.stop();

        let chunks = recorded.chunks.lock().clone();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        assert!(!chunks[0].data.is_empty());
        assert!(!capture.is_active());
        assert!(!source.is_acquired());

        // Samples after stop go nowhere
        assert!(!source.push(&tone(100)));
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_a_no_op() {
        let source = MemoryCaptureSource::new(48_000);
        let (capture, recorded) = capture_with(&source);

        capture.stop();
        assert!(recorded.chunks.lock().is_empty());
        assert!(!capture.is_active());
        assert_eq!(capture.current_level(), 0.0);
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let source = MemoryCaptureSource::new(48_000);
        let (capture, _recorded) = capture_with(&source);

        capture.start().await.unwrap();
        capture.start().await.unwrap();
        assert_eq!(source.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let source = MemoryCaptureSource::new(48_000);
        source.deny_permission();
        let (capture, _recorded) = capture_with(&source);

        assert_eq!(capture.start().await, Err(CaptureError::PermissionDenied));
        assert!(!capture.is_active());
        assert_eq!(
            AgentVoxError::from(CaptureError::PermissionDenied),
            AgentVoxError::PermissionError("Microphone permission denied".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_level_follows_input() {
        let source = MemoryCaptureSource::new(48_000);
        let (capture, _recorded) = capture_with(&source);

        capture.start().await.unwrap();
        assert_eq!(capture.current_level(), 0.0);

        for _ in 0..10 {
            source.push(&tone(FFT_SIZE));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(capture.current_level() > 0.0);

        capture.stop();
        assert_eq!(capture.current_level(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_fault_stops_capture() {
        let source = MemoryCaptureSource::new(48_000);
        let (capture, recorded) = capture_with(&source);

        capture.start().await.unwrap();
        source.fault(false, "overrun");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(capture.is_active());

        source.fault(true, "device unplugged");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!capture.is_active());
        assert!(!source.is_acquired());
        assert_eq!(
            recorded.errors.lock().clone(),
            vec![CaptureError::Device("device unplugged".into())]
        );

        // Already inactive, so no final chunk
        capture.stop();
        assert!(recorded.chunks.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_chunk_follows_the_final_one() {
        let config = CaptureConfig {
            chunk_interval: Duration::from_millis(1),
            ..CaptureConfig::default()
        };

        for _ in 0..50 {
            let source = MemoryCaptureSource::new(48_000);
            let (capture, recorded) = capture_with_config(&source, config.clone());
            capture.start().await.unwrap();

            let feeder = {
                let source = source.clone();
                std::thread::spawn(move || {
                    while source.push(&tone(48)) {
                        std::thread::sleep(Duration::from_micros(200));
                    }
                })
            };

            tokio::time::sleep(Duration::from_millis(3)).await;
            capture.stop();
            feeder.join().unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;

            let chunks = recorded.chunks.lock().clone();
            assert_eq!(chunks.iter().filter(|chunk| chunk.is_final).count(), 1);
            assert!(chunks.last().unwrap().is_final);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_acquiring_cancels_start() {
        let source = MemoryCaptureSource::new(48_000).with_acquire_delay(Duration::from_millis(100));
        let (capture, recorded) = capture_with(&source);

        let (result, _) = tokio::join!(capture.start(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            capture.stop();
        });

        assert_eq!(result, Ok(()));
        assert!(!capture.is_active());
        assert!(!source.is_acquired());
        assert!(recorded.chunks.lock().is_empty());

        // A later start acquires again
        capture.start().await.unwrap();
        assert!(capture.is_active());
        assert_eq!(source.acquire_count(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_device() {
        let source = MemoryCaptureSource::new(48_000);
        source.unsupported("no input devices");
        let (capture, _recorded) = capture_with(&source);

        assert_eq!(
            capture.start().await,
            Err(CaptureError::Unsupported("no input devices".into()))
        );
        assert!(!capture.is_active());
        assert_eq!(
            AgentVoxError::from(CaptureError::Unsupported("no input devices".into())),
            AgentVoxError::UnsupportedError("no input devices".into())
        );

        source.allow();
        capture.start().await.unwrap();
        assert!(capture.is_active());
    }
}

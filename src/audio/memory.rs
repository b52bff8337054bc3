//! In-memory audio devices
//!
//! [`MemoryCaptureSource`] stands in for a microphone: samples are pushed by
//! hand. [`MemorySink`] stands in for a speaker: it records what it was asked
//! to play and only finishes an item when told to.

use crate::audio::capture::{
    CaptureConstraints, CaptureError, CaptureFault, CaptureSource, CaptureStream, SampleSink,
};
use crate::audio::playback::{AudioSink, FinishSignal};
use crate::{AgentVoxError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct SourceState {
    sink: Option<SampleSink>,
    failure: Option<CaptureError>,
    acquired: bool,
    acquire_count: usize,
}

#[derive(Clone)]
pub struct MemoryCaptureSource {
    sample_rate: u32,
    acquire_delay: Option<Duration>,
    state: Arc<Mutex<SourceState>>,
}

impl MemoryCaptureSource {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            acquire_delay: None,
            state: Arc::new(Mutex::new(SourceState::default())),
        }
    }

    /// Take `delay` to hand out each stream, like a permission prompt
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    /// Refuse every following acquire as a permission failure
    pub fn deny_permission(&self) {
        self.state.lock().failure = Some(CaptureError::PermissionDenied);
    }

    /// Refuse every following acquire as unsupported
    pub fn unsupported(&self, reason: &str) {
        self.state.lock().failure = Some(CaptureError::Unsupported(reason.to_string()));
    }

    pub fn allow(&self) {
        self.state.lock().failure = None;
    }

    /// Deliver samples to the running stream; false if none is running
    pub fn push(&self, samples: &[f32]) -> bool {
        let state = self.state.lock();
        match state.sink.as_ref() {
            Some(sink) if state.acquired && sink.is_active() => {
                sink.push(samples);
                true
            }
            _ => false,
        }
    }

    /// Report a device error to the running stream
    pub fn fault(&self, fatal: bool, message: &str) {
        if let Some(sink) = self.state.lock().sink.as_ref() {
            sink.fault(CaptureFault {
                fatal,
                message: message.to_string(),
            });
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().acquired
    }

    pub fn acquire_count(&self) -> usize {
        self.state.lock().acquire_count
    }
}

#[async_trait]
impl CaptureSource for MemoryCaptureSource {
    async fn acquire(
        &self,
        _constraints: &CaptureConstraints,
        sink: SampleSink,
    ) -> std::result::Result<Box<dyn CaptureStream>, CaptureError> {
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(failure) = state.failure.clone() {
            return Err(failure);
        }

        state.acquire_count += 1;
        state.acquired = true;
        state.sink = Some(sink);

        Ok(Box::new(MemoryCaptureStream {
            sample_rate: self.sample_rate,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryCaptureStream {
    sample_rate: u32,
    state: Arc<Mutex<SourceState>>,
}

impl CaptureStream for MemoryCaptureStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn release(&mut self) {
        let mut state = self.state.lock();
        state.acquired = false;
        state.sink = None;
    }
}

#[derive(Default)]
struct SinkState {
    started: Vec<Vec<u8>>,
    current: Option<FinishSignal>,
    paused: bool,
    position: Duration,
    stops: usize,
}

/// Speaker that plays nothing
///
/// Empty items fail to start, like undecodable audio would.
#[derive(Clone, Default)]
pub struct MemorySink {
    duration: Option<Duration>,
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duration reported for every item
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Items that started playing, in order
    pub fn started(&self) -> Vec<Vec<u8>> {
        self.state.lock().started.clone()
    }

    /// Let the current item play to its end; false if nothing is playing
    pub fn finish_current(&self) -> bool {
        let signal = self.state.lock().current.take();
        match signal {
            Some(signal) => {
                signal.fire();
                true
            }
            None => false,
        }
    }

    /// End signal of the current item
    pub fn current_signal(&self) -> Option<FinishSignal> {
        self.state.lock().current.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn set_position(&self, position: Duration) {
        self.state.lock().position = position;
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stops
    }
}

impl AudioSink for MemorySink {
    fn start(&mut self, bytes: Vec<u8>, finished: FinishSignal) -> Result<Option<Duration>> {
        let mut state = self.state.lock();
        state.current = None;
        state.paused = false;
        state.position = Duration::ZERO;

        if bytes.is_empty() {
            return Err(AgentVoxError::PlaybackError("Cannot decode empty audio".into()));
        }

        state.started.push(bytes);
        state.current = Some(finished);
        Ok(self.duration)
    }

    fn pause(&mut self) {
        self.state.lock().paused = true;
    }

    fn resume(&mut self) {
        self.state.lock().paused = false;
    }

    fn stop(&mut self) {
        let mut state = self.state.lock();
        state.current = None;
        state.paused = false;
        state.position = Duration::ZERO;
        state.stops += 1;
    }

    fn position(&self) -> Duration {
        self.state.lock().position
    }
}

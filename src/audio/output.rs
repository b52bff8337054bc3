use crate::audio::playback::{AudioSink, FinishSignal};
use crate::{AgentVoxError, Result};
use crossbeam_channel::{bounded, Sender};
use rodio::source::EmptyCallback;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Speaker sink backed by rodio
///
/// The rodio output stream is pinned to a dedicated thread; only its handle
/// is kept here. Every item gets a fresh [`Sink`] followed by a callback
/// source that reports the item's end.
pub struct RodioSink {
    handle: OutputStreamHandle,
    sink: Option<Sink>,
    playback_start: Option<Instant>,
    paused_position: Duration,
    duration: Option<Duration>,
    shutdown: Option<Sender<()>>,
}

impl RodioSink {
    pub fn new() -> Result<Self> {
        let (handle_tx, handle_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        std::thread::Builder::new()
            .name("agentvox-output".into())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    debug!("Output stream closed");
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(AgentVoxError::AudioDeviceError(format!(
                        "No output device available: {}",
                        e
                    ))));
                }
            })
            .map_err(|e| AgentVoxError::AudioDeviceError(format!("Failed to spawn output thread: {}", e)))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| AgentVoxError::AudioDeviceError("Output thread exited".into()))??;

        info!("Opened default output device");

        Ok(Self {
            handle,
            sink: None,
            playback_start: None,
            paused_position: Duration::ZERO,
            duration: None,
            shutdown: Some(shutdown_tx),
        })
    }
}

impl AudioSink for RodioSink {
    fn start(&mut self, bytes: Vec<u8>, finished: FinishSignal) -> Result<Option<Duration>> {
        self.stop();

        let source = Decoder::new(Cursor::new(bytes))
            .map_err(|e| AgentVoxError::PlaybackError(format!("Failed to decode audio: {}", e)))?;
        let duration = source.total_duration();

        let sink = Sink::try_new(&self.handle)
            .map_err(|e| AgentVoxError::PlaybackError(format!("Failed to open sink: {}", e)))?;

        sink.append(source);
        sink.append(EmptyCallback::<f32>::new(Box::new(move || finished.fire())));
        sink.play();

        self.playback_start = Some(Instant::now());
        self.duration = duration;
        self.sink = Some(sink);

        Ok(duration)
    }

    fn pause(&mut self) {
        if let Some(sink) = &self.sink {
            if !sink.is_paused() {
                sink.pause();
                if let Some(start) = self.playback_start {
                    self.paused_position = Instant::now().duration_since(start);
                }
            }
        }
    }

    fn resume(&mut self) {
        if let Some(sink) = &self.sink {
            if sink.is_paused() {
                sink.play();
                self.playback_start = Some(Instant::now() - self.paused_position);
            }
        }
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.playback_start = None;
        self.paused_position = Duration::ZERO;
        self.duration = None;
    }

    fn position(&self) -> Duration {
        let Some(sink) = &self.sink else {
            return Duration::ZERO;
        };

        if sink.is_paused() {
            return self.paused_position;
        }

        match (self.playback_start, self.duration) {
            (Some(start), Some(duration)) => start.elapsed().min(duration),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        self.stop();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::{AudioPlayer, PlayerCallbacks};

    #[tokio::test]
    async fn test_undecodable_audio_is_a_playback_error() {
        // Skipped on machines without an output device
        if let Ok(sink) = RodioSink::new() {
            let player = AudioPlayer::new(
                Box::new(sink),
                PlayerCallbacks::default(),
                Duration::from_millis(100),
            );
            let result = player.play(vec![0u8; 16]).await;
            assert!(matches!(result, Err(AgentVoxError::PlaybackError(_))));
            player.shutdown().await;
        }
    }
}

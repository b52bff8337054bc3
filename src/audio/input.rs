use crate::audio::capture::{
    CaptureConstraints, CaptureError, CaptureFault, CaptureSource, CaptureStream, SampleSink,
};
use crate::audio::preprocessor::downmix;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig, StreamError};
use crossbeam_channel::{bounded, Sender};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Microphone source backed by the default cpal input device
///
/// cpal streams cannot leave the thread that built them, so each acquired
/// stream lives on its own thread until it is released.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalSource;

impl CpalSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureSource for CpalSource {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
        sink: SampleSink,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            info!("Echo cancellation and noise suppression are not available from the host audio API");
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let constraints = constraints.clone();

        let thread = std::thread::Builder::new()
            .name("agentvox-capture".into())
            .spawn(move || match open_stream(&constraints, sink) {
                Ok((stream, sample_rate)) => {
                    let _ = ready_tx.send(Ok(sample_rate));
                    // Parked until released
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    debug!("Input stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| CaptureError::Device(format!("Failed to spawn capture thread: {}", e)))?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| CaptureError::Device("Capture thread exited".into()))??;

        Ok(Box::new(CpalStream {
            sample_rate,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }))
    }
}

struct CpalStream {
    sample_rate: u32,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn release(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("Released input device");
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_stream(
    constraints: &CaptureConstraints,
    sink: SampleSink,
) -> Result<(Stream, u32), CaptureError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::Unsupported("No input device available".into()))?;

    info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let (config, format) = choose_config(&device, constraints)?;
    let channels = config.channels as usize;
    let sample_rate = config.sample_rate.0;

    debug!(
        "Input config: {} Hz, {} channel(s), {:?}",
        sample_rate, channels, format
    );

    let err_sink = sink.clone();
    let err_fn = move |err: StreamError| {
        let fatal = matches!(err, StreamError::DeviceNotAvailable);
        err_sink.fault(CaptureFault {
            fatal,
            message: err.to_string(),
        });
    };

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                sink.push(&downmix(data, channels));
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                sink.push(&downmix(&samples, channels));
            },
            err_fn,
            None,
        ),
        other => {
            return Err(CaptureError::Unsupported(format!(
                "Unsupported sample format: {:?}",
                other
            )))
        }
    }
    .map_err(|e| device_error(format!("Failed to build input stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| device_error(format!("Failed to start input stream: {}", e)))?;

    Ok((stream, sample_rate))
}

/// Prefer the requested rate and channel count, else the device default
fn choose_config(
    device: &Device,
    constraints: &CaptureConstraints,
) -> Result<(StreamConfig, SampleFormat), CaptureError> {
    let wanted = SampleRate(constraints.sample_rate);

    if let Ok(ranges) = device.supported_input_configs() {
        for range in ranges {
            let usable = matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16);
            if usable
                && range.channels() == constraints.channel_count
                && range.min_sample_rate() <= wanted
                && wanted <= range.max_sample_rate()
            {
                let supported = range.with_sample_rate(wanted);
                return Ok((supported.config(), supported.sample_format()));
            }
        }
    }

    warn!(
        "Input device does not offer {} Hz with {} channel(s), using its default",
        constraints.sample_rate, constraints.channel_count
    );

    let supported = device
        .default_input_config()
        .map_err(|e| device_error(format!("Failed to get input config: {}", e)))?;

    Ok((supported.config(), supported.sample_format()))
}

fn device_error(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::Device(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_messages() {
        assert_eq!(
            device_error("Access denied by the OS".into()),
            CaptureError::PermissionDenied
        );
        assert_eq!(
            device_error("Device busy".into()),
            CaptureError::Device("Device busy".into())
        );
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        // Skipped on machines without a microphone
        let (sink, _faults) = SampleSink::new();
        if let Ok(mut stream) = CpalSource::new()
            .acquire(&CaptureConstraints::default(), sink)
            .await
        {
            assert!(stream.sample_rate() > 0);
            stream.release();
            stream.release();
        }
    }
}

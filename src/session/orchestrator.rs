//! Session orchestrator
//!
//! Ties one agent's connection, microphone and speaker together. Inbound
//! messages are applied to the [`ConversationStore`] by a pump task; capture
//! chunks go straight out on the connection from the capture callback.

use super::agent::AgentSession;
use super::store::{ConversationMessage, ConversationStatus, ConversationStore};
use crate::audio::capture::{
    AudioCapture, AudioChunk, CaptureCallbacks, CaptureError, CaptureSource,
};
use crate::audio::playback::{AudioPlayer, AudioSink, PlaybackProgress, PlayerCallbacks};
use crate::config::SessionConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState, Transport, WsTransport};
use crate::protocol::{self, WireMessage};
use crate::{AgentVoxError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Assembles a [`VoiceSession`] for one agent
pub struct VoiceSessionBuilder {
    agent_id: String,
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    capture_source: Option<Arc<dyn CaptureSource>>,
    audio_sink: Option<Box<dyn AudioSink>>,
}

impl VoiceSessionBuilder {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            config: SessionConfig::default(),
            transport: None,
            capture_source: None,
            audio_sink: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn capture_source(mut self, source: Arc<dyn CaptureSource>) -> Self {
        self.capture_source = Some(source);
        self
    }

    pub fn audio_sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.audio_sink = Some(sink);
        self
    }

    /// Build the session; must be called inside a tokio runtime
    ///
    /// Backends that were not supplied default to the WebSocket transport and,
    /// with the `audio-io` feature, the default microphone and speaker.
    pub fn build(self) -> Result<VoiceSession> {
        let agent = AgentSession::new(&self.config, self.agent_id)?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(WsTransport::new()),
        };
        let capture_source = match self.capture_source {
            Some(source) => source,
            None => default_capture_source()?,
        };
        let audio_sink = match self.audio_sink {
            Some(sink) => sink,
            None => default_audio_sink()?,
        };

        let store = ConversationStore::new();
        let (connection, events) = ConnectionManager::new(
            agent.endpoint.clone(),
            transport,
            self.config.reconnect.clone(),
        );

        let responses = ResponseTracker::new(store.clone());
        let player = AudioPlayer::new(
            audio_sink,
            player_callbacks(store.clone(), responses.clone()),
            self.config.progress_interval,
        );

        let capture = AudioCapture::new(
            capture_source,
            self.config.capture.clone(),
            capture_callbacks(store.clone(), connection.clone()),
        );

        let inner = Arc::new(SessionInner {
            agent,
            store,
            connection,
            player,
            capture,
            responses,
        });

        let pump = tokio::spawn(run_pump(Arc::clone(&inner), events));

        info!("Voice session ready for agent {}", inner.agent.agent_id);

        Ok(VoiceSession {
            inner,
            pump: Mutex::new(Some(pump)),
        })
    }
}

#[cfg(feature = "audio-io")]
fn default_capture_source() -> Result<Arc<dyn CaptureSource>> {
    Ok(Arc::new(crate::audio::CpalSource::new()))
}

#[cfg(not(feature = "audio-io"))]
fn default_capture_source() -> Result<Arc<dyn CaptureSource>> {
    Err(AgentVoxError::ConfigError(
        "No capture source given and audio-io is disabled".into(),
    ))
}

#[cfg(feature = "audio-io")]
fn default_audio_sink() -> Result<Box<dyn AudioSink>> {
    Ok(Box::new(crate::audio::RodioSink::new()?))
}

#[cfg(not(feature = "audio-io"))]
fn default_audio_sink() -> Result<Box<dyn AudioSink>> {
    Err(AgentVoxError::ConfigError(
        "No audio sink given and audio-io is disabled".into(),
    ))
}

/// Counts agent audio handed to the player and not yet settled
///
/// Every queued response either ends or fails to start, and each outcome
/// settles it. The count and the `responding` status change under one lock,
/// so a response that arrives just as the previous one ends keeps the status
/// at `responding`.
#[derive(Clone)]
struct ResponseTracker {
    outstanding: Arc<Mutex<usize>>,
    store: ConversationStore,
}

impl ResponseTracker {
    fn new(store: ConversationStore) -> Self {
        Self {
            outstanding: Arc::new(Mutex::new(0)),
            store,
        }
    }

    fn queued(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding += 1;
        self.store.set_status(ConversationStatus::Responding);
    }

    fn settled(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 && self.store.status() == ConversationStatus::Responding {
            self.store.set_status(ConversationStatus::Connected);
        }
    }

    fn reset(&self) {
        *self.outstanding.lock() = 0;
    }
}

fn player_callbacks(store: ConversationStore, responses: ResponseTracker) -> PlayerCallbacks {
    let ended = responses.clone();
    PlayerCallbacks {
        on_ended: Arc::new(move |_remaining: usize| ended.settled()),
        on_error: Arc::new(move |err: AgentVoxError| {
            store.set_error(err);
            responses.settled();
        }),
    }
}

fn capture_callbacks(store: ConversationStore, connection: ConnectionManager) -> CaptureCallbacks {
    CaptureCallbacks {
        on_chunk: Arc::new(move |chunk: AudioChunk| {
            send_chunk(&connection, &chunk.data, chunk.is_final);
        }),
        on_error: Arc::new(move |err: CaptureError| {
            error!("Capture failed: {}", err);
            store.set_error(err.into());
            store.set_status(ConversationStatus::Error);
        }),
    }
}

fn send_chunk(connection: &ConnectionManager, bytes: &[u8], is_final: bool) -> bool {
    let data = protocol::encode_audio(bytes);
    connection.send(&WireMessage::audio_chunk(data, is_final))
}

struct SessionInner {
    agent: AgentSession,
    store: ConversationStore,
    connection: ConnectionManager,
    player: AudioPlayer,
    capture: AudioCapture,
    responses: ResponseTracker,
}

impl SessionInner {
    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => {
                debug!("Socket open, waiting for connection_established");
            }
            ConnectionEvent::Message(message) => self.handle_message(message),
            ConnectionEvent::Error(err) => {
                warn!("Connection error: {}", err);
                self.store.set_error(err);
                self.store.set_status(ConversationStatus::Error);
            }
            ConnectionEvent::Closed { reconnecting } => {
                self.store.set_connected(false);
                if reconnecting {
                    self.store.set_status(ConversationStatus::Connecting);
                } else if self.store.status() != ConversationStatus::Error {
                    self.store.set_status(ConversationStatus::Disconnected);
                }
            }
        }
    }

    fn handle_message(&self, message: WireMessage) {
        match message {
            WireMessage::ConnectionEstablished { session_id, agent } => {
                info!(
                    "Session established (session {:?}, agent {:?})",
                    session_id, agent
                );
                self.store.set_session_info(session_id, agent);
                self.store.set_connected(true);
                self.store.set_status(ConversationStatus::Connected);
            }
            WireMessage::Transcription { text } => match non_empty(text) {
                Some(text) => self.store.add_message(ConversationMessage::user(text)),
                None => debug!("Ignoring empty transcription"),
            },
            WireMessage::LlmResponse { text } => match non_empty(text) {
                Some(text) => self.store.add_message(ConversationMessage::agent(text)),
                None => debug!("Ignoring empty llm_response"),
            },
            WireMessage::AudioResponse { data } => {
                let Some(data) = non_empty(data) else {
                    debug!("Ignoring empty audio_response");
                    return;
                };

                match protocol::decode_audio(&data) {
                    Ok(bytes) => {
                        self.responses.queued();
                        self.player.play_chunk(bytes);
                    }
                    Err(e) => {
                        warn!("Dropping audio_response: {}", e);
                        self.store.set_error(e);
                    }
                }
            }
            WireMessage::StatusUpdate { status } => {
                let Some(status) = status else {
                    debug!("Ignoring status_update without status");
                    return;
                };

                match status.parse::<ConversationStatus>() {
                    Ok(status) => self.store.set_status(status),
                    Err(_) => warn!("Ignoring unknown status: {}", status),
                }
            }
            WireMessage::Error { message } => {
                let message = message.unwrap_or_else(|| "Unknown error".to_string());
                warn!("Server error: {}", message);
                self.store.set_error(AgentVoxError::ProtocolError(message));
            }
            other @ (WireMessage::AudioChunk { .. } | WireMessage::EndSession) => {
                warn!("Ignoring client-only message type: {}", other.kind());
            }
            WireMessage::Unknown { kind } => {
                warn!("Unknown message type: {}", kind);
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

async fn run_pump(inner: Arc<SessionInner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        inner.handle_event(event);
    }
    debug!("Session pump finished");
}

/// A live voice conversation with one agent
pub struct VoiceSession {
    inner: Arc<SessionInner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceSession {
    pub fn builder(agent_id: impl Into<String>) -> VoiceSessionBuilder {
        VoiceSessionBuilder::new(agent_id)
    }

    pub fn agent(&self) -> &AgentSession {
        &self.inner.agent
    }

    /// Clear the history and open the connection
    pub async fn start_session(&self) {
        self.inner.store.begin_session();
        self.inner.store.set_status(ConversationStatus::Connecting);
        info!("Starting session with {}", self.inner.agent.endpoint);
        self.inner.connection.connect().await;
    }

    /// Tell the server the session is over, then close the connection
    ///
    /// The `end_session` frame is flushed before the socket closes; no
    /// acknowledgement is awaited.
    pub async fn end_session(&self) {
        self.inner.capture.stop();
        self.inner.connection.send(&WireMessage::EndSession);
        self.inner.connection.disconnect().await;

        self.inner.player.stop();
        self.inner.player.clear_queue();
        self.inner.responses.reset();
        self.inner.store.set_connected(false);
        self.inner.store.set_status(ConversationStatus::Disconnected);
        info!("Session with {} ended", self.inner.agent.agent_id);
    }

    /// Send raw audio bytes as one `audio_chunk` frame
    ///
    /// Returns false when the frame was dropped because the connection is not
    /// open.
    pub fn send_audio_chunk(&self, bytes: &[u8], is_final: bool) -> bool {
        send_chunk(&self.inner.connection, bytes, is_final)
    }

    /// Start streaming the microphone
    pub async fn start_recording(&self) -> Result<()> {
        let status = self.inner.store.status();
        let allowed = match status {
            ConversationStatus::Connected => true,
            ConversationStatus::Idle => self.inner.connection.is_connected(),
            _ => false,
        };

        if !allowed {
            return Err(AgentVoxError::InvalidState(format!(
                "Cannot record while {}",
                status
            )));
        }

        match self.inner.capture.start().await {
            Ok(()) if self.inner.capture.is_active() => {
                self.inner.store.set_status(ConversationStatus::Recording);
                Ok(())
            }
            Ok(()) => {
                debug!("Recording was stopped before the microphone opened");
                Ok(())
            }
            Err(e) => {
                let err = AgentVoxError::from(e);
                error!("Failed to start recording: {}", err);
                self.inner.store.set_error(err.clone());
                self.inner.store.set_status(ConversationStatus::Error);
                Err(err)
            }
        }
    }

    /// Stop the microphone; the last chunk goes out flagged as final
    pub fn stop_recording(&self) {
        self.inner.capture.stop();
        if self.inner.store.status() == ConversationStatus::Recording {
            self.inner.store.set_status(ConversationStatus::Connected);
        }
    }

    /// Release the microphone, close the connection and end all tasks
    pub async fn shutdown(&self) {
        self.inner.capture.stop();
        self.inner.connection.disconnect().await;
        self.inner.player.shutdown().await;
        self.inner.responses.reset();

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
        }

        // The pump is gone before it sees the close event
        self.inner.store.set_connected(false);
        self.inner.store.set_status(ConversationStatus::Disconnected);
        info!("Voice session shut down");
    }

    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.inner.store.messages()
    }

    pub fn status(&self) -> ConversationStatus {
        self.inner.store.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConversationStatus> {
        self.inner.store.subscribe_status()
    }

    pub fn error(&self) -> Option<AgentVoxError> {
        self.inner.store.error()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.store.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.store.session_id()
    }

    pub fn agent_name(&self) -> Option<String> {
        self.inner.store.agent_name()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.capture.is_active()
    }

    /// Microphone level in `[0, 1]`
    pub fn level(&self) -> f32 {
        self.inner.capture.current_level()
    }

    pub fn subscribe_level(&self) -> watch::Receiver<f32> {
        self.inner.capture.subscribe_level()
    }

    pub fn playback_progress(&self) -> PlaybackProgress {
        self.inner.player.progress()
    }

    /// Read-only handle on the conversation state
    pub fn store(&self) -> &ConversationStore {
        &self.inner.store
    }

    /// Apply one inbound message as if it had arrived on the socket
    pub fn handle_message(&self, message: WireMessage) {
        self.inner.handle_message(message);
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        self.inner.capture.stop();
        self.inner.connection.abort();
        self.inner.player.close();
        debug!("Voice session for {} dropped", self.inner.agent.agent_id);
    }
}

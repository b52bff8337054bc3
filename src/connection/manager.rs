//! Connection manager
//!
//! Keeps one logical connection to the server alive. Every socket gets a
//! generation number; anything a socket's reader task or a reconnect timer
//! tries to report is dropped once a newer `connect`/`disconnect` has bumped
//! the generation, so handlers only ever trace to the most recent socket.

use super::reconnect::ReconnectPolicy;
use super::transport::{FrameSink, FrameStream, Transport};
use super::{ConnectionEvent, ConnectionState};
use crate::protocol::{self, WireMessage};
use crate::AgentVoxError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Longest wait for queued frames to flush when a socket is torn down
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Slot {
    generation: u64,
    writer: Option<mpsc::UnboundedSender<String>>,
    writer_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    attempts: u32,
}

struct Shared {
    url: String,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    slot: Mutex<Slot>,
}

/// Owner of the live socket
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager for `url`; events arrive on the returned receiver
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let manager = Self {
            shared: Arc::new(Shared {
                url: url.into(),
                transport,
                policy,
                events,
                state,
                slot: Mutex::new(Slot::default()),
            }),
        };

        (manager, events_rx)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnect attempts made since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.slot.lock().attempts
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.shared.slot.lock().reconnect_timer.is_some()
    }

    /// Open a fresh socket, tearing down any previous one first
    pub async fn connect(&self) {
        self.shared.slot.lock().attempts = 0;
        self.open_socket().await;
    }

    /// Close the socket and cancel any pending reconnect
    ///
    /// Frames already passed to [`send`](Self::send) are flushed before the
    /// socket closes.
    pub async fn disconnect(&self) {
        self.teardown().await;
        self.shared.slot.lock().attempts = 0;
        self.set_state(ConnectionState::Disconnected);
        let _ = self
            .shared
            .events
            .send(ConnectionEvent::Closed { reconnecting: false });
        info!("Disconnected from {}", self.shared.url);
    }

    /// Tear the connection down without waiting
    ///
    /// For owners that cannot await, such as `Drop`. Any pending reconnect is
    /// cancelled and nothing reaches the event receiver afterwards; frames
    /// already queued still flush in the background before the socket closes.
    pub fn abort(&self) {
        // The writer task stays detached and exits once the queue is drained
        let _ = self.detach();
        self.shared.slot.lock().attempts = 0;
        self.set_state(ConnectionState::Disconnected);
        debug!("Connection to {} aborted", self.shared.url);
    }

    /// Encode and queue a message on the open socket
    ///
    /// While not connected the message is dropped with a warning and `false`
    /// is returned; nothing is buffered for later.
    pub fn send(&self, message: &WireMessage) -> bool {
        let frame = match protocol::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode {} frame: {}", message.kind(), e);
                return false;
            }
        };

        let slot = self.shared.slot.lock();
        match slot.writer.as_ref() {
            Some(writer) if self.is_connected() => {
                if writer.send(frame).is_err() {
                    warn!("Socket writer is gone, dropping {} frame", message.kind());
                    return false;
                }
                true
            }
            _ => {
                warn!("Not connected, dropping {} frame", message.kind());
                false
            }
        }
    }

    async fn open_socket(&self) {
        let generation = self.teardown().await;
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {}", self.shared.url);

        match self.shared.transport.open(&self.shared.url).await {
            Ok((sink, stream)) => self.attach(generation, sink, stream).await,
            Err(e) => {
                warn!("Failed to open socket: {}", e);
                self.fail(generation, e);
            }
        }
    }

    async fn attach(&self, generation: u64, mut sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream>) {
        {
            let mut slot = self.shared.slot.lock();
            if slot.generation == generation {
                let (writer_tx, writer_rx) = mpsc::unbounded_channel();
                slot.writer = Some(writer_tx);
                slot.attempts = 0;

                self.set_state(ConnectionState::Connected);
                let _ = self.shared.events.send(ConnectionEvent::Opened);
                info!("Connected to {}", self.shared.url);

                slot.writer_task = Some(tokio::spawn(run_writer(sink, writer_rx)));
                slot.reader_task = Some(tokio::spawn(self.clone().run_reader(generation, stream)));
                return;
            }
        }

        debug!("Socket opened after being superseded, closing it");
        let _ = sink.close().await;
    }

    async fn run_reader(self, generation: u64, mut stream: Box<dyn FrameStream>) {
        while let Some(item) = stream.next_frame().await {
            match item {
                Ok(frame) => match protocol::decode(&frame) {
                    Ok(message) => {
                        if !self.emit_current(generation, ConnectionEvent::Message(message)) {
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping malformed frame: {}", e),
                },
                Err(e) => {
                    warn!("Socket error: {}", e);
                    self.fail(generation, e);
                    return;
                }
            }
        }

        debug!("Socket stream ended");
        self.handle_closed(generation);
    }

    /// Cancel the reconnect timer, detach the reader and close the socket
    ///
    /// Returns the generation of whatever socket comes next.
    async fn teardown(&self) -> u64 {
        let (writer_task, generation) = self.detach();

        if let Some(task) = writer_task {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                warn!("Socket did not close within {:?}, dropping it", CLOSE_GRACE);
                abort.abort();
            }
        }

        generation
    }

    /// Invalidate the current socket and hand back its writer task
    fn detach(&self) -> (Option<JoinHandle<()>>, u64) {
        let mut slot = self.shared.slot.lock();
        slot.generation += 1;

        if let Some(timer) = slot.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = slot.reader_task.take() {
            reader.abort();
        }
        // Dropping the sender lets the writer drain and then close the socket
        slot.writer = None;

        (slot.writer_task.take(), slot.generation)
    }

    fn fail(&self, generation: u64, error: AgentVoxError) {
        {
            let slot = self.shared.slot.lock();
            if slot.generation != generation {
                return;
            }
            self.set_state(ConnectionState::Error);
            let _ = self.shared.events.send(ConnectionEvent::Error(error));
        }

        self.handle_closed(generation);
    }

    fn handle_closed(&self, generation: u64) {
        let mut slot = self.shared.slot.lock();
        if slot.generation != generation {
            return;
        }

        slot.writer = None;
        // Detach only: this may be the reader task itself
        slot.reader_task = None;

        let attempt = slot.attempts + 1;
        let delay = self.shared.policy.delay_for(attempt);

        if let Some(timer) = slot.reconnect_timer.take() {
            timer.abort();
        }

        self.set_state(ConnectionState::Disconnected);

        match delay {
            Some(delay) => {
                slot.attempts = attempt;
                info!(
                    "Connection closed, reconnecting in {:?} (attempt {})",
                    delay, attempt
                );
                let manager = self.clone();
                slot.reconnect_timer =
                    Some(tokio::spawn(manager.fire_reconnect(generation, delay)));
                let _ = self
                    .shared
                    .events
                    .send(ConnectionEvent::Closed { reconnecting: true });
            }
            None => {
                info!("Connection closed");
                let _ = self
                    .shared
                    .events
                    .send(ConnectionEvent::Closed { reconnecting: false });
            }
        }
    }

    async fn fire_reconnect(self, generation: u64, delay: Duration) {
        tokio::time::sleep(delay).await;

        {
            let mut slot = self.shared.slot.lock();
            if slot.generation != generation {
                return;
            }
            // Forget our own handle so the teardown below does not abort us
            slot.reconnect_timer = None;
        }

        self.open_socket().await;
    }

    fn emit_current(&self, generation: u64, event: ConnectionEvent) -> bool {
        let slot = self.shared.slot.lock();
        if slot.generation != generation {
            return false;
        }
        self.shared.events.send(event).is_ok()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!("Connection state: {} -> {}", previous.as_str(), state.as_str());
        }
    }
}

async fn run_writer(mut sink: Box<dyn FrameSink>, mut frames: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = sink.send_frame(frame).await {
            warn!("Failed to send frame: {}", e);
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Socket close failed: {}", e);
    }
}

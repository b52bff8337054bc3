//! Streaming playback pipeline
//!
//! One task owns the [`AudioSink`] and the chunk queue. [`AudioPlayer`] is a
//! cheap handle that sends it commands, so calls are applied in the order
//! they were made.

use crate::{AgentVoxError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Output device seam
pub trait AudioSink: Send {
    /// Replace whatever is playing with `bytes`
    ///
    /// The sink fires `finished` once the item plays to its end. Returns the
    /// item's duration when the decoder knows it.
    fn start(&mut self, bytes: Vec<u8>, finished: FinishSignal) -> Result<Option<Duration>>;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Stop and rewind; the stopped item never finishes
    fn stop(&mut self);

    /// Position within the current item
    fn position(&self) -> Duration;
}

/// Fired by a sink when an item plays to its end
#[derive(Clone)]
pub struct FinishSignal {
    item: u64,
    commands: mpsc::UnboundedSender<PlayerCommand>,
}

impl FinishSignal {
    pub fn fire(&self) {
        let _ = self.commands.send(PlayerCommand::Finished(self.item));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackProgress {
    pub position: Duration,
    pub duration: Option<Duration>,
    pub is_playing: bool,
    pub queued: usize,
}

pub type EndedCallback = Arc<dyn Fn(usize) + Send + Sync>;
pub type PlaybackErrorCallback = Arc<dyn Fn(AgentVoxError) + Send + Sync>;

#[derive(Clone)]
pub struct PlayerCallbacks {
    /// Called after each item ends, with the number of items still queued
    pub on_ended: EndedCallback,
    pub on_error: PlaybackErrorCallback,
}

impl Default for PlayerCallbacks {
    fn default() -> Self {
        Self {
            on_ended: Arc::new(|_: usize| {}),
            on_error: Arc::new(|_: AgentVoxError| {}),
        }
    }
}

enum PlayerCommand {
    PlayChunk(Vec<u8>),
    Play {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Pause,
    Resume,
    Stop,
    ClearQueue,
    Finished(u64),
    Shutdown,
}

#[derive(Clone)]
pub struct AudioPlayer {
    commands: mpsc::UnboundedSender<PlayerCommand>,
    progress: watch::Receiver<PlaybackProgress>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AudioPlayer {
    /// Spawn the playback task; must be called inside a tokio runtime
    pub fn new(
        sink: Box<dyn AudioSink>,
        callbacks: PlayerCallbacks,
        progress_interval: Duration,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress) = watch::channel(PlaybackProgress::default());

        let task = PlayerTask {
            sink,
            queue: VecDeque::new(),
            current: None,
            next_item: 0,
            paused: false,
            duration: None,
            callbacks,
            progress: progress_tx,
            commands: commands.downgrade(),
        };

        let handle = tokio::spawn(task.run(command_rx, progress_interval));

        Self {
            commands,
            progress,
            task: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Play now if idle, otherwise queue behind the current item
    pub fn play_chunk(&self, bytes: Vec<u8>) {
        self.send(PlayerCommand::PlayChunk(bytes));
    }

    /// Play one complete resource in place of the current item
    ///
    /// The queue is left untouched.
    pub async fn play(&self, bytes: Vec<u8>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(PlayerCommand::Play { bytes, reply })
            .map_err(|_| AgentVoxError::ChannelError("Playback task has stopped".into()))?;

        response
            .await
            .map_err(|_| AgentVoxError::ChannelError("Playback task has stopped".into()))?
    }

    pub fn pause(&self) {
        self.send(PlayerCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(PlayerCommand::Resume);
    }

    /// Stop and rewind the current item
    pub fn stop(&self) {
        self.send(PlayerCommand::Stop);
    }

    /// Drop queued items; the current one keeps playing
    pub fn clear_queue(&self) {
        self.send(PlayerCommand::ClearQueue);
    }

    pub fn progress(&self) -> PlaybackProgress {
        *self.progress.borrow()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<PlaybackProgress> {
        self.progress.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.progress.borrow().is_playing
    }

    /// Ask the task to stop playback and exit, without waiting for it
    pub fn close(&self) {
        self.send(PlayerCommand::Shutdown);
    }

    /// Stop playback and end the task
    pub async fn shutdown(&self) {
        self.close();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn send(&self, command: PlayerCommand) {
        if self.commands.send(command).is_err() {
            debug!("Playback task has stopped, command dropped");
        }
    }
}

struct PlayerTask {
    sink: Box<dyn AudioSink>,
    queue: VecDeque<Vec<u8>>,
    current: Option<u64>,
    next_item: u64,
    paused: bool,
    duration: Option<Duration>,
    callbacks: PlayerCallbacks,
    progress: watch::Sender<PlaybackProgress>,
    commands: mpsc::WeakUnboundedSender<PlayerCommand>,
}

impl PlayerTask {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<PlayerCommand>,
        progress_interval: Duration,
    ) {
        let mut ticker = interval(progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command) {
                        break;
                    }
                    self.publish();
                }
                _ = ticker.tick() => {
                    if self.is_playing() {
                        self.publish();
                    }
                }
            }
        }

        debug!("Playback task finished");
    }

    /// Returns false once the task should exit
    fn handle(&mut self, command: PlayerCommand) -> bool {
        match command {
            PlayerCommand::PlayChunk(bytes) => {
                if self.current.is_some() {
                    self.queue.push_back(bytes);
                    debug!("Queued audio chunk ({} waiting)", self.queue.len());
                } else if self.start_item(bytes).is_err() {
                    self.play_next();
                }
            }
            PlayerCommand::Play { bytes, reply } => {
                let result = self.start_item(bytes);
                let _ = reply.send(result);
            }
            PlayerCommand::Pause => {
                if self.current.is_some() && !self.paused {
                    self.sink.pause();
                    self.paused = true;
                }
            }
            PlayerCommand::Resume => {
                if self.current.is_some() && self.paused {
                    self.sink.resume();
                    self.paused = false;
                }
            }
            PlayerCommand::Stop => {
                self.sink.stop();
                self.current = None;
                self.paused = false;
                self.duration = None;
            }
            PlayerCommand::ClearQueue => {
                self.queue.clear();
            }
            PlayerCommand::Finished(item) => {
                if self.current != Some(item) {
                    debug!("Ignoring end of replaced item {}", item);
                    return true;
                }
                self.current = None;
                self.duration = None;
                (self.callbacks.on_ended)(self.queue.len());
                self.play_next();
            }
            PlayerCommand::Shutdown => {
                self.sink.stop();
                self.current = None;
                self.queue.clear();
                self.publish();
                info!("Playback shut down");
                return false;
            }
        }
        true
    }

    fn start_item(&mut self, bytes: Vec<u8>) -> Result<()> {
        let item = self.next_item;
        self.next_item += 1;
        self.current = None;
        self.paused = false;
        self.duration = None;

        let Some(commands) = self.commands.upgrade() else {
            return Err(AgentVoxError::ChannelError("Playback task has stopped".into()));
        };
        let finished = FinishSignal { item, commands };

        match self.sink.start(bytes, finished) {
            Ok(duration) => {
                self.current = Some(item);
                self.duration = duration;
                Ok(())
            }
            Err(e) => {
                warn!("Playback failed: {}", e);
                (self.callbacks.on_error)(e.clone());
                Err(e)
            }
        }
    }

    fn play_next(&mut self) {
        while let Some(bytes) = self.queue.pop_front() {
            if self.start_item(bytes).is_ok() {
                return;
            }
        }
    }

    fn is_playing(&self) -> bool {
        self.current.is_some() && !self.paused
    }

    fn publish(&self) {
        let position = if self.current.is_some() {
            self.sink.position()
        } else {
            Duration::ZERO
        };

        self.progress.send_replace(PlaybackProgress {
            position,
            duration: self.duration,
            is_playing: self.is_playing(),
            queued: self.queue.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::MemorySink;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn player_with(sink: &MemorySink) -> (AudioPlayer, Arc<Mutex<Vec<usize>>>, Arc<Mutex<Vec<AgentVoxError>>>) {
        let ended = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let callbacks = PlayerCallbacks {
            on_ended: {
                let ended = Arc::clone(&ended);
                Arc::new(move |remaining: usize| ended.lock().push(remaining))
            },
            on_error: {
                let errors = Arc::clone(&errors);
                Arc::new(move |err: AgentVoxError| errors.lock().push(err))
            },
        };
        let player = AudioPlayer::new(Box::new(sink.clone()), callbacks, Duration::from_millis(100));
        (player, ended, errors)
    }

    #[tokio::test]
    async fn test_chunks_play_in_order_exactly_once() {
        let sink = MemorySink::new();
        let (player, ended, _errors) = player_with(&sink);

        for i in 1..=4u8 {
            player.play_chunk(vec![i]);
        }
        settle().await;
        assert_eq!(sink.started(), vec![vec![1]]);
        assert_eq!(player.progress().queued, 3);

        for _ in 0..4 {
            assert!(sink.finish_current());
            settle().await;
        }

        assert_eq!(sink.started(), vec![vec![1], vec![2], vec![3], vec![4]]);
        assert_eq!(*ended.lock(), vec![3, 2, 1, 0]);
        assert!(!player.is_playing());
    }

    #[tokio::test]
    async fn test_failed_item_is_skipped() {
        let sink = MemorySink::new();
        let (player, _ended, errors) = player_with(&sink);

        player.play_chunk(vec![1]);
        player.play_chunk(Vec::new());
        player.play_chunk(vec![3]);
        settle().await;

        sink.finish_current();
        settle().await;

        assert_eq!(sink.started(), vec![vec![1], vec![3]]);
        assert_eq!(errors.lock().len(), 1);
        assert!(matches!(errors.lock()[0], AgentVoxError::PlaybackError(_)));
    }

    #[tokio::test]
    async fn test_play_replaces_current_and_keeps_queue() {
        let sink = MemorySink::new();
        let (player, ended, _errors) = player_with(&sink);

        player.play_chunk(vec![1]);
        player.play_chunk(vec![2]);
        settle().await;
        let stale = sink.current_signal();

        player.play(vec![9]).await.unwrap();
        assert_eq!(player.progress().queued, 1);

        // End signal from the replaced item
        if let Some(signal) = stale {
            signal.fire();
        }
        settle().await;
        assert!(ended.lock().is_empty());

        sink.finish_current();
        settle().await;
        assert_eq!(sink.started(), vec![vec![1], vec![9], vec![2]]);
    }

    #[tokio::test]
    async fn test_play_reports_errors() {
        let sink = MemorySink::new();
        let (player, _ended, errors) = player_with(&sink);

        let result = player.play(Vec::new()).await;
        assert!(matches!(result, Err(AgentVoxError::PlaybackError(_))));
        assert_eq!(errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let sink = MemorySink::new();
        let (player, ended, errors) = player_with(&sink);

        player.stop();
        player.stop();
        settle().await;
        assert_eq!(player.progress(), PlaybackProgress::default());

        player.play_chunk(vec![1]);
        player.stop();
        player.stop();
        settle().await;

        assert!(!player.is_playing());
        assert_eq!(player.progress().position, Duration::ZERO);
        assert!(ended.lock().is_empty());
        assert!(errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume_and_clear_queue() {
        let sink = MemorySink::new();
        let (player, _ended, _errors) = player_with(&sink);

        player.play_chunk(vec![1]);
        player.play_chunk(vec![2]);
        player.pause();
        settle().await;
        assert!(sink.is_paused());
        assert!(!player.is_playing());

        player.resume();
        player.clear_queue();
        settle().await;
        assert!(!sink.is_paused());
        assert!(player.is_playing());
        assert_eq!(player.progress().queued, 0);

        sink.finish_current();
        settle().await;
        assert_eq!(sink.started(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_refreshes_while_playing() {
        let sink = MemorySink::new().with_duration(Duration::from_secs(2));
        let (player, _ended, _errors) = player_with(&sink);

        player.play_chunk(vec![1]);
        settle().await;
        assert_eq!(player.progress().duration, Some(Duration::from_secs(2)));

        sink.set_position(Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(player.progress().position, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_shutdown_ends_task() {
        let sink = MemorySink::new();
        let (player, _ended, _errors) = player_with(&sink);

        player.play_chunk(vec![1]);
        player.shutdown().await;

        assert!(player.play(vec![2]).await.is_err());
        assert!(!player.is_playing());
    }

    #[tokio::test]
    async fn test_close_stops_sink_without_waiting() {
        let sink = MemorySink::new();
        let (player, _ended, _errors) = player_with(&sink);

        player.play_chunk(vec![1]);
        player.play_chunk(vec![2]);
        player.close();

        assert!(player.play(vec![3]).await.is_err());
        assert_eq!(sink.stop_count(), 1);
        assert_eq!(sink.started(), vec![vec![1]]);
        assert_eq!(player.progress().queued, 0);
    }
}

//! Per-venue playback session.
//!
//! Each session is one spawned task owning a FIFO of [`TrackRef`]s, the
//! lifecycle state, the bound [`AudioSink`], and at most one scheduled timer
//! (retry backoff or inactivity deadline). Every external call and every
//! asynchronous callback (resolution results, sink completions) arrives as
//! a message in the worker's select loop, so state mutations are fully
//! serialized without locks. Commands ride a bounded inbox; internal
//! callbacks ride a separate unbounded channel, so backpressure from queued
//! commands can never drop a sink completion or a resolution result.
//!
//! Stale asynchronous results are discarded by generation: the worker bumps
//! an epoch counter on every `advance`/`skip`/`stop`, and resolution results
//! and completion callbacks carry the epoch captured when they were
//! scheduled. A completion from a track superseded by `skip`, or a resolve
//! that lands after `stop`, compares unequal and becomes a no-op. Timers are
//! simpler: they live in the worker's own select loop, so dropping the slot
//! cancels them synchronously with the state change.

mod state;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration, Sleep};
use tracing::{debug, info, warn};

use jukesource::{
    AudioSink, CompletionCallback, Notifier, ResolveError, SessionId, SinkError, StreamRef,
    TrackRef, TrackResolver,
};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{DisconnectReason, SessionEvent, SessionEventKind};
use crate::registry::RegistryInner;

pub use state::SessionState;

/// Messages accepted by the session worker.
pub(crate) enum SessionCommand {
    Enqueue {
        track: TrackRef,
        reply: oneshot::Sender<()>,
    },
    Skip {
        reply: oneshot::Sender<Result<()>>,
    },
    Pause {
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<TrackRef>>,
    },
    ClearQueue {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
}

/// Internal results delivered back to the worker. These bypass the command
/// inbox: a full command buffer must never cost us a completion.
enum SessionCallback {
    /// Result of a spawned resolution attempt.
    Resolved {
        epoch: u64,
        outcome: std::result::Result<StreamRef, ResolveError>,
    },
    /// Completion callback from the sink.
    PlaybackEnded {
        epoch: u64,
        error: Option<SinkError>,
    },
}

/// Cloneable handle to one session worker.
///
/// All methods are messages; they resolve once the worker has processed the
/// request. A handle whose worker has exited reports [`Error::SessionClosed`]
/// (except [`SessionHandle::stop`], which treats that as already done).
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// True once the worker has exited (stopped or inactivity-disconnected).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether this handle fronts the worker owning `tx`.
    pub(crate) fn same_channel(&self, tx: &mpsc::Sender<SessionCommand>) -> bool {
        self.tx.same_channel(tx)
    }

    /// Append a track to the queue. Starts playback immediately when the
    /// session is idle. Acknowledged: `Ok` means the worker took the track,
    /// not merely that it was buffered towards a worker that may be gone.
    pub async fn enqueue(&self, track: impl Into<TrackRef>) -> Result<()> {
        let track = track.into();
        self.request(|reply| SessionCommand::Enqueue { track, reply })
            .await
    }

    /// Stop the current track and advance to the next queued one.
    pub async fn skip(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Skip { reply }).await?
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Pause { reply }).await?
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Resume { reply }).await?
    }

    /// Release the sink, clear the queue, and leave the registry. Idempotent:
    /// stopping an already-ended session succeeds.
    pub async fn stop(&self) -> Result<()> {
        match self.request(|reply| SessionCommand::Stop { reply }).await {
            Ok(()) | Err(Error::SessionClosed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Read-only copy of the pending queue, in play order.
    pub async fn queue_snapshot(&self) -> Result<Vec<TrackRef>> {
        self.request(|reply| SessionCommand::Snapshot { reply })
            .await
    }

    /// Empty the pending queue without touching current playback.
    pub async fn clear_queue(&self) -> Result<()> {
        self.request(|reply| SessionCommand::ClearQueue { reply })
            .await
    }

    pub async fn state(&self) -> Result<SessionState> {
        self.request(|reply| SessionCommand::State { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| Error::SessionClosed(self.id.clone()))?;
        reply_rx
            .await
            .map_err(|_| Error::SessionClosed(self.id.clone()))
    }
}

/// The single timer slot: a session never waits on more than one deadline.
struct ScheduledTimer {
    kind: TimerKind,
    sleep: Pin<Box<Sleep>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// Constant delay before retrying the pending track's resolution.
    Backoff,
    /// Idle deadline after which the session releases its sink.
    Inactivity,
}

/// Spawn a session worker and return its handle.
pub(crate) fn spawn(
    id: SessionId,
    sink: Arc<dyn AudioSink>,
    resolver: Arc<dyn TrackResolver>,
    notifier: Arc<dyn Notifier>,
    config: SessionConfig,
    registry: Weak<RegistryInner>,
) -> SessionHandle {
    let (tx, mut rx) = mpsc::channel(config.command_buffer.max(1));
    let (callback_tx, mut callback_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        id: id.clone(),
        tx: tx.clone(),
    };

    tokio::spawn(async move {
        let mut worker = SessionWorker {
            id,
            config,
            queue: VecDeque::new(),
            state: SessionState::Idle,
            sink: Some(sink),
            resolver,
            notifier,
            registry,
            tx,
            callback_tx,
            epoch: 0,
            retry_count: 0,
            pending: None,
            timer: None,
        };

        info!(session = %worker.id, "Session started");
        // A fresh session is idle with an empty queue: the deadline is armed
        // from the first instant.
        worker.arm_inactivity();

        // The worker holds its own callback sender, so `callback_rx` never
        // yields `None` while the loop runs.
        loop {
            if let Some(timer) = worker.timer.as_mut() {
                let kind = timer.kind;
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => worker.handle_command(cmd).await,
                        None => break,
                    },
                    Some(cb) = callback_rx.recv() => {
                        worker.handle_callback(cb).await;
                    }
                    _ = &mut timer.sleep => {
                        worker.timer = None;
                        worker.handle_timer(kind).await;
                    }
                }
            } else {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => worker.handle_command(cmd).await,
                        None => break,
                    },
                    Some(cb) = callback_rx.recv() => {
                        worker.handle_callback(cb).await;
                    }
                }
            }

            if worker.state.is_terminal() {
                break;
            }
        }

        info!(session = %worker.id, "Session ended");
    });

    handle
}

struct SessionWorker {
    id: SessionId,
    config: SessionConfig,
    queue: VecDeque<TrackRef>,
    state: SessionState,
    /// Bound from creation until disconnect; `None` only once terminal.
    sink: Option<Arc<dyn AudioSink>>,
    resolver: Arc<dyn TrackResolver>,
    notifier: Arc<dyn Notifier>,
    registry: Weak<RegistryInner>,
    /// Clone of the inbox sender, kept for the registry's guarded removal.
    tx: mpsc::Sender<SessionCommand>,
    /// Handed to resolve tasks and completion callbacks. Unbounded so a
    /// full command inbox can never discard an internal result.
    callback_tx: mpsc::UnboundedSender<SessionCallback>,
    /// Generation counter. Bumped on every advance/skip/stop; async results
    /// carrying an older value are discarded.
    epoch: u64,
    /// Attempts made for the track currently being resolved.
    retry_count: u32,
    /// The track being resolved or played; retries reuse it without a new
    /// queue pop.
    pending: Option<TrackRef>,
    timer: Option<ScheduledTimer>,
}

impl SessionWorker {
    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Enqueue { track, reply } => {
                self.enqueue(track).await;
                let _ = reply.send(());
            }
            SessionCommand::Skip { reply } => {
                let _ = reply.send(self.skip().await);
            }
            SessionCommand::Pause { reply } => {
                let _ = reply.send(self.pause().await);
            }
            SessionCommand::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            SessionCommand::Stop { reply } => {
                self.disconnect(DisconnectReason::Stopped).await;
                let _ = reply.send(());
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.queue.iter().cloned().collect());
            }
            SessionCommand::ClearQueue { reply } => {
                self.clear_queue().await;
                let _ = reply.send(());
            }
            SessionCommand::State { reply } => {
                let _ = reply.send(self.state);
            }
        }
    }

    async fn handle_callback(&mut self, cb: SessionCallback) {
        match cb {
            SessionCallback::Resolved { epoch, outcome } => self.on_resolved(epoch, outcome).await,
            SessionCallback::PlaybackEnded { epoch, error } => {
                self.on_playback_ended(epoch, error).await
            }
        }
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Backoff => {
                if self.state != SessionState::Resolving {
                    return;
                }
                if let Some(track) = self.pending.clone() {
                    self.spawn_resolve(track);
                }
            }
            TimerKind::Inactivity => {
                // Disconnect only from a truly empty idle session. A session
                // parked idle behind an abandoned track keeps its queue and
                // its sink until the user acts.
                if self.state != SessionState::Idle || !self.queue.is_empty() {
                    debug!(session = %self.id, state = %self.state, "Inactivity deadline ignored");
                    return;
                }
                info!(session = %self.id, "Inactivity deadline reached, disconnecting");
                self.disconnect(DisconnectReason::Inactivity).await;
            }
        }
    }

    async fn enqueue(&mut self, track: TrackRef) {
        debug!(session = %self.id, track = %track, "Enqueue");
        self.queue.push_back(track.clone());
        self.cancel_timer(TimerKind::Inactivity);
        self.publish(SessionEventKind::TrackQueued {
            track: track.clone(),
        });

        if self.state == SessionState::Idle {
            self.advance().await;
        } else {
            self.notify(&format!("Added to queue: {track}")).await;
        }
    }

    /// Pop the next track and start resolving it, or park idle.
    async fn advance(&mut self) {
        self.epoch += 1;
        self.pending = None;
        self.retry_count = 0;
        self.cancel_timer(TimerKind::Backoff);

        match self.queue.pop_front() {
            None => {
                self.state = SessionState::Idle;
                self.arm_inactivity();
            }
            Some(track) => {
                self.state = SessionState::Resolving;
                self.pending = Some(track.clone());
                self.spawn_resolve(track);
            }
        }
    }

    /// Run one resolution attempt off the serialized path. The result comes
    /// back through the callback channel tagged with the current epoch.
    fn spawn_resolve(&self, track: TrackRef) {
        let resolver = Arc::clone(&self.resolver);
        let tx = self.callback_tx.clone();
        let epoch = self.epoch;
        let id = self.id.clone();
        let attempt = self.retry_count + 1;

        tokio::spawn(async move {
            debug!(session = %id, track = %track, attempt, "Resolving");
            let outcome = resolver.resolve(&track).await;
            if tx.send(SessionCallback::Resolved { epoch, outcome }).is_err() {
                debug!(session = %id, "Session gone before resolution landed");
            }
        });
    }

    async fn on_resolved(
        &mut self,
        epoch: u64,
        outcome: std::result::Result<StreamRef, ResolveError>,
    ) {
        if epoch != self.epoch {
            debug!(session = %self.id, "Discarding stale resolution result");
            return;
        }

        match outcome {
            Ok(stream) => self.start_playback(stream).await,
            Err(err) => {
                warn!(session = %self.id, error = %err, attempt = self.retry_count + 1, "Resolution failed");
                self.retry_or_abandon().await;
            }
        }
    }

    async fn start_playback(&mut self, stream: StreamRef) {
        let Some(sink) = self.sink.clone() else {
            return;
        };

        let track = self
            .pending
            .clone()
            .unwrap_or_else(|| TrackRef::new(stream.url()));
        let display = stream
            .title()
            .map(str::to_string)
            .unwrap_or_else(|| track.to_string());

        // The sink fires this from its own execution context; marshal it back
        // through the callback channel instead of touching worker state
        // directly. The channel is unbounded: the sink's exactly-once
        // completion must land even when the command inbox is full.
        let tx = self.callback_tx.clone();
        let epoch = self.epoch;
        let on_complete: CompletionCallback = Box::new(move |error| {
            let _ = tx.send(SessionCallback::PlaybackEnded { epoch, error });
        });

        match sink.play(stream, on_complete).await {
            Ok(()) => {
                self.state = SessionState::Playing;
                info!(session = %self.id, track = %track, "Now playing");
                self.publish(SessionEventKind::NowPlaying {
                    track: track.clone(),
                });
                self.notify(&format!("Now playing: {display}")).await;
            }
            Err(err) => {
                // A sink rejection is retried exactly like a resolve failure.
                warn!(session = %self.id, error = %err, "Sink rejected stream");
                self.retry_or_abandon().await;
            }
        }
    }

    async fn retry_or_abandon(&mut self) {
        self.retry_count += 1;

        if self.retry_count < self.config.max_retries {
            debug!(
                session = %self.id,
                attempts = self.retry_count,
                backoff_ms = self.config.retry_backoff_ms,
                "Scheduling retry"
            );
            self.schedule_timer(TimerKind::Backoff, self.config.retry_backoff());
            return;
        }

        // Exhausted. The track is dropped but the rest of the queue stays
        // put; the next enqueue (or an explicit skip-less user action) will
        // advance it.
        let track = self
            .pending
            .take()
            .unwrap_or_else(|| TrackRef::new("<unknown>"));
        let attempts = self.retry_count;
        warn!(session = %self.id, track = %track, attempts, "Abandoning track");
        self.publish(SessionEventKind::PlaybackFailed {
            track: track.clone(),
            attempts,
        });
        self.notify(&format!(
            "Playback failed after {attempts} attempts: {track}"
        ))
        .await;

        self.state = SessionState::Idle;
        self.retry_count = 0;
        self.arm_inactivity();
    }

    async fn on_playback_ended(&mut self, epoch: u64, error: Option<SinkError>) {
        if epoch != self.epoch {
            debug!(session = %self.id, "Discarding superseded completion");
            return;
        }
        if let Some(err) = error {
            warn!(session = %self.id, error = %err, "Playback ended with error");
        }
        self.advance().await;
    }

    async fn skip(&mut self) -> Result<()> {
        if !matches!(self.state, SessionState::Playing | SessionState::Paused) {
            return Err(Error::NothingPlaying);
        }

        if let Some(sink) = self.sink.clone() {
            // The stopped track's completion carries the pre-advance epoch
            // and is discarded; only this advance moves the queue.
            sink.stop().await;
        }
        self.publish(SessionEventKind::Skipped);
        self.notify("Skipped").await;
        self.advance().await;
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        if self.state != SessionState::Playing {
            return Err(Error::NothingToPause);
        }
        if let Some(sink) = self.sink.clone() {
            sink.pause().await;
        }
        self.state = SessionState::Paused;
        self.publish(SessionEventKind::Paused);
        self.notify("Paused").await;
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        if self.state != SessionState::Paused {
            return Err(Error::NothingToResume);
        }
        if let Some(sink) = self.sink.clone() {
            sink.resume().await;
        }
        self.state = SessionState::Playing;
        self.publish(SessionEventKind::Resumed);
        self.notify("Resumed").await;
        Ok(())
    }

    async fn clear_queue(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        debug!(session = %self.id, dropped, "Queue cleared");
        self.publish(SessionEventKind::QueueCleared);
        self.notify("Queue cleared").await;
    }

    /// Terminal transition: release the sink, drop timers and queue, leave
    /// the registry. The worker loop exits right after.
    async fn disconnect(&mut self, reason: DisconnectReason) {
        if self.state.is_terminal() {
            return;
        }

        self.epoch += 1;
        self.timer = None;
        self.queue.clear();
        self.pending = None;
        self.retry_count = 0;

        if let Some(sink) = self.sink.take() {
            sink.stop().await;
            sink.disconnect().await;
        }

        self.state = SessionState::Disconnected;
        info!(session = %self.id, ?reason, "Session disconnected");
        self.publish(SessionEventKind::Disconnected { reason });

        if let Some(registry) = self.registry.upgrade() {
            // Guarded removal: if the registry already holds a replacement
            // session under this id, leave it alone.
            registry.detach_worker(&self.id, &self.tx);
        }
    }

    fn arm_inactivity(&mut self) {
        self.schedule_timer(TimerKind::Inactivity, self.config.inactivity_timeout());
    }

    fn schedule_timer(&mut self, kind: TimerKind, duration: Duration) {
        self.timer = Some(ScheduledTimer {
            kind,
            sleep: Box::pin(sleep(duration)),
        });
    }

    /// Synchronous cancellation: dropping the slot before the state change
    /// means a deadline can never observe the old state.
    fn cancel_timer(&mut self, kind: TimerKind) {
        if self.timer.as_ref().map(|t| t.kind) == Some(kind) {
            self.timer = None;
        }
    }

    fn publish(&self, kind: SessionEventKind) {
        if let Some(registry) = self.registry.upgrade() {
            registry.publish(SessionEvent {
                session_id: self.id.clone(),
                kind,
            });
        }
    }

    /// Best-effort user notification; delivery failures are logged, never
    /// propagated.
    async fn notify(&self, text: &str) {
        if let Err(err) = self.notifier.send(&self.id, text).await {
            warn!(session = %self.id, error = %err, "Notifier delivery failed");
        }
    }
}

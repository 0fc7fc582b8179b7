//! Integration tests for the session orchestrator.
//!
//! All collaborators are in-memory mocks and every test runs on a paused
//! tokio clock, so backoff and inactivity deadlines elapse virtually.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration, Instant};

use jukesession::{
    DisconnectReason, Error, SessionConfig, SessionEventKind, SessionRegistry, SessionState,
};
use jukesource::{
    AudioSink, CompletionCallback, Notifier, ResolveError, SessionId, SinkError, StreamRef,
    TrackRef, TrackResolver,
};

// ----- mocks ---------------------------------------------------------------

/// Resolver failing a programmed number of times before succeeding.
/// `u32::MAX` failures means "never succeeds".
struct ScriptedResolver {
    failures_left: AtomicU32,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedResolver {
    fn ok() -> Arc<Self> {
        Self::with_failures(0)
    }

    fn failing() -> Arc<Self> {
        Self::with_failures(u32::MAX)
    }

    fn with_failures(n: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(n),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn queries(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(q, _)| q.clone()).collect()
    }

    fn call_instants(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl TrackResolver for ScriptedResolver {
    async fn resolve(&self, track: &TrackRef) -> Result<StreamRef, ResolveError> {
        self.calls
            .lock()
            .unwrap()
            .push((track.to_string(), Instant::now()));

        let left = self.failures_left.load(Ordering::SeqCst);
        if left == u32::MAX {
            return Err(ResolveError::NotFound(track.to_string()));
        }
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(ResolveError::ExtractionFailed("scripted failure".into()));
        }
        Ok(StreamRef::new(format!("https://cdn.test/{track}")))
    }
}

/// Sink recording every accepted stream. In `auto` mode each playback
/// completes immediately; in manual mode it holds the completion callback
/// until `finish_current` (or `stop`) fires it.
struct MockSink {
    auto_complete: bool,
    reject: AtomicBool,
    playing: AtomicBool,
    pending: Mutex<Option<CompletionCallback>>,
    played: Mutex<Vec<String>>,
    stops: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockSink {
    fn auto() -> Arc<Self> {
        Arc::new(Self::new(true))
    }

    fn manual() -> Arc<Self> {
        Arc::new(Self::new(false))
    }

    fn rejecting() -> Arc<Self> {
        let sink = Self::new(true);
        sink.reject.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    fn new(auto_complete: bool) -> Self {
        Self {
            auto_complete,
            reject: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            pending: Mutex::new(None),
            played: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    /// End the current playback as the real sink would on natural completion.
    fn finish_current(&self) {
        if let Some(done) = self.pending.lock().unwrap().take() {
            self.playing.store(false, Ordering::SeqCst);
            done(None);
        }
    }

    fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for MockSink {
    async fn play(
        &self,
        stream: StreamRef,
        on_complete: CompletionCallback,
    ) -> Result<(), SinkError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected("no voice connection".into()));
        }
        self.played.lock().unwrap().push(stream.url().to_string());
        self.playing.store(true, Ordering::SeqCst);
        if self.auto_complete {
            self.playing.store(false, Ordering::SeqCst);
            on_complete(None);
        } else {
            *self.pending.lock().unwrap() = Some(on_complete);
        }
        Ok(())
    }

    async fn pause(&self) {}

    async fn resume(&self) {}

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.finish_current();
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
        })
    }

    fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, _session: &SessionId, text: &str) -> anyhow::Result<()> {
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Notifier that parks every "Now playing" send until released, keeping the
/// worker busy in place while commands pile up behind it.
struct GatedNotifier {
    gate: Semaphore,
}

impl GatedNotifier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
        })
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl Notifier for GatedNotifier {
    async fn send(&self, _session: &SessionId, text: &str) -> anyhow::Result<()> {
        if text.starts_with("Now playing") {
            self.gate.acquire().await?.forget();
        }
        Ok(())
    }
}

// ----- helpers -------------------------------------------------------------

fn registry(resolver: Arc<ScriptedResolver>, notifier: Arc<RecordingNotifier>) -> SessionRegistry {
    SessionRegistry::new(resolver, notifier, SessionConfig::default())
}

/// Spin the runtime (without letting virtual time advance) until `cond`
/// holds. Panics when it never does.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

// ----- tests ---------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn enqueue_on_idle_session_starts_resolving_in_fifo_order() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::manual();
    let registry = registry(Arc::clone(&resolver), notifier);

    let session = registry.get_or_create("venue", sink.clone());
    session.enqueue("a").await.unwrap();
    session.enqueue("b").await.unwrap();
    session.enqueue("c").await.unwrap();

    wait_until(|| !sink.played().is_empty()).await;
    assert_eq!(resolver.queries(), vec!["a"]);
    assert_eq!(sink.played(), vec!["https://cdn.test/a"]);
    assert_eq!(session.state().await.unwrap(), SessionState::Playing);

    // Natural completion advances to the next queued track.
    sink.finish_current();
    wait_until(|| sink.played().len() == 2).await;
    assert_eq!(resolver.queries(), vec!["a", "b"]);

    sink.finish_current();
    wait_until(|| sink.played().len() == 3).await;
    assert_eq!(resolver.queries(), vec!["a", "b", "c"]);
}

#[tokio::test(start_paused = true)]
async fn queue_listing_preserves_insertion_order_while_playing() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::manual();
    let registry = registry(resolver, notifier);

    let session = registry.get_or_create("venue", sink.clone());
    session.enqueue("current").await.unwrap();
    wait_until(|| !sink.played().is_empty()).await;

    session.enqueue("a").await.unwrap();
    session.enqueue("b").await.unwrap();

    let listed = registry.list_queue(&"venue".into()).await;
    assert_eq!(listed, vec![TrackRef::new("a"), TrackRef::new("b")]);
}

#[tokio::test(start_paused = true)]
async fn failing_resolver_makes_exactly_three_attempts_spaced_by_backoff() {
    let resolver = ScriptedResolver::failing();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::auto();
    let registry = registry(Arc::clone(&resolver), Arc::clone(&notifier));

    let session = registry.get_or_create("venue", sink);
    session.enqueue("bad track").await.unwrap();
    session.enqueue("untouched").await.unwrap();

    // Two 2s backoffs plus margin; the paused clock fast-forwards.
    sleep(Duration::from_secs(6)).await;

    assert_eq!(resolver.call_count(), 3);
    let at = resolver.call_instants();
    assert_eq!(at[1] - at[0], Duration::from_secs(2));
    assert_eq!(at[2] - at[1], Duration::from_secs(2));

    assert!(notifier.contains("Playback failed after 3 attempts"));
    assert_eq!(session.state().await.unwrap(), SessionState::Idle);

    // The remainder of the queue is not auto-advanced past the failure.
    let listed = session.queue_snapshot().await.unwrap();
    assert_eq!(listed, vec![TrackRef::new("untouched")]);
}

#[tokio::test(start_paused = true)]
async fn sink_rejection_is_retried_like_a_resolution_failure() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::rejecting();
    let registry = registry(Arc::clone(&resolver), Arc::clone(&notifier));

    let session = registry.get_or_create("venue", sink);
    session.enqueue("song").await.unwrap();

    sleep(Duration::from_secs(6)).await;

    // Resolution succeeds every time; the sink rejects every stream.
    assert_eq!(resolver.call_count(), 3);
    assert!(notifier.contains("Playback failed after 3 attempts: song"));
    assert_eq!(session.state().await.unwrap(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_a_pending_backoff_wait() {
    let resolver = ScriptedResolver::failing();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::auto();
    let registry = registry(Arc::clone(&resolver), notifier);

    let session = registry.get_or_create("venue", sink.clone());
    session.enqueue("bad track").await.unwrap();

    // First attempt fails and schedules the 2s backoff.
    wait_until(|| resolver.call_count() == 1).await;
    session.stop().await.unwrap();

    sleep(Duration::from_secs(10)).await;
    assert_eq!(resolver.call_count(), 1, "backoff retry fired after stop");
    assert_eq!(registry.len(), 0);
    assert_eq!(sink.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn skip_advances_exactly_once_despite_superseded_completion() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::manual();
    let registry = registry(resolver, notifier);

    let session = registry.get_or_create("venue", sink.clone());
    session.enqueue("a").await.unwrap();
    session.enqueue("b").await.unwrap();
    wait_until(|| !sink.played().is_empty()).await;

    // Skip stops "a"; the sink fires its completion callback from the stop,
    // and that superseded completion must not advance a second time.
    session.skip().await.unwrap();
    wait_until(|| sink.played().len() == 2).await;
    assert_eq!(sink.played(), vec!["https://cdn.test/a", "https://cdn.test/b"]);
    assert_eq!(sink.stop_count(), 1);

    assert_eq!(session.state().await.unwrap(), SessionState::Playing);
    assert!(session.queue_snapshot().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn completion_survives_a_full_command_inbox() {
    let resolver = ScriptedResolver::ok();
    let notifier = GatedNotifier::new();
    let sink = MockSink::manual();
    let config = SessionConfig {
        command_buffer: 4,
        ..SessionConfig::default()
    };
    let registry = SessionRegistry::new(resolver, Arc::clone(&notifier) as Arc<dyn Notifier>, config);

    let session = registry.get_or_create("venue", sink.clone());
    session.enqueue("first").await.unwrap();

    // The sink accepts the stream, then the worker parks inside the
    // notifier's "Now playing" send.
    wait_until(|| !sink.played().is_empty()).await;

    // Saturate the inbox while the worker is stuck.
    let mut fillers = Vec::new();
    for i in 0..8 {
        let handle = session.clone();
        fillers.push(tokio::spawn(
            async move { handle.enqueue(format!("filler{i}")).await },
        ));
    }
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }

    // Natural completion fires against the saturated inbox; only then is the
    // worker released.
    sink.finish_current();
    notifier.release(64);

    for filler in fillers {
        filler.await.unwrap().unwrap();
    }

    // The completion advanced the queue instead of being dropped.
    wait_until(|| sink.played().len() == 2).await;
    assert_eq!(session.state().await.unwrap(), SessionState::Playing);
    assert_eq!(session.queue_snapshot().await.unwrap().len(), 7);
}

#[tokio::test(start_paused = true)]
async fn usage_errors_do_not_mutate_state() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::manual();
    let registry = registry(resolver, notifier);

    let session = registry.get_or_create("venue", sink.clone());
    assert!(matches!(session.skip().await, Err(Error::NothingPlaying)));
    assert!(matches!(session.pause().await, Err(Error::NothingToPause)));
    assert!(matches!(session.resume().await, Err(Error::NothingToResume)));
    assert_eq!(session.state().await.unwrap(), SessionState::Idle);

    // Absent venue through the registry surface.
    assert!(matches!(
        registry.skip(&"elsewhere".into()).await,
        Err(Error::NothingPlaying)
    ));
    assert!(matches!(
        registry.handle(&"elsewhere".into()),
        Err(Error::SessionNotFound(_))
    ));

    session.enqueue("a").await.unwrap();
    wait_until(|| !sink.played().is_empty()).await;

    session.pause().await.unwrap();
    assert_eq!(session.state().await.unwrap(), SessionState::Paused);
    assert!(matches!(session.pause().await, Err(Error::NothingToPause)));
    assert_eq!(session.state().await.unwrap(), SessionState::Paused);

    session.resume().await.unwrap();
    assert_eq!(session.state().await.unwrap(), SessionState::Playing);
}

#[tokio::test(start_paused = true)]
async fn clear_queue_leaves_current_playback_untouched() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::manual();
    let registry = registry(resolver, notifier);

    let session = registry.get_or_create("venue", sink.clone());
    session.enqueue("current").await.unwrap();
    session.enqueue("a").await.unwrap();
    session.enqueue("b").await.unwrap();
    wait_until(|| !sink.played().is_empty()).await;

    session.clear_queue().await.unwrap();
    assert!(session.queue_snapshot().await.unwrap().is_empty());
    assert_eq!(session.state().await.unwrap(), SessionState::Playing);
}

#[tokio::test(start_paused = true)]
async fn idle_session_disconnects_after_inactivity_timeout() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::auto();
    let registry = registry(resolver, notifier);
    let mut events = registry.subscribe();

    let session = registry.get_or_create("venue", sink.clone());
    assert_eq!(registry.len(), 1);

    sleep(Duration::from_secs(11)).await;

    assert!(session.is_closed());
    assert_eq!(registry.len(), 0);
    assert_eq!(sink.disconnect_count(), 1);

    let mut disconnected = None;
    while let Ok(envelope) = events.try_recv() {
        if let SessionEventKind::Disconnected { reason } = envelope.event.kind {
            disconnected = Some(reason);
        }
    }
    assert_eq!(disconnected, Some(DisconnectReason::Inactivity));
}

#[tokio::test(start_paused = true)]
async fn enqueue_before_the_deadline_cancels_the_disconnect() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::manual();
    let registry = registry(resolver, notifier);

    let session = registry.get_or_create("venue", sink.clone());
    sleep(Duration::from_secs(5)).await;
    session.enqueue("song").await.unwrap();

    // Way past the idle deadline; playback keeps the session alive.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(registry.len(), 1);
    assert_eq!(session.state().await.unwrap(), SessionState::Playing);
}

#[tokio::test(start_paused = true)]
async fn concurrent_stops_are_idempotent() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::manual();
    let registry = registry(resolver, notifier);

    let session = registry.get_or_create("venue", sink.clone());
    session.enqueue("song").await.unwrap();
    wait_until(|| !sink.played().is_empty()).await;

    let id: SessionId = "venue".into();
    let (first, second) = tokio::join!(registry.stop(&id), registry.stop(&id));
    first.unwrap();
    second.unwrap();

    assert_eq!(registry.len(), 0);
    assert_eq!(sink.disconnect_count(), 1);

    // And a third stop on the now-absent session is still fine.
    registry.stop(&id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn enqueue_after_session_end_is_reported_and_recoverable() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::manual();
    let registry = registry(resolver, notifier);

    let id: SessionId = "venue".into();
    let session = registry.get_or_create(id.clone(), sink.clone());
    session.enqueue("song").await.unwrap();
    wait_until(|| !sink.played().is_empty()).await;

    session.stop().await.unwrap();
    wait_until(|| session.is_closed()).await;

    // A stale handle reports the closure instead of pretending the track
    // was taken.
    assert!(matches!(
        session.enqueue("lost").await,
        Err(Error::SessionClosed(_))
    ));

    // The registry surface rebuilds the session and delivers.
    let replacement = MockSink::manual();
    registry
        .enqueue(id.clone(), replacement.clone(), "recovered")
        .await
        .unwrap();
    wait_until(|| !replacement.played().is_empty()).await;
    assert_eq!(replacement.played(), vec!["https://cdn.test/recovered"]);
    assert_eq!(registry.state(&id).await, Some(SessionState::Playing));
}

#[tokio::test(start_paused = true)]
async fn get_or_create_returns_the_same_live_session() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let registry = registry(resolver, notifier);

    let sink = MockSink::manual();
    let first = registry.get_or_create("venue", sink.clone());
    let second = registry.get_or_create("venue", MockSink::manual());
    assert_eq!(registry.len(), 1);

    first.enqueue("current").await.unwrap();
    wait_until(|| !sink.played().is_empty()).await;
    first.enqueue("queued").await.unwrap();

    // Both handles front the same worker.
    let listed = second.queue_snapshot().await.unwrap();
    assert_eq!(listed, vec![TrackRef::new("queued")]);

    registry.remove(&"venue".into());
    assert_eq!(registry.len(), 0);
    let third = registry.get_or_create("venue", MockSink::manual());
    assert!(third.queue_snapshot().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn end_to_end_happy_path() {
    let resolver = ScriptedResolver::ok();
    let notifier = RecordingNotifier::new();
    let sink = MockSink::auto();
    let registry = registry(Arc::clone(&resolver), Arc::clone(&notifier));
    let mut events = registry.subscribe();

    let session = registry.get_or_create("venue", sink.clone());
    session.enqueue("song1").await.unwrap();

    // Auto-completing sink: Idle -> Resolving -> Playing -> back to Idle.
    wait_until(|| notifier.contains("Now playing: song1")).await;
    assert_eq!(sink.played(), vec!["https://cdn.test/song1"]);
    assert_eq!(session.state().await.unwrap(), SessionState::Idle);

    let mut kinds = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        kinds.push(envelope.event.kind);
    }
    assert!(kinds
        .iter()
        .any(|k| matches!(k, SessionEventKind::TrackQueued { track } if track.as_str() == "song1")));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, SessionEventKind::NowPlaying { track } if track.as_str() == "song1")));

    // The empty idle session then times out and leaves the registry.
    sleep(Duration::from_secs(11)).await;
    assert_eq!(registry.len(), 0);
    assert_eq!(sink.disconnect_count(), 1);
}

//! Walkthrough of the session orchestrator with simulated collaborators.
//!
//! This example demonstrates:
//! - Creating a registry and a per-venue session
//! - FIFO queueing with immediate start on an idle session
//! - Skip, pause/resume, and queue listing
//! - The retry policy on a flaky resolver
//! - Inactivity auto-disconnect
//!
//! To run:
//! ```bash
//! cargo run -p jukesession --example venue_bot
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use jukesession::{SessionConfig, SessionRegistry};
use jukesource::{
    AudioSink, CompletionCallback, Notifier, ResolveError, SessionId, SinkError, StreamRef,
    TrackRef, TrackResolver,
};

/// Pretend search backend: 300ms of "network", fails twice for any query
/// containing "flaky".
struct DemoResolver {
    flaky_failures: AtomicU32,
}

#[async_trait]
impl TrackResolver for DemoResolver {
    async fn resolve(&self, track: &TrackRef) -> Result<StreamRef, ResolveError> {
        sleep(Duration::from_millis(300)).await;
        if track.as_str().contains("flaky") && self.flaky_failures.fetch_add(1, Ordering::SeqCst) < 2
        {
            return Err(ResolveError::ExtractionFailed("simulated outage".into()));
        }
        let slug = track.as_str().replace(' ', "-");
        Ok(StreamRef::new(format!("https://cdn.demo/{slug}.opus")).with_title(track.to_string()))
    }
}

/// Pretend voice connection: each track "plays" for two seconds on a spawned
/// task, then fires its completion callback.
struct DemoSink {
    playing: AtomicBool,
    current: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DemoSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            playing: AtomicBool::new(false),
            current: Mutex::new(None),
        })
    }
}

#[async_trait]
impl AudioSink for DemoSink {
    async fn play(
        &self,
        stream: StreamRef,
        on_complete: CompletionCallback,
    ) -> Result<(), SinkError> {
        println!("   🔊 sink: streaming {}", stream.url());
        self.playing.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            on_complete(None);
        });
        *self.current.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn pause(&self) {
        println!("   🔊 sink: paused");
    }

    async fn resume(&self) {
        println!("   🔊 sink: resumed");
    }

    async fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
        if let Some(handle) = self.current.lock().unwrap().take() {
            handle.abort();
        }
        println!("   🔊 sink: stopped");
    }

    async fn disconnect(&self) {
        println!("   🔊 sink: voice connection released");
    }

    async fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn send(&self, session: &SessionId, text: &str) -> anyhow::Result<()> {
        println!("   💬 [{session}] {text}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jukesession=info".into()),
        )
        .init();

    println!("=== Venue playback session demo ===\n");

    let config = SessionConfig {
        retry_backoff_ms: 500,
        inactivity_timeout_secs: 3,
        ..SessionConfig::default()
    };
    let registry = SessionRegistry::new(
        Arc::new(DemoResolver {
            flaky_failures: AtomicU32::new(0),
        }),
        Arc::new(ConsoleNotifier),
        config,
    );

    let venue: SessionId = "venue-42".into();
    let session = registry.get_or_create(venue.clone(), DemoSink::new());

    println!("▶ Queueing three tracks on an idle session");
    session.enqueue("miles davis so what").await?;
    session.enqueue("john coltrane giant steps").await?;
    session.enqueue("flaky bootleg recording").await?;
    sleep(Duration::from_millis(600)).await;

    println!("\n▶ Pending queue: {:?}", registry.list_queue(&venue).await);

    println!("\n▶ Pause / resume");
    registry.pause(&venue).await?;
    sleep(Duration::from_millis(300)).await;
    registry.resume(&venue).await?;

    println!("\n▶ Skipping the current track");
    registry.skip(&venue).await?;

    println!("\n▶ Letting the rest play out (the flaky track needs retries)");
    sleep(Duration::from_secs(8)).await;

    println!("\n▶ Idle now; waiting for the inactivity disconnect");
    sleep(Duration::from_secs(4)).await;
    println!("   sessions left in registry: {}", registry.len());

    Ok(())
}

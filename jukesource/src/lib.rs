//! # jukesource
//!
//! Common contracts between the playback orchestrator (`jukesession`) and the
//! external layers it drives: stream resolution, audio output, and user-facing
//! notifications.
//!
//! The orchestrator never talks to a search backend, a voice connection, or a
//! chat surface directly. Everything goes through three narrow traits:
//!
//! - [`TrackResolver`]: turns a raw request ([`TrackRef`]) into a playable
//!   stream ([`StreamRef`]). May block on network I/O.
//! - [`AudioSink`]: accepts a stream, plays it, and fires a completion
//!   callback exactly once per accepted `play`.
//! - [`Notifier`]: best-effort delivery of status text to the venue.
//!
//! Implementations live next to the transport they wrap (voice client,
//! scraping client, chat client); `jukesession` only sees these traits.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Stable identifier of a playback session, one per voice-enabled venue.
///
/// Caller-supplied; the orchestrator only hashes, compares, and prints it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An unresolved track request: raw search text or a direct URL.
///
/// Immutable, no identity beyond its text. The resolver decides what to do
/// with it; [`TrackRef::is_url`] only exists so callers can shortcut the
/// search step for direct links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackRef(String);

impl TrackRef {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the request already is a direct link rather than search text.
    pub fn is_url(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }
}

impl fmt::Display for TrackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackRef {
    fn from(text: &str) -> Self {
        Self(text.to_string())
    }
}

impl From<String> for TrackRef {
    fn from(text: String) -> Self {
        Self(text)
    }
}

/// A resolved, playable stream handle produced by a [`TrackResolver`].
///
/// Consumed exactly once by [`AudioSink::play`]. The optional title is only
/// used for display ("now playing" texts); the URL is whatever the sink's
/// decoder expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRef {
    url: String,
    title: Option<String>,
}

impl StreamRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Best display name available: title when known, URL otherwise.
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

/// Errors produced while turning a [`TrackRef`] into a [`StreamRef`].
///
/// Both variants are transient from the orchestrator's point of view and
/// subject to its retry policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("No results found for query: {0}")]
    NotFound(String),

    #[error("Stream extraction failed: {0}")]
    ExtractionFailed(String),
}

/// Errors produced by an [`AudioSink`].
///
/// A rejected stream is retried exactly like a resolution failure; a lost
/// connection ends the current playback through the completion callback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("Playback rejected: {0}")]
    Rejected(String),

    #[error("Voice connection lost: {0}")]
    ConnectionLost(String),
}

/// Completion callback handed to [`AudioSink::play`].
///
/// The sink must invoke it exactly once per accepted `play`: with `None` when
/// playback ends naturally, with `Some(err)` when it dies underway. It is
/// typically fired from the sink's own execution context; the orchestrator
/// marshals it back onto its serialized path.
pub type CompletionCallback = Box<dyn FnOnce(Option<SinkError>) + Send + 'static>;

/// Resolves user requests into playable streams.
///
/// `resolve` may block on network I/O (search scraping, metadata extraction);
/// the orchestrator always calls it from a spawned task, never from the path
/// that serializes session state.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, track: &TrackRef) -> Result<StreamRef, ResolveError>;
}

/// Plays resolved streams into a voice channel.
///
/// One sink is bound to one session for the session's whole active life.
/// Transport control only; the sink never touches the session's queue.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Start playing `stream`. On `Ok`, `on_complete` fires exactly once when
    /// playback ends (naturally or via [`AudioSink::stop`]). On `Err`, the
    /// callback must not fire.
    async fn play(&self, stream: StreamRef, on_complete: CompletionCallback)
        -> Result<(), SinkError>;

    async fn pause(&self);

    async fn resume(&self);

    /// Stop the current playback, if any. Triggers the pending completion
    /// callback.
    async fn stop(&self);

    /// Release the underlying voice connection. The sink is unusable after.
    async fn disconnect(&self);

    async fn is_playing(&self) -> bool;
}

/// Delivers user-facing status text to a venue.
///
/// Best-effort: the orchestrator logs failures and moves on, so a broken chat
/// surface can never stall playback.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, session: &SessionId, text: &str) -> anyhow::Result<()>;
}

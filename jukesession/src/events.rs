//! Structured session events broadcast by the registry.
//!
//! Distinct from the [`Notifier`](jukesource::Notifier) collaborator: the
//! notifier carries user-facing text into the venue, while these events feed
//! observers (dashboards, SSE bridges, tests) with machine-readable state
//! changes.

use std::time::SystemTime;

use serde::Serialize;

use jukesource::{SessionId, TrackRef};

/// An event emitted by one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub kind: SessionEventKind,
}

/// Session event variants.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    /// A track was appended to the pending queue.
    TrackQueued { track: TrackRef },
    /// Resolution succeeded and the sink accepted the stream.
    NowPlaying { track: TrackRef },
    /// All resolution attempts for a track were exhausted.
    PlaybackFailed { track: TrackRef, attempts: u32 },
    Paused,
    Resumed,
    Skipped,
    QueueCleared,
    /// The session released its sink and left the registry.
    Disconnected { reason: DisconnectReason },
}

/// Why a session disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Explicit `stop` from the command layer.
    Stopped,
    /// Idle with an empty queue past the inactivity deadline.
    Inactivity,
}

/// Broadcast wrapper adding the emission timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEventEnvelope {
    pub event: SessionEvent,
    pub timestamp: SystemTime,
}

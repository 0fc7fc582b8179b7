//! Session lifecycle states.

use std::fmt;

use serde::Serialize;

/// Lifecycle of one playback session.
///
/// `Idle → Resolving → Playing ↔ Paused → Idle`, with `Disconnected` as the
/// terminal state (explicit stop from anywhere, or inactivity timeout from
/// `Idle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No current track. The inactivity deadline is armed.
    Idle,
    /// A track was popped and is being resolved (possibly between retries).
    Resolving,
    Playing,
    Paused,
    /// Terminal. The sink has been released and the worker has exited.
    Disconnected,
}

impl SessionState {
    /// True while the session owns a track (resolving, playing, or paused).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Resolving | SessionState::Playing | SessionState::Paused
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Resolving => "resolving",
            SessionState::Playing => "playing",
            SessionState::Paused => "paused",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

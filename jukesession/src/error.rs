//! Error types for jukesession

use jukesource::SessionId;

/// Session orchestration errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Nothing is playing")]
    NothingPlaying,

    #[error("Nothing to pause")]
    NothingToPause,

    #[error("Nothing to resume")]
    NothingToResume,

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Specialized Result type for jukesession
pub type Result<T> = std::result::Result<T, Error>;

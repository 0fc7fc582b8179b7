//! # jukesession - Per-venue playback session orchestrator
//!
//! This crate owns the stateful core of a voice music bot: one queue, one
//! state machine, and one inactivity deadline per venue. Everything with I/O
//! attached (stream resolution, audio output, user notifications) lives
//! behind the `jukesource` traits and is supplied by the caller.
//!
//! # Architecture
//!
//! - **SessionRegistry**: process-wide map from venue id to session; creates
//!   on first use, drops on stop or inactivity disconnect.
//! - **SessionHandle**: cloneable front for one session; every call becomes
//!   a message on the session's inbox.
//! - **Session worker**: one spawned task per venue serializing all state
//!   mutations, driving resolve-with-retry and the sink.
//! - **SessionConfig**: retry count, backoff delay, inactivity timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jukesession::{SessionConfig, SessionRegistry};
//!
//! let registry = SessionRegistry::new(resolver, notifier, SessionConfig::default());
//!
//! // First enqueue creates the session and binds the venue's sink.
//! let session = registry.get_or_create("venue-42", sink);
//! session.enqueue("miles davis so what").await?;
//! session.enqueue("https://media.example/watch?v=abc").await?;
//!
//! // Later, from command handlers:
//! registry.skip(&"venue-42".into()).await?;
//! registry.stop(&"venue-42".into()).await?;
//! ```

mod config;
mod error;
mod events;
mod registry;
mod session;

// Public re-exports
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use events::{DisconnectReason, SessionEvent, SessionEventEnvelope, SessionEventKind};
pub use registry::SessionRegistry;
pub use session::{SessionHandle, SessionState};

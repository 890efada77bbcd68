//! Error types.
//!
//! Recoverable failures come back as values. Misuse, such as touching thread-bound state from the
//! wrong thread or tearing an actor down twice, panics instead.

use std::io;

use crate::process::ProcessId;
use crate::runtime::DispatchError;

/// Failures of the background lifecycle and actor allocation operations.
#[derive(Debug, thiserror::Error)]
pub enum BackgroundError {
    #[error("background shutdown has already started")]
    ShutdownStarted,

    #[error("failed to spawn dispatcher thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("failed to create shutdown timer: {0}")]
    TimerUnavailable(#[source] io::Error),

    #[error("peer process {0} is not running")]
    PeerGone(ProcessId),

    #[error("calling thread has no task loop")]
    NoTaskQueue,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("bridge request failed: {0}")]
    Bridge(String),

    #[error("actor creation failed")]
    CreationFailed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures of a [`MessageChannel`](crate::channel::MessageChannel) end.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is already open")]
    AlreadyOpen,

    #[error("channel is closed")]
    Closed,

    #[error("channel must be opened from a thread with a task loop")]
    NoTaskQueue,

    #[error("peer endpoint is unavailable")]
    PeerUnavailable,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Failures loading a [`BackgroundConfig`](crate::config::BackgroundConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value `{value}` for {var}")]
    Env { var: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

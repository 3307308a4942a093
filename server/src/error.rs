//! Error types.
//!
//! Reactor-internal failures never surface here: inside a callback cycle
//! they are logged and, where appropriate, close the offending connection.

use std::io;

/// Lifecycle and setup errors returned by [`crate::Server`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// `start` was called twice, or `add_listener` after `start`.
    #[error("server already started")]
    AlreadyStarted,
    /// `run` or `stop` was called before `start`.
    #[error("server not started")]
    NotStarted,
    /// Socket or thread-spawn failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from [`crate::Connection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection is already closed.
    #[error("connection is closed")]
    Closed,
    /// The owning reactor has exited.
    #[error("server is stopped")]
    Stopped,
}

/// Errors from loading a [`crate::Config`] file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] io::Error),
    /// The file is not valid TOML for this schema.
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    /// The values fail validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

//! Error types for server sessions
//!
//! Failures are grouped the way they are handled: configuration errors stop a
//! session from being created, authentication and transport errors abort a
//! connection attempt, protocol errors only skip the offending log line, and
//! resource errors force the log source to be reopened.

use crate::config::ConfigError;
use crate::logsource::LogError;
use crate::parser::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("RCon authentication failed: {0}")]
    Auth(String),

    #[error("RCon transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("log source unavailable: {0}")]
    Resource(#[from] LogError),
}

impl SessionError {
    /// Returns true for errors that leave the session usable on the next tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SessionError::Protocol(_) | SessionError::Resource(_))
    }
}

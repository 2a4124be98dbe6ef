//! Error types for SMTP probing.

use std::io;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A command did not receive its reply in time.
    #[error("Timed out waiting for reply to {command}")]
    Timeout {
        /// Verb of the command that timed out (e.g. `RCPT`).
        command: String,
    },

    /// Server returned error response.
    #[error("SMTP error {code}: {message}")]
    SmtpError {
        /// Reply code (e.g., 550).
        code: u16,
        /// Error message from server.
        message: String,
    },

    /// Protocol error (unexpected or malformed response).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer closed the connection or the session was torn down.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// No connection slot became free before the wait timeout.
    #[error("Connection pool exhausted for {key}")]
    PoolExhausted {
        /// Pool key (`host:port`).
        key: String,
    },

    /// Invalid session or TLS configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Creates an SMTP error from a reply code and message.
    #[must_use]
    pub fn smtp_error(code: u16, message: impl Into<String>) -> Self {
        Self::SmtpError {
            code,
            message: message.into(),
        }
    }

    /// Creates a timeout error for the given command verb.
    #[must_use]
    pub fn timeout(command: impl Into<String>) -> Self {
        Self::Timeout {
            command: command.into(),
        }
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::SmtpError { code, .. } if *code >= 500 && *code < 600)
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SmtpError { code, .. } if *code >= 400 && *code < 500)
    }

    /// Returns true if the transport is unusable after this error.
    ///
    /// A session that produced one of these must not be reused.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Tls(_) | Self::Timeout { .. } | Self::ConnectionClosed | Self::Protocol(_)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[test]
    fn smtp_error_classes() {
        assert!(Error::smtp_error(550, "no such user").is_permanent());
        assert!(Error::smtp_error(451, "try later").is_transient());
        assert!(!Error::smtp_error(250, "ok").is_permanent());
    }

    #[test]
    fn connection_errors() {
        assert!(Error::timeout("RCPT").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(!Error::smtp_error(550, "no").is_connection_error());
        assert!(!Error::PoolExhausted { key: "mx:25".into() }.is_connection_error());
    }

    #[test]
    fn display_includes_command() {
        assert_eq!(
            Error::timeout("MAIL").to_string(),
            "Timed out waiting for reply to MAIL"
        );
    }
}

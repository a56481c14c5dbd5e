//! Error types and result handling for pg-copy-out.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_copy_out::{Error, Result};
//!
//! fn export() -> Result<()> {
//!     Err(Error::Protocol("query did not start COPY OUT".to_string()))
//! }
//!
//! match export() {
//!     Ok(()) => println!("Exported"),
//!     Err(Error::Server(e)) => eprintln!("Server rejected export: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

use crate::postgres::PgError;

/// The main error type for pg-copy-out operations.
///
/// Every variant is fatal to the call that produced it. Whether the
/// connection survives is reported by [`Error::is_fatal_to_connection`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Sending to or receiving from the server failed.
    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),

    /// The server answered with an `ErrorResponse`.
    #[error("{0}")]
    Server(PgError),

    /// Writing a data chunk to the caller's sink failed.
    #[error("Sink error: {0}")]
    Sink(#[source] io::Error),

    /// Applying a message unrelated to the in-flight command failed.
    #[error("Unsolicited message error: {message}")]
    Unsolicited {
        /// What could not be applied
        message: String,
    },

    /// The connection was marked dead by an earlier failure.
    #[error("Connection is dead: {cause}")]
    ConnectionDead {
        /// Description of the failure that killed the connection
        cause: String,
    },

    /// A frame from the server could not be decoded.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// The server sent a valid message that makes no sense at this point.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Query arguments could not be interpolated into the statement.
    #[error("Argument error: {message}")]
    Argument {
        /// Description of the mismatch
        message: String,
    },
}

impl Error {
    /// Returns `true` when the connection can no longer be used after this
    /// error.
    ///
    /// A server `ErrorResponse` leaves the session usable once the trailing
    /// `ReadyForQuery` is consumed, and argument errors never reach the
    /// wire. Everything else leaves the stream at an unknown position.
    pub fn is_fatal_to_connection(&self) -> bool {
        !matches!(self, Error::Server(_) | Error::Argument { .. } | Error::Config(_))
    }

    /// The server error carried by this error, if any.
    pub fn as_server_error(&self) -> Option<&PgError> {
        match self {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PgError> for Error {
    fn from(e: PgError) -> Self {
        Error::Server(e)
    }
}

/// A convenient Result type alias for pg-copy-out operations.
///
/// This is equivalent to `std::result::Result<T, pg_copy_out::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_leave_connection_usable() {
        let err = Error::Server(PgError::from_fields([("message", "disk full")]));
        assert!(!err.is_fatal_to_connection());
        assert_eq!(err.as_server_error().unwrap().message(), "disk full");
    }

    #[test]
    fn test_transport_and_sink_errors_are_fatal() {
        let transport = Error::Transport(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let sink = Error::Sink(io::Error::new(io::ErrorKind::Other, "full"));
        assert!(transport.is_fatal_to_connection());
        assert!(sink.is_fatal_to_connection());
        assert_eq!(sink.to_string(), "Sink error: full");
    }
}

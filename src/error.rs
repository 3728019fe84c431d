//! Custom error types for the VICP client.
//!
//! This module defines the primary error type, `VicpError`, for the whole crate.
//! Using the `thiserror` crate, it provides one consistent way to report the
//! failures that can occur while talking to an instrument, from socket problems
//! to framing desynchronisation and bad configuration.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`**: Wraps `std::io::Error`. The connection was refused, reset, a
//!   write came up short, or the peer closed the stream in the middle of a frame or
//!   block. The core never retries; the caller decides whether to reconnect.
//! - **`Protocol`**: Framing or length desynchronisation, a malformed block header,
//!   or a stalled peer. Fatal to the in-flight operation. A desynced connection should
//!   be closed and reopened by the caller.
//! - **`Encoding`**: A command could not be framed (oversized payload). Local to the
//!   call that raised it, the connection state is untouched.
//! - **`Config`** / **`Configuration`**: Figment extraction failures and semantic
//!   validation failures respectively.
//! - **`InvalidChannel`**, **`CapabilityMissing`**, **`Unsupported`**: Caller errors
//!   raised before anything is put on the wire.
//!
//! By using `#[from]`, `VicpError` can be created from the underlying error types,
//! so `?` works throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, VicpError>;

/// Primary error type for the VICP client.
#[derive(Error, Debug)]
pub enum VicpError {
    /// Underlying connection failure.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Framing / block length desynchronisation or malformed response envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command could not be framed.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Channel index outside the detected channel roster.
    #[error("Channel {0} is not part of the detected channel roster")]
    InvalidChannel(usize),

    /// The instrument lacks the option needed for this call.
    #[error("Instrument option not installed: {0}")]
    CapabilityMissing(&'static str),

    /// The instrument cannot perform this operation at all.
    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

impl VicpError {
    /// Build a transport error for a stream that ended before `context` completed.
    pub fn closed(context: impl std::fmt::Display) -> Self {
        VicpError::Transport(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("connection closed by instrument during {context}"),
        ))
    }

    /// True for connection-level failures (the link should be reopened).
    pub fn is_transport(&self) -> bool {
        matches!(self, VicpError::Transport(_))
    }

    /// True for framing desynchronisation (the link should be reopened).
    pub fn is_protocol(&self) -> bool {
        matches!(self, VicpError::Protocol(_))
    }
}

impl From<figment::Error> for VicpError {
    fn from(value: figment::Error) -> Self {
        VicpError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_stream_is_a_transport_error() {
        let err = VicpError::closed("waveform block");
        assert!(err.is_transport());
        assert!(!err.is_protocol());
        match err {
            VicpError::Transport(io) => {
                assert_eq!(io.kind(), std::io::ErrorKind::UnexpectedEof);
                assert!(io.to_string().contains("waveform block"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn fails() -> AppResult<()> {
            Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset))?;
            Ok(())
        }
        assert!(fails().unwrap_err().is_transport());
    }

    #[test]
    fn display_includes_context() {
        let err = VicpError::Protocol("block overran declared length".into());
        assert_eq!(
            err.to_string(),
            "Protocol error: block overran declared length"
        );
        assert_eq!(
            VicpError::InvalidChannel(7).to_string(),
            "Channel 7 is not part of the detected channel roster"
        );
    }
}

//! Centralized error types for the Lockstep core library.
//!
//! Each subsystem defines its own `thiserror` enum next to the code that
//! produces it; this module provides the unified [`LockstepError`] the host
//! sees, plus the [`ErrorCode`] trait mapping errors to machine-readable
//! codes.

use thiserror::Error;

use crate::audio::decode::DecodeError;
use crate::protocol::ProtocolError;
use crate::transport::signaling::SignalingError;
use crate::transport::TransportError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for host consumption.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the Lockstep core.
#[derive(Debug, Error)]
pub enum LockstepError {
    /// Impossible request: policy without a matching descriptor, malformed
    /// remote identifier, invalid URL. Non-recoverable; surfaced immediately.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure; recoverability is carried by the source.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or unexpected protocol traffic.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Decoder configuration or decode failure; aborts the current stream.
    #[error("Decoder error: {0}")]
    Decoder(#[from] DecodeError),

    /// WebRTC signaling exchange failure.
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Handshake did not complete within its deadline.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Auto-reconnect gave up after the configured number of attempts.
    #[error("Connection lost after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl LockstepError {
    /// Returns a machine-readable error code for host consumption.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration_error",
            Self::Transport(e) => e.code(),
            Self::Protocol(_) => "protocol_error",
            Self::Decoder(_) => "decoder_error",
            Self::Signaling(_) => "signaling_error",
            Self::Handshake(_) => "handshake_failed",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
        }
    }

    /// True when retrying the same operation could succeed.
    ///
    /// Configuration errors and exhausted reconnects are final; transport
    /// errors delegate to their own classification.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::ReconnectExhausted { .. } => false,
            Self::Transport(e) => e.is_recoverable(),
            Self::Signaling(_) | Self::Handshake(_) => true,
            Self::Protocol(_) | Self::Decoder(_) => false,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type LockstepResult<T> = Result<T, LockstepError>;

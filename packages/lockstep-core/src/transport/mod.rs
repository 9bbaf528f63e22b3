//! Bidirectional message channels to the server.
//!
//! Three concrete variants share one abstract contract: a direct local
//! WebSocket, an authenticated proxy WebSocket over TLS, and a data channel
//! ferried through a WebRTC peer negotiated via a signaling service. The
//! session engine only ever sees the [`Transport`] trait and the
//! [`TransportEvent`] stream.

pub mod signaling;
pub mod webrtc;
pub mod ws;

pub use webrtc::{IceCandidate, PeerEvent, WebRtcPeer, WebRtcTransport};
pub use ws::WsTransport;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Timeout for establishing any transport connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket idle ping interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket idle ping interval in high-power mode.
pub const PING_INTERVAL_HIGH_POWER: Duration = Duration::from_secs(15);

/// Which connection variant a transport implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Local,
    Proxy,
    WebRtc,
}

impl TransportKind {
    /// Short name for logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Proxy => "proxy",
            Self::WebRtc => "webrtc",
        }
    }
}

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Events surfaced to the session engine.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The channel is open; sends will succeed.
    Connected,
    /// A JSON text frame arrived.
    Text(String),
    /// A binary frame arrived.
    Binary(Bytes),
    /// The peer started a graceful close.
    Closing,
    /// The channel closed. Code 1000 is a normal close; anything else is a
    /// transport failure with recoverability as classified.
    Closed { code: u16, reason: String },
    /// The channel failed.
    Failure { error: TransportError },
}

/// Transport-level failures with recoverability classification.
///
/// Recoverable by default; unknown-host, TLS handshake, connect-refused,
/// no-route and auth rejection stop auto-reconnect for the variant.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connection refused")]
    ConnectionRefused,

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("no route to host: {0}")]
    NoRoute(String),

    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection closed by peer: code={code}, reason={reason}")]
    RemoteClosed { code: u16, reason: String },

    #[error("peer connection failed: {0}")]
    Peer(String),

    #[error("not connected")]
    NotConnected,
}

impl TransportError {
    /// True when retrying the same variant could succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::ConnectionRefused
                | Self::UnknownHost(_)
                | Self::Tls(_)
                | Self::NoRoute(_)
                | Self::Unauthorized(_)
                | Self::InvalidUrl(_)
        )
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::UnknownHost(_) => "unknown_host",
            Self::Tls(_) => "tls_handshake_failed",
            Self::NoRoute(_) => "no_route",
            Self::Unauthorized(_) => "authentication_failed",
            Self::InvalidUrl(_) => "invalid_url",
            Self::WebSocket(_) => "websocket_error",
            Self::Io(_) => "io_error",
            Self::RemoteClosed { .. } => "remote_closed",
            Self::Peer(_) => "peer_failed",
            Self::NotConnected => "not_connected",
        }
    }

    /// Classifies a tungstenite error.
    ///
    /// `authenticated` transports additionally treat HTTP 401/403 upgrade
    /// rejections (and anything that smells like an authorization failure)
    /// as non-recoverable even when they would otherwise look transient.
    pub(crate) fn classify(err: &tokio_tungstenite::tungstenite::Error, authenticated: bool) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Io(io) => Self::classify_io(io),
            WsError::Tls(e) => Self::Tls(e.to_string()),
            WsError::Url(e) => Self::InvalidUrl(e.to_string()),
            WsError::Http(response) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    Self::Unauthorized(format!("upgrade rejected with {}", status))
                } else {
                    Self::WebSocket(format!("upgrade rejected with {}", status))
                }
            }
            other => {
                let text = other.to_string();
                if authenticated && text.to_ascii_lowercase().contains("unauthorized") {
                    Self::Unauthorized(text)
                } else {
                    Self::WebSocket(text)
                }
            }
        }
    }

    fn classify_io(io: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let text = io.to_string();
        match io.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            ErrorKind::TimedOut => Self::ConnectTimeout(CONNECT_TIMEOUT),
            _ => {
                let lower = text.to_ascii_lowercase();
                // DNS failures and unreachable routes surface as opaque I/O
                // errors; sniff the message rather than unstable ErrorKinds.
                if lower.contains("lookup") || lower.contains("name resolution") {
                    Self::UnknownHost(text)
                } else if lower.contains("unreachable") || lower.contains("no route") {
                    Self::NoRoute(text)
                } else {
                    Self::Io(text)
                }
            }
        }
    }
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Abstract bidirectional channel.
///
/// `send_*` while not connected returns `false`; there is no queuing.
/// [`Transport::destroy`] guarantees full resource release; close alone does
/// not. The supervisor close-reopens transports during variant rotation and
/// must not leak.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the channel. Resolves once connected or classifies the failure.
    async fn connect(&self) -> TransportResult<()>;

    /// Sends a JSON text frame. `false` when not connected.
    async fn send_text(&self, text: &str) -> bool;

    /// Sends a binary frame. `false` when not connected.
    async fn send_binary(&self, data: &[u8]) -> bool;

    /// Starts a graceful close. Best-effort on some variants.
    async fn close(&self, code: u16, reason: &str);

    /// Releases all resources held by this transport.
    async fn destroy(&self);

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Which variant this is.
    fn kind(&self) -> TransportKind;
}

//! Core configuration and server endpoint records.
//!
//! Provides the host-supplied tuning options ([`CoreConfig`]) and the
//! description of a server the client can connect to ([`ServerEndpoint`]).
//! The core persists nothing; endpoint records are handed in by the host.

use serde::{Deserialize, Serialize};

/// Default scheduler queue bound (32 MB of decoded PCM).
pub const DEFAULT_BUFFER_CAPACITY: usize = 32 * 1024 * 1024;

/// Scheduler queue bound under memory pressure (8 MB).
pub const LOW_MEMORY_BUFFER_CAPACITY: usize = 8 * 1024 * 1024;

/// Tuning options the core consumes from its host.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Shortens the WebSocket idle ping interval from 30 s to 15 s.
    pub high_power_mode: bool,

    /// Scheduler queue bound in bytes of decoded PCM.
    pub output_buffer_capacity: usize,

    /// Audio-path calibration in milliseconds. Positive values shift playout
    /// later; applied in the server→client conversion.
    pub static_delay_ms: f64,

    /// Ordered codec preference advertised in `client/hello`.
    pub codec_preference: Vec<String>,

    /// Frames scheduled to play further in the past than this are dropped.
    pub late_frame_threshold_ms: u64,

    /// Maximum auto-reconnect attempts before surfacing failure.
    pub max_reconnect_attempts: u32,
}

impl CoreConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.output_buffer_capacity == 0 {
            return Err("output_buffer_capacity must be >= 1 byte".to_string());
        }
        if self.codec_preference.is_empty() {
            return Err("codec_preference must list at least one codec".to_string());
        }
        if self.max_reconnect_attempts == 0 {
            return Err("max_reconnect_attempts must be >= 1".to_string());
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            high_power_mode: false,
            output_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            static_delay_ms: 0.0,
            codec_preference: vec!["opus".to_string(), "flac".to_string(), "pcm".to_string()],
            late_frame_threshold_ms: 100,
            max_reconnect_attempts: 11,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Endpoints
// ─────────────────────────────────────────────────────────────────────────────

/// Which connection variants the user allows for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPolicy {
    /// Pick the variant priority from the current network class.
    #[default]
    Auto,
    /// Only the local WebSocket descriptor.
    LocalOnly,
    /// Only the remote (WebRTC-tunneled) descriptor.
    RemoteOnly,
    /// Only the authenticated proxy descriptor.
    ProxyOnly,
}

/// Address of a server on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDescriptor {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl LocalDescriptor {
    /// Builds the `ws://` URL for this descriptor.
    #[must_use]
    pub fn url(&self) -> String {
        let path = self.path.strip_prefix('/').unwrap_or(&self.path);
        format!("ws://{}:{}/{}", self.host, self.port, path)
    }
}

/// Credentials for the authenticated proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyAuth {
    /// Sent as `Authorization: Bearer …` on the upgrade request.
    Bearer { token: String },
    /// HTTP basic credentials.
    Basic { username: String, password: String },
}

/// Authenticated proxy descriptor: an `https://` URL plus credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub url: String,
    pub auth: Option<ProxyAuth>,
}

impl ProxyDescriptor {
    /// Translates the configured `https://`/`http://` URL to its WebSocket
    /// equivalent (`wss://`/`ws://`).
    #[must_use]
    pub fn ws_url(&self) -> String {
        if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.url.clone()
        }
    }
}

/// A 26-character upper-case alphanumeric handle issued by the server's
/// remote-access service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    /// Validates and wraps a remote identifier.
    ///
    /// # Errors
    ///
    /// Returns a user-facing message when the handle is not exactly 26
    /// upper-case letters or digits.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let ok = raw.len() == 26
            && raw
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if ok {
            Ok(Self(raw.to_string()))
        } else {
            Err("remote id must be 26 upper-case letters or digits".to_string())
        }
    }

    /// Returns the validated identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A server the client can connect to.
///
/// Invariant: at least one of `local`, `remote`, `proxy` is present;
/// [`ServerEndpoint::validate`] enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Stable identifier supplied by the host.
    pub id: String,
    /// Display name for logs and user-facing errors.
    pub name: String,
    /// Local-network WebSocket address.
    pub local: Option<LocalDescriptor>,
    /// Remote-access handle for the WebRTC-tunneled variant.
    pub remote: Option<RemoteId>,
    /// Authenticated proxy descriptor.
    pub proxy: Option<ProxyDescriptor>,
    /// Which variants the user allows.
    #[serde(default)]
    pub policy: ConnectionPolicy,
}

impl ServerEndpoint {
    /// Checks the endpoint invariant: at least one connection descriptor.
    pub fn validate(&self) -> Result<(), String> {
        if self.local.is_none() && self.remote.is_none() && self.proxy.is_none() {
            return Err(format!(
                "endpoint '{}' has no connection descriptors",
                self.name
            ));
        }
        Ok(())
    }
}

//! Player configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use lockstep_core::{
    ConnectionPolicy, CoreConfig, LocalDescriptor, ProxyAuth, ProxyDescriptor, RemoteId,
    ServerEndpoint,
};

/// Player configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Display name advertised to servers.
    /// Override: `LOCKSTEP_NAME`
    pub name: String,

    /// Local server host.
    /// Override: `LOCKSTEP_SERVER_HOST`
    pub server_host: Option<String>,

    /// Local server port.
    /// Override: `LOCKSTEP_SERVER_PORT`
    pub server_port: u16,

    /// WebSocket path on the local server.
    pub server_path: String,

    /// Authenticated proxy URL (`https://…`).
    pub proxy_url: Option<String>,

    /// Bearer token for the proxy.
    /// Override: `LOCKSTEP_PROXY_TOKEN`
    pub proxy_token: Option<String>,

    /// Remote-access handle (26 upper-case letters or digits).
    pub remote_id: Option<String>,

    /// Signaling service URL for the WebRTC variant.
    pub signaling_url: String,

    /// Connection policy: auto, local_only, remote_only, proxy_only.
    pub policy: ConnectionPolicy,

    /// Audio-path calibration in milliseconds; positive plays later.
    pub static_delay_ms: f64,

    /// Shorter WebSocket ping interval for lossy networks.
    pub high_power_mode: bool,

    /// Use the 8 MB low-memory scheduler bound instead of 32 MB.
    pub low_memory: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            name: "Lockstep Player".to_string(),
            server_host: None,
            server_port: 8927,
            server_path: "/lockstep".to_string(),
            proxy_url: None,
            proxy_token: None,
            remote_id: None,
            signaling_url: "wss://signal.lockstep.app/ws".to_string(),
            policy: ConnectionPolicy::Auto,
            static_delay_ms: 0.0,
            high_power_mode: false,
            low_memory: false,
        }
    }
}

impl PlayerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LOCKSTEP_NAME") {
            self.name = val;
        }
        if let Ok(val) = std::env::var("LOCKSTEP_SERVER_HOST") {
            self.server_host = Some(val);
        }
        if let Ok(val) = std::env::var("LOCKSTEP_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server_port = port;
            }
        }
        if let Ok(val) = std::env::var("LOCKSTEP_PROXY_TOKEN") {
            self.proxy_token = Some(val);
        }
    }

    /// Converts to lockstep-core's configuration type.
    pub fn to_core_config(&self) -> CoreConfig {
        CoreConfig {
            high_power_mode: self.high_power_mode,
            output_buffer_capacity: if self.low_memory {
                lockstep_core::config::LOW_MEMORY_BUFFER_CAPACITY
            } else {
                lockstep_core::config::DEFAULT_BUFFER_CAPACITY
            },
            static_delay_ms: self.static_delay_ms,
            ..Default::default()
        }
    }

    /// Builds the endpoint record for the configured server.
    pub fn to_endpoint(&self) -> Result<ServerEndpoint> {
        let local = self.server_host.as_ref().map(|host| LocalDescriptor {
            host: host.clone(),
            port: self.server_port,
            path: self.server_path.clone(),
        });
        let proxy = self.proxy_url.as_ref().map(|url| ProxyDescriptor {
            url: url.clone(),
            auth: self
                .proxy_token
                .as_ref()
                .map(|token| ProxyAuth::Bearer { token: token.clone() }),
        });
        let remote = self
            .remote_id
            .as_deref()
            .map(RemoteId::parse)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))?;

        let endpoint = ServerEndpoint {
            id: format!(
                "{}:{}",
                self.server_host.as_deref().unwrap_or("remote"),
                self.server_port
            ),
            name: self.name.clone(),
            local,
            remote,
            proxy,
            policy: self.policy,
        };
        endpoint.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(endpoint)
    }
}

//! JSON protocol messages.
//!
//! Every message on the wire shares the shape `{type: "…", payload: {…}}`.
//! Outbound payloads are fully populated by the client; inbound payloads are
//! parsed permissively: missing optional fields fall back to defaults and
//! unknown message types map to [`Message::Unknown`] instead of failing the
//! whole connection.

use serde::{Deserialize, Serialize};

/// Playback state reported in group updates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    #[default]
    Stopped,
}

/// Synchronization state advertised by the player in `client/state`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlayerSyncState {
    Synchronized,
    Error,
    Idle,
}

/// Hardware/software identity advertised in `client/hello`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
}

/// One audio format the player can accept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioFormatSpec {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Player capabilities advertised in `client/hello`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSupport {
    pub supported_formats: Vec<AudioFormatSpec>,
    /// Buffer capacity in milliseconds of audio the player can hold.
    pub buffer_capacity: u64,
    pub supported_commands: Vec<String>,
}

/// `client/hello` payload: identity plus capability set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub client_id: String,
    pub name: String,
    pub version: u32,
    pub supported_roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_support: Option<PlayerSupport>,
}

/// `server/hello` payload.
///
/// `name` and `server_id` are required; a hello without them is a protocol
/// error. Everything else defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    pub name: String,
    pub server_id: String,
    #[serde(default)]
    pub connection_reason: Option<String>,
    #[serde(default)]
    pub active_roles: Vec<String>,
}

/// Volume/mute pair reported in `client/state`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlayerStateInfo {
    pub volume: u8,
    pub muted: bool,
}

/// `client/state` payload: the player's current condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientState {
    pub state: PlayerSyncState,
    pub player: PlayerStateInfo,
}

/// Progress triple inside a metadata snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct TrackProgress {
    #[serde(default)]
    pub track_progress_ms: u64,
    #[serde(default)]
    pub track_duration_ms: u64,
    #[serde(default = "default_playback_speed")]
    pub playback_speed: f64,
}

fn default_playback_speed() -> f64 {
    1.0
}

/// Last-known metadata snapshot carried by `server/state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TrackProgress>,
}

/// `server/state` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerState {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

/// Negotiated stream format inside `stream/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPlayerConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// Opaque codec initialization bytes, base64-encoded.
    #[serde(default)]
    pub codec_header: Option<String>,
}

/// `stream/start` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStart {
    #[serde(default)]
    pub player: Option<StreamPlayerConfig>,
}

/// A command addressed to the player or the controller role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<serde_json::Value>,
}

/// Player command carried by `server/command`.
///
/// Unknown commands are preserved (not a parse error) so the engine can log
/// and drop them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

/// `group/update` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupUpdate {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub playback_state: Option<PlaybackState>,
}

/// `client/sync_offset` payload (server-initiated delay calibration).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOffset {
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default)]
    pub offset_ms: f64,
    #[serde(default)]
    pub source: Option<String>,
}

/// All JSON protocol messages, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    #[serde(rename = "client/hello")]
    ClientHello(ClientHello),
    #[serde(rename = "server/hello")]
    ServerHello(ServerHello),
    #[serde(rename = "client/time")]
    ClientTime { client_transmitted: i64 },
    #[serde(rename = "server/time")]
    ServerTime {
        client_transmitted: i64,
        server_received: i64,
        server_transmitted: i64,
    },
    #[serde(rename = "client/state")]
    ClientState(ClientState),
    #[serde(rename = "server/state")]
    ServerState(ServerState),
    #[serde(rename = "stream/start")]
    StreamStart(StreamStart),
    #[serde(rename = "stream/end")]
    StreamEnd(Option<serde_json::Value>),
    #[serde(rename = "stream/clear")]
    StreamClear(Option<serde_json::Value>),
    #[serde(rename = "client/command")]
    ClientCommand(CommandPayload),
    #[serde(rename = "server/command")]
    ServerCommand(CommandPayload),
    #[serde(rename = "client/goodbye")]
    ClientGoodbye { reason: String },
    #[serde(rename = "group/update")]
    GroupUpdate(GroupUpdate),
    #[serde(rename = "client/sync_offset")]
    SyncOffset(SyncOffset),
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Short message name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientHello(_) => "client/hello",
            Self::ServerHello(_) => "server/hello",
            Self::ClientTime { .. } => "client/time",
            Self::ServerTime { .. } => "server/time",
            Self::ClientState(_) => "client/state",
            Self::ServerState(_) => "server/state",
            Self::StreamStart(_) => "stream/start",
            Self::StreamEnd(_) => "stream/end",
            Self::StreamClear(_) => "stream/clear",
            Self::ClientCommand(_) => "client/command",
            Self::ServerCommand(_) => "server/command",
            Self::ClientGoodbye { .. } => "client/goodbye",
            Self::GroupUpdate(_) => "group/update",
            Self::SyncOffset(_) => "client/sync_offset",
            Self::Unknown => "unknown",
        }
    }
}

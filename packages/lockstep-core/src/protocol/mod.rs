//! Wire protocol: JSON messages and binary frames.
//!
//! JSON is UTF-8 with a strict parser; unknown fields are ignored and unknown
//! message types map to [`Message::Unknown`]. Binary frames use a fixed
//! big-endian header followed by an opaque payload.

pub mod frames;
pub mod messages;

pub use frames::{BinaryFrame, FrameKind, FRAME_HEADER_LEN};
pub use messages::{
    AudioFormatSpec, ClientHello, ClientState, CommandPayload, DeviceInfo, GroupUpdate, Message,
    Metadata, PlaybackState, PlayerCommand, PlayerStateInfo, PlayerSupport, PlayerSyncState,
    ServerHello, ServerState, StreamPlayerConfig, StreamStart, SyncOffset, TrackProgress,
};

use thiserror::Error;

/// Malformed or unexpected protocol traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer sent JSON we could not parse into a message.
    #[error("malformed JSON message: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// `server/hello` arrived without its required fields.
    #[error("server/hello missing required field: {field}")]
    IncompleteHello { field: &'static str },

    /// Binary frame shorter than the 9-byte header.
    #[error("binary frame too short: {len} bytes")]
    FrameTooShort { len: usize },

    /// Unrecognized binary frame tag. Warn-and-drop, not fatal.
    #[error("unknown binary frame type: {tag}")]
    UnknownFrameType { tag: u8 },

    /// Codec header bytes were not valid base64.
    #[error("invalid codec header: {0}")]
    InvalidCodecHeader(String),
}

/// Result alias for protocol parsing.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Parses a JSON text frame into a [`Message`].
pub fn parse_message(text: &str) -> ProtocolResult<Message> {
    Ok(serde_json::from_str(text)?)
}

/// Serializes a [`Message`] to its JSON text frame.
pub fn encode_message(message: &Message) -> ProtocolResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decodes the base64 codec header carried by `stream/start`.
pub fn decode_codec_header(encoded: &str) -> ProtocolResult<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ProtocolError::InvalidCodecHeader(e.to_string()))
}

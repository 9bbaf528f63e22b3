//! Binary frame codec.
//!
//! Layout: byte 0 = type tag, bytes 1–8 = microsecond timestamp (big-endian,
//! server time domain), remainder = opaque payload. The decoder is strict
//! about the 9-byte minimum; unknown type tags are reported so the caller can
//! warn-and-drop without tearing the session down.

use bytes::Bytes;

use super::ProtocolError;

/// Minimum frame size: 1 tag byte + 8 timestamp bytes.
pub const FRAME_HEADER_LEN: usize = 9;

/// Known binary frame channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Compressed audio (tag 4).
    Audio,
    /// Artwork channels 0–3 (tags 8–11).
    Artwork(u8),
    /// Visualizer data (tag 16).
    Visualizer,
}

impl FrameKind {
    /// Maps a wire tag to a frame kind.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            4 => Some(Self::Audio),
            8..=11 => Some(Self::Artwork(tag - 8)),
            16 => Some(Self::Visualizer),
            _ => None,
        }
    }

    /// Returns the wire tag for this kind.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::Audio => 4,
            Self::Artwork(channel) => 8 + channel,
            Self::Visualizer => 16,
        }
    }
}

/// A parsed binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub kind: FrameKind,
    /// Presentation timestamp in microseconds, server time domain.
    pub timestamp_us: i64,
    pub payload: Bytes,
}

impl BinaryFrame {
    /// Parses a binary frame from wire bytes.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::FrameTooShort`] below the 9-byte minimum and
    /// [`ProtocolError::UnknownFrameType`] for unrecognized tags (the latter
    /// is warn-and-drop at the call site, not fatal).
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::FrameTooShort { len: data.len() });
        }

        let tag = data[0];
        let kind = FrameKind::from_tag(tag).ok_or(ProtocolError::UnknownFrameType { tag })?;

        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&data[1..9]);
        let timestamp_us = i64::from_be_bytes(ts_bytes);

        Ok(Self {
            kind,
            timestamp_us,
            payload: Bytes::copy_from_slice(&data[FRAME_HEADER_LEN..]),
        })
    }

    /// Builds the wire representation of a frame.
    #[must_use]
    pub fn build(kind: FrameKind, timestamp_us: i64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.push(kind.tag());
        out.extend_from_slice(&timestamp_us.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

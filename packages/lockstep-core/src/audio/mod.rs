//! Decode and playout pipeline: codec-agnostic frame decoding and
//! timestamp-driven scheduling into an output sink.

pub mod decode;
pub mod scheduler;

pub use decode::{DecodeError, DecodeOutput, Decoder, DecoderPipeline};
pub use scheduler::{run_playout, ScheduledBuffer, Scheduler, SchedulerConfig, SchedulerStats};

use bytes::Bytes;
use serde::Serialize;

/// Supported audio codecs for the stream.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Pcm,
    Flac,
    Opus,
    Aac,
}

impl AudioCodec {
    /// Parses the codec name used on the wire.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "pcm" => Some(Self::Pcm),
            "flac" => Some(Self::Flac),
            "opus" => Some(Self::Opus),
            "aac" => Some(Self::Aac),
            _ => None,
        }
    }

    /// Returns the codec as a short string identifier (e.g., "pcm", "opus").
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::Flac => "flac",
            Self::Opus => "opus",
            Self::Aac => "aac",
        }
    }
}

/// Negotiated audio stream format.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AudioFormat {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// Opaque codec initialization bytes from `stream/start`.
    #[serde(skip)]
    pub codec_header: Option<Bytes>,
}

impl AudioFormat {
    /// Creates a format without a codec header.
    #[must_use]
    pub fn new(codec: AudioCodec, sample_rate: u32, channels: u16, bit_depth: u16) -> Self {
        Self {
            codec,
            sample_rate,
            channels,
            bit_depth,
            codec_header: None,
        }
    }

    /// Bytes per input sample for PCM payloads.
    #[must_use]
    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bit_depth / 8)
    }

    /// Duration of `frames` sample frames in microseconds.
    #[must_use]
    pub fn frames_to_micros(&self, frames: usize) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (frames as i64 * 1_000_000) / i64::from(self.sample_rate)
    }
}

/// A span of decoded PCM and the server-domain deadline it inherits from the
/// input frame.
///
/// Decoders may produce more or fewer samples than input frames; the deadline
/// is attached to the first sample and subsequent samples extend at the
/// nominal sample period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBuffer {
    /// Presentation timestamp of the first sample, server time domain, µs.
    pub timestamp_us: i64,
    /// Interleaved 16-bit PCM.
    pub samples: Vec<i16>,
}

impl DecodedBuffer {
    /// Size of the PCM payload in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }
}

/// Result of handing a buffer to the output sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkPush {
    Accepted,
    Overflow,
}

/// Host-provided PCM output.
///
/// The core never touches an audio device; it hands decoded PCM plus a local
/// monotonic deadline to this sink.
pub trait OutputSink: Send + Sync {
    /// Prepares the sink for a new stream format.
    fn configure(&self, format: &AudioFormat) -> Result<(), String>;

    /// Offers the next buffer. [`SinkPush::Overflow`] means try again later.
    fn push(&self, deadline_us: i64, pcm: &[i16]) -> SinkPush;

    /// Pauses output.
    fn pause(&self);

    /// Resumes output.
    fn resume(&self);

    /// Discards anything the sink still holds.
    fn flush(&self);

    /// The sink's own output latency in microseconds; buffers are handed
    /// over this far ahead of their deadline.
    fn latency_floor_us(&self) -> i64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_names_round_trip() {
        for codec in [
            AudioCodec::Pcm,
            AudioCodec::Flac,
            AudioCodec::Opus,
            AudioCodec::Aac,
        ] {
            assert_eq!(AudioCodec::from_wire(codec.as_str()), Some(codec));
        }
        assert_eq!(AudioCodec::from_wire("mp3"), None);
    }

    #[test]
    fn frames_to_micros_uses_nominal_sample_period() {
        let format = AudioFormat::new(AudioCodec::Pcm, 48_000, 2, 16);
        assert_eq!(format.frames_to_micros(48_000), 1_000_000);
        assert_eq!(format.frames_to_micros(480), 10_000);
    }
}

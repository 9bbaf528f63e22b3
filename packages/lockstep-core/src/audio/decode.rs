//! Codec abstraction and synchronous per-codec decoders.
//!
//! Decoders run on a dedicated blocking worker because decoding is CPU-bound
//! and may block briefly. Input frames arrive on a bounded queue; when the
//! queue stays full past a short deadline the frame is dropped loudly,
//! never silently, because stateful codecs like Opus would go out of sync.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AudioCodec, AudioFormat, DecodedBuffer};

/// Bounded input queue between the engine and the decode worker.
const INPUT_QUEUE_CAPACITY: usize = 64;

/// Ceiling on added latency when the input queue is saturated (three retries
/// of the 10 ms slot wait, plus change).
const INPUT_SUBMIT_TIMEOUT: Duration = Duration::from_millis(40);

/// Largest Opus frame: 120 ms at 48 kHz.
const OPUS_MAX_FRAME_SAMPLES: usize = 5_760;

/// Decoder configuration or decode failures.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u16),

    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(u16),

    #[error("decoder not configured")]
    NotConfigured,

    #[error("decoder configuration failed: {0}")]
    Configure(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Result alias for decoder operations.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Synchronous codec interface.
///
/// Implementations resume automatically from a flushed state on the next
/// decode; `flush` must not reinitialize the codec.
pub trait Decoder: Send {
    /// Prepares the codec for the given format.
    fn configure(&mut self, format: &AudioFormat) -> DecodeResult<()>;

    /// Decodes one compressed frame into interleaved 16-bit PCM.
    fn decode(&mut self, compressed: &[u8]) -> DecodeResult<Vec<i16>>;

    /// Drops internal codec state without reinitializing.
    fn flush(&mut self);

    /// Best-effort teardown; errors are logged, not surfaced.
    fn release(&mut self);

    /// True once `configure` succeeded.
    fn is_configured(&self) -> bool;
}

/// Creates the decoder for a codec.
pub fn create_decoder(codec: AudioCodec) -> Box<dyn Decoder> {
    match codec {
        AudioCodec::Pcm => Box::new(PcmDecoder::new()),
        AudioCodec::Opus => Box::new(OpusDecoder::new()),
        AudioCodec::Flac => Box::new(SymphoniaDecoder::flac()),
        AudioCodec::Aac => Box::new(SymphoniaDecoder::aac()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PCM
// ─────────────────────────────────────────────────────────────────────────────

/// Identity decoder: converts little-endian PCM payloads to i16.
pub struct PcmDecoder {
    bit_depth: Option<u16>,
}

impl PcmDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self { bit_depth: None }
    }
}

impl Default for PcmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PcmDecoder {
    fn configure(&mut self, format: &AudioFormat) -> DecodeResult<()> {
        match format.bit_depth {
            16 | 24 | 32 => {
                self.bit_depth = Some(format.bit_depth);
                Ok(())
            }
            other => Err(DecodeError::UnsupportedBitDepth(other)),
        }
    }

    fn decode(&mut self, compressed: &[u8]) -> DecodeResult<Vec<i16>> {
        let bit_depth = self.bit_depth.ok_or(DecodeError::NotConfigured)?;
        let bytes_per_sample = usize::from(bit_depth / 8);
        if compressed.len() % bytes_per_sample != 0 {
            return Err(DecodeError::Decode(format!(
                "{} bytes is not a multiple of the {}-byte sample size",
                compressed.len(),
                bytes_per_sample
            )));
        }

        let samples = match bit_depth {
            16 => compressed
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
            24 => compressed
                .chunks_exact(3)
                .map(|c| {
                    let extension = if c[2] & 0x80 != 0 { 0xFF } else { 0x00 };
                    let value = i32::from_le_bytes([c[0], c[1], c[2], extension]);
                    (value >> 8) as i16
                })
                .collect(),
            32 => compressed
                .chunks_exact(4)
                .map(|c| (i32::from_le_bytes([c[0], c[1], c[2], c[3]]) >> 16) as i16)
                .collect(),
            _ => unreachable!("configure validated the bit depth"),
        };
        Ok(samples)
    }

    fn flush(&mut self) {}

    fn release(&mut self) {
        self.bit_depth = None;
    }

    fn is_configured(&self) -> bool {
        self.bit_depth.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Opus
// ─────────────────────────────────────────────────────────────────────────────

/// Opus decoder backed by libopus.
pub struct OpusDecoder {
    decoder: Option<opus::Decoder>,
    channels: usize,
}

impl OpusDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoder: None,
            channels: 0,
        }
    }
}

impl Default for OpusDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for OpusDecoder {
    fn configure(&mut self, format: &AudioFormat) -> DecodeResult<()> {
        let channels = match format.channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            other => return Err(DecodeError::UnsupportedChannels(other)),
        };
        let decoder = opus::Decoder::new(format.sample_rate, channels)
            .map_err(|e| DecodeError::Configure(e.to_string()))?;
        self.decoder = Some(decoder);
        self.channels = usize::from(format.channels);
        Ok(())
    }

    fn decode(&mut self, compressed: &[u8]) -> DecodeResult<Vec<i16>> {
        let decoder = self.decoder.as_mut().ok_or(DecodeError::NotConfigured)?;
        let mut output = vec![0i16; OPUS_MAX_FRAME_SAMPLES * self.channels];
        let frames = decoder
            .decode(compressed, &mut output, false)
            .map_err(|e| DecodeError::Decode(e.to_string()))?;
        output.truncate(frames * self.channels);
        Ok(output)
    }

    fn flush(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            if let Err(e) = decoder.reset_state() {
                log::warn!("[Decoder] Opus reset failed: {}", e);
            }
        }
    }

    fn release(&mut self) {
        self.decoder = None;
    }

    fn is_configured(&self) -> bool {
        self.decoder.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FLAC / AAC (Symphonia)
// ─────────────────────────────────────────────────────────────────────────────

/// FLAC and AAC decoding through Symphonia's packet decoders.
pub struct SymphoniaDecoder {
    codec: AudioCodec,
    decoder: Option<Box<dyn symphonia::core::codecs::Decoder>>,
}

impl SymphoniaDecoder {
    #[must_use]
    pub fn flac() -> Self {
        Self {
            codec: AudioCodec::Flac,
            decoder: None,
        }
    }

    #[must_use]
    pub fn aac() -> Self {
        Self {
            codec: AudioCodec::Aac,
            decoder: None,
        }
    }

    /// Extracts the STREAMINFO payload from a FLAC stream header.
    ///
    /// Servers send the full `fLaC` header (magic + metadata block header +
    /// 34-byte STREAMINFO); Symphonia wants the bare STREAMINFO block.
    fn flac_stream_info(header: &[u8]) -> Option<&[u8]> {
        if header.len() >= 42 && &header[..4] == b"fLaC" && header[4] & 0x7F == 0 {
            Some(&header[8..42])
        } else if header.len() == 34 {
            Some(header)
        } else {
            None
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn configure(&mut self, format: &AudioFormat) -> DecodeResult<()> {
        use symphonia::core::audio::Channels;
        use symphonia::core::codecs::{CodecParameters, DecoderOptions, CODEC_TYPE_AAC, CODEC_TYPE_FLAC};

        let channels = match format.channels {
            1 => Channels::FRONT_LEFT,
            2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
            other => return Err(DecodeError::UnsupportedChannels(other)),
        };

        let mut params = CodecParameters::new();
        params
            .for_codec(match self.codec {
                AudioCodec::Flac => CODEC_TYPE_FLAC,
                AudioCodec::Aac => CODEC_TYPE_AAC,
                other => return Err(DecodeError::UnsupportedCodec(other.as_str().to_string())),
            })
            .with_sample_rate(format.sample_rate)
            .with_channels(channels)
            .with_bits_per_sample(u32::from(format.bit_depth));

        if let Some(header) = &format.codec_header {
            let extra: &[u8] = match self.codec {
                AudioCodec::Flac => Self::flac_stream_info(header).ok_or_else(|| {
                    DecodeError::Configure("malformed FLAC stream header".to_string())
                })?,
                _ => header,
            };
            params.with_extra_data(extra.to_vec().into_boxed_slice());
        }

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Configure(e.to_string()))?;
        self.decoder = Some(decoder);
        Ok(())
    }

    fn decode(&mut self, compressed: &[u8]) -> DecodeResult<Vec<i16>> {
        use symphonia::core::audio::SampleBuffer;
        use symphonia::core::formats::Packet;

        let decoder = self.decoder.as_mut().ok_or(DecodeError::NotConfigured)?;
        let packet = Packet::new_from_slice(0, 0, 0, compressed);
        let decoded = decoder
            .decode(&packet)
            .map_err(|e| DecodeError::Decode(e.to_string()))?;

        let spec = *decoded.spec();
        let mut buffer = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        Ok(buffer.samples().to_vec())
    }

    fn flush(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
    }

    fn release(&mut self) {
        self.decoder = None;
    }

    fn is_configured(&self) -> bool {
        self.decoder.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline worker
// ─────────────────────────────────────────────────────────────────────────────

/// Commands to the decode worker.
enum DecodeCommand {
    Frame { timestamp_us: i64, payload: Bytes },
    Flush,
}

/// Output of the decode worker.
#[derive(Debug)]
pub enum DecodeOutput {
    /// A decoded buffer for the scheduler.
    Buffer(DecodedBuffer),
    /// Decoding failed after configuration; the current stream is dead.
    Fatal(DecodeError),
}

/// Decode worker handle.
///
/// Frames flow in through a bounded queue and out as [`DecodeOutput`] on the
/// channel given at spawn. Dropping the pipeline drains the queue and
/// releases the codec; [`DecoderPipeline::abort`] discards queued frames
/// instead.
pub struct DecoderPipeline {
    format: AudioFormat,
    input_tx: mpsc::Sender<DecodeCommand>,
    abort: CancellationToken,
    /// Frames dropped because the input queue stayed saturated.
    dropped_inputs: std::sync::atomic::AtomicU64,
}

impl DecoderPipeline {
    /// Configures the codec and starts the decode worker.
    ///
    /// A failed configure releases the partial codec and surfaces the error;
    /// no worker is started.
    pub fn spawn(
        format: AudioFormat,
        output_tx: mpsc::Sender<DecodeOutput>,
    ) -> DecodeResult<Self> {
        let mut decoder = create_decoder(format.codec);
        if let Err(e) = decoder.configure(&format) {
            decoder.release();
            return Err(e);
        }
        log::info!(
            "[Decoder] Configured: codec={}, {}Hz {}ch {}bit, header={}B",
            format.codec.as_str(),
            format.sample_rate,
            format.channels,
            format.bit_depth,
            format.codec_header.as_ref().map_or(0, Bytes::len),
        );

        let (input_tx, mut input_rx) = mpsc::channel::<DecodeCommand>(INPUT_QUEUE_CAPACITY);
        let abort = CancellationToken::new();
        let worker_abort = abort.clone();

        tokio::task::spawn_blocking(move || {
            while let Some(command) = input_rx.blocking_recv() {
                if worker_abort.is_cancelled() {
                    break;
                }
                match command {
                    DecodeCommand::Flush => decoder.flush(),
                    DecodeCommand::Frame {
                        timestamp_us,
                        payload,
                    } => match decoder.decode(&payload) {
                        Ok(samples) if samples.is_empty() => {}
                        Ok(samples) => {
                            let buffer = DecodedBuffer {
                                timestamp_us,
                                samples,
                            };
                            if output_tx.blocking_send(DecodeOutput::Buffer(buffer)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::error!("[Decoder] Fatal decode failure: {}", e);
                            let _ = output_tx.blocking_send(DecodeOutput::Fatal(e));
                            break;
                        }
                    },
                }
            }
            decoder.release();
            log::debug!("[Decoder] Worker released");
        });

        Ok(Self {
            format,
            input_tx,
            abort,
            dropped_inputs: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// The format this pipeline was configured with.
    #[must_use]
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Submits one compressed frame.
    ///
    /// Waits up to ~40 ms for an input slot, then drops the frame with an
    /// error log.
    pub async fn submit(&self, timestamp_us: i64, payload: Bytes) {
        let command = DecodeCommand::Frame {
            timestamp_us,
            payload,
        };
        match self
            .input_tx
            .send_timeout(command, INPUT_SUBMIT_TIMEOUT)
            .await
        {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                let dropped = self
                    .dropped_inputs
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    + 1;
                log::error!(
                    "[Decoder] Input queue saturated, dropping frame ts={}us (total dropped: {})",
                    timestamp_us,
                    dropped
                );
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                log::debug!("[Decoder] Worker gone, frame discarded");
            }
        }
    }

    /// Flushes the codec state without reinitializing it.
    pub async fn flush(&self) {
        let _ = self.input_tx.send(DecodeCommand::Flush).await;
    }

    /// Discards queued frames and releases the codec as soon as possible.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Frames dropped due to input-queue saturation.
    #[must_use]
    pub fn dropped_inputs(&self) -> u64 {
        self.dropped_inputs.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_format(bit_depth: u16) -> AudioFormat {
        AudioFormat::new(AudioCodec::Pcm, 48_000, 2, bit_depth)
    }

    #[test]
    fn pcm16_decodes_little_endian() {
        let mut decoder = PcmDecoder::new();
        decoder.configure(&pcm_format(16)).expect("configure");

        let samples = decoder
            .decode(&[0x01, 0x00, 0xFF, 0xFF, 0x00, 0x80])
            .expect("decode");
        assert_eq!(samples, vec![1, -1, i16::MIN]);
    }

    #[test]
    fn pcm24_scales_to_16_bit() {
        let mut decoder = PcmDecoder::new();
        decoder.configure(&pcm_format(24)).expect("configure");

        // 0x7FFFFF (max positive 24-bit) -> 0x7FFF; 0x800000 (min) -> -32768.
        let samples = decoder
            .decode(&[0xFF, 0xFF, 0x7F, 0x00, 0x00, 0x80])
            .expect("decode");
        assert_eq!(samples, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn pcm_rejects_ragged_payload() {
        let mut decoder = PcmDecoder::new();
        decoder.configure(&pcm_format(16)).expect("configure");
        assert!(matches!(
            decoder.decode(&[0x01, 0x00, 0xFF]),
            Err(DecodeError::Decode(_))
        ));
    }

    #[test]
    fn pcm_rejects_unsupported_bit_depth() {
        let mut decoder = PcmDecoder::new();
        assert!(matches!(
            decoder.configure(&pcm_format(12)),
            Err(DecodeError::UnsupportedBitDepth(12))
        ));
        assert!(!decoder.is_configured());
    }

    #[test]
    fn decode_before_configure_fails() {
        let mut decoder = PcmDecoder::new();
        assert!(matches!(
            decoder.decode(&[0, 0]),
            Err(DecodeError::NotConfigured)
        ));
    }

    #[test]
    fn opus_configures_for_standard_rates() {
        let mut decoder = OpusDecoder::new();
        decoder
            .configure(&AudioFormat::new(AudioCodec::Opus, 48_000, 2, 16))
            .expect("standard opus config");
        assert!(decoder.is_configured());
        decoder.release();
        assert!(!decoder.is_configured());
    }

    #[test]
    fn opus_rejects_surround() {
        let mut decoder = OpusDecoder::new();
        assert!(matches!(
            decoder.configure(&AudioFormat::new(AudioCodec::Opus, 48_000, 6, 16)),
            Err(DecodeError::UnsupportedChannels(6))
        ));
    }

    #[test]
    fn flac_stream_info_strips_container_header() {
        let mut header = Vec::new();
        header.extend_from_slice(b"fLaC");
        header.push(0x80); // last-block flag + STREAMINFO type
        header.extend_from_slice(&[0, 0, 34]); // block length
        header.extend_from_slice(&[0xAB; 34]);

        let info = SymphoniaDecoder::flac_stream_info(&header).expect("strip");
        assert_eq!(info.len(), 34);
        assert!(info.iter().all(|&b| b == 0xAB));

        // Bare STREAMINFO passes through.
        let bare = [0xCD; 34];
        assert_eq!(
            SymphoniaDecoder::flac_stream_info(&bare).expect("bare"),
            &bare
        );

        assert!(SymphoniaDecoder::flac_stream_info(&[0u8; 10]).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pipeline_decodes_in_arrival_order() {
        let (output_tx, mut output_rx) = mpsc::channel(16);
        let pipeline = DecoderPipeline::spawn(pcm_format(16), output_tx).expect("spawn");

        pipeline
            .submit(1_000, Bytes::from_static(&[0x01, 0x00, 0x02, 0x00]))
            .await;
        pipeline
            .submit(2_000, Bytes::from_static(&[0x03, 0x00, 0x04, 0x00]))
            .await;

        let first = match output_rx.recv().await.expect("first buffer") {
            DecodeOutput::Buffer(b) => b,
            other => panic!("unexpected output: {:?}", other),
        };
        assert_eq!(first.timestamp_us, 1_000);
        assert_eq!(first.samples, vec![1, 2]);

        let second = match output_rx.recv().await.expect("second buffer") {
            DecodeOutput::Buffer(b) => b,
            other => panic!("unexpected output: {:?}", other),
        };
        assert_eq!(second.timestamp_us, 2_000);
        assert_eq!(second.samples, vec![3, 4]);

        // Dropping the pipeline drains and closes the output side.
        drop(pipeline);
        assert!(output_rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pipeline_surfaces_fatal_decode_errors() {
        let (output_tx, mut output_rx) = mpsc::channel(16);
        let pipeline = DecoderPipeline::spawn(pcm_format(16), output_tx).expect("spawn");

        // Ragged payload is fatal for the stream.
        pipeline.submit(1_000, Bytes::from_static(&[0x01])).await;

        match output_rx.recv().await.expect("fatal output") {
            DecodeOutput::Fatal(DecodeError::Decode(_)) => {}
            other => panic!("expected fatal error, got {:?}", other),
        }
        drop(pipeline);
    }

    #[tokio::test]
    async fn configure_failure_surfaces_without_worker() {
        let (output_tx, _output_rx) = mpsc::channel(4);
        match DecoderPipeline::spawn(pcm_format(12), output_tx) {
            Err(DecodeError::UnsupportedBitDepth(12)) => {}
            other => panic!("expected configure failure, got {:?}", other.err()),
        }
    }
}

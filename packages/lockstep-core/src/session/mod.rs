//! Session state machine.
//!
//! One engine instance per connection attempt. The engine owns the protocol
//! conversation: handshake, continuous time sync, stream framing, playback
//! state reporting and command dispatch. All mutations happen on the engine's
//! own task; the host communicates through [`EngineCommand`]s and observes
//! through the event bus.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::audio::{
    run_playout, AudioCodec, AudioFormat, DecodeOutput, DecoderPipeline, OutputSink, Scheduler,
    SchedulerConfig, SchedulerStats,
};
use crate::clock;
use crate::config::CoreConfig;
use crate::events::{EventBus, PlayerEvent, SessionEvent, StreamEvent, SyncEvent};
use crate::protocol::{
    self, BinaryFrame, ClientHello, ClientState, DeviceInfo, FrameKind, GroupUpdate, Message,
    Metadata, PlaybackState, PlayerStateInfo, PlayerSupport, PlayerSyncState, ProtocolError,
    ServerHello, StreamPlayerConfig,
};
use crate::timesync::{BurstSyncManager, FilterStats, TimeFilter, TimeMeasurement};
use crate::transport::{Transport, TransportError, TransportEvent};

/// Handshake must complete within this after the transport connects.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of sync-quality events while connected.
const SYNC_QUALITY_INTERVAL: Duration = Duration::from_secs(5);

/// Reference format (48 kHz stereo 16-bit) used to express the buffer
/// capacity in milliseconds for `client/hello`.
const CAPACITY_REFERENCE_BYTES_PER_SEC: u64 = 48_000 * 2 * 2;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Connected,
    StreamActive,
    Closing,
    Failed,
}

/// How a session ended; drives the supervisor's next move.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The user asked for the disconnect; no reconnection.
    UserDisconnect,
    /// The server closed normally (code 1000); no reconnection.
    CleanClose,
    /// The handshake did not complete.
    HandshakeFailed(String),
    /// The transport failed; recoverability decides reconnection.
    TransportFailed(TransportError),
}

/// Host requests to a running session.
#[derive(Debug)]
pub enum EngineCommand {
    /// Local volume change (0–100).
    SetVolume(u8),
    /// Local mute change.
    SetMuted(bool),
    /// Adjust the audio-path calibration.
    SetStaticDelay(f64),
    /// Clean user-initiated disconnect.
    Disconnect,
    /// Telemetry snapshot request.
    Snapshot(oneshot::Sender<EngineSnapshot>),
}

/// Transient telemetry snapshot. Never persisted by the core.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub session_state: SessionState,
    pub current_format: Option<AudioFormat>,
    pub last_metadata: Option<Metadata>,
    pub filter_stats: FilterStats,
    #[serde(skip)]
    pub scheduler_stats: SchedulerStats,
}

/// Group membership as last reported by the server.
#[derive(Debug, Clone, Default)]
pub struct GroupState {
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub playback_state: PlaybackState,
}

/// Everything a session engine needs to run.
pub struct EngineContext {
    pub transport: Arc<dyn Transport>,
    pub transport_rx: mpsc::Receiver<TransportEvent>,
    pub command_rx: mpsc::Receiver<EngineCommand>,
    pub filter: Arc<Mutex<TimeFilter>>,
    pub burst: Arc<BurstSyncManager>,
    pub sink: Arc<dyn OutputSink>,
    pub events: EventBus,
    pub config: CoreConfig,
    /// Client identity advertised in `client/hello`.
    pub client_id: String,
    pub client_name: String,
}

/// Decoded output tagged with the stream epoch that produced it, so buffers
/// from a torn-down decoder cannot leak into a newer stream.
type EpochOutput = (u64, DecodeOutput);

/// The session state machine.
pub struct SessionEngine {
    transport: Arc<dyn Transport>,
    transport_rx: Option<mpsc::Receiver<TransportEvent>>,
    command_rx: Option<mpsc::Receiver<EngineCommand>>,
    filter: Arc<Mutex<TimeFilter>>,
    burst: Arc<BurstSyncManager>,
    scheduler: Arc<Scheduler>,
    sink: Arc<dyn OutputSink>,
    events: EventBus,
    config: CoreConfig,
    client_id: String,
    client_name: String,

    state: SessionState,
    server: Option<ServerHello>,
    volume: u8,
    muted: bool,
    format: Option<AudioFormat>,
    metadata: Option<Metadata>,
    group: GroupState,
    pipeline: Option<DecoderPipeline>,
    /// Monotonic stream counter; gates stale decode output.
    stream_epoch: u64,
    /// Sender half handed to the burst manager for measurements.
    burst_response_tx: Option<mpsc::Sender<TimeMeasurement>>,
    /// Tears down the playout task with the engine.
    playout_cancel: CancellationToken,
    converged_reported: bool,
}

impl SessionEngine {
    /// Builds an engine around a connecting transport.
    #[must_use]
    pub fn new(context: EngineContext) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&context.filter),
            SchedulerConfig::from_core(&context.config),
        ));
        Self {
            transport: context.transport,
            transport_rx: Some(context.transport_rx),
            command_rx: Some(context.command_rx),
            filter: context.filter,
            burst: context.burst,
            scheduler,
            sink: context.sink,
            events: context.events,
            config: context.config,
            client_id: context.client_id,
            client_name: context.client_name,
            state: SessionState::Idle,
            server: None,
            volume: 100,
            muted: false,
            format: None,
            metadata: None,
            group: GroupState::default(),
            pipeline: None,
            stream_epoch: 0,
            burst_response_tx: None,
            playout_cancel: CancellationToken::new(),
            converged_reported: false,
        }
    }

    /// Exposes the scheduler (telemetry, tests).
    #[must_use]
    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Runs the session to completion.
    pub async fn run(mut self) -> SessionOutcome {
        let mut transport_rx = self.transport_rx.take().expect("run called once");
        let mut command_rx = self.command_rx.take().expect("run called once");

        self.set_state(SessionState::Connecting);

        // If the supervisor drops this future mid-session, the guard still
        // tears the playout task down.
        let _playout_guard = self.playout_cancel.clone().drop_guard();
        tokio::spawn(run_playout(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.sink),
            self.playout_cancel.clone(),
        ));

        // Time requests from the burst manager are stamped here so t1 is as
        // close to the actual send as possible.
        let (burst_request_tx, mut burst_request_rx) = mpsc::channel::<()>(16);

        // Engine-lifetime decode channel; per-stream pipelines forward into
        // it tagged with their epoch.
        let (decode_tx, mut decode_rx) = mpsc::channel::<EpochOutput>(64);

        let mut handshake_deadline: Option<tokio::time::Instant> = None;
        let mut quality_ticker = tokio::time::interval(SYNC_QUALITY_INTERVAL);
        quality_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                event = transport_rx.recv() => {
                    let Some(event) = event else {
                        break SessionOutcome::TransportFailed(TransportError::NotConnected);
                    };
                    let action = self
                        .handle_transport_event(event, &burst_request_tx, &decode_tx)
                        .await;
                    match action {
                        EngineAction::Continue => {}
                        EngineAction::ArmHandshakeTimer => {
                            handshake_deadline =
                                Some(tokio::time::Instant::now() + HANDSHAKE_TIMEOUT);
                        }
                        EngineAction::DisarmHandshakeTimer => handshake_deadline = None,
                        EngineAction::End(outcome) => break outcome,
                    }
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        // Host dropped the handle; treat as user disconnect.
                        self.shutdown_clean("host_dropped").await;
                        break SessionOutcome::UserDisconnect;
                    };
                    if let Some(outcome) = self.handle_command(command).await {
                        break outcome;
                    }
                }

                Some(()) = burst_request_rx.recv() => {
                    let t1 = clock::now_micros();
                    self.send_message(&Message::ClientTime { client_transmitted: t1 }).await;
                }

                Some((epoch, output)) = decode_rx.recv() => {
                    self.handle_decode_output(epoch, output);
                }

                _ = sleep_until_or_pending(handshake_deadline), if handshake_deadline.is_some() => {
                    log::warn!("[Session] Handshake timed out after {:?}", HANDSHAKE_TIMEOUT);
                    self.fail_session();
                    break SessionOutcome::HandshakeFailed(format!(
                        "no server/hello within {:?}",
                        HANDSHAKE_TIMEOUT
                    ));
                }

                _ = quality_ticker.tick() => {
                    self.report_sync_quality();
                }
            }
        };

        self.teardown();
        outcome
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transport events
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        burst_request_tx: &mpsc::Sender<()>,
        decode_tx: &mpsc::Sender<EpochOutput>,
    ) -> EngineAction {
        match event {
            TransportEvent::Connected => {
                self.begin_handshake().await;
                EngineAction::ArmHandshakeTimer
            }
            TransportEvent::Text(text) => match protocol::parse_message(&text) {
                Ok(message) => {
                    self.handle_message(message, burst_request_tx, decode_tx)
                        .await
                }
                Err(e) => {
                    if self.state == SessionState::Handshaking {
                        // A hello we cannot parse means no session.
                        log::error!("[Session] Handshake message unparseable: {}", e);
                        self.fail_session();
                        return EngineAction::End(SessionOutcome::HandshakeFailed(e.to_string()));
                    }
                    log::warn!("[Session] Dropping malformed message: {}", e);
                    EngineAction::Continue
                }
            },
            TransportEvent::Binary(data) => {
                self.handle_binary(data).await;
                EngineAction::Continue
            }
            TransportEvent::Closing => {
                self.set_state(SessionState::Closing);
                EngineAction::Continue
            }
            TransportEvent::Closed { code, reason } => {
                log::info!("[Session] Transport closed: code={}, reason={}", code, reason);
                if code == 1000 {
                    self.burst.stop();
                    self.filter.lock().freeze();
                    self.set_state(SessionState::Idle);
                    self.events.emit(SessionEvent::Disconnected {
                        reason: if reason.is_empty() {
                            "server_close".to_string()
                        } else {
                            reason
                        },
                        user_initiated: false,
                    });
                    EngineAction::End(SessionOutcome::CleanClose)
                } else {
                    self.fail_session();
                    EngineAction::End(SessionOutcome::TransportFailed(
                        TransportError::RemoteClosed { code, reason },
                    ))
                }
            }
            TransportEvent::Failure { error } => {
                log::warn!("[Session] Transport failure: {}", error);
                self.fail_session();
                EngineAction::End(SessionOutcome::TransportFailed(error))
            }
        }
    }

    async fn begin_handshake(&mut self) {
        self.set_state(SessionState::Handshaking);

        // State frozen by a previous clean disconnect seeds the resumed
        // session; a no-op when nothing is parked.
        if self.filter.lock().thaw() {
            log::info!("[Session] Resumed frozen clock state");
        }

        let supported_formats = self
            .config
            .codec_preference
            .iter()
            .filter_map(|name| AudioCodec::from_wire(name))
            .map(|codec| protocol::AudioFormatSpec {
                codec: codec.as_str().to_string(),
                sample_rate: 48_000,
                channels: 2,
                bit_depth: 16,
            })
            .collect();

        let buffer_capacity_ms =
            self.config.output_buffer_capacity as u64 * 1_000 / CAPACITY_REFERENCE_BYTES_PER_SEC;

        let hello = Message::ClientHello(ClientHello {
            client_id: self.client_id.clone(),
            name: self.client_name.clone(),
            version: 1,
            supported_roles: vec!["player@v1".to_string()],
            device_info: Some(DeviceInfo {
                product_name: Some(self.client_name.clone()),
                manufacturer: Some("Lockstep".to_string()),
                software_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            player_support: Some(PlayerSupport {
                supported_formats,
                buffer_capacity: buffer_capacity_ms,
                supported_commands: vec!["volume".to_string(), "mute".to_string()],
            }),
        });
        self.send_message(&hello).await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Protocol messages
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_message(
        &mut self,
        message: Message,
        burst_request_tx: &mpsc::Sender<()>,
        decode_tx: &mpsc::Sender<EpochOutput>,
    ) -> EngineAction {
        match message {
            Message::ServerHello(hello) => {
                self.complete_handshake(hello, burst_request_tx).await;
                EngineAction::DisarmHandshakeTimer
            }
            Message::ServerTime {
                client_transmitted,
                server_received,
                server_transmitted,
            } => {
                let t4 = clock::now_micros();
                let measurement = TimeMeasurement::from_timestamps(
                    client_transmitted,
                    server_received,
                    server_transmitted,
                    t4,
                );
                if let Some(tx) = &self.burst_response_tx {
                    if tx.try_send(measurement).is_err() {
                        log::debug!("[Session] Burst window full, time response dropped");
                    }
                }
                self.maybe_report_convergence();
                EngineAction::Continue
            }
            Message::ServerState(state) => {
                if let Some(metadata) = state.metadata {
                    self.metadata = Some(metadata.clone());
                    self.events.emit(PlayerEvent::MetadataUpdated { metadata });
                }
                EngineAction::Continue
            }
            Message::StreamStart(start) => {
                match start.player {
                    Some(player) => self.start_stream(player, decode_tx).await,
                    None => log::warn!("[Session] stream/start without player config"),
                }
                EngineAction::Continue
            }
            Message::StreamEnd(_) => {
                self.end_stream().await;
                EngineAction::Continue
            }
            Message::StreamClear(_) => {
                self.clear_stream();
                EngineAction::Continue
            }
            Message::ServerCommand(command) => {
                if let Some(player) = command.player {
                    self.handle_player_command(player).await;
                } else if command.controller.is_some() {
                    log::debug!("[Session] Ignoring controller command (player role only)");
                }
                EngineAction::Continue
            }
            Message::GroupUpdate(update) => {
                self.handle_group_update(update);
                EngineAction::Continue
            }
            Message::SyncOffset(offset) => {
                log::info!(
                    "[Session] Server adjusted static delay: {}ms (source: {})",
                    offset.offset_ms,
                    offset.source.as_deref().unwrap_or("unknown")
                );
                self.filter.lock().set_static_delay_ms(offset.offset_ms);
                self.events.emit(PlayerEvent::StaticDelayChanged {
                    delay_ms: offset.offset_ms,
                    source: offset.source,
                });
                EngineAction::Continue
            }
            Message::Unknown => {
                log::debug!("[Session] Ignoring unknown message type");
                EngineAction::Continue
            }
            other => {
                log::warn!(
                    "[Session] Dropping unexpected client-direction message: {}",
                    other.kind()
                );
                EngineAction::Continue
            }
        }
    }

    async fn complete_handshake(
        &mut self,
        hello: ServerHello,
        burst_request_tx: &mpsc::Sender<()>,
    ) {
        if self.state != SessionState::Handshaking {
            log::warn!("[Session] Unexpected server/hello in state {:?}", self.state);
            return;
        }
        log::info!(
            "[Session] Connected to '{}' (id={}, roles={:?})",
            hello.name,
            hello.server_id,
            hello.active_roles
        );

        self.events.emit(SessionEvent::Connected {
            server_name: hello.name.clone(),
            server_id: hello.server_id.clone(),
        });
        self.server = Some(hello);
        self.set_state(SessionState::Connected);

        self.send_player_state().await;

        // Time sync starts the moment we are connected.
        self.burst_response_tx = Some(self.burst.start(burst_request_tx.clone()));
    }

    async fn handle_player_command(&mut self, command: protocol::PlayerCommand) {
        match command.command.as_str() {
            "volume" => {
                let volume = command
                    .volume
                    .unwrap_or(i64::from(self.volume))
                    .clamp(0, 100) as u8;
                if volume != self.volume {
                    self.volume = volume;
                    self.events.emit(PlayerEvent::VolumeChanged { volume });
                    self.send_player_state().await;
                }
            }
            "mute" => {
                let muted = command.muted.unwrap_or(self.muted);
                if muted != self.muted {
                    self.muted = muted;
                    self.events.emit(PlayerEvent::MuteChanged { muted });
                    self.send_player_state().await;
                }
            }
            other => {
                log::warn!("[Session] Dropping unknown player command: {}", other);
            }
        }
    }

    fn handle_group_update(&mut self, update: GroupUpdate) {
        if let Some(group_id) = update.group_id {
            self.group.group_id = Some(group_id);
        }
        if let Some(group_name) = update.group_name {
            self.group.group_name = Some(group_name);
        }
        if let Some(playback_state) = update.playback_state {
            self.group.playback_state = playback_state;
        }
        self.events.emit(PlayerEvent::GroupUpdated {
            group_id: self.group.group_id.clone(),
            group_name: self.group.group_name.clone(),
            playback_state: self.group.playback_state,
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Streams
    // ─────────────────────────────────────────────────────────────────────────

    async fn start_stream(
        &mut self,
        player: StreamPlayerConfig,
        decode_tx: &mpsc::Sender<EpochOutput>,
    ) {
        let Some(codec) = AudioCodec::from_wire(&player.codec) else {
            log::error!(
                "[Session] stream/start with unsupported codec '{}'",
                player.codec
            );
            self.events.emit(SessionEvent::Error {
                code: "unsupported_codec",
                message: format!("server offered codec '{}'", player.codec),
            });
            return;
        };

        let codec_header = match player.codec_header.as_deref() {
            Some(encoded) => match protocol::decode_codec_header(encoded) {
                Ok(bytes) => Some(Bytes::from(bytes)),
                Err(e) => {
                    log::error!("[Session] Rejecting stream: {}", e);
                    self.events.emit(SessionEvent::Error {
                        code: "invalid_codec_header",
                        message: e.to_string(),
                    });
                    return;
                }
            },
            None => None,
        };

        // Any previous decoder is torn down before the new one exists.
        if let Some(old) = self.pipeline.take() {
            old.abort();
        }
        self.stream_epoch += 1;

        let format = AudioFormat {
            codec,
            sample_rate: player.sample_rate,
            channels: player.channels,
            bit_depth: player.bit_depth,
            codec_header,
        };

        let (output_tx, mut output_rx) = mpsc::channel(64);
        match DecoderPipeline::spawn(format.clone(), output_tx) {
            Ok(pipeline) => {
                if let Err(e) = self.sink.configure(&format) {
                    log::error!("[Session] Output sink rejected format: {}", e);
                    pipeline.abort();
                    self.events.emit(SessionEvent::Error {
                        code: "sink_configure_failed",
                        message: e,
                    });
                    return;
                }
                self.sink.resume();

                // Forward decoder output into the engine loop, tagged with
                // this stream's epoch.
                let epoch = self.stream_epoch;
                let forward_tx = decode_tx.clone();
                tokio::spawn(async move {
                    while let Some(output) = output_rx.recv().await {
                        if forward_tx.send((epoch, output)).await.is_err() {
                            return;
                        }
                    }
                });

                self.pipeline = Some(pipeline);
                self.format = Some(format.clone());
                self.set_state(SessionState::StreamActive);
                self.events.emit(StreamEvent::Started { format });
            }
            Err(e) => {
                log::error!("[Session] Decoder configuration failed: {}", e);
                self.events.emit(SessionEvent::Error {
                    code: "decoder_configure_failed",
                    message: e.to_string(),
                });
            }
        }
    }

    /// `stream/end`: drain and hold. Queued audio plays out.
    async fn end_stream(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.flush().await;
            // Graceful: dropping the handle lets the worker drain its queue.
            drop(pipeline);
        }
        self.format = None;
        if self.state == SessionState::StreamActive {
            self.set_state(SessionState::Connected);
        }
        self.events.emit(StreamEvent::Ended);
    }

    /// `stream/clear`: the stream is a new logical session. Queued audio,
    /// decoder state and the time filter are all discarded.
    fn clear_stream(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
        self.stream_epoch += 1;
        self.scheduler.flush();
        self.sink.flush();
        self.filter.lock().reset_and_discard();
        self.converged_reported = false;
        self.format = None;
        if self.state == SessionState::StreamActive {
            self.set_state(SessionState::Connected);
        }
        self.events.emit(StreamEvent::Cleared);
    }

    async fn handle_binary(&mut self, data: Bytes) {
        match BinaryFrame::parse(&data) {
            Ok(frame) => match frame.kind {
                FrameKind::Audio => {
                    if let Some(pipeline) = &self.pipeline {
                        pipeline.submit(frame.timestamp_us, frame.payload).await;
                    } else {
                        log::debug!("[Session] Audio frame outside an active stream, dropped");
                    }
                }
                FrameKind::Artwork(channel) => {
                    self.events.emit(StreamEvent::ArtworkChunk {
                        channel,
                        data: frame.payload,
                    });
                }
                FrameKind::Visualizer => {
                    self.events.emit(StreamEvent::VisualizerFrame {
                        data: frame.payload,
                    });
                }
            },
            Err(ProtocolError::UnknownFrameType { tag }) => {
                log::warn!("[Session] Dropping binary frame with unknown type {}", tag);
            }
            Err(e) => {
                log::warn!("[Session] Dropping malformed binary frame: {}", e);
            }
        }
    }

    fn handle_decode_output(&mut self, epoch: u64, output: DecodeOutput) {
        if epoch != self.stream_epoch {
            log::debug!("[Session] Discarding decode output from stale stream {}", epoch);
            return;
        }
        match output {
            DecodeOutput::Buffer(buffer) => {
                self.scheduler.enqueue(buffer);
            }
            DecodeOutput::Fatal(error) => {
                // The stream is dead; the session stays connected and waits
                // for a fresh stream/start.
                log::error!("[Session] Aborting stream after decoder failure: {}", error);
                if let Some(pipeline) = self.pipeline.take() {
                    pipeline.abort();
                }
                self.stream_epoch += 1;
                self.scheduler.flush();
                self.format = None;
                if self.state == SessionState::StreamActive {
                    self.set_state(SessionState::Connected);
                }
                self.events.emit(SessionEvent::Error {
                    code: "decoder_failed",
                    message: error.to_string(),
                });
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands & lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: EngineCommand) -> Option<SessionOutcome> {
        match command {
            EngineCommand::SetVolume(volume) => {
                self.volume = volume.min(100);
                self.events.emit(PlayerEvent::VolumeChanged {
                    volume: self.volume,
                });
                self.send_player_state().await;
                None
            }
            EngineCommand::SetMuted(muted) => {
                self.muted = muted;
                self.events.emit(PlayerEvent::MuteChanged { muted });
                self.send_player_state().await;
                None
            }
            EngineCommand::SetStaticDelay(delay_ms) => {
                self.filter.lock().set_static_delay_ms(delay_ms);
                self.events.emit(PlayerEvent::StaticDelayChanged {
                    delay_ms,
                    source: Some("host".to_string()),
                });
                None
            }
            EngineCommand::Disconnect => {
                self.shutdown_clean("user_disconnect").await;
                Some(SessionOutcome::UserDisconnect)
            }
            EngineCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
                None
            }
        }
    }

    /// Ordered clean shutdown: goodbye → burst stop → filter freeze →
    /// transport close.
    async fn shutdown_clean(&mut self, reason: &str) {
        self.set_state(SessionState::Closing);
        self.send_message(&Message::ClientGoodbye {
            reason: reason.to_string(),
        })
        .await;
        self.burst.stop();
        self.filter.lock().freeze();
        self.transport.close(1000, reason).await;
        self.set_state(SessionState::Idle);
        self.events.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
            user_initiated: true,
        });
    }

    /// Failure path: burst stopped, live filter state discarded.
    fn fail_session(&mut self) {
        self.burst.stop();
        self.filter.lock().reset();
        self.set_state(SessionState::Failed);
    }

    fn teardown(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
        self.scheduler.flush();
        self.playout_cancel.cancel();
        self.burst.stop();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("[Session] {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.emit(SessionEvent::StateChanged { state });
        }
    }

    async fn send_message(&self, message: &Message) {
        match protocol::encode_message(message) {
            Ok(json) => {
                if !self.transport.send_text(&json).await {
                    log::warn!(
                        "[Session] Could not send {} (not connected)",
                        message.kind()
                    );
                }
            }
            Err(e) => log::error!("[Session] Failed to encode {}: {}", message.kind(), e),
        }
    }

    async fn send_player_state(&self) {
        let message = Message::ClientState(ClientState {
            state: PlayerSyncState::Synchronized,
            player: PlayerStateInfo {
                volume: self.volume,
                muted: self.muted,
            },
        });
        self.send_message(&message).await;
    }

    fn maybe_report_convergence(&mut self) {
        if !self.converged_reported && self.filter.lock().is_converged() {
            self.converged_reported = true;
            self.events.emit(SyncEvent::Converged);
        }
    }

    fn report_sync_quality(&self) {
        if matches!(
            self.state,
            SessionState::Connected | SessionState::StreamActive
        ) {
            let stats = self.filter.lock().stats();
            self.events.emit(SyncEvent::QualityUpdated { stats });
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            session_state: self.state,
            current_format: self.format.clone(),
            last_metadata: self.metadata.clone(),
            filter_stats: self.filter.lock().stats(),
            scheduler_stats: self.scheduler.stats(),
        }
    }
}

/// What the engine loop should do after handling a transport event.
enum EngineAction {
    Continue,
    ArmHandshakeTimer,
    DisarmHandshakeTimer,
    End(SessionOutcome),
}

/// Sleeps until the deadline, or parks forever when there is none. Guarded
/// by an `if` in the select arm, so the pending branch is never polled.
async fn sleep_until_or_pending(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::audio::{AudioFormat, OutputSink, Scheduler, SinkPush};
use crate::clock;
use crate::config::CoreConfig;
use crate::events::{CoreEvent, EventBus, PlayerEvent, SessionEvent, StreamEvent};
use crate::protocol::{BinaryFrame, FrameKind, Message};
use crate::timesync::{BurstSyncManager, TimeFilter, TimeMeasurement};
use crate::transport::{
    Transport, TransportEvent, TransportKind, TransportResult, TransportState,
};

use super::{EngineCommand, EngineContext, SessionEngine, SessionOutcome, SessionState};

/// Transport double: records outbound messages, lets tests inject inbound
/// events through the channel handed to the engine.
struct FakeTransport {
    sent: Mutex<Vec<Message>>,
    closed_with: Mutex<Option<(u16, String)>>,
    connected: AtomicBool,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            closed_with: Mutex::new(None),
            connected: AtomicBool::new(true),
        })
    }

    fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Outbound messages excluding time-sync chatter.
    fn sent_non_time(&self) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|m| !matches!(m, Message::ClientTime { .. }))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn send_text(&self, text: &str) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let message = crate::protocol::parse_message(text).expect("engine sends valid JSON");
        self.sent.lock().push(message);
        true
    }

    async fn send_binary(&self, _data: &[u8]) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self, code: u16, reason: &str) {
        *self.closed_with.lock() = Some((code, reason.to_string()));
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn destroy(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn state(&self) -> TransportState {
        if self.connected.load(Ordering::SeqCst) {
            TransportState::Connected
        } else {
            TransportState::Closed
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }
}

/// Sink double that accepts everything immediately.
struct NullSink;

impl OutputSink for NullSink {
    fn configure(&self, _format: &AudioFormat) -> Result<(), String> {
        Ok(())
    }
    fn push(&self, _deadline_us: i64, _pcm: &[i16]) -> SinkPush {
        SinkPush::Accepted
    }
    fn pause(&self) {}
    fn resume(&self) {}
    fn flush(&self) {}
    fn latency_floor_us(&self) -> i64 {
        0
    }
}

struct Harness {
    transport: Arc<FakeTransport>,
    inject_tx: mpsc::Sender<TransportEvent>,
    command_tx: mpsc::Sender<EngineCommand>,
    events_rx: broadcast::Receiver<CoreEvent>,
    filter: Arc<Mutex<TimeFilter>>,
    scheduler: Arc<Scheduler>,
    handle: JoinHandle<SessionOutcome>,
}

fn spawn_engine() -> Harness {
    let filter = Arc::new(Mutex::new(TimeFilter::new()));
    let burst = Arc::new(BurstSyncManager::new(Arc::clone(&filter)));
    spawn_engine_with(filter, burst)
}

/// Spawns an engine over caller-owned sync state, as the supervisor does
/// when it rebuilds a session on the same endpoint.
fn spawn_engine_with(filter: Arc<Mutex<TimeFilter>>, burst: Arc<BurstSyncManager>) -> Harness {
    let transport = FakeTransport::new();
    let (inject_tx, transport_rx) = mpsc::channel(64);
    let (command_tx, command_rx) = mpsc::channel(16);
    let events = EventBus::new();
    let events_rx = events.subscribe();

    let engine = SessionEngine::new(EngineContext {
        transport: Arc::clone(&transport) as Arc<dyn Transport>,
        transport_rx,
        command_rx,
        filter: Arc::clone(&filter),
        burst,
        sink: Arc::new(NullSink),
        events,
        config: CoreConfig::default(),
        client_id: "test-client-id".to_string(),
        client_name: "Test Player".to_string(),
    });
    let scheduler = engine.scheduler();
    let handle = tokio::spawn(engine.run());

    Harness {
        transport,
        inject_tx,
        command_tx,
        events_rx,
        filter,
        scheduler,
        handle,
    }
}

async fn inject(harness: &Harness, event: TransportEvent) {
    harness.inject_tx.send(event).await.expect("engine alive");
}

async fn inject_text(harness: &Harness, json: &str) {
    inject(harness, TransportEvent::Text(json.to_string())).await;
}

const SERVER_HELLO: &str = r#"{"type":"server/hello","payload":{"name":"Bedroom","server_id":"s1","connection_reason":"discovery","active_roles":["player@v1"]}}"#;

async fn next_event(harness: &mut Harness) -> CoreEvent {
    tokio::time::timeout(Duration::from_secs(2), harness.events_rx.recv())
        .await
        .expect("event within deadline")
        .expect("event bus open")
}

/// Waits until the fake transport has recorded `n` non-time messages.
async fn wait_for_sent(harness: &Harness, n: usize) {
    for _ in 0..200 {
        if harness.transport.sent_non_time().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "only {} messages sent, wanted {}",
        harness.transport.sent_non_time().len(),
        n
    );
}

/// Drives a fresh engine through the handshake.
async fn handshake(harness: &mut Harness) {
    inject(harness, TransportEvent::Connected).await;
    inject_text(harness, SERVER_HELLO).await;
    wait_for_sent(harness, 2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_handshake_sends_hello_then_state() {
    let mut harness = spawn_engine();
    handshake(&mut harness).await;

    let sent = harness.transport.sent_non_time();
    match &sent[0] {
        Message::ClientHello(hello) => {
            assert_eq!(hello.version, 1);
            assert_eq!(hello.supported_roles, vec!["player@v1".to_string()]);
            let support = hello.player_support.as_ref().expect("capabilities");
            assert!(!support.supported_formats.is_empty());
        }
        other => panic!("first message must be client/hello, got {}", other.kind()),
    }
    match &sent[1] {
        Message::ClientState(state) => {
            assert_eq!(state.player.volume, 100);
            assert!(!state.player.muted);
        }
        other => panic!("second message must be client/state, got {}", other.kind()),
    }
    assert_eq!(sent.len(), 2, "nothing else before server traffic");

    // State walked connecting -> handshaking -> connected.
    let mut states = Vec::new();
    while states.len() < 3 {
        if let CoreEvent::Session(SessionEvent::StateChanged { state }) =
            next_event(&mut harness).await
        {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            SessionState::Connecting,
            SessionState::Handshaking,
            SessionState::Connected
        ]
    );

    harness.handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_time_measurements_reach_the_filter() {
    let mut harness = spawn_engine();
    handshake(&mut harness).await;

    // Wait for the burst manager's first time request, then answer it with a
    // full burst worth of consistent responses.
    for _ in 0..200 {
        if harness
            .transport
            .sent_messages()
            .iter()
            .any(|m| matches!(m, Message::ClientTime { .. }))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let requests: Vec<i64> = harness
        .transport
        .sent_messages()
        .iter()
        .filter_map(|m| match m {
            Message::ClientTime { client_transmitted } => Some(*client_transmitted),
            _ => None,
        })
        .collect();
    assert!(!requests.is_empty(), "burst manager must request time");

    for t1 in requests {
        // Server 1000 µs ahead, 2 ms RTT.
        let response = format!(
            r#"{{"type":"server/time","payload":{{"client_transmitted":{},"server_received":{},"server_transmitted":{}}}}}"#,
            t1,
            t1 + 1_000 + 2_000,
            t1 + 1_000 + 2_100,
        );
        inject_text(&harness, &response).await;
    }

    // Best-of-burst lands in the filter after the straggler window.
    for _ in 0..300 {
        if harness.filter.lock().measurement_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        harness.filter.lock().measurement_count() > 0,
        "filter never saw a measurement"
    );

    harness.handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_clear_discards_queue_and_filter() {
    let mut harness = spawn_engine();
    handshake(&mut harness).await;

    // Warm the filter to readiness.
    {
        let mut filter = harness.filter.lock();
        let base = clock::now_micros();
        for i in 0..6 {
            filter.ingest(TimeMeasurement {
                offset_us: 1_000,
                max_error_us: 2_000,
                client_recv_us: base + i * 100_000,
                rtt_us: 4_000,
            });
        }
        assert!(filter.is_ready());
    }

    inject_text(
        &harness,
        r#"{"type":"stream/start","payload":{"player":{"codec":"pcm","sample_rate":48000,"channels":2,"bit_depth":16}}}"#,
    )
    .await;

    // An audio frame destined well into the future stays queued.
    let timestamp = harness.filter.lock().client_to_server(clock::now_micros() + 500_000);
    let frame = BinaryFrame::build(FrameKind::Audio, timestamp, &[0x01, 0x00, 0x02, 0x00]);
    inject(&harness, TransportEvent::Binary(frame.into())).await;

    for _ in 0..200 {
        if harness.scheduler.stats().queued_buffers > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(harness.scheduler.stats().queued_buffers > 0, "frame never queued");

    inject_text(&harness, r#"{"type":"stream/clear","payload":{}}"#).await;

    loop {
        if let CoreEvent::Stream(StreamEvent::Cleared) = next_event(&mut harness).await {
            break;
        }
    }

    assert!(harness.scheduler.is_empty(), "scheduler must be flushed");
    let filter = harness.filter.lock();
    assert!(!filter.is_ready(), "filter must be discarded");
    assert_eq!(filter.offset_us(), 0);

    harness.handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_volume_is_clamped_to_valid_range() {
    let mut harness = spawn_engine();
    handshake(&mut harness).await;

    inject_text(
        &harness,
        r#"{"type":"server/command","payload":{"player":{"command":"volume","volume":30}}}"#,
    )
    .await;
    loop {
        if let CoreEvent::Player(PlayerEvent::VolumeChanged { volume }) =
            next_event(&mut harness).await
        {
            assert_eq!(volume, 30);
            break;
        }
    }

    // 140 clamps to 100.
    inject_text(
        &harness,
        r#"{"type":"server/command","payload":{"player":{"command":"volume","volume":140}}}"#,
    )
    .await;
    loop {
        if let CoreEvent::Player(PlayerEvent::VolumeChanged { volume }) =
            next_event(&mut harness).await
        {
            assert_eq!(volume, 100);
            break;
        }
    }

    // Unknown commands are dropped without killing the session.
    inject_text(
        &harness,
        r#"{"type":"server/command","payload":{"player":{"command":"teleport"}}}"#,
    )
    .await;
    inject_text(
        &harness,
        r#"{"type":"server/command","payload":{"player":{"command":"mute","muted":true}}}"#,
    )
    .await;
    loop {
        if let CoreEvent::Player(PlayerEvent::MuteChanged { muted }) =
            next_event(&mut harness).await
        {
            assert!(muted);
            break;
        }
    }

    harness.handle.abort();
}

#[tokio::test(start_paused = true)]
async fn handshake_timeout_fails_the_session() {
    let harness = spawn_engine();
    inject(&harness, TransportEvent::Connected).await;
    // No server/hello ever arrives.

    let outcome = harness.handle.await.expect("engine task completes");
    assert!(
        matches!(outcome, SessionOutcome::HandshakeFailed(_)),
        "expected handshake failure, got {:?}",
        outcome
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_disconnect_sends_goodbye_and_freezes_filter() {
    let mut harness = spawn_engine();
    handshake(&mut harness).await;

    // A ready filter freezes on clean shutdown.
    {
        let mut filter = harness.filter.lock();
        let base = clock::now_micros();
        for i in 0..4 {
            filter.ingest(TimeMeasurement {
                offset_us: 7_500,
                max_error_us: 2_000,
                client_recv_us: base + i * 100_000,
                rtt_us: 4_000,
            });
        }
    }

    harness
        .command_tx
        .send(EngineCommand::Disconnect)
        .await
        .expect("engine alive");
    let outcome = harness.handle.await.expect("engine task completes");
    assert!(matches!(outcome, SessionOutcome::UserDisconnect));

    let sent = harness.transport.sent_non_time();
    assert!(
        matches!(sent.last(), Some(Message::ClientGoodbye { reason }) if reason == "user_disconnect"),
        "last message must be client/goodbye"
    );
    assert_eq!(
        harness.transport.closed_with.lock().clone(),
        Some((1000, "user_disconnect".to_string()))
    );

    // Frozen state survives a reset and comes back on thaw.
    let mut filter = harness.filter.lock();
    filter.reset();
    assert!(filter.thaw(), "freeze must have parked state");
    assert_eq!(filter.offset_us(), 7_500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_session_thaws_frozen_filter() {
    let filter = Arc::new(Mutex::new(TimeFilter::new()));
    let burst = Arc::new(BurstSyncManager::new(Arc::clone(&filter)));

    // First session: converge, then disconnect cleanly (freezes the filter).
    let mut first = spawn_engine_with(Arc::clone(&filter), Arc::clone(&burst));
    handshake(&mut first).await;
    {
        let mut filter = filter.lock();
        let base = clock::now_micros();
        for i in 0..6 {
            filter.ingest(TimeMeasurement {
                offset_us: 12_000,
                max_error_us: 2_000,
                client_recv_us: base + i * 100_000,
                rtt_us: 4_000,
            });
        }
    }
    let error_before = filter.lock().error_us();

    first
        .command_tx
        .send(EngineCommand::Disconnect)
        .await
        .expect("engine alive");
    let outcome = first.handle.await.expect("engine task completes");
    assert!(matches!(outcome, SessionOutcome::UserDisconnect));

    // Clear the live state; only the frozen slot survives.
    filter.lock().reset();
    assert!(!filter.lock().is_ready());

    // Second session over the same filter: the handshake thaws the parked
    // state, so the mapping is usable before any new measurement arrives.
    let mut second = spawn_engine_with(Arc::clone(&filter), burst);
    handshake(&mut second).await;

    let filter = filter.lock();
    assert!(filter.is_ready(), "thawed state must restore readiness");
    assert_eq!(filter.offset_us(), 12_000);
    assert!(
        filter.error_us() > error_before,
        "thawed error {} must exceed pre-freeze error {}",
        filter.error_us(),
        error_before
    );
    drop(filter);

    second.handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn artwork_frames_pass_through_and_unknown_tags_drop() {
    let mut harness = spawn_engine();
    handshake(&mut harness).await;

    // Artwork channel 2 (tag 10).
    let artwork = BinaryFrame::build(FrameKind::Artwork(2), 0, &[0xFF, 0xD8, 0xFF]);
    inject(&harness, TransportEvent::Binary(artwork.into())).await;

    loop {
        if let CoreEvent::Stream(StreamEvent::ArtworkChunk { channel, data }) =
            next_event(&mut harness).await
        {
            assert_eq!(channel, 2);
            assert_eq!(&data[..], &[0xFF, 0xD8, 0xFF]);
            break;
        }
    }

    // Unknown tag 7 and a short frame: warn-and-drop, session lives.
    inject(
        &harness,
        TransportEvent::Binary(bytes::Bytes::from_static(&[7, 0, 0, 0, 0, 0, 0, 0, 0, 1])),
    )
    .await;
    inject(
        &harness,
        TransportEvent::Binary(bytes::Bytes::from_static(&[4, 0, 0])),
    )
    .await;

    // The engine still answers commands afterwards.
    let (reply_tx, reply_rx) = oneshot::channel();
    harness
        .command_tx
        .send(EngineCommand::Snapshot(reply_tx))
        .await
        .expect("engine alive");
    let snapshot = tokio::time::timeout(Duration::from_secs(2), reply_rx)
        .await
        .expect("snapshot within deadline")
        .expect("snapshot delivered");
    assert_eq!(snapshot.session_state, SessionState::Connected);

    harness.handle.abort();
}

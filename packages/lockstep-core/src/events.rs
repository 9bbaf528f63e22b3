//! Event stream for host communication.
//!
//! Where the original listener-with-methods idiom would invoke callbacks, the
//! core emits a sum-typed [`CoreEvent`] down a broadcast channel consumed by
//! the host. Events are never emitted while an internal lock is held.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::audio::AudioFormat;
use crate::protocol::{Metadata, PlaybackState};
use crate::session::SessionState;
use crate::timesync::FilterStats;

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Events broadcast to the host.
///
/// Each category has its own inner event type with specific variants.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum CoreEvent {
    /// Session lifecycle changes.
    Session(SessionEvent),

    /// Audio stream lifecycle and side channels.
    Stream(StreamEvent),

    /// Player state and metadata pushed by the server.
    Player(PlayerEvent),

    /// Time synchronization quality.
    Sync(SyncEvent),
}

/// Session lifecycle events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// The session state machine moved to a new state.
    StateChanged {
        state: SessionState,
    },
    /// Handshake completed; the server identified itself.
    Connected {
        #[serde(rename = "serverName")]
        server_name: String,
        #[serde(rename = "serverId")]
        server_id: String,
    },
    /// The session ended.
    Disconnected {
        reason: String,
        #[serde(rename = "userInitiated")]
        user_initiated: bool,
    },
    /// A non-fatal error the host may want to surface.
    Error {
        code: &'static str,
        message: String,
    },
    /// A reconnect attempt was scheduled after a drop.
    ReconnectScheduled {
        attempt: u32,
        #[serde(rename = "delayMs")]
        delay_ms: u64,
    },
    /// Auto-reconnect gave up; the host should surface this to the user.
    ReconnectExhausted {
        attempts: u32,
    },
    /// A background probe found the default endpoint reachable again.
    ServerReachable {
        #[serde(rename = "endpointId")]
        endpoint_id: String,
    },
}

/// Audio stream events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    /// A stream started with the given negotiated format.
    Started { format: AudioFormat },
    /// The stream ended; the decoder was drained.
    Ended,
    /// The stream was cleared; queued audio and filter state were discarded.
    Cleared,
    /// Artwork bytes on one of the four artwork channels. Byte passthrough
    /// only; the core does no image decoding.
    ArtworkChunk {
        channel: u8,
        #[serde(skip)]
        data: Bytes,
    },
    /// Visualizer payload passthrough.
    VisualizerFrame {
        #[serde(skip)]
        data: Bytes,
    },
}

/// Player state and metadata events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlayerEvent {
    /// Server set the player volume (already clamped to 0–100).
    VolumeChanged { volume: u8 },
    /// Server muted or unmuted the player.
    MuteChanged { muted: bool },
    /// A new metadata snapshot arrived.
    MetadataUpdated { metadata: Metadata },
    /// Group membership or group playback state changed.
    GroupUpdated {
        #[serde(rename = "groupId")]
        group_id: Option<String>,
        #[serde(rename = "groupName")]
        group_name: Option<String>,
        #[serde(rename = "playbackState")]
        playback_state: PlaybackState,
    },
    /// The server adjusted this player's static delay.
    StaticDelayChanged {
        #[serde(rename = "delayMs")]
        delay_ms: f64,
        source: Option<String>,
    },
}

/// Time synchronization events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Periodic filter quality snapshot.
    QualityUpdated { stats: FilterStats },
    /// The filter reached convergence for the first time this session.
    Converged,
}

impl From<SessionEvent> for CoreEvent {
    fn from(event: SessionEvent) -> Self {
        CoreEvent::Session(event)
    }
}

impl From<StreamEvent> for CoreEvent {
    fn from(event: StreamEvent) -> Self {
        CoreEvent::Stream(event)
    }
}

impl From<PlayerEvent> for CoreEvent {
    fn from(event: PlayerEvent) -> Self {
        CoreEvent::Player(event)
    }
}

impl From<SyncEvent> for CoreEvent {
    fn from(event: SyncEvent) -> Self {
        CoreEvent::Sync(event)
    }
}

/// Broadcast fan-out for [`CoreEvent`]s.
///
/// Lossy by design: a slow host subscriber lags rather than backpressuring
/// the engine worker.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emits an event to all subscribers. Dropped silently when nobody
    /// listens.
    pub fn emit(&self, event: impl Into<CoreEvent>) {
        let _ = self.tx.send(event.into());
    }

    /// Subscribes to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//! Lockstep Core - synchronized network audio player engine.
//!
//! This crate implements the synchronization and streaming engine of a
//! networked audio player: it connects to an audio server over a
//! bidirectional message channel, keeps a shared time base with the server
//! to sub-millisecond accuracy, decodes the server's compressed audio frames
//! and schedules them into an output sink so playout lines up with the
//! server's intended play time. Several clients against the same server play
//! in lock-step.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`clock`]: Process-wide monotonic microsecond clock
//! - [`config`]: Host-supplied tuning and server endpoint records
//! - [`events`]: Event stream for host communication
//! - [`protocol`]: JSON messages and binary frame codec
//! - [`timesync`]: Kalman clock filter and burst request pacing
//! - [`transport`]: Local, proxy and WebRTC-tunneled channels
//! - [`session`]: The session state machine
//! - [`audio`]: Decoders, playout scheduler, output sink contract
//! - [`supervisor`]: Variant selection and auto-reconnect
//! - [`prober`]: Background reachability probing
//! - [`client`]: The host-facing facade
//!
//! # Abstraction Traits
//!
//! Platform concerns stay outside the core behind traits: the audio device
//! behind [`OutputSink`](audio::OutputSink), the WebRTC stack behind
//! [`WebRtcPeer`](transport::WebRtcPeer), network classification behind
//! [`NetworkMonitor`](network::NetworkMonitor) writes. The core persists
//! nothing.

#![warn(clippy::all)]

pub mod audio;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod prober;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod timesync;
pub mod transport;

// Re-export commonly used types at the crate root
pub use audio::{AudioCodec, AudioFormat, DecodedBuffer, OutputSink, SinkPush};
pub use client::{Client, ClientOptions};
pub use config::{
    ConnectionPolicy, CoreConfig, LocalDescriptor, ProxyAuth, ProxyDescriptor, RemoteId,
    ServerEndpoint,
};
pub use error::{ErrorCode, LockstepError, LockstepResult};
pub use events::{CoreEvent, PlayerEvent, SessionEvent, StreamEvent, SyncEvent};
pub use network::{NetworkClass, NetworkMonitor};
pub use prober::PowerState;
pub use session::{EngineSnapshot, SessionState};
pub use supervisor::ConnectionVariant;
pub use timesync::{FilterStats, TimeFilter, TimeMeasurement};
pub use transport::{IceCandidate, PeerEvent, TransportState, WebRtcPeer};

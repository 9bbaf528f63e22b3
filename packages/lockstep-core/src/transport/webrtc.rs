//! WebRTC data-channel transport (variant C).
//!
//! The peer connection itself is host-provided through the [`WebRtcPeer`]
//! trait; this module negotiates it via the signaling service and then wraps
//! the reliable, ordered data channel in the [`Transport`] contract. Close
//! code/reason are best-effort on this transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::RemoteId;

use super::signaling::{
    merge_ice_servers, InboundSignal, OfferData, OutboundSignal, SignalingChannel, SignalingClient,
};
use super::{
    Transport, TransportError, TransportEvent, TransportKind, TransportResult, TransportState,
};

/// How long to wait for the data channel to open after signaling connects.
const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(15);

/// A single ICE candidate exchanged through signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u32>,
}

/// Events from the host's peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered; ship it through signaling.
    LocalIceCandidate(IceCandidate),
    /// The negotiated data channel opened.
    DataChannelOpen,
    /// Text arrived on the data channel.
    DataChannelText(String),
    /// Binary arrived on the data channel.
    DataChannelBinary(Bytes),
    /// The data channel closed.
    DataChannelClosed,
    /// The peer connection failed.
    PeerFailed(String),
}

/// Host-provided WebRTC peer connection.
///
/// The core drives offer/answer and candidate exchange; the host owns the
/// actual RTC stack. Events are delivered on a broadcast channel instead of
/// callbacks so no host code runs under core locks.
#[async_trait]
pub trait WebRtcPeer: Send + Sync {
    /// Installs the ICE server list before offer creation.
    fn set_ice_servers(&self, servers: Vec<String>);

    /// Creates the local SDP offer.
    async fn create_offer(&self) -> Result<String, String>;

    /// Applies the remote SDP answer.
    async fn set_remote_description(&self, sdp: &str) -> Result<(), String>;

    /// Adds a remote ICE candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), String>;

    /// Subscribes to peer events.
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;

    /// Sends text over the data channel.
    async fn send_text(&self, text: &str) -> Result<(), String>;

    /// Sends binary over the data channel.
    async fn send_binary(&self, data: &[u8]) -> Result<(), String>;

    /// Tears the peer connection down.
    fn close(&self);
}

/// Transport over a host-provided WebRTC data channel.
pub struct WebRtcTransport {
    signaling_endpoint: String,
    remote_id: RemoteId,
    peer: Arc<dyn WebRtcPeer>,
    event_tx: mpsc::Sender<TransportEvent>,
    /// Shared with the pump task so failures flip the visible state.
    state: Arc<parking_lot::Mutex<TransportState>>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl WebRtcTransport {
    /// Creates a transport for the given remote handle.
    #[must_use]
    pub fn new(
        signaling_endpoint: String,
        remote_id: RemoteId,
        peer: Arc<dyn WebRtcPeer>,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            signaling_endpoint,
            remote_id,
            peer,
            event_tx,
            state: Arc::new(parking_lot::Mutex::new(TransportState::Disconnected)),
            cancel: parking_lot::Mutex::new(None),
        }
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }

    /// Runs the negotiation until the data channel opens, returning the
    /// signaling session id.
    async fn negotiate(
        &self,
        channel: &mut SignalingChannel,
        peer_events: &mut broadcast::Receiver<PeerEvent>,
    ) -> TransportResult<String> {
        // Step 1: wait for the service to accept the exchange.
        let session_id = loop {
            match channel.recv().await.map_err(peer_err)? {
                InboundSignal::Connected {
                    session_id,
                    ice_servers,
                } => {
                    let merged = merge_ice_servers(&ice_servers);
                    log::info!(
                        "[Transport:webrtc] Signaling connected: session={}, ice_servers={}",
                        session_id,
                        merged.len()
                    );
                    self.peer.set_ice_servers(merged);
                    break session_id;
                }
                InboundSignal::Error { error, message } => {
                    return Err(TransportError::Peer(InboundSignal::error_text(
                        &error, &message,
                    )));
                }
                other => {
                    log::debug!("[Transport:webrtc] Ignoring pre-session signal: {:?}", other);
                }
            }
        };

        // Step 2: offer.
        let sdp = self.peer.create_offer().await.map_err(TransportError::Peer)?;
        channel
            .send(OutboundSignal::Offer {
                remote_id: self.remote_id.as_str().to_string(),
                session_id: session_id.clone(),
                data: OfferData {
                    sdp,
                    kind: "offer".to_string(),
                },
            })
            .await
            .map_err(peer_err)?;

        // Step 3: pump answer/candidates both ways until the channel opens.
        loop {
            tokio::select! {
                signal = channel.recv() => match signal.map_err(peer_err)? {
                    InboundSignal::Answer { data } => {
                        self.peer
                            .set_remote_description(&data.sdp)
                            .await
                            .map_err(TransportError::Peer)?;
                    }
                    InboundSignal::IceCandidate { data } => {
                        if let Err(e) = self.peer.add_ice_candidate(data).await {
                            log::warn!("[Transport:webrtc] Rejected remote candidate: {}", e);
                        }
                    }
                    InboundSignal::PeerDisconnected => {
                        return Err(TransportError::Peer("peer disconnected".to_string()));
                    }
                    InboundSignal::Error { error, message } => {
                        return Err(TransportError::Peer(InboundSignal::error_text(
                            &error, &message,
                        )));
                    }
                    _ => {}
                },
                event = peer_events.recv() => match event {
                    Ok(PeerEvent::LocalIceCandidate(candidate)) => {
                        channel
                            .send(OutboundSignal::IceCandidate {
                                remote_id: self.remote_id.as_str().to_string(),
                                session_id: session_id.clone(),
                                data: candidate,
                            })
                            .await
                            .map_err(peer_err)?;
                    }
                    Ok(PeerEvent::DataChannelOpen) => return Ok(session_id),
                    Ok(PeerEvent::PeerFailed(reason)) => {
                        return Err(TransportError::Peer(reason));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Transport:webrtc] Peer event stream lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TransportError::Peer("peer event stream closed".to_string()));
                    }
                },
            }
        }
    }

    /// Steady-state pump after the data channel is open.
    async fn pump(
        peer: Arc<dyn WebRtcPeer>,
        event_tx: mpsc::Sender<TransportEvent>,
        mut channel: SignalingChannel,
        mut peer_events: broadcast::Receiver<PeerEvent>,
        state: Arc<parking_lot::Mutex<TransportState>>,
        cancel: CancellationToken,
        session_id: String,
    ) {
        let remote_id = channel.remote_id().as_str().to_string();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                signal = channel.recv() => match signal {
                    Ok(InboundSignal::IceCandidate { data }) => {
                        if let Err(e) = peer.add_ice_candidate(data).await {
                            log::warn!("[Transport:webrtc] Rejected trickle candidate: {}", e);
                        }
                    }
                    Ok(InboundSignal::PeerDisconnected) => {
                        *state.lock() = TransportState::Failed;
                        let _ = event_tx
                            .send(TransportEvent::Failure {
                                error: TransportError::Peer("peer disconnected".to_string()),
                            })
                            .await;
                        return;
                    }
                    Ok(InboundSignal::Error { error, message }) => {
                        log::warn!(
                            "[Transport:webrtc] Signaling error: {}",
                            InboundSignal::error_text(&error, &message)
                        );
                    }
                    Ok(_) => {}
                    // Losing signaling after the channel is up is harmless.
                    Err(_) => {
                        log::debug!("[Transport:webrtc] Signaling channel gone");
                    }
                },
                event = peer_events.recv() => match event {
                    Ok(PeerEvent::DataChannelText(text)) => {
                        let _ = event_tx.send(TransportEvent::Text(text)).await;
                    }
                    Ok(PeerEvent::DataChannelBinary(data)) => {
                        let _ = event_tx.send(TransportEvent::Binary(data)).await;
                    }
                    Ok(PeerEvent::LocalIceCandidate(candidate)) => {
                        let _ = channel
                            .send(OutboundSignal::IceCandidate {
                                remote_id: remote_id.clone(),
                                session_id: session_id.clone(),
                                data: candidate,
                            })
                            .await;
                    }
                    Ok(PeerEvent::DataChannelClosed) => {
                        *state.lock() = TransportState::Closed;
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                code: 1000,
                                reason: "data channel closed".to_string(),
                            })
                            .await;
                        return;
                    }
                    Ok(PeerEvent::PeerFailed(reason)) => {
                        *state.lock() = TransportState::Failed;
                        let _ = event_tx
                            .send(TransportEvent::Failure {
                                error: TransportError::Peer(reason),
                            })
                            .await;
                        return;
                    }
                    Ok(PeerEvent::DataChannelOpen) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[Transport:webrtc] Peer event stream lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        *state.lock() = TransportState::Failed;
                        let _ = event_tx
                            .send(TransportEvent::Failure {
                                error: TransportError::Peer(
                                    "peer event stream closed".to_string(),
                                ),
                            })
                            .await;
                        return;
                    }
                },
            }
        }
    }
}

fn peer_err(err: super::signaling::SignalingError) -> TransportError {
    TransportError::Peer(err.to_string())
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn connect(&self) -> TransportResult<()> {
        self.set_state(TransportState::Connecting);

        let mut channel =
            SignalingClient::connect(&self.signaling_endpoint, self.remote_id.clone())
                .await
                .map_err(|e| {
                    self.set_state(TransportState::Failed);
                    peer_err(e)
                })?;
        let mut peer_events = self.peer.subscribe();

        let negotiated = tokio::time::timeout(
            DATA_CHANNEL_TIMEOUT,
            self.negotiate(&mut channel, &mut peer_events),
        )
        .await;

        let session_id = match negotiated {
            Err(_) => {
                self.set_state(TransportState::Failed);
                return Err(TransportError::ConnectTimeout(DATA_CHANNEL_TIMEOUT));
            }
            Ok(Err(e)) => {
                self.set_state(TransportState::Failed);
                return Err(e);
            }
            Ok(Ok(session_id)) => session_id,
        };

        self.set_state(TransportState::Connected);
        log::info!("[Transport:webrtc] Data channel open for {}", self.remote_id);

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        tokio::spawn(Self::pump(
            Arc::clone(&self.peer),
            self.event_tx.clone(),
            channel,
            peer_events,
            Arc::clone(&self.state),
            cancel,
            session_id,
        ));

        self.event_tx
            .send(TransportEvent::Connected)
            .await
            .map_err(|_| TransportError::NotConnected)?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> bool {
        if self.state() != TransportState::Connected {
            return false;
        }
        match self.peer.send_text(text).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Transport:webrtc] Text send failed: {}", e);
                false
            }
        }
    }

    async fn send_binary(&self, data: &[u8]) -> bool {
        if self.state() != TransportState::Connected {
            return false;
        }
        match self.peer.send_binary(data).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Transport:webrtc] Binary send failed: {}", e);
                false
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        // Close codes don't traverse a data channel; log for diagnostics.
        log::info!(
            "[Transport:webrtc] Closing (best-effort): code={}, reason={}",
            code,
            reason
        );
        self.peer.close();
        self.set_state(TransportState::Closed);
    }

    async fn destroy(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.peer.close();
        self.set_state(TransportState::Closed);
        log::debug!("[Transport:webrtc] Destroyed");
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
    }
}

#[cfg(test)]
mod tests {
    use super::super::signaling::FALLBACK_STUN_SERVERS;
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Scripted fake peer: answers offer/ICE calls and lets the test inject
    /// peer events.
    struct FakePeer {
        events: broadcast::Sender<PeerEvent>,
        ice_servers: parking_lot::Mutex<Vec<String>>,
        remote_sdp: parking_lot::Mutex<Option<String>>,
        sent_texts: parking_lot::Mutex<Vec<String>>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl FakePeer {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(32);
            Arc::new(Self {
                events,
                ice_servers: parking_lot::Mutex::new(Vec::new()),
                remote_sdp: parking_lot::Mutex::new(None),
                sent_texts: parking_lot::Mutex::new(Vec::new()),
                closed: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl WebRtcPeer for FakePeer {
        fn set_ice_servers(&self, servers: Vec<String>) {
            *self.ice_servers.lock() = servers;
        }

        async fn create_offer(&self) -> Result<String, String> {
            Ok("v=0 offer".to_string())
        }

        async fn set_remote_description(&self, sdp: &str) -> Result<(), String> {
            *self.remote_sdp.lock() = Some(sdp.to_string());
            // Answer applied: the data channel comes up.
            let _ = self.events.send(PeerEvent::DataChannelOpen);
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), String> {
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
            self.events.subscribe()
        }

        async fn send_text(&self, text: &str) -> Result<(), String> {
            self.sent_texts.lock().push(text.to_string());
            Ok(())
        }

        async fn send_binary(&self, _data: &[u8]) -> Result<(), String> {
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Minimal signaling server: accepts one exchange, replies `connected`
    /// and answers the offer.
    async fn spawn_signaling_server() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            while let Some(Ok(message)) = ws.next().await {
                let WsMessage::Text(text) = message else { continue };
                let value: serde_json::Value = serde_json::from_str(&text).expect("json");
                match value["type"].as_str() {
                    Some("connect-request") => {
                        assert_eq!(
                            value["remoteId"].as_str().map(str::len),
                            Some(26),
                            "remote id must be forwarded verbatim"
                        );
                        let reply = r#"{"type":"connected","sessionId":"sess-9","iceServers":[]}"#;
                        ws.send(WsMessage::Text(reply.to_string())).await.expect("send");
                    }
                    Some("offer") => {
                        let reply = r#"{"type":"answer","data":{"sdp":"v=0 answer"}}"#;
                        ws.send(WsMessage::Text(reply.to_string())).await.expect("send");
                    }
                    _ => {}
                }
            }
        });
        port
    }

    fn remote_id() -> RemoteId {
        RemoteId::parse("ABCDEFGHJKMNPQRSTVWXYZ0123").expect("valid id")
    }

    #[tokio::test]
    async fn negotiates_and_carries_data_channel_traffic() {
        let port = spawn_signaling_server().await;
        let peer = FakePeer::new();
        let (event_tx, mut event_rx) = mpsc::channel(16);

        let transport = WebRtcTransport::new(
            format!("ws://127.0.0.1:{}/signal", port),
            remote_id(),
            Arc::clone(&peer) as Arc<dyn WebRtcPeer>,
            event_tx,
        );

        transport.connect().await.expect("negotiation succeeds");
        assert_eq!(transport.state(), TransportState::Connected);
        assert!(matches!(
            event_rx.recv().await,
            Some(TransportEvent::Connected)
        ));

        // ICE fallback applied (signaling sent an empty list).
        assert_eq!(peer.ice_servers.lock().len(), FALLBACK_STUN_SERVERS.len());
        assert_eq!(peer.remote_sdp.lock().as_deref(), Some("v=0 answer"));

        // Outbound maps to data-channel sends.
        assert!(transport.send_text("{\"type\":\"client/time\"}").await);
        assert_eq!(peer.sent_texts.lock().len(), 1);

        // Inbound peer traffic surfaces as transport events.
        peer.events
            .send(PeerEvent::DataChannelBinary(Bytes::from_static(&[4u8; 12])))
            .expect("subscriber alive");
        match event_rx.recv().await {
            Some(TransportEvent::Binary(data)) => assert_eq!(data.len(), 12),
            other => panic!("expected binary event, got {:?}", other),
        }

        // Peer failure surfaces as a recoverable transport failure.
        peer.events
            .send(PeerEvent::PeerFailed("ice disconnected".to_string()))
            .expect("subscriber alive");
        match event_rx.recv().await {
            Some(TransportEvent::Failure { error }) => {
                assert!(matches!(error, TransportError::Peer(_)));
                assert!(error.is_recoverable());
            }
            other => panic!("expected failure event, got {:?}", other),
        }

        transport.destroy().await;
        assert!(peer.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!transport.send_text("gone").await);
    }
}

//! WebSocket client for the WebRTC signaling exchange.
//!
//! The signaling service brokers SDP offers/answers and ICE candidates
//! between this client and a server identified by its remote handle. If the
//! service supplies no ICE servers, a baked-in list of public STUN servers is
//! used; otherwise the two lists are merged uniquely.

use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::RemoteId;

use super::webrtc::IceCandidate;

/// Timeout for reaching the signaling service.
pub const SIGNALING_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Public STUN fallback used when the signaling service sends no ICE servers.
pub const FALLBACK_STUN_SERVERS: [&str; 4] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

/// Signaling exchange failures.
#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("signaling connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("signaling websocket error: {0}")]
    WebSocket(String),

    #[error("signaling service rejected the exchange: {0}")]
    Rejected(String),

    #[error("signaling connection closed")]
    Closed,
}

/// Result alias for signaling operations.
pub type SignalingResult<T> = Result<T, SignalingError>;

/// SDP body attached to an offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferData {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Messages this client sends to the signaling service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundSignal {
    #[serde(rename = "connect-request")]
    ConnectRequest {
        #[serde(rename = "remoteId")]
        remote_id: String,
    },
    #[serde(rename = "offer")]
    Offer {
        #[serde(rename = "remoteId")]
        remote_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        data: OfferData,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(rename = "remoteId")]
        remote_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        data: IceCandidate,
    },
}

/// An ICE server entry as sent by the signaling service.
///
/// `urls` accepts both a single string and a list, matching the WebRTC
/// RTCIceServer shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "string_or_list")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

/// SDP body attached to an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerData {
    pub sdp: String,
}

/// Messages the signaling service sends to this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundSignal {
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "iceServers", default)]
        ice_servers: Vec<IceServer>,
    },
    #[serde(rename = "answer")]
    Answer { data: AnswerData },
    #[serde(rename = "ice-candidate")]
    IceCandidate { data: IceCandidate },
    #[serde(rename = "peer-disconnected")]
    PeerDisconnected,
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl InboundSignal {
    /// Extracts the human-readable text of an error signal.
    #[must_use]
    pub fn error_text(error: &Option<String>, message: &Option<String>) -> String {
        error
            .clone()
            .or_else(|| message.clone())
            .unwrap_or_else(|| "unspecified signaling error".to_string())
    }
}

/// Merges server-supplied ICE servers with the baked-in STUN fallback.
///
/// Empty or absent input falls back entirely; otherwise the union is taken
/// with duplicates removed, server-supplied entries first.
#[must_use]
pub fn merge_ice_servers(from_server: &[IceServer]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for server in from_server {
        for url in &server.urls {
            if !merged.contains(url) {
                merged.push(url.clone());
            }
        }
    }
    for fallback in FALLBACK_STUN_SERVERS {
        if !merged.iter().any(|url| url == fallback) {
            merged.push(fallback.to_string());
        }
    }
    merged
}

type SignalSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// An open signaling conversation.
///
/// Created by [`SignalingClient::connect`]; the `connect-request` for the
/// validated remote id has already been sent when this is handed out.
pub struct SignalingChannel {
    remote_id: RemoteId,
    writer: SignalSink,
    inbound: mpsc::Receiver<InboundSignal>,
}

impl SignalingChannel {
    /// The remote handle this exchange is for.
    #[must_use]
    pub fn remote_id(&self) -> &RemoteId {
        &self.remote_id
    }

    /// Sends a signal to the service.
    pub async fn send(&mut self, signal: OutboundSignal) -> SignalingResult<()> {
        let json = serde_json::to_string(&signal)
            .map_err(|e| SignalingError::WebSocket(e.to_string()))?;
        self.writer
            .send(WsMessage::Text(json))
            .await
            .map_err(|e| SignalingError::WebSocket(e.to_string()))
    }

    /// Receives the next signal, or [`SignalingError::Closed`] when the
    /// service hung up.
    pub async fn recv(&mut self) -> SignalingResult<InboundSignal> {
        self.inbound.recv().await.ok_or(SignalingError::Closed)
    }
}

/// WebSocket client for the signaling endpoint.
pub struct SignalingClient;

impl SignalingClient {
    /// Connects to the signaling service and opens the exchange for
    /// `remote_id`.
    ///
    /// The identifier is validated by construction ([`RemoteId`]); the
    /// `connect-request` is sent before this returns.
    pub async fn connect(endpoint: &str, remote_id: RemoteId) -> SignalingResult<SignalingChannel> {
        log::info!("[Signaling] Connecting to {} for {}", endpoint, remote_id);

        let connected =
            tokio::time::timeout(SIGNALING_CONNECT_TIMEOUT, connect_async(endpoint)).await;
        let (stream, _response) = match connected {
            Err(_) => return Err(SignalingError::ConnectTimeout(SIGNALING_CONNECT_TIMEOUT)),
            Ok(Err(e)) => return Err(SignalingError::WebSocket(e.to_string())),
            Ok(Ok(pair)) => pair,
        };

        let (writer, mut reader) = stream.split();
        let (inbound_tx, inbound) = mpsc::channel(32);

        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        match serde_json::from_str::<InboundSignal>(&text) {
                            Ok(signal) => {
                                if inbound_tx.send(signal).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                log::warn!("[Signaling] Unparseable signal: {} - raw: {}", e, text);
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        });

        let mut channel = SignalingChannel {
            remote_id,
            writer,
            inbound,
        };
        let remote_id = channel.remote_id.as_str().to_string();
        channel
            .send(OutboundSignal::ConnectRequest { remote_id })
            .await?;
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_signals_match_wire_shapes() {
        let offer = OutboundSignal::Offer {
            remote_id: "R".to_string(),
            session_id: "sess-1".to_string(),
            data: OfferData {
                sdp: "v=0".to_string(),
                kind: "offer".to_string(),
            },
        };
        let json = serde_json::to_value(&offer).expect("serialize");
        assert_eq!(json["type"], "offer");
        assert_eq!(json["remoteId"], "R");
        assert_eq!(json["sessionId"], "sess-1");
        assert_eq!(json["data"]["sdp"], "v=0");
        assert_eq!(json["data"]["type"], "offer");

        let candidate = OutboundSignal::IceCandidate {
            remote_id: "R".to_string(),
            session_id: "sess-1".to_string(),
            data: IceCandidate {
                candidate: "candidate:1".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        };
        let json = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["data"]["sdpMid"], "0");
        assert_eq!(json["data"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn inbound_connected_parses_with_and_without_ice_servers() {
        let raw = r#"{"type":"connected","sessionId":"s","iceServers":[{"urls":"stun:a"},{"urls":["stun:b","turn:c"]}]}"#;
        match serde_json::from_str::<InboundSignal>(raw).expect("parse") {
            InboundSignal::Connected {
                session_id,
                ice_servers,
            } => {
                assert_eq!(session_id, "s");
                assert_eq!(ice_servers.len(), 2);
                assert_eq!(ice_servers[0].urls, vec!["stun:a"]);
                assert_eq!(ice_servers[1].urls, vec!["stun:b", "turn:c"]);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let bare = r#"{"type":"connected","sessionId":"s"}"#;
        match serde_json::from_str::<InboundSignal>(bare).expect("parse") {
            InboundSignal::Connected { ice_servers, .. } => assert!(ice_servers.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_inbound_type_is_tolerated() {
        let raw = r#"{"type":"future-feature","payload":true}"#;
        let signal = serde_json::from_str::<InboundSignal>(raw).expect("parse");
        assert!(matches!(signal, InboundSignal::Unknown));
    }

    #[test]
    fn empty_ice_list_falls_back_to_baked_in_stun() {
        let merged = merge_ice_servers(&[]);
        assert_eq!(merged.len(), FALLBACK_STUN_SERVERS.len());
        assert_eq!(merged[0], FALLBACK_STUN_SERVERS[0]);
    }

    #[test]
    fn server_supplied_ice_merges_uniquely() {
        let servers = vec![
            IceServer {
                urls: vec!["turn:turn.example.com:3478".to_string()],
                username: Some("u".to_string()),
                credential: Some("c".to_string()),
            },
            IceServer {
                // Duplicate of a fallback entry.
                urls: vec![FALLBACK_STUN_SERVERS[0].to_string()],
                username: None,
                credential: None,
            },
        ];
        let merged = merge_ice_servers(&servers);
        assert_eq!(merged[0], "turn:turn.example.com:3478");
        assert_eq!(
            merged.len(),
            1 + FALLBACK_STUN_SERVERS.len(),
            "duplicates must collapse"
        );
    }

    #[test]
    fn error_text_prefers_error_field() {
        assert_eq!(
            InboundSignal::error_text(&Some("denied".into()), &Some("other".into())),
            "denied"
        );
        assert_eq!(
            InboundSignal::error_text(&None, &Some("fallback".into())),
            "fallback"
        );
        assert_eq!(
            InboundSignal::error_text(&None, &None),
            "unspecified signaling error"
        );
    }
}

//! WebSocket transport: local (variant A) and authenticated proxy
//! (variant B).
//!
//! Both variants share the same machinery; they differ in URL construction,
//! the `Authorization` upgrade header, and error classification (the proxy
//! treats 401/403 as non-recoverable even when the underlying error would
//! otherwise look transient).

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::{LocalDescriptor, ProxyAuth, ProxyDescriptor};

use super::{
    Transport, TransportError, TransportEvent, TransportKind, TransportResult, TransportState,
    CONNECT_TIMEOUT, PING_INTERVAL, PING_INTERVAL_HIGH_POWER,
};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct Inner {
    url: String,
    auth_header: Option<String>,
    ping_interval: std::time::Duration,
    authenticated: bool,
    kind: TransportKind,
    event_tx: mpsc::Sender<TransportEvent>,
    state: parking_lot::Mutex<TransportState>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl Inner {
    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }

    async fn emit(&self, event: TransportEvent) {
        // Engine gone means nobody cares anymore; drop silently.
        let _ = self.event_tx.send(event).await;
    }
}

/// WebSocket transport for the local and proxy variants.
pub struct WsTransport {
    inner: Arc<Inner>,
}

impl WsTransport {
    /// Direct local WebSocket (`ws://host:port/path`).
    #[must_use]
    pub fn local(
        descriptor: &LocalDescriptor,
        event_tx: mpsc::Sender<TransportEvent>,
        high_power_mode: bool,
    ) -> Self {
        Self::build(
            descriptor.url(),
            None,
            false,
            TransportKind::Local,
            event_tx,
            high_power_mode,
        )
    }

    /// Authenticated proxy WebSocket (`wss://…` with an `Authorization`
    /// header on the upgrade request).
    #[must_use]
    pub fn proxy(
        descriptor: &ProxyDescriptor,
        event_tx: mpsc::Sender<TransportEvent>,
        high_power_mode: bool,
    ) -> Self {
        let auth_header = descriptor.auth.as_ref().map(|auth| match auth {
            ProxyAuth::Bearer { token } => format!("Bearer {}", token),
            ProxyAuth::Basic { username, password } => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                format!("Basic {}", credentials)
            }
        });
        Self::build(
            descriptor.ws_url(),
            auth_header,
            true,
            TransportKind::Proxy,
            event_tx,
            high_power_mode,
        )
    }

    fn build(
        url: String,
        auth_header: Option<String>,
        authenticated: bool,
        kind: TransportKind,
        event_tx: mpsc::Sender<TransportEvent>,
        high_power_mode: bool,
    ) -> Self {
        let ping_interval = if high_power_mode {
            PING_INTERVAL_HIGH_POWER
        } else {
            PING_INTERVAL
        };
        Self {
            inner: Arc::new(Inner {
                url,
                auth_header,
                ping_interval,
                authenticated,
                kind,
                event_tx,
                state: parking_lot::Mutex::new(TransportState::Disconnected),
                writer: tokio::sync::Mutex::new(None),
                cancel: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Reads inbound frames until close, failure, or cancellation.
    async fn reader_loop(inner: Arc<Inner>, mut read: WsSource, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = read.next() => message,
            };

            match message {
                Some(Ok(WsMessage::Text(text))) => {
                    inner.emit(TransportEvent::Text(text)).await;
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    inner.emit(TransportEvent::Binary(Bytes::from(data))).await;
                }
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                    // Pongs are queued by tungstenite; the ping task's next
                    // write flushes them.
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((1005, String::new()));
                    log::info!(
                        "[Transport:{}] Peer closing: code={}, reason={}",
                        inner.kind.as_str(),
                        code,
                        reason
                    );
                    inner.emit(TransportEvent::Closing).await;
                    inner.set_state(TransportState::Closed);
                    inner.emit(TransportEvent::Closed { code, reason }).await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let error = TransportError::classify(&e, inner.authenticated);
                    log::warn!(
                        "[Transport:{}] Read failed: {} (recoverable={})",
                        inner.kind.as_str(),
                        error,
                        error.is_recoverable()
                    );
                    inner.set_state(TransportState::Failed);
                    inner.emit(TransportEvent::Failure { error }).await;
                    return;
                }
                None => {
                    log::info!(
                        "[Transport:{}] Stream ended without close frame",
                        inner.kind.as_str()
                    );
                    inner.set_state(TransportState::Closed);
                    inner
                        .emit(TransportEvent::Closed {
                            code: 1006,
                            reason: String::new(),
                        })
                        .await;
                    return;
                }
            }
        }
    }

    /// Sends idle pings so NAT/proxy mappings stay warm.
    async fn ping_loop(inner: Arc<Inner>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(inner.ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let mut writer = inner.writer.lock().await;
            let Some(sink) = writer.as_mut() else { return };
            tracing::debug!(transport = inner.kind.as_str(), "idle ping");
            if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                log::debug!(
                    "[Transport:{}] Ping failed, reader will classify: {}",
                    inner.kind.as_str(),
                    e
                );
                return;
            }
        }
    }

    async fn send(&self, message: WsMessage) -> bool {
        if self.state() != TransportState::Connected {
            return false;
        }
        let mut writer = self.inner.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return false;
        };
        match sink.send(message).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Transport:{}] Send failed: {}", self.inner.kind.as_str(), e);
                false
            }
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> TransportResult<()> {
        self.inner.set_state(TransportState::Connecting);
        log::info!(
            "[Transport:{}] Connecting to {}",
            self.inner.kind.as_str(),
            self.inner.url
        );

        let mut request = self
            .inner
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| {
                self.inner.set_state(TransportState::Failed);
                TransportError::InvalidUrl(e.to_string())
            })?;
        if let Some(header) = &self.inner.auth_header {
            let value = HeaderValue::from_str(header).map_err(|e| {
                self.inner.set_state(TransportState::Failed);
                TransportError::InvalidUrl(format!("bad authorization header: {}", e))
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let connected = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await;
        let (stream, _response) = match connected {
            Err(_) => {
                self.inner.set_state(TransportState::Failed);
                return Err(TransportError::ConnectTimeout(CONNECT_TIMEOUT));
            }
            Ok(Err(e)) => {
                let error = TransportError::classify(&e, self.inner.authenticated);
                log::warn!(
                    "[Transport:{}] Connect failed: {} (recoverable={})",
                    self.inner.kind.as_str(),
                    error,
                    error.is_recoverable()
                );
                self.inner.set_state(TransportState::Failed);
                return Err(error);
            }
            Ok(Ok(pair)) => pair,
        };

        let (write, read) = stream.split();
        *self.inner.writer.lock().await = Some(write);

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = Some(cancel.clone());

        self.inner.set_state(TransportState::Connected);
        log::info!("[Transport:{}] Connected", self.inner.kind.as_str());

        tokio::spawn(Self::reader_loop(
            Arc::clone(&self.inner),
            read,
            cancel.clone(),
        ));
        tokio::spawn(Self::ping_loop(Arc::clone(&self.inner), cancel));

        self.inner.emit(TransportEvent::Connected).await;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> bool {
        self.send(WsMessage::Text(text.to_string())).await
    }

    async fn send_binary(&self, data: &[u8]) -> bool {
        self.send(WsMessage::Binary(data.to_vec())).await
    }

    async fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let mut writer = self.inner.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
                log::debug!(
                    "[Transport:{}] Close frame not delivered: {}",
                    self.inner.kind.as_str(),
                    e
                );
            }
        }
        self.inner.set_state(TransportState::Closed);
    }

    async fn destroy(&self) {
        if let Some(cancel) = self.inner.cancel.lock().take() {
            cancel.cancel();
        }
        // Dropping the sink tears down the underlying socket.
        self.inner.writer.lock().await.take();
        self.inner.set_state(TransportState::Closed);
        log::debug!("[Transport:{}] Destroyed", self.inner.kind.as_str());
    }

    fn state(&self) -> TransportState {
        *self.inner.state.lock()
    }

    fn kind(&self) -> TransportKind {
        self.inner.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_descriptor(port: u16) -> LocalDescriptor {
        LocalDescriptor {
            host: "127.0.0.1".to_string(),
            port,
            path: "/lockstep".to_string(),
        }
    }

    #[tokio::test]
    async fn send_before_connect_returns_false() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let transport = WsTransport::local(&local_descriptor(9), event_tx, false);

        assert!(!transport.send_text("hello").await);
        assert!(!transport.send_binary(&[1, 2, 3]).await);
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn invalid_url_is_a_config_error() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let descriptor = ProxyDescriptor {
            url: "not a url at all".to_string(),
            auth: None,
        };
        let transport = WsTransport::proxy(&descriptor, event_tx, false);

        let err = transport.connect().await.expect_err("must fail");
        assert!(matches!(err, TransportError::InvalidUrl(_)));
        assert!(!err.is_recoverable());
        assert_eq!(transport.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn refused_connection_is_fatal() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        // Bind then drop a listener so the port is very likely unbound.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let transport = WsTransport::local(&local_descriptor(port), event_tx, false);
        let err = transport.connect().await.expect_err("must be refused");
        assert!(matches!(err, TransportError::ConnectionRefused));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn round_trips_text_and_binary_through_echo_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();

        // Minimal echo server.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    WsMessage::Text(_) | WsMessage::Binary(_) => {
                        if ws.send(message).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });

        let (event_tx, mut event_rx) = mpsc::channel(8);
        let transport = WsTransport::local(&local_descriptor(port), event_tx, false);
        transport.connect().await.expect("connect");

        assert!(matches!(
            event_rx.recv().await,
            Some(TransportEvent::Connected)
        ));
        assert_eq!(transport.state(), TransportState::Connected);

        assert!(transport.send_text("ping?").await);
        match event_rx.recv().await {
            Some(TransportEvent::Text(text)) => assert_eq!(text, "ping?"),
            other => panic!("expected echoed text, got {:?}", other),
        }

        assert!(transport.send_binary(&[4, 0, 0, 0, 0, 0, 0, 0, 1, 9]).await);
        match event_rx.recv().await {
            Some(TransportEvent::Binary(data)) => {
                assert_eq!(&data[..], &[4, 0, 0, 0, 0, 0, 0, 0, 1, 9]);
            }
            other => panic!("expected echoed binary, got {:?}", other),
        }

        transport.destroy().await;
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(!transport.send_text("after destroy").await);
    }

    #[tokio::test]
    async fn close_stops_sends() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (event_tx, mut event_rx) = mpsc::channel(8);
        let transport = WsTransport::local(&local_descriptor(port), event_tx, false);
        transport.connect().await.expect("connect");
        let _ = event_rx.recv().await; // Connected

        transport.close(1000, "user_disconnect").await;
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(!transport.send_text("too late").await);
    }
}

//! Host-facing facade wiring the engine together.
//!
//! A [`Client`] owns the shared time filter, burst manager and event bus,
//! builds a [`ConnectionSupervisor`] per endpoint, and forwards host
//! requests into the live session. One client maps to one configured player
//! instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use crate::audio::OutputSink;
use crate::config::{CoreConfig, ServerEndpoint};
use crate::error::{LockstepError, LockstepResult};
use crate::events::{CoreEvent, EventBus, SessionEvent};
use crate::network::NetworkMonitor;
use crate::prober::{PowerState, ProberContext, ServerProber};
use crate::session::{EngineCommand, EngineSnapshot, SessionState};
use crate::supervisor::{
    ConnectionSupervisor, DefaultTransportFactory, SupervisorContext, TransportFactory,
};
use crate::timesync::{BurstSyncManager, TimeFilter};
use crate::transport::WebRtcPeer;

/// Builder-style options for a [`Client`].
pub struct ClientOptions {
    pub config: CoreConfig,
    /// Display name advertised to servers.
    pub name: String,
    pub sink: Arc<dyn OutputSink>,
    /// Signaling service URL for the WebRTC variant.
    pub signaling_endpoint: String,
    /// Host-provided peer connections; `None` disables the remote variant.
    pub peer_factory: Option<Arc<dyn Fn() -> Arc<dyn WebRtcPeer> + Send + Sync>>,
}

/// The synchronized player client.
pub struct Client {
    config: CoreConfig,
    name: String,
    client_id: String,
    network: Arc<NetworkMonitor>,
    events: EventBus,
    filter: Arc<Mutex<TimeFilter>>,
    burst: Arc<BurstSyncManager>,
    sink: Arc<dyn OutputSink>,
    factory: Arc<dyn TransportFactory>,
    signaling_endpoint: String,
    supervisor: Mutex<Option<ConnectionSupervisor>>,
    prober: Mutex<Option<ServerProber>>,
    session_active: Arc<AtomicBool>,
}

impl Client {
    /// Creates a client. No network activity until [`Client::connect`].
    #[must_use]
    pub fn new(options: ClientOptions) -> Arc<Self> {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let mut initial = filter.lock();
        initial.set_static_delay_ms(options.config.static_delay_ms);
        drop(initial);

        let burst = Arc::new(BurstSyncManager::new(Arc::clone(&filter)));
        let events = EventBus::new();
        let factory: Arc<dyn TransportFactory> = Arc::new(DefaultTransportFactory {
            high_power_mode: options.config.high_power_mode,
            signaling_endpoint: options.signaling_endpoint.clone(),
            peer_factory: options.peer_factory,
        });

        let client = Arc::new(Self {
            config: options.config,
            name: options.name,
            client_id: Uuid::new_v4().to_string(),
            network: NetworkMonitor::new(),
            events: events.clone(),
            filter,
            burst,
            sink: options.sink,
            factory,
            signaling_endpoint: options.signaling_endpoint,
            supervisor: Mutex::new(None),
            prober: Mutex::new(None),
            session_active: Arc::new(AtomicBool::new(false)),
        });

        // Track session liveness off the event stream; the prober reads it.
        let session_active = Arc::clone(&client.session_active);
        let mut events_rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok(CoreEvent::Session(SessionEvent::StateChanged { state })) => {
                        let live = matches!(
                            state,
                            SessionState::Handshaking
                                | SessionState::Connected
                                | SessionState::StreamActive
                        );
                        session_active.store(live, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        client
    }

    /// The network monitor the host's observer writes into.
    #[must_use]
    pub fn network(&self) -> Arc<NetworkMonitor> {
        Arc::clone(&self.network)
    }

    /// Subscribes to the core event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Connects to an endpoint, replacing any previous connection.
    ///
    /// Selecting a new endpoint cancels the old lifecycle completely: its
    /// backoff timer, in-flight connect attempt and future iterations.
    pub fn connect(&self, endpoint: ServerEndpoint) -> LockstepResult<()> {
        endpoint.validate().map_err(LockstepError::Config)?;

        let supervisor = ConnectionSupervisor::new(SupervisorContext {
            endpoint,
            config: self.config.clone(),
            network: Arc::clone(&self.network),
            events: self.events.clone(),
            filter: Arc::clone(&self.filter),
            burst: Arc::clone(&self.burst),
            sink: Arc::clone(&self.sink),
            factory: Arc::clone(&self.factory),
            client_id: self.client_id.clone(),
            client_name: self.name.clone(),
        })?;

        let mut slot = self.supervisor.lock();
        if let Some(previous) = slot.take() {
            previous.cancel_reconnection();
        }
        supervisor.start();
        *slot = Some(supervisor);
        Ok(())
    }

    /// Cleanly disconnects and stops any reconnection.
    pub async fn disconnect(&self) {
        let (command, supervisor) = {
            let slot = self.supervisor.lock();
            match slot.as_ref() {
                Some(supervisor) => (supervisor.command_sender(), true),
                None => (None, false),
            }
        };
        if let Some(command_tx) = command {
            // The engine performs the goodbye/freeze/close sequence.
            let _ = command_tx.send(EngineCommand::Disconnect).await;
        }
        if supervisor {
            if let Some(supervisor) = self.supervisor.lock().as_ref() {
                supervisor.cancel_reconnection();
            }
        }
    }

    /// True while the supervisor is between reconnect attempts.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.supervisor
            .lock()
            .as_ref()
            .map(ConnectionSupervisor::is_reconnecting)
            .unwrap_or(false)
    }

    /// Sets the player volume (0–100).
    pub async fn set_volume(&self, volume: u8) {
        self.send_command(EngineCommand::SetVolume(volume)).await;
    }

    /// Mutes or unmutes the player.
    pub async fn set_muted(&self, muted: bool) {
        self.send_command(EngineCommand::SetMuted(muted)).await;
    }

    /// Adjusts the audio-path calibration; positive plays later.
    pub async fn set_static_delay(&self, delay_ms: f64) {
        // Takes effect immediately even without a session.
        self.filter.lock().set_static_delay_ms(delay_ms);
        self.send_command(EngineCommand::SetStaticDelay(delay_ms)).await;
    }

    /// Telemetry snapshot of the live session, or `None` when idle.
    pub async fn snapshot(&self) -> Option<EngineSnapshot> {
        let command_tx = self.supervisor.lock().as_ref()?.command_sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        command_tx.send(EngineCommand::Snapshot(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    /// Starts background reachability probing for the default endpoint.
    pub fn start_prober(&self, endpoint: ServerEndpoint) {
        let prober = ServerProber::start(ProberContext {
            endpoint,
            signaling_endpoint: self.signaling_endpoint.clone(),
            network: Arc::clone(&self.network),
            events: self.events.clone(),
            session_active: Arc::clone(&self.session_active),
        });
        if let Some(previous) = self.prober.lock().replace(prober) {
            previous.stop();
        }
    }

    /// Stops background probing.
    pub fn stop_prober(&self) {
        if let Some(prober) = self.prober.lock().take() {
            prober.stop();
        }
    }

    /// Updates the prober cadence for the host's power/visibility state.
    pub fn set_power_state(&self, power: PowerState) {
        if let Some(prober) = self.prober.lock().as_ref() {
            prober.set_power_state(power);
        }
    }

    /// Final shutdown: disconnects, stops probing, releases sync state.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.stop_prober();
        self.burst.stop();
        log::info!("[Client] Shutdown complete");
    }

    async fn send_command(&self, command: EngineCommand) {
        let command_tx = {
            let slot = self.supervisor.lock();
            slot.as_ref().and_then(ConnectionSupervisor::command_sender)
        };
        match command_tx {
            Some(tx) => {
                if tx.send(command).await.is_err() {
                    log::debug!("[Client] Session ended before command was delivered");
                }
            }
            None => log::debug!("[Client] No live session for command"),
        }
    }
}

//! Connection supervision: variant selection and auto-reconnect.
//!
//! Selection maps the endpoint's policy and the current network class to an
//! ordered list of transport variants. The reconnect FSM lives in a single
//! cancellable task: one linear loop with interior delays, so there is no
//! window in which two timers race and no scenario in which the loop
//! continues after cancellation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::OutputSink;
use crate::config::{ConnectionPolicy, CoreConfig, ServerEndpoint};
use crate::error::LockstepError;
use crate::events::{EventBus, SessionEvent};
use crate::network::{NetworkClass, NetworkMonitor};
use crate::session::{EngineCommand, EngineContext, SessionEngine, SessionOutcome};
use crate::timesync::{BurstSyncManager, TimeFilter};
use crate::transport::{
    Transport, TransportEvent, WebRtcPeer, WebRtcTransport, WsTransport,
};

/// Reconnect delays; attempts beyond the table reuse the last entry.
const BACKOFF_SCHEDULE_MS: [u64; 11] = [
    500, 1_000, 2_000, 4_000, 8_000, 15_000, 30_000, 60_000, 60_000, 60_000, 60_000,
];

/// Capacity of the per-connection transport event queue.
const TRANSPORT_EVENT_QUEUE: usize = 256;

/// The three concrete connection variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionVariant {
    Local,
    Proxy,
    Remote,
}

impl ConnectionVariant {
    /// Short name for logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Proxy => "proxy",
            Self::Remote => "remote",
        }
    }
}

/// Variant priority under the `auto` policy for a network class.
///
/// Cellular skips local entirely; VPNs and unknown networks are assumed to
/// break LAN reachability and try the proxy first.
#[must_use]
pub fn auto_priority(class: NetworkClass) -> &'static [ConnectionVariant] {
    use ConnectionVariant::{Local, Proxy, Remote};
    match class {
        NetworkClass::Wifi | NetworkClass::Ethernet => &[Local, Proxy, Remote],
        NetworkClass::Cellular => &[Proxy, Remote],
        NetworkClass::Vpn | NetworkClass::Unknown => &[Proxy, Remote, Local],
    }
}

/// Ordered, configured variants for an endpoint under its policy.
///
/// # Errors
///
/// [`LockstepError::Config`] when the policy selects only variants the
/// endpoint has no descriptor for.
pub fn select_variants(
    endpoint: &ServerEndpoint,
    class: NetworkClass,
) -> Result<Vec<ConnectionVariant>, LockstepError> {
    let configured = |variant: &ConnectionVariant| match variant {
        ConnectionVariant::Local => endpoint.local.is_some(),
        ConnectionVariant::Proxy => endpoint.proxy.is_some(),
        ConnectionVariant::Remote => endpoint.remote.is_some(),
    };

    let candidates: Vec<ConnectionVariant> = match endpoint.policy {
        ConnectionPolicy::Auto => auto_priority(class)
            .iter()
            .copied()
            .filter(configured)
            .collect(),
        ConnectionPolicy::LocalOnly => [ConnectionVariant::Local]
            .into_iter()
            .filter(configured)
            .collect(),
        ConnectionPolicy::ProxyOnly => [ConnectionVariant::Proxy]
            .into_iter()
            .filter(configured)
            .collect(),
        ConnectionPolicy::RemoteOnly => [ConnectionVariant::Remote]
            .into_iter()
            .filter(configured)
            .collect(),
    };

    if candidates.is_empty() {
        return Err(LockstepError::Config(format!(
            "endpoint '{}' has no usable connection variant under {:?}",
            endpoint.name, endpoint.policy
        )));
    }
    Ok(candidates)
}

/// Backoff delay before the given 1-based reconnect attempt.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let index = (attempt.max(1) as usize - 1).min(BACKOFF_SCHEDULE_MS.len() - 1);
    Duration::from_millis(BACKOFF_SCHEDULE_MS[index])
}

/// Builds transports for a variant. Abstracted so tests can script
/// connection outcomes.
pub trait TransportFactory: Send + Sync {
    fn build(
        &self,
        variant: ConnectionVariant,
        endpoint: &ServerEndpoint,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, LockstepError>;
}

/// Production factory wiring the concrete transport variants.
pub struct DefaultTransportFactory {
    pub high_power_mode: bool,
    /// Signaling service URL for the WebRTC variant.
    pub signaling_endpoint: String,
    /// Host-provided peer connections; `None` disables the remote variant.
    pub peer_factory: Option<Arc<dyn Fn() -> Arc<dyn WebRtcPeer> + Send + Sync>>,
}

impl TransportFactory for DefaultTransportFactory {
    fn build(
        &self,
        variant: ConnectionVariant,
        endpoint: &ServerEndpoint,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, LockstepError> {
        match variant {
            ConnectionVariant::Local => {
                let descriptor = endpoint.local.as_ref().ok_or_else(|| {
                    LockstepError::Config("no local descriptor".to_string())
                })?;
                Ok(Arc::new(WsTransport::local(
                    descriptor,
                    event_tx,
                    self.high_power_mode,
                )))
            }
            ConnectionVariant::Proxy => {
                let descriptor = endpoint.proxy.as_ref().ok_or_else(|| {
                    LockstepError::Config("no proxy descriptor".to_string())
                })?;
                Ok(Arc::new(WsTransport::proxy(
                    descriptor,
                    event_tx,
                    self.high_power_mode,
                )))
            }
            ConnectionVariant::Remote => {
                let remote_id = endpoint.remote.clone().ok_or_else(|| {
                    LockstepError::Config("no remote handle".to_string())
                })?;
                let peer_factory = self.peer_factory.as_ref().ok_or_else(|| {
                    LockstepError::Config("host provides no WebRTC peer".to_string())
                })?;
                Ok(Arc::new(WebRtcTransport::new(
                    self.signaling_endpoint.clone(),
                    remote_id,
                    peer_factory(),
                    event_tx,
                )))
            }
        }
    }
}

/// Everything the supervisor needs.
pub struct SupervisorContext {
    pub endpoint: ServerEndpoint,
    pub config: CoreConfig,
    pub network: Arc<NetworkMonitor>,
    pub events: EventBus,
    pub filter: Arc<Mutex<TimeFilter>>,
    pub burst: Arc<BurstSyncManager>,
    pub sink: Arc<dyn OutputSink>,
    pub factory: Arc<dyn TransportFactory>,
    pub client_id: String,
    pub client_name: String,
}

struct Inner {
    endpoint: ServerEndpoint,
    config: CoreConfig,
    network: Arc<NetworkMonitor>,
    events: EventBus,
    filter: Arc<Mutex<TimeFilter>>,
    burst: Arc<BurstSyncManager>,
    sink: Arc<dyn OutputSink>,
    factory: Arc<dyn TransportFactory>,
    client_id: String,
    client_name: String,

    reconnecting: AtomicBool,
    attempt: AtomicU32,
    /// Command channel of the live session, if any.
    command_slot: Mutex<Option<mpsc::Sender<EngineCommand>>>,
    /// Cancellation for the current lifecycle task.
    cancel: Mutex<Option<CancellationToken>>,
}

/// A connected transport ready to host a session.
struct Connected {
    transport: Arc<dyn Transport>,
    variant: ConnectionVariant,
    transport_rx: mpsc::Receiver<TransportEvent>,
}

enum ConnectResult {
    Connected(Connected),
    Cancelled,
    Failed(LockstepError),
}

/// Drives the transport lifecycle for one endpoint.
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Creates a supervisor for the endpoint.
    ///
    /// # Errors
    ///
    /// [`LockstepError::Config`] when the endpoint has no descriptors at all.
    pub fn new(context: SupervisorContext) -> Result<Self, LockstepError> {
        context.endpoint.validate().map_err(LockstepError::Config)?;
        Ok(Self {
            inner: Arc::new(Inner {
                endpoint: context.endpoint,
                config: context.config,
                network: context.network,
                events: context.events,
                filter: context.filter,
                burst: context.burst,
                sink: context.sink,
                factory: context.factory,
                client_id: context.client_id,
                client_name: context.client_name,
                reconnecting: AtomicBool::new(false),
                attempt: AtomicU32::new(0),
                command_slot: Mutex::new(None),
                cancel: Mutex::new(None),
            }),
        })
    }

    /// Starts the connection lifecycle.
    ///
    /// Any previous lifecycle task is cancelled first, so at most one loop
    /// runs per endpoint.
    pub fn start(&self) {
        let cancel = CancellationToken::new();
        {
            let mut slot = self.inner.cancel.lock();
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
            *slot = Some(cancel.clone());
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::run(inner, cancel).await;
        });
    }

    /// Cancels everything: the backoff timer, the in-flight connect attempt,
    /// the running session, and all future iterations.
    pub fn cancel_reconnection(&self) {
        if let Some(cancel) = self.inner.cancel.lock().take() {
            cancel.cancel();
        }
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        self.inner.attempt.store(0, Ordering::SeqCst);
        self.inner.burst.stop();
    }

    /// True while the reconnect FSM is between attempts.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    /// Current 1-based reconnect attempt, 0 when not reconnecting.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.attempt.load(Ordering::SeqCst)
    }

    /// Command channel of the live session, if one is up.
    #[must_use]
    pub fn command_sender(&self) -> Option<mpsc::Sender<EngineCommand>> {
        self.inner.command_slot.lock().clone()
    }
}

impl Inner {
    /// The whole lifecycle: connect, session, reconnect. One task, one
    /// cancellation token.
    async fn run(inner: Arc<Self>, cancel: CancellationToken) {
        let mut dead: HashSet<ConnectionVariant> = HashSet::new();

        // Initial connection. A failure here surfaces immediately: the
        // reconnect FSM only guards sessions that were once connected.
        let mut connected = match Self::connect_once(&inner, &mut dead, &cancel).await {
            ConnectResult::Connected(c) => c,
            ConnectResult::Cancelled => return,
            ConnectResult::Failed(error) => {
                log::warn!("[Supervisor] Initial connect failed: {}", error);
                inner.events.emit(SessionEvent::Error {
                    code: error.code(),
                    message: error.to_string(),
                });
                return;
            }
        };

        loop {
            let variant = connected.variant;
            let outcome = Self::run_session(&inner, connected, &cancel).await;

            let Some(outcome) = outcome else {
                // Cancelled mid-session; everything is already torn down.
                return;
            };

            match outcome {
                SessionOutcome::UserDisconnect | SessionOutcome::CleanClose => return,
                SessionOutcome::HandshakeFailed(reason) => {
                    log::warn!("[Supervisor] Session lost during handshake: {}", reason);
                }
                SessionOutcome::TransportFailed(error) => {
                    if !error.is_recoverable() {
                        log::warn!(
                            "[Supervisor] Variant {} failed fatally: {}",
                            variant.as_str(),
                            error
                        );
                        dead.insert(variant);
                    } else {
                        log::info!(
                            "[Supervisor] Session dropped on {}: {}",
                            variant.as_str(),
                            error
                        );
                    }
                }
            }

            match Self::reconnect(&inner, &mut dead, &cancel).await {
                Some(next) => {
                    connected = next;
                    // A fresh session clears the per-cycle variant blacklist.
                    dead.clear();
                }
                None => return,
            }
        }
    }

    /// Tries every allowed variant once, in priority order for the current
    /// network class. Fatal failures blacklist the variant for this cycle.
    async fn connect_once(
        inner: &Arc<Self>,
        dead: &mut HashSet<ConnectionVariant>,
        cancel: &CancellationToken,
    ) -> ConnectResult {
        let class = inner.network.class();
        let variants = match select_variants(&inner.endpoint, class) {
            Ok(variants) => variants,
            Err(e) => return ConnectResult::Failed(e),
        };

        let mut last_error: Option<LockstepError> = None;
        for variant in variants {
            if dead.contains(&variant) {
                continue;
            }
            log::info!(
                "[Supervisor] Trying {} for '{}' (network: {:?})",
                variant.as_str(),
                inner.endpoint.name,
                class
            );

            let (event_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_QUEUE);
            let transport = match inner.factory.build(variant, &inner.endpoint, event_tx) {
                Ok(transport) => transport,
                Err(e) => {
                    log::warn!("[Supervisor] Cannot build {}: {}", variant.as_str(), e);
                    last_error = Some(e);
                    continue;
                }
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    transport.destroy().await;
                    return ConnectResult::Cancelled;
                }
                result = transport.connect() => result,
            };

            match result {
                Ok(()) => {
                    return ConnectResult::Connected(Connected {
                        transport,
                        variant,
                        transport_rx,
                    });
                }
                Err(error) => {
                    transport.destroy().await;
                    if !error.is_recoverable() {
                        log::warn!(
                            "[Supervisor] {} failed fatally, rotating: {}",
                            variant.as_str(),
                            error
                        );
                        dead.insert(variant);
                    }
                    last_error = Some(error.into());
                }
            }
        }

        ConnectResult::Failed(last_error.unwrap_or_else(|| {
            LockstepError::Config("no connection variant left to try".to_string())
        }))
    }

    /// Hosts one session on a connected transport. `None` means the
    /// lifecycle was cancelled.
    async fn run_session(
        inner: &Arc<Self>,
        connected: Connected,
        cancel: &CancellationToken,
    ) -> Option<SessionOutcome> {
        let Connected {
            transport,
            variant,
            transport_rx,
        } = connected;

        let (command_tx, command_rx) = mpsc::channel(16);
        *inner.command_slot.lock() = Some(command_tx);
        inner.reconnecting.store(false, Ordering::SeqCst);
        inner.attempt.store(0, Ordering::SeqCst);

        let engine = SessionEngine::new(EngineContext {
            transport: Arc::clone(&transport),
            transport_rx,
            command_rx,
            filter: Arc::clone(&inner.filter),
            burst: Arc::clone(&inner.burst),
            sink: Arc::clone(&inner.sink),
            events: inner.events.clone(),
            config: inner.config.clone(),
            client_id: inner.client_id.clone(),
            client_name: inner.client_name.clone(),
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("[Supervisor] Session on {} cancelled", variant.as_str());
                inner.burst.stop();
                transport.destroy().await;
                *inner.command_slot.lock() = None;
                return None;
            }
            outcome = engine.run() => outcome,
        };

        *inner.command_slot.lock() = None;
        transport.destroy().await;
        Some(outcome)
    }

    /// The reconnect FSM: bounded attempts with backoff, re-selecting the
    /// variant priority from the live network class on every attempt.
    async fn reconnect(
        inner: &Arc<Self>,
        dead: &mut HashSet<ConnectionVariant>,
        cancel: &CancellationToken,
    ) -> Option<Connected> {
        inner.reconnecting.store(true, Ordering::SeqCst);
        let mut availability = inner.network.subscribe_availability();
        availability.mark_unchanged();
        let max_attempts = inner.config.max_reconnect_attempts;

        for attempt in 1..=max_attempts {
            inner.attempt.store(attempt, Ordering::SeqCst);
            let delay = backoff_delay(attempt);
            log::info!(
                "[Supervisor] Reconnect attempt {}/{} in {:?}",
                attempt,
                max_attempts,
                delay
            );
            inner.events.emit(SessionEvent::ReconnectScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    inner.reconnecting.store(false, Ordering::SeqCst);
                    inner.attempt.store(0, Ordering::SeqCst);
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
                changed = availability.changed() => {
                    if changed.is_ok() {
                        log::info!("[Supervisor] Network available, skipping backoff delay");
                    }
                }
            }

            match Self::connect_once(inner, dead, cancel).await {
                ConnectResult::Connected(connected) => {
                    inner.reconnecting.store(false, Ordering::SeqCst);
                    inner.attempt.store(0, Ordering::SeqCst);
                    return Some(connected);
                }
                ConnectResult::Cancelled => {
                    inner.reconnecting.store(false, Ordering::SeqCst);
                    inner.attempt.store(0, Ordering::SeqCst);
                    return None;
                }
                ConnectResult::Failed(error) => {
                    log::warn!(
                        "[Supervisor] Reconnect attempt {}/{} failed: {}",
                        attempt,
                        max_attempts,
                        error
                    );
                    // A cycle that blacklisted every variant can still see a
                    // network change revive one; keep only fatal suppression
                    // within the cycle but never let the set block all
                    // attempts silently.
                    if dead.len() >= 3 {
                        dead.clear();
                    }
                }
            }
        }

        log::warn!(
            "[Supervisor] Giving up after {} reconnect attempts",
            max_attempts
        );
        inner.events.emit(SessionEvent::ReconnectExhausted {
            attempts: max_attempts,
        });
        inner.reconnecting.store(false, Ordering::SeqCst);
        inner.attempt.store(0, Ordering::SeqCst);
        None
    }
}

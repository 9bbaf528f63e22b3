//! Background reachability probing for the default endpoint.
//!
//! When the user's default endpoint is configured but no session is live,
//! the prober periodically checks whether the server answers a WebSocket
//! upgrade (or, for the remote variant, whether the signaling service
//! accepts the exchange). A success is reported through the event bus so the
//! host can auto-connect.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ServerEndpoint;
use crate::events::{EventBus, SessionEvent};
use crate::network::NetworkMonitor;
use crate::supervisor::{select_variants, ConnectionVariant};
use crate::transport::signaling::{InboundSignal, SignalingClient};

/// Probe timeout for the local variant.
const LOCAL_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Probe timeout for proxy and remote variants.
const REMOTE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe cadence while the app is foregrounded or charging.
const ACTIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Probe cadence while backgrounded on battery.
const BACKGROUND_INTERVAL: Duration = Duration::from_secs(120);

/// Failure backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Host power/visibility state; drives the probe cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PowerState {
    /// Foregrounded or charging.
    Active = 0,
    /// Backgrounded on battery.
    Background = 1,
}

/// Cadence for the next probe.
///
/// Consecutive failures back off exponentially from 60 s up to 5 min,
/// regardless of power state.
#[must_use]
pub fn probe_interval(consecutive_failures: u32, power: PowerState) -> Duration {
    if consecutive_failures > 0 {
        let exponent = consecutive_failures.saturating_sub(1).min(3);
        let backoff = Duration::from_secs(60 << exponent);
        return backoff.min(MAX_BACKOFF);
    }
    match power {
        PowerState::Active => ACTIVE_INTERVAL,
        PowerState::Background => BACKGROUND_INTERVAL,
    }
}

/// What the prober needs from its host.
pub struct ProberContext {
    pub endpoint: ServerEndpoint,
    /// Signaling service URL for remote probes.
    pub signaling_endpoint: String,
    pub network: Arc<NetworkMonitor>,
    pub events: EventBus,
    /// Set by the client while a session is live; probes become no-ops.
    pub session_active: Arc<AtomicBool>,
}

struct Inner {
    endpoint: ServerEndpoint,
    signaling_endpoint: String,
    network: Arc<NetworkMonitor>,
    events: EventBus,
    session_active: Arc<AtomicBool>,
    power: AtomicU8,
    consecutive_failures: AtomicU32,
}

/// Periodic reachability probe, active only between sessions.
pub struct ServerProber {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

impl ServerProber {
    /// Starts the probe loop.
    #[must_use]
    pub fn start(context: ProberContext) -> Self {
        let inner = Arc::new(Inner {
            endpoint: context.endpoint,
            signaling_endpoint: context.signaling_endpoint,
            network: context.network,
            events: context.events,
            session_active: context.session_active,
            power: AtomicU8::new(PowerState::Active as u8),
            consecutive_failures: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();

        let loop_inner = Arc::clone(&inner);
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            Inner::run(loop_inner, loop_cancel).await;
        });

        Self { inner, cancel }
    }

    /// Stops the probe loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Updates the power state driving the cadence.
    pub fn set_power_state(&self, power: PowerState) {
        self.inner.power.store(power as u8, Ordering::Relaxed);
    }

    /// Consecutive failed probes, for telemetry.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Relaxed)
    }
}

impl Drop for ServerProber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    fn power(&self) -> PowerState {
        if self.power.load(Ordering::Relaxed) == PowerState::Background as u8 {
            PowerState::Background
        } else {
            PowerState::Active
        }
    }

    async fn run(inner: Arc<Self>, cancel: CancellationToken) {
        log::info!("[Prober] Started for '{}'", inner.endpoint.name);
        let mut availability = inner.network.subscribe_availability();
        availability.mark_unchanged();

        loop {
            let failures = inner.consecutive_failures.load(Ordering::Relaxed);
            let interval = probe_interval(failures, inner.power());

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("[Prober] Stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
                changed = availability.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    log::debug!("[Prober] Network change, probing immediately");
                }
            }

            if inner.session_active.load(Ordering::SeqCst) {
                // A live session answers the reachability question itself.
                continue;
            }

            match Self::probe(&inner).await {
                Some(variant) => {
                    inner.consecutive_failures.store(0, Ordering::Relaxed);
                    log::info!(
                        "[Prober] '{}' reachable via {}",
                        inner.endpoint.name,
                        variant.as_str()
                    );
                    inner.events.emit(SessionEvent::ServerReachable {
                        endpoint_id: inner.endpoint.id.clone(),
                    });
                }
                None => {
                    let failures = inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    log::debug!(
                        "[Prober] '{}' unreachable ({} consecutive)",
                        inner.endpoint.name,
                        failures
                    );
                }
            }
        }
    }

    /// Tries each selectable variant once; ends on the first success.
    async fn probe(inner: &Arc<Self>) -> Option<ConnectionVariant> {
        let class = inner.network.class();
        let variants = match select_variants(&inner.endpoint, class) {
            Ok(variants) => variants,
            Err(e) => {
                log::warn!("[Prober] No probeable variant: {}", e);
                return None;
            }
        };

        for variant in variants {
            let reachable = match variant {
                ConnectionVariant::Local => {
                    let Some(descriptor) = inner.endpoint.local.as_ref() else { continue };
                    probe_upgrade(&descriptor.url(), LOCAL_PROBE_TIMEOUT).await
                }
                ConnectionVariant::Proxy => {
                    let Some(descriptor) = inner.endpoint.proxy.as_ref() else { continue };
                    probe_upgrade(&descriptor.ws_url(), REMOTE_PROBE_TIMEOUT).await
                }
                ConnectionVariant::Remote => {
                    let Some(remote_id) = inner.endpoint.remote.clone() else { continue };
                    probe_signaling(&inner.signaling_endpoint, remote_id).await
                }
            };
            if reachable {
                return Some(variant);
            }
        }
        None
    }
}

/// Attempts a WebSocket upgrade and immediately drops the connection.
async fn probe_upgrade(url: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((mut stream, _response))) => {
            let _ = stream.close(None).await;
            true
        }
        Ok(Err(e)) => {
            tracing::debug!(url, error = %e, "probe upgrade failed");
            false
        }
        Err(_) => {
            tracing::debug!(url, "probe upgrade timed out");
            false
        }
    }
}

/// Checks signaling-service connectivity: the exchange must reach the
/// `connected` acknowledgement.
async fn probe_signaling(endpoint: &str, remote_id: crate::config::RemoteId) -> bool {
    let attempt = async {
        let mut channel = SignalingClient::connect(endpoint, remote_id).await.ok()?;
        loop {
            match channel.recv().await.ok()? {
                InboundSignal::Connected { .. } => return Some(()),
                InboundSignal::Error { .. } => return None,
                _ => {}
            }
        }
    };
    tokio::time::timeout(REMOTE_PROBE_TIMEOUT, attempt)
        .await
        .ok()
        .flatten()
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_tracks_power_state() {
        assert_eq!(
            probe_interval(0, PowerState::Active),
            Duration::from_secs(60)
        );
        assert_eq!(
            probe_interval(0, PowerState::Background),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn failure_backoff_doubles_to_five_minutes() {
        assert_eq!(
            probe_interval(1, PowerState::Active),
            Duration::from_secs(60)
        );
        assert_eq!(
            probe_interval(2, PowerState::Active),
            Duration::from_secs(120)
        );
        assert_eq!(
            probe_interval(3, PowerState::Background),
            Duration::from_secs(240)
        );
        // Capped at 5 minutes from then on.
        assert_eq!(
            probe_interval(4, PowerState::Active),
            Duration::from_secs(300)
        );
        assert_eq!(
            probe_interval(20, PowerState::Active),
            Duration::from_secs(300)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn upgrade_probe_succeeds_against_listening_server() {
        use futures_util::StreamExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });

        let url = format!("ws://127.0.0.1:{}/lockstep", port);
        assert!(probe_upgrade(&url, LOCAL_PROBE_TIMEOUT).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn upgrade_probe_fails_against_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let url = format!("ws://127.0.0.1:{}/lockstep", port);
        assert!(!probe_upgrade(&url, LOCAL_PROBE_TIMEOUT).await);
    }
}

//! Network class observation.
//!
//! The core never inspects interfaces itself; the host feeds it a
//! [`NetworkClass`] through a [`NetworkObserver`]. The current class is held
//! in a read-only atomic snapshot so the supervisor and prober can consult it
//! without crossing task boundaries.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Classification of the currently active network path.
///
/// Mutated by the host's network observer; read-only inside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    Wifi,
    Ethernet,
    Cellular,
    Vpn,
    #[default]
    Unknown,
}

impl NetworkClass {
    fn to_u8(self) -> u8 {
        match self {
            Self::Wifi => 0,
            Self::Ethernet => 1,
            Self::Cellular => 2,
            Self::Vpn => 3,
            Self::Unknown => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Wifi,
            1 => Self::Ethernet,
            2 => Self::Cellular,
            3 => Self::Vpn,
            _ => Self::Unknown,
        }
    }
}

/// Shared, lock-free view of the current network class.
///
/// The host writes through [`NetworkMonitor::set_class`]; core components
/// read via [`NetworkMonitor::class`]. An availability pulse is delivered on
/// a watch channel so the supervisor can cut a backoff delay short when
/// connectivity returns.
pub struct NetworkMonitor {
    class: AtomicU8,
    availability_tx: watch::Sender<u64>,
}

impl NetworkMonitor {
    /// Creates a monitor starting in [`NetworkClass::Unknown`].
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (availability_tx, _) = watch::channel(0);
        Arc::new(Self {
            class: AtomicU8::new(NetworkClass::Unknown.to_u8()),
            availability_tx,
        })
    }

    /// Returns the most recently observed network class.
    pub fn class(&self) -> NetworkClass {
        NetworkClass::from_u8(self.class.load(Ordering::Relaxed))
    }

    /// Records a new network class, reported by the host observer.
    ///
    /// A class change also pulses the availability channel: the prober runs
    /// one immediate probe and the supervisor cuts any backoff delay short.
    pub fn set_class(&self, class: NetworkClass) {
        let prev = NetworkClass::from_u8(self.class.swap(class.to_u8(), Ordering::Relaxed));
        if prev != class {
            log::info!("[Network] Class changed: {:?} -> {:?}", prev, class);
            self.signal_available();
        }
    }

    /// Signals that the network became available.
    ///
    /// Skips the remainder of any supervisor backoff delay without cancelling
    /// the enclosing reconnect task.
    pub fn signal_available(&self) {
        self.availability_tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Subscribes to availability pulses.
    pub fn subscribe_availability(&self) -> watch::Receiver<u64> {
        self.availability_tx.subscribe()
    }
}

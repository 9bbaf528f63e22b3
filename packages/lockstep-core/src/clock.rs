//! Monotonic time source shared by the sync and playout paths.
//!
//! All protocol timestamps on the client side are microseconds on a single
//! process-wide monotonic axis. Using one shared epoch means a timestamp
//! captured in the I/O task and a deadline computed in the engine task are
//! directly comparable.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Process-wide monotonic epoch, captured on first use.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Returns the current monotonic time in microseconds since the process epoch.
#[must_use]
pub fn now_micros() -> i64 {
    epoch().elapsed().as_micros() as i64
}

/// Converts a monotonic microsecond timestamp back into an [`Instant`].
///
/// Timestamps before the epoch (possible after clock-domain conversion of a
/// very early server timestamp) saturate to the epoch itself.
#[must_use]
pub fn instant_at_micros(micros: i64) -> Instant {
    if micros <= 0 {
        epoch()
    } else {
        epoch() + Duration::from_micros(micros as u64)
    }
}

/// Returns how far in the future `deadline_us` is, or zero if it has passed.
#[must_use]
pub fn micros_until(deadline_us: i64) -> Duration {
    let delta = deadline_us - now_micros();
    if delta <= 0 {
        Duration::ZERO
    } else {
        Duration::from_micros(delta as u64)
    }
}

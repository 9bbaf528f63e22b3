//! Time synchronization: Kalman clock filter and burst request pacing.

pub mod burst;
pub mod filter;

pub use burst::{BurstCadence, BurstPhase, BurstSyncManager};
pub use filter::{FilterStats, TimeFilter, TimeMeasurement, STALE_RTT_US};

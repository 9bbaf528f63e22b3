//! NTP-style best-of-N time-request pacing.
//!
//! Each burst sends N time requests 50 ms apart, waits 100 ms for
//! stragglers, then feeds only the lowest-RTT response to the
//! [`TimeFilter`]: under jitter, the minimum-RTT sample has the least
//! queueing on either direction and therefore the least biased offset.
//! Burst size and spacing adapt to the observed jitter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::filter::{TimeFilter, TimeMeasurement};

/// Spacing between packets within a burst.
const PACKET_SPACING: Duration = Duration::from_millis(50);

/// Wait for stragglers after the last packet of a burst.
const STRAGGLER_WAIT: Duration = Duration::from_millis(100);

/// Rolling history of best-of-burst RTTs driving the cadence bands.
const RTT_HISTORY: usize = 15;

/// IQR above this means a jittery link: sync aggressively.
const IQR_AGGRESSIVE_US: i64 = 20_000;

/// IQR below this means a quiet link: back off.
const IQR_CONSERVATIVE_US: i64 = 5_000;

/// Burst parameters for one jitter band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstCadence {
    /// Requests per burst.
    pub burst_size: u32,
    /// Pause between bursts.
    pub interval: Duration,
}

impl BurstCadence {
    /// High-jitter band: large bursts, short pauses.
    pub const AGGRESSIVE: Self = Self {
        burst_size: 15,
        interval: Duration::from_millis(200),
    };

    /// Quiet-link band.
    pub const CONSERVATIVE: Self = Self {
        burst_size: 5,
        interval: Duration::from_millis(500),
    };

    /// Default band.
    pub const DEFAULT: Self = Self {
        burst_size: 10,
        interval: Duration::from_millis(250),
    };
}

/// Burst manager phase, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BurstPhase {
    Idle = 0,
    BurstInFlight = 1,
    BetweenBursts = 2,
}

impl BurstPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::BurstInFlight,
            2 => Self::BetweenBursts,
            _ => Self::Idle,
        }
    }
}

/// Best-of-N time-request pacer feeding the [`TimeFilter`].
pub struct BurstSyncManager {
    filter: Arc<Mutex<TimeFilter>>,
    /// Rolling best-of-burst RTTs; cleared on stop.
    rtt_history: Mutex<VecDeque<i64>>,
    phase: AtomicU8,
    /// Cancellation for the running burst task, if any.
    running: Mutex<Option<CancellationToken>>,
}

impl BurstSyncManager {
    /// Creates a stopped manager bound to a shared filter.
    #[must_use]
    pub fn new(filter: Arc<Mutex<TimeFilter>>) -> Self {
        Self {
            filter,
            rtt_history: Mutex::new(VecDeque::with_capacity(RTT_HISTORY)),
            phase: AtomicU8::new(BurstPhase::Idle as u8),
            running: Mutex::new(None),
        }
    }

    /// Current phase of the burst state machine.
    #[must_use]
    pub fn phase(&self) -> BurstPhase {
        BurstPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    /// Cadence band selected from the current RTT history.
    #[must_use]
    pub fn cadence(&self) -> BurstCadence {
        let history = self.rtt_history.lock();
        match interquartile_range(&history) {
            Some(iqr) if iqr > IQR_AGGRESSIVE_US => BurstCadence::AGGRESSIVE,
            Some(iqr) if iqr < IQR_CONSERVATIVE_US => BurstCadence::CONSERVATIVE,
            _ => BurstCadence::DEFAULT,
        }
    }

    /// Starts the burst loop.
    ///
    /// Every time request is a `()` pulse on `request_tx`; the session engine
    /// stamps t1 and writes the actual `client/time` message. Responses are
    /// fed back through the returned sender after the engine stamps t4.
    ///
    /// A second `start` while running restarts the loop.
    pub fn start(self: &Arc<Self>, request_tx: mpsc::Sender<()>) -> mpsc::Sender<TimeMeasurement> {
        self.stop();

        let cancel = CancellationToken::new();
        *self.running.lock() = Some(cancel.clone());

        let (response_tx, response_rx) = mpsc::channel(64);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run(request_tx, response_rx, cancel).await;
        });
        response_tx
    }

    /// Stops the burst loop.
    ///
    /// Drops any mid-burst collection and resets the jitter history; a
    /// subsequent start begins in the default band.
    pub fn stop(&self) {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
        }
        self.rtt_history.lock().clear();
        self.phase.store(BurstPhase::Idle as u8, Ordering::Relaxed);
    }

    /// True while the burst loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    async fn run(
        self: Arc<Self>,
        request_tx: mpsc::Sender<()>,
        mut response_rx: mpsc::Receiver<TimeMeasurement>,
        cancel: CancellationToken,
    ) {
        log::info!("[BurstSync] Started");
        loop {
            let cadence = self.cadence();
            self.phase
                .store(BurstPhase::BurstInFlight as u8, Ordering::Relaxed);

            let mut collected: Vec<TimeMeasurement> = Vec::with_capacity(cadence.burst_size as usize);

            // Send the burst, collecting responses while pacing packets.
            for i in 0..cadence.burst_size {
                if request_tx.send(()).await.is_err() {
                    log::info!("[BurstSync] Request channel closed, stopping");
                    self.phase.store(BurstPhase::Idle as u8, Ordering::Relaxed);
                    return;
                }
                if i + 1 < cadence.burst_size {
                    if !collect_for(&mut response_rx, &mut collected, PACKET_SPACING, &cancel).await
                    {
                        return;
                    }
                }
            }

            // Stragglers get a grace window after the last packet.
            if !collect_for(&mut response_rx, &mut collected, STRAGGLER_WAIT, &cancel).await {
                return;
            }

            self.finish_burst(&collected);

            self.phase
                .store(BurstPhase::BetweenBursts as u8, Ordering::Relaxed);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(cadence.interval) => {}
            }
        }
    }

    /// Selects the best response of a burst and feeds it to the filter.
    fn finish_burst(&self, collected: &[TimeMeasurement]) {
        if collected.is_empty() {
            log::warn!("[BurstSync] Burst produced no responses");
            return;
        }

        let best = collected
            .iter()
            .filter(|m| !m.is_stale())
            .min_by_key(|m| m.rtt_us);

        let Some(best) = best else {
            // An all-stale burst says nothing about the link; it neither
            // feeds the filter nor counts against the jitter history.
            log::warn!(
                "[BurstSync] All {} responses stale, skipping burst",
                collected.len()
            );
            return;
        };

        log::debug!(
            "[BurstSync] Best of {}: rtt={}us, offset={}us",
            collected.len(),
            best.rtt_us,
            best.offset_us
        );

        self.filter.lock().ingest(*best);

        let mut history = self.rtt_history.lock();
        if history.len() == RTT_HISTORY {
            history.pop_front();
        }
        history.push_back(best.rtt_us);
    }
}

/// Collects responses for up to `window`, returning `false` on cancellation.
async fn collect_for(
    response_rx: &mut mpsc::Receiver<TimeMeasurement>,
    collected: &mut Vec<TimeMeasurement>,
    window: Duration,
    cancel: &CancellationToken,
) -> bool {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep_until(deadline) => return true,
            response = response_rx.recv() => match response {
                Some(m) => collected.push(m),
                // Engine side gone; treat like cancellation.
                None => return false,
            },
        }
    }
}

/// IQR (Q3 − Q1) of the RTT history; `None` below four samples.
fn interquartile_range(history: &VecDeque<i64>) -> Option<i64> {
    if history.len() < 4 {
        return None;
    }
    let mut sorted: Vec<i64> = history.iter().copied().collect();
    sorted.sort_unstable();
    let q1 = sorted[sorted.len() / 4];
    let q3 = sorted[(sorted.len() * 3) / 4];
    Some(q3 - q1)
}

#[cfg(test)]
mod tests {
    use super::super::filter::STALE_RTT_US;
    use super::*;

    fn manager() -> (Arc<BurstSyncManager>, Arc<Mutex<TimeFilter>>) {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        (
            Arc::new(BurstSyncManager::new(Arc::clone(&filter))),
            filter,
        )
    }

    fn measurement(offset_us: i64, rtt_us: i64) -> TimeMeasurement {
        TimeMeasurement {
            offset_us,
            max_error_us: rtt_us / 2,
            client_recv_us: 1_000_000,
            rtt_us,
        }
    }

    #[test]
    fn default_band_without_history() {
        let (manager, _) = manager();
        assert_eq!(manager.cadence(), BurstCadence::DEFAULT);
    }

    #[test]
    fn band_selection_follows_iqr() {
        let (manager, _) = manager();

        // Jittery link: spread-out best RTTs.
        {
            let mut history = manager.rtt_history.lock();
            for rtt in [5_000, 10_000, 20_000, 40_000, 80_000, 120_000] {
                history.push_back(rtt);
            }
        }
        assert_eq!(manager.cadence(), BurstCadence::AGGRESSIVE);

        // Quiet link: tightly clustered best RTTs.
        {
            let mut history = manager.rtt_history.lock();
            history.clear();
            for rtt in [10_000, 10_500, 11_000, 10_200, 10_800, 10_300] {
                history.push_back(rtt);
            }
        }
        assert_eq!(manager.cadence(), BurstCadence::CONSERVATIVE);
    }

    #[test]
    fn best_of_burst_feeds_filter() {
        let (manager, filter) = manager();

        manager.finish_burst(&[
            measurement(9_000, 30_000),
            measurement(1_000, 8_000),
            measurement(5_000, 15_000),
        ]);

        // Lowest-RTT offset seeds the filter.
        assert_eq!(filter.lock().offset_us(), 1_000);
        assert_eq!(manager.rtt_history.lock().back().copied(), Some(8_000));
    }

    #[test]
    fn all_stale_burst_is_skipped_entirely() {
        let (manager, filter) = manager();

        manager.finish_burst(&[
            measurement(9_000, STALE_RTT_US),
            measurement(1_000, STALE_RTT_US + 5),
        ]);

        assert_eq!(filter.lock().measurement_count(), 0);
        assert!(manager.rtt_history.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_paces_requests_and_picks_best() {
        let (manager, filter) = manager();
        let (request_tx, mut request_rx) = mpsc::channel(32);

        let response_tx = manager.start(request_tx);

        // Default band: 10 requests, 50 ms apart.
        for i in 0..10 {
            tokio::time::timeout(Duration::from_millis(60), request_rx.recv())
                .await
                .expect("request within packet spacing")
                .expect("request channel open");
            // Respond to each request; the fifth is the fastest.
            let rtt = if i == 5 { 4_000 } else { 12_000 + i * 100 };
            response_tx
                .send(measurement(2_000 + rtt, rtt))
                .await
                .expect("response channel open");
        }

        // Let the straggler window close and the burst finish.
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(filter.lock().measurement_count(), 1);
        assert_eq!(filter.lock().offset_us(), 2_000 + 4_000);

        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drops_midburst_state_and_history() {
        let (manager, _) = manager();
        let (request_tx, mut request_rx) = mpsc::channel(32);

        let response_tx = manager.start(request_tx);
        // Receive one request, leave the burst mid-flight.
        request_rx.recv().await.expect("first request");
        response_tx
            .send(measurement(1_000, 5_000))
            .await
            .expect("response accepted");

        manager.stop();

        assert!(!manager.is_running());
        assert_eq!(manager.phase(), BurstPhase::Idle);
        assert!(manager.rtt_history.lock().is_empty());
        assert_eq!(manager.cadence(), BurstCadence::DEFAULT);

        // The stopped task sends no further requests.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(
            request_rx.try_recv().is_err(),
            "no requests may arrive after stop"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_burst_logs_and_continues() {
        let (manager, filter) = manager();
        let (request_tx, mut request_rx) = mpsc::channel(32);

        let _response_tx = manager.start(request_tx);

        // Swallow an entire burst without responding.
        for _ in 0..10 {
            request_rx.recv().await.expect("request");
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        // No measurement, but the loop is still alive and bursts again.
        assert_eq!(filter.lock().measurement_count(), 0);
        request_rx.recv().await.expect("next burst starts");

        manager.stop();
    }
}

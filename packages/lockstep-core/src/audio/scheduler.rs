//! Timestamp-driven playout scheduling.
//!
//! Decoded buffers enter with server-domain timestamps, are translated to
//! local deadlines through the time filter at enqueue time, and leave through
//! the output sink when their deadline is imminent. Deadlines of queued
//! entries are never remapped; after a large clock correction, only future
//! entries see the new mapping, and the audible seam is accepted for
//! correctness.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clock;
use crate::config::{CoreConfig, DEFAULT_BUFFER_CAPACITY};
use crate::timesync::TimeFilter;

use super::{DecodedBuffer, OutputSink, SinkPush};

/// Poll interval while the queue is empty or nothing is due.
const PLAYOUT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Pause after the sink reports overflow before retrying.
const SINK_BACKOFF: Duration = Duration::from_millis(2);

/// Minimum spacing of overflow/late warnings.
const WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Scheduler tuning derived from [`CoreConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Queue bound in bytes of decoded PCM.
    pub capacity_bytes: usize,
    /// Frames scheduled to play further in the past than this are skipped.
    pub late_threshold_ms: u64,
    /// Offset corrections larger than this are logged as seams.
    pub correction_threshold_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_BUFFER_CAPACITY,
            late_threshold_ms: 100,
            correction_threshold_ms: 20,
        }
    }
}

impl SchedulerConfig {
    /// Derives scheduler tuning from the host configuration.
    #[must_use]
    pub fn from_core(config: &CoreConfig) -> Self {
        Self {
            capacity_bytes: config.output_buffer_capacity,
            late_threshold_ms: config.late_frame_threshold_ms,
            ..Self::default()
        }
    }
}

/// A queue entry: local playout deadline plus PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBuffer {
    /// Local monotonic deadline in microseconds.
    pub deadline_us: i64,
    /// Interleaved 16-bit PCM.
    pub samples: Vec<i16>,
}

impl ScheduledBuffer {
    fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }
}

/// Counters surfaced through telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub queued_buffers: usize,
    pub queued_bytes: usize,
    pub dropped_late: u64,
    pub dropped_overflow: u64,
}

struct Inner {
    queue: VecDeque<ScheduledBuffer>,
    queued_bytes: usize,
    /// Filter offset at the previous enqueue, for seam detection.
    last_offset_us: Option<i64>,
    last_overflow_warn: Option<Instant>,
    last_late_warn: Option<Instant>,
    dropped_late: u64,
    dropped_overflow: u64,
}

/// Bounded, monotonic playout queue.
///
/// Never blocks the decoder: overflow drops oldest-first with a rate-limited
/// warning.
pub struct Scheduler {
    filter: Arc<Mutex<TimeFilter>>,
    config: SchedulerConfig,
    inner: Mutex<Inner>,
}

impl Scheduler {
    /// Creates an empty scheduler bound to the session's time filter.
    #[must_use]
    pub fn new(filter: Arc<Mutex<TimeFilter>>, config: SchedulerConfig) -> Self {
        Self {
            filter,
            config,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued_bytes: 0,
                last_offset_us: None,
                last_overflow_warn: None,
                last_late_warn: None,
                dropped_late: 0,
                dropped_overflow: 0,
            }),
        }
    }

    /// Enqueues a decoded buffer, translating its server timestamp to a
    /// local deadline.
    pub fn enqueue(&self, buffer: DecodedBuffer) {
        let (deadline_us, offset_us) = {
            let filter = self.filter.lock();
            (filter.server_to_client(buffer.timestamp_us), filter.offset_us())
        };
        let now_us = clock::now_micros();
        let late_threshold_us = self.config.late_threshold_ms as i64 * 1_000;

        let mut inner = self.inner.lock();

        // Seam detection: queued entries keep their deadlines, future entries
        // use the corrected mapping.
        if let Some(last_offset) = inner.last_offset_us {
            let correction = (offset_us - last_offset).abs();
            if correction > self.config.correction_threshold_ms as i64 * 1_000 {
                log::warn!(
                    "[Scheduler] Clock correction of {}ms; queued audio keeps old deadlines, \
                     an audible seam may occur",
                    correction / 1_000
                );
            }
        }
        inner.last_offset_us = Some(offset_us);

        // Too late to be worth playing at all.
        if deadline_us < now_us - late_threshold_us {
            inner.dropped_late += 1;
            let dropped = inner.dropped_late;
            rate_limited(&mut inner.last_late_warn, || {
                log::warn!(
                    "[Scheduler] Dropping late frame: {}ms past deadline (total late: {})",
                    (now_us - deadline_us) / 1_000,
                    dropped
                );
            });
            return;
        }

        let incoming = ScheduledBuffer {
            // Deadlines stay monotonic even across a backwards correction;
            // playout order is FIFO regardless.
            deadline_us: inner
                .queue
                .back()
                .map_or(deadline_us, |back| deadline_us.max(back.deadline_us)),
            samples: buffer.samples,
        };
        let incoming_bytes = incoming.byte_len();

        if incoming_bytes > self.config.capacity_bytes {
            log::warn!(
                "[Scheduler] Buffer of {} bytes exceeds queue capacity, discarding",
                incoming_bytes
            );
            inner.dropped_overflow += 1;
            return;
        }

        while inner.queued_bytes + incoming_bytes > self.config.capacity_bytes {
            let Some(evicted) = inner.queue.pop_front() else { break };
            inner.queued_bytes -= evicted.byte_len();
            inner.dropped_overflow += 1;
            let dropped = inner.dropped_overflow;
            let capacity = self.config.capacity_bytes;
            rate_limited(&mut inner.last_overflow_warn, || {
                log::warn!(
                    "[Scheduler] Queue over {} bytes, dropping oldest (total dropped: {})",
                    capacity,
                    dropped
                );
            });
        }

        inner.queued_bytes += incoming_bytes;
        inner.queue.push_back(incoming);
    }

    /// Hands out the next buffer whose deadline is imminent.
    ///
    /// "Imminent" means `deadline ≤ now + latency_floor`. Entries that have
    /// drifted past the late threshold while queued are skipped entirely
    /// rather than played late.
    pub fn next_ready(&self, latency_floor_us: i64) -> Option<ScheduledBuffer> {
        let now_us = clock::now_micros();
        let late_threshold_us = self.config.late_threshold_ms as i64 * 1_000;

        let mut inner = self.inner.lock();
        while let Some(front) = inner.queue.front() {
            if front.deadline_us < now_us - late_threshold_us {
                let expired = inner.queue.pop_front().expect("front checked");
                inner.queued_bytes -= expired.byte_len();
                inner.dropped_late += 1;
                let dropped = inner.dropped_late;
                rate_limited(&mut inner.last_late_warn, || {
                    log::warn!(
                        "[Scheduler] Skipping frame {}ms past deadline (total late: {})",
                        (now_us - expired.deadline_us) / 1_000,
                        dropped
                    );
                });
                continue;
            }
            if front.deadline_us <= now_us.saturating_add(latency_floor_us) {
                let ready = inner.queue.pop_front().expect("front checked");
                inner.queued_bytes -= ready.byte_len();
                return Some(ready);
            }
            return None;
        }
        None
    }

    /// Puts a buffer back at the head after a sink overflow.
    pub fn requeue_front(&self, buffer: ScheduledBuffer) {
        let mut inner = self.inner.lock();
        inner.queued_bytes += buffer.byte_len();
        inner.queue.push_front(buffer);
    }

    /// Empties the queue.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        let flushed = inner.queue.len();
        inner.queue.clear();
        inner.queued_bytes = 0;
        inner.last_offset_us = None;
        if flushed > 0 {
            log::info!("[Scheduler] Flushed {} queued buffers", flushed);
        }
    }

    /// Queue counters for telemetry.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let inner = self.inner.lock();
        SchedulerStats {
            queued_buffers: inner.queue.len(),
            queued_bytes: inner.queued_bytes,
            dropped_late: inner.dropped_late,
            dropped_overflow: inner.dropped_overflow,
        }
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

/// Invokes `warn` at most once per [`WARN_INTERVAL`].
fn rate_limited(last: &mut Option<Instant>, warn: impl FnOnce()) {
    let now = Instant::now();
    if last.map_or(true, |t| now.duration_since(t) >= WARN_INTERVAL) {
        warn();
        *last = Some(now);
    }
}

/// Playout loop: pulls imminent buffers and hands them to the sink.
///
/// Polls at millisecond granularity to keep handoff jitter low; honors
/// cancellation at every suspension point.
pub async fn run_playout(
    scheduler: Arc<Scheduler>,
    sink: Arc<dyn OutputSink>,
    cancel: CancellationToken,
) {
    log::debug!("[Playout] Started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match scheduler.next_ready(sink.latency_floor_us()) {
            Some(buffer) => match sink.push(buffer.deadline_us, &buffer.samples) {
                SinkPush::Accepted => {}
                SinkPush::Overflow => {
                    scheduler.requeue_front(buffer);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(SINK_BACKOFF) => {}
                    }
                }
            },
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PLAYOUT_POLL_INTERVAL) => {}
                }
            }
        }
    }
    log::debug!("[Playout] Stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler_with_capacity(capacity_bytes: usize) -> Scheduler {
        // The filter stays unready, so conversions are identity and tests can
        // express deadlines directly on the local clock.
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        Scheduler::new(
            filter,
            SchedulerConfig {
                capacity_bytes,
                late_threshold_ms: 100,
                correction_threshold_ms: 20,
            },
        )
    }

    fn buffer_at(timestamp_us: i64, samples: usize) -> DecodedBuffer {
        DecodedBuffer {
            timestamp_us,
            samples: vec![7; samples],
        }
    }

    #[test]
    fn imminent_buffer_is_handed_out() {
        let scheduler = scheduler_with_capacity(1 << 20);
        let now = clock::now_micros();

        scheduler.enqueue(buffer_at(now + 5_000, 4));
        // 10 ms latency floor makes a 5 ms-out deadline imminent.
        let ready = scheduler.next_ready(10_000).expect("imminent");
        assert_eq!(ready.samples.len(), 4);
    }

    #[test]
    fn distant_buffer_waits() {
        let scheduler = scheduler_with_capacity(1 << 20);
        let now = clock::now_micros();

        scheduler.enqueue(buffer_at(now + 500_000, 4));
        assert!(scheduler.next_ready(10_000).is_none());
        assert!(!scheduler.is_empty());
    }

    #[test]
    fn frames_past_late_threshold_are_skipped() {
        let scheduler = scheduler_with_capacity(1 << 20);
        let now = clock::now_micros();

        // 200 ms late: beyond the 100 ms threshold, dropped at enqueue.
        scheduler.enqueue(buffer_at(now - 200_000, 4));
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.stats().dropped_late, 1);

        // 50 ms late: within the threshold, played rather than dropped.
        scheduler.enqueue(buffer_at(now - 50_000, 4));
        assert!(scheduler.next_ready(0).is_some());
    }

    #[test]
    fn overflow_drops_oldest_first() {
        // Room for two 4-sample buffers (8 bytes each).
        let scheduler = scheduler_with_capacity(16);
        let now = clock::now_micros();

        scheduler.enqueue(DecodedBuffer {
            timestamp_us: now + 10_000,
            samples: vec![1; 4],
        });
        scheduler.enqueue(DecodedBuffer {
            timestamp_us: now + 20_000,
            samples: vec![2; 4],
        });
        scheduler.enqueue(DecodedBuffer {
            timestamp_us: now + 30_000,
            samples: vec![3; 4],
        });

        let stats = scheduler.stats();
        assert_eq!(stats.dropped_overflow, 1);
        assert_eq!(stats.queued_buffers, 2);

        let first = scheduler.next_ready(i64::MAX).expect("front");
        assert_eq!(first.samples[0], 2, "oldest entry must have been evicted");
    }

    #[test]
    fn flush_empties_the_queue() {
        let scheduler = scheduler_with_capacity(1 << 20);
        let now = clock::now_micros();
        scheduler.enqueue(buffer_at(now + 10_000, 4));
        scheduler.enqueue(buffer_at(now + 20_000, 4));

        scheduler.flush();
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.stats().queued_bytes, 0);
    }

    #[test]
    fn deadlines_stay_monotonic() {
        let scheduler = scheduler_with_capacity(1 << 20);
        let now = clock::now_micros();

        scheduler.enqueue(buffer_at(now + 50_000, 4));
        // Out-of-order timestamp clamps to the previous deadline.
        scheduler.enqueue(buffer_at(now + 40_000, 4));

        let first = scheduler.next_ready(i64::MAX).expect("first");
        let second = scheduler.next_ready(i64::MAX).expect("second");
        assert!(second.deadline_us >= first.deadline_us);
    }

    #[test]
    fn queued_entries_keep_deadlines_across_delay_change() {
        use crate::timesync::TimeMeasurement;

        // A ready filter with zero offset: server and local domains line up,
        // so the static delay is the whole mapping.
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let now = clock::now_micros();
        {
            let mut filter = filter.lock();
            for i in 0..5 {
                filter.ingest(TimeMeasurement {
                    offset_us: 0,
                    max_error_us: 1_000,
                    client_recv_us: now - 1_000_000 + i * 100_000,
                    rtt_us: 2_000,
                });
            }
            assert!(filter.is_ready());
        }
        let scheduler = Scheduler::new(Arc::clone(&filter), SchedulerConfig::default());

        scheduler.enqueue(buffer_at(now + 30_000, 4));
        let before = scheduler.stats();

        // The mapping shifts by 500 ms; the queued entry must not move.
        filter.lock().set_static_delay_ms(500.0);
        scheduler.enqueue(buffer_at(now + 40_000, 4));

        let first = scheduler.next_ready(i64::MAX).expect("first");
        assert_eq!(first.deadline_us, now + 30_000, "in-flight deadline moved");
        let second = scheduler.next_ready(i64::MAX).expect("second");
        assert!(
            second.deadline_us >= now + 500_000,
            "future entry must use the corrected mapping, got {}",
            second.deadline_us - now
        );
        assert_eq!(before.queued_buffers, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn playout_delivers_to_sink_and_honors_cancel() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingSink {
            pushes: AtomicUsize,
        }
        impl OutputSink for CountingSink {
            fn configure(&self, _format: &crate::audio::AudioFormat) -> Result<(), String> {
                Ok(())
            }
            fn push(&self, _deadline_us: i64, _pcm: &[i16]) -> SinkPush {
                self.pushes.fetch_add(1, Ordering::SeqCst);
                SinkPush::Accepted
            }
            fn pause(&self) {}
            fn resume(&self) {}
            fn flush(&self) {}
            fn latency_floor_us(&self) -> i64 {
                20_000
            }
        }

        let scheduler = Arc::new(scheduler_with_capacity(1 << 20));
        let sink = Arc::new(CountingSink {
            pushes: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_playout(
            Arc::clone(&scheduler),
            Arc::clone(&sink) as Arc<dyn OutputSink>,
            cancel.clone(),
        ));

        let now = clock::now_micros();
        scheduler.enqueue(buffer_at(now + 5_000, 4));
        scheduler.enqueue(buffer_at(now + 6_000, 4));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.pushes.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.expect("playout task ends");
    }
}

//! Logging output sink.
//!
//! Platform audio device binding is out of the core's scope; this headless
//! sink accounts for delivered PCM and logs throughput once per second so
//! synchronization behavior can be observed without an audio stack.

use std::sync::atomic::{AtomicU64, Ordering};

use lockstep_core::{AudioFormat, OutputSink, SinkPush};
use parking_lot::Mutex;
use std::time::Instant;

/// Pretend device latency reported to the scheduler.
const LATENCY_FLOOR_US: i64 = 20_000;

pub struct LoggingSink {
    buffers: AtomicU64,
    samples: AtomicU64,
    last_report: Mutex<Instant>,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self {
            buffers: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            last_report: Mutex::new(Instant::now()),
        }
    }
}

impl OutputSink for LoggingSink {
    fn configure(&self, format: &AudioFormat) -> Result<(), String> {
        log::info!(
            "sink configured: {} {}Hz {}ch {}bit",
            format.codec.as_str(),
            format.sample_rate,
            format.channels,
            format.bit_depth
        );
        Ok(())
    }

    fn push(&self, deadline_us: i64, pcm: &[i16]) -> SinkPush {
        let buffers = self.buffers.fetch_add(1, Ordering::Relaxed) + 1;
        let samples = self.samples.fetch_add(pcm.len() as u64, Ordering::Relaxed) + pcm.len() as u64;

        let mut last = self.last_report.lock();
        if last.elapsed().as_secs() >= 1 {
            *last = Instant::now();
            log::info!(
                "playout: {} buffers, {} samples total, next deadline {}us",
                buffers,
                samples,
                deadline_us
            );
        }
        SinkPush::Accepted
    }

    fn pause(&self) {
        log::debug!("sink paused");
    }

    fn resume(&self) {
        log::debug!("sink resumed");
    }

    fn flush(&self) {
        log::debug!("sink flushed");
    }

    fn latency_floor_us(&self) -> i64 {
        LATENCY_FLOOR_US
    }
}

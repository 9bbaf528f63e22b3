//! Kalman filter mapping server time to local monotonic time.
//!
//! State vector `x = (offset, drift)`: offset is server-minus-client in
//! microseconds, drift its rate of change in seconds per second. Measurements
//! are NTP-style offset estimates whose noise variance is scaled from the
//! round-trip time, so fast links keep a minimum noise floor while congested
//! paths are aggressively discounted.

use serde::Serialize;
use std::collections::VecDeque;

/// Measurements with RTT at or above this are stale and discarded.
pub const STALE_RTT_US: i64 = 10_000_000;

/// Measurement noise floor: 1 ms standard deviation, in µs².
const R_BASE_US2: f64 = 1.0e6;

/// Innovation gate width in standard deviations.
const GATE_SIGMA: f64 = 3.0;

/// Consecutive rejections before a measurement is force-accepted.
const FORCE_ACCEPT_AFTER: u32 = 3;

/// Bounded innovation-history window feeding the stability score.
const INNOVATION_WINDOW: usize = 20;

/// Measurements required before conversions leave identity.
const READY_MEASUREMENTS: u64 = 2;

/// Minimum measurements for convergence.
const CONVERGED_MEASUREMENTS: u64 = 5;

/// Convergence additionally requires the offset std below this (5 ms).
const CONVERGED_ERROR_US: f64 = 5_000.0;

/// Drift clamp: ±500 ppm.
const MAX_DRIFT: f64 = 5.0e-4;

/// Offset process noise, µs² per second.
const Q_OFFSET_BASE: f64 = 100.0;

/// Drift process noise, (s/s)² per second.
const Q_DRIFT_BASE: f64 = 1.0e-12;

/// Adaptive process-noise scale bounds.
const Q_SCALE_MIN: f64 = 1.0 / 64.0;
const Q_SCALE_MAX: f64 = 64.0;

/// Stability bands triggering process-noise adaptation.
const STABILITY_HIGH: f64 = 1.5;
const STABILITY_LOW: f64 = 0.5;

/// Covariance inflation applied when thawing frozen state.
const THAW_P_INFLATION: f64 = 10.0;

/// One NTP-style clock measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeMeasurement {
    /// Estimated server-minus-client offset in microseconds.
    pub offset_us: i64,
    /// Upper bound on the measurement error in microseconds.
    pub max_error_us: i64,
    /// Local monotonic receive timestamp (t4) in microseconds.
    pub client_recv_us: i64,
    /// Round-trip time in microseconds.
    pub rtt_us: i64,
}

impl TimeMeasurement {
    /// Derives a measurement from the four protocol timestamps.
    ///
    /// `offset = ((t2−t1) + (t3−t4)) / 2`, `rtt = (t4−t1) − (t3−t2)`.
    #[must_use]
    pub fn from_timestamps(t1: i64, t2: i64, t3: i64, t4: i64) -> Self {
        let offset_us = ((t2 - t1) + (t3 - t4)) / 2;
        let rtt_us = (t4 - t1) - (t3 - t2);
        Self {
            offset_us,
            max_error_us: rtt_us / 2,
            client_recv_us: t4,
            rtt_us,
        }
    }

    /// True when the round trip took long enough to be useless.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.rtt_us >= STALE_RTT_US
    }
}

/// Filter quality snapshot surfaced through events and telemetry.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterStats {
    pub offset_us: i64,
    pub drift_ppm: f64,
    /// Offset standard deviation in µs; `None` until the first measurement.
    pub error_us: Option<f64>,
    pub measurements: u64,
    pub rejected: u64,
    pub stability: f64,
    pub ready: bool,
    pub converged: bool,
}

/// Frozen filter state, parked across a clean disconnect.
#[derive(Debug, Clone, Copy)]
struct FrozenState {
    offset: f64,
    drift: f64,
    p: [[f64; 2]; 2],
    last_update_us: i64,
    measurements: u64,
}

/// 2-state Kalman filter with innovation-gated outlier rejection.
///
/// Never fails: conversions before readiness return identity, stale
/// measurements are discarded without side effects.
#[derive(Debug)]
pub struct TimeFilter {
    /// Offset estimate, µs.
    offset: f64,
    /// Drift estimate, s/s (equivalently µs/µs).
    drift: f64,
    /// Covariance, µs² / µs / unitless².
    p: [[f64; 2]; 2],
    /// Adaptive process-noise scale.
    q_scale: f64,
    /// Local monotonic time of the last ingested measurement.
    last_update_us: i64,
    /// Normalized squared innovations of recent accepted measurements.
    innovations: VecDeque<f64>,
    /// Accepted measurement count.
    measurements: u64,
    /// Gate rejections since the last accepted measurement.
    consecutive_rejects: u32,
    /// Total gate rejections, for telemetry.
    total_rejects: u64,
    /// No measurement has been accepted since the last reset.
    stale_since_reset: bool,
    /// Consecutive updates with the stability score out of band.
    high_stability_streak: u32,
    low_stability_streak: u32,
    /// Audio-path calibration, µs. Applied in the server→client direction.
    static_delay_us: i64,
    /// Parked state for freeze/thaw across sessions.
    frozen: Option<FrozenState>,
}

impl TimeFilter {
    /// Creates an empty filter with no static delay.
    #[must_use]
    pub fn new() -> Self {
        Self {
            offset: 0.0,
            drift: 0.0,
            p: [[0.0; 2]; 2],
            q_scale: 1.0,
            last_update_us: 0,
            innovations: VecDeque::with_capacity(INNOVATION_WINDOW),
            measurements: 0,
            consecutive_rejects: 0,
            total_rejects: 0,
            stale_since_reset: true,
            high_stability_streak: 0,
            low_stability_streak: 0,
            static_delay_us: 0,
            frozen: None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Measurement ingestion
    // ─────────────────────────────────────────────────────────────────────────

    /// Ingests one measurement. Returns `true` if it was accepted.
    ///
    /// Stale measurements (RTT ≥ 10 s) are discarded without touching any
    /// counter. The innovation gate rejects outliers; after three consecutive
    /// rejections the next outlier is force-accepted so a permanent offset
    /// change is eventually picked up.
    pub fn ingest(&mut self, m: TimeMeasurement) -> bool {
        if m.is_stale() {
            log::debug!(
                "[TimeFilter] Discarding stale measurement: rtt={}us",
                m.rtt_us
            );
            return false;
        }

        let z = m.offset_us as f64;
        let r = R_BASE_US2 + {
            let half_rtt = m.rtt_us as f64 / 2.0;
            half_rtt * half_rtt
        };

        if self.measurements == 0 {
            self.initialize(z, r, m);
            return true;
        }

        // Predict to the measurement time.
        let dt_us = (m.client_recv_us - self.last_update_us).max(0) as f64;
        self.predict(dt_us);
        self.last_update_us = m.client_recv_us;

        // Innovation against the *predicted* covariance; this is what the
        // stability score is defined over.
        let y = z - self.offset;
        let s = self.p[0][0] + r;

        let force = self.consecutive_rejects >= FORCE_ACCEPT_AFTER;
        if y.abs() > GATE_SIGMA * s.sqrt() && !force {
            self.consecutive_rejects += 1;
            self.total_rejects += 1;
            log::debug!(
                "[TimeFilter] Rejected outlier: innovation={:.0}us, gate={:.0}us, streak={}",
                y,
                GATE_SIGMA * s.sqrt(),
                self.consecutive_rejects
            );
            return false;
        }

        let (y, s) = if force && y.abs() > GATE_SIGMA * s.sqrt() {
            // The offset genuinely moved. Inflate the offset variance so the
            // update re-centers on the new regime instead of crawling there.
            log::info!(
                "[TimeFilter] Force-accepting after {} rejections: innovation={:.0}us",
                self.consecutive_rejects,
                y
            );
            self.p[0][0] = self.p[0][0].max(y * y);
            (y, self.p[0][0] + r)
        } else {
            (y, s)
        };

        // Kalman update with H = [1, 0].
        let k0 = self.p[0][0] / s;
        let k1 = self.p[1][0] / s;
        self.offset += k0 * y;
        self.drift = (self.drift + k1 * y).clamp(-MAX_DRIFT, MAX_DRIFT);

        let p00 = self.p[0][0];
        let p01 = self.p[0][1];
        self.p[0][0] = (1.0 - k0) * p00;
        self.p[0][1] = (1.0 - k0) * p01;
        self.p[1][0] -= k1 * p00;
        self.p[1][1] -= k1 * p01;

        self.push_innovation(y * y / s);

        self.measurements += 1;
        self.consecutive_rejects = 0;
        self.stale_since_reset = false;
        true
    }

    /// Seeds the state from the first measurement.
    fn initialize(&mut self, z: f64, r: f64, m: TimeMeasurement) {
        self.offset = z;
        self.drift = 0.0;
        let max_err = m.max_error_us as f64;
        self.p = [[r.max(max_err * max_err), 0.0], [0.0, 1.0e-8]];
        self.last_update_us = m.client_recv_us;
        self.measurements = 1;
        self.consecutive_rejects = 0;
        self.stale_since_reset = false;
    }

    /// Propagates state and covariance over `dt_us` of local time.
    ///
    /// `offset ← offset + drift·Δt`; `P ← F·P·Fᵀ + Q·Δt` with
    /// `F = [[1, Δt], [0, 1]]`.
    fn predict(&mut self, dt_us: f64) {
        if dt_us <= 0.0 {
            return;
        }
        self.offset += self.drift * dt_us;

        let p00 = self.p[0][0];
        let p01 = self.p[0][1];
        let p10 = self.p[1][0];
        let p11 = self.p[1][1];
        self.p[0][0] = p00 + dt_us * (p01 + p10) + dt_us * dt_us * p11;
        self.p[0][1] = p01 + dt_us * p11;
        self.p[1][0] = p10 + dt_us * p11;

        let dt_s = dt_us / 1.0e6;
        self.p[0][0] += Q_OFFSET_BASE * self.q_scale * dt_s;
        self.p[1][1] += Q_DRIFT_BASE * self.q_scale * dt_s;
    }

    /// Appends a normalized squared innovation and adapts Q.
    fn push_innovation(&mut self, normalized: f64) {
        if self.innovations.len() == INNOVATION_WINDOW {
            self.innovations.pop_front();
        }
        self.innovations.push_back(normalized);

        let mean = self.stability();
        if mean > STABILITY_HIGH {
            self.high_stability_streak += 1;
            self.low_stability_streak = 0;
            if self.high_stability_streak as usize > INNOVATION_WINDOW / 2 {
                let next = (self.q_scale * 2.0).min(Q_SCALE_MAX);
                if next != self.q_scale {
                    log::info!(
                        "[TimeFilter] Model underestimates noise (stability={:.2}), Q scale {} -> {}",
                        mean,
                        self.q_scale,
                        next
                    );
                }
                self.q_scale = next;
                self.high_stability_streak = 0;
            }
        } else if mean < STABILITY_LOW {
            self.low_stability_streak += 1;
            self.high_stability_streak = 0;
            if self.low_stability_streak as usize > INNOVATION_WINDOW / 2 {
                self.q_scale = (self.q_scale / 2.0).max(Q_SCALE_MIN);
                self.low_stability_streak = 0;
            }
        } else {
            self.high_stability_streak = 0;
            self.low_stability_streak = 0;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conversions
    // ─────────────────────────────────────────────────────────────────────────

    /// Maps a server-domain timestamp to local monotonic microseconds.
    ///
    /// Positive static delay lands here, shifting playout later. Identity
    /// before readiness.
    #[must_use]
    pub fn server_to_client(&self, server_us: i64) -> i64 {
        if !self.is_ready() {
            return server_us;
        }
        server_us - self.offset_us() + self.static_delay_us
    }

    /// Maps a local monotonic timestamp to the server domain. Exact inverse
    /// of [`TimeFilter::server_to_client`].
    #[must_use]
    pub fn client_to_server(&self, client_us: i64) -> i64 {
        if !self.is_ready() {
            return client_us;
        }
        client_us + self.offset_us() - self.static_delay_us
    }

    /// Sets the audio-path calibration in milliseconds.
    pub fn set_static_delay_ms(&mut self, delay_ms: f64) {
        self.static_delay_us = (delay_ms * 1_000.0).round() as i64;
    }

    /// Returns the audio-path calibration in milliseconds.
    #[must_use]
    pub fn static_delay_ms(&self) -> f64 {
        self.static_delay_us as f64 / 1_000.0
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Current offset estimate in microseconds.
    #[must_use]
    pub fn offset_us(&self) -> i64 {
        self.offset.round() as i64
    }

    /// Current drift estimate in seconds per second.
    #[must_use]
    pub fn drift(&self) -> f64 {
        self.drift
    }

    /// Offset standard deviation in µs, or infinity before the first
    /// measurement.
    #[must_use]
    pub fn error_us(&self) -> f64 {
        if self.measurements == 0 {
            f64::INFINITY
        } else {
            self.p[0][0].max(0.0).sqrt()
        }
    }

    /// Accepted measurement count.
    #[must_use]
    pub fn measurement_count(&self) -> u64 {
        self.measurements
    }

    /// Usable for conversions after two measurements.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.measurements >= READY_MEASUREMENTS
    }

    /// Converged: enough measurements and the error estimate below 5 ms.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.measurements >= CONVERGED_MEASUREMENTS && self.error_us() < CONVERGED_ERROR_US
    }

    /// Mean normalized innovation over the window; 1.0 means the model's
    /// uncertainty is well calibrated.
    #[must_use]
    pub fn stability(&self) -> f64 {
        if self.innovations.is_empty() {
            return 1.0;
        }
        self.innovations.iter().sum::<f64>() / self.innovations.len() as f64
    }

    /// Snapshot for events and telemetry.
    #[must_use]
    pub fn stats(&self) -> FilterStats {
        FilterStats {
            offset_us: self.offset_us(),
            drift_ppm: self.drift * 1.0e6,
            error_us: (self.measurements > 0).then(|| self.error_us()),
            measurements: self.measurements,
            rejected: self.total_rejects,
            stability: self.stability(),
            ready: self.is_ready(),
            converged: self.is_converged(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Clears the live state. Any frozen slot is kept.
    pub fn reset(&mut self) {
        let frozen = self.frozen.take();
        let delay = self.static_delay_us;
        *self = Self::new();
        self.frozen = frozen;
        self.static_delay_us = delay;
    }

    /// Parks the live state in the side slot. No-op unless ready.
    pub fn freeze(&mut self) {
        if !self.is_ready() {
            return;
        }
        self.frozen = Some(FrozenState {
            offset: self.offset,
            drift: self.drift,
            p: self.p,
            last_update_us: self.last_update_us,
            measurements: self.measurements,
        });
        log::debug!(
            "[TimeFilter] Frozen: offset={}us, drift={:.1}ppm",
            self.offset_us(),
            self.drift * 1.0e6
        );
    }

    /// Restores frozen state with an inflated covariance, so the prior
    /// influences but does not dominate the resumed session. Returns `true`
    /// if state was restored.
    pub fn thaw(&mut self) -> bool {
        let Some(frozen) = self.frozen.take() else {
            return false;
        };
        self.offset = frozen.offset;
        self.drift = frozen.drift;
        self.p = frozen.p;
        for row in &mut self.p {
            for v in row.iter_mut() {
                *v *= THAW_P_INFLATION;
            }
        }
        self.last_update_us = frozen.last_update_us;
        self.measurements = frozen.measurements;
        self.stale_since_reset = false;
        log::debug!(
            "[TimeFilter] Thawed: offset={}us, error={:.0}us",
            self.offset_us(),
            self.error_us()
        );
        true
    }

    /// Clears everything, including any frozen slot.
    pub fn reset_and_discard(&mut self) {
        let delay = self.static_delay_us;
        *self = Self::new();
        self.static_delay_us = delay;
    }
}

impl Default for TimeFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds `n` measurements with the given offset, spaced 1 s apart at a
    /// fixed 10 ms RTT, starting at `start_us`.
    fn warm_up(filter: &mut TimeFilter, n: u64, offset_us: i64, start_us: i64) -> i64 {
        let mut t = start_us;
        for _ in 0..n {
            filter.ingest(TimeMeasurement {
                offset_us,
                max_error_us: 5_000,
                client_recv_us: t,
                rtt_us: 10_000,
            });
            t += 1_000_000;
        }
        t
    }

    #[test]
    fn stale_measurement_leaves_count_untouched() {
        let mut filter = TimeFilter::new();
        warm_up(&mut filter, 3, 1_000, 0);
        let before = filter.measurement_count();

        let accepted = filter.ingest(TimeMeasurement {
            offset_us: 1_000,
            max_error_us: 5_000_000,
            client_recv_us: 4_000_000,
            rtt_us: STALE_RTT_US,
        });

        assert!(!accepted);
        assert_eq!(filter.measurement_count(), before);
    }

    #[test]
    fn conversion_round_trip_is_bit_exact() {
        let mut filter = TimeFilter::new();
        warm_up(&mut filter, 5, 1_234, 0);
        filter.set_static_delay_ms(12.5);

        for t in [0i64, 1, -1, 987_654_321, i64::MAX / 4] {
            assert_eq!(filter.server_to_client(filter.client_to_server(t)), t);
            assert_eq!(filter.client_to_server(filter.server_to_client(t)), t);
        }
    }

    #[test]
    fn static_delay_shifts_playout_later() {
        let mut filter = TimeFilter::new();
        warm_up(&mut filter, 5, 1_000, 0);

        let base = filter.server_to_client(500_000);
        filter.set_static_delay_ms(40.0);
        let delayed = filter.server_to_client(500_000);
        assert_eq!(delayed - base, 40 * 1_000);
    }

    #[test]
    fn conversion_is_identity_before_readiness() {
        let filter = TimeFilter::new();
        assert_eq!(filter.server_to_client(42), 42);
        assert_eq!(filter.client_to_server(42), 42);
    }

    #[test]
    fn reset_returns_to_pristine_state() {
        let mut filter = TimeFilter::new();
        warm_up(&mut filter, 10, 8_000, 0);
        assert!(filter.is_ready());

        filter.reset();

        assert_eq!(filter.offset_us(), 0);
        assert!(filter.error_us().is_infinite());
        assert_eq!(filter.measurement_count(), 0);
        assert!(!filter.is_ready());
    }

    #[test]
    fn freeze_reset_thaw_restores_state_with_inflated_error() {
        let mut filter = TimeFilter::new();
        warm_up(&mut filter, 10, 8_000, 0);

        let offset_before = filter.offset_us();
        let drift_before = filter.drift();
        let error_before = filter.error_us();

        filter.freeze();
        filter.reset();
        assert!(!filter.is_ready());
        assert!(filter.thaw());

        assert_eq!(filter.offset_us(), offset_before);
        assert_eq!(filter.drift(), drift_before);
        assert!(
            filter.error_us() > error_before,
            "thawed error {} must exceed pre-freeze error {}",
            filter.error_us(),
            error_before
        );
        assert!(filter.is_ready());
    }

    #[test]
    fn freeze_is_a_noop_before_readiness() {
        let mut filter = TimeFilter::new();
        warm_up(&mut filter, 1, 8_000, 0);
        filter.freeze();
        filter.reset();
        assert!(!filter.thaw());
    }

    #[test]
    fn reset_and_discard_clears_frozen_slot() {
        let mut filter = TimeFilter::new();
        warm_up(&mut filter, 10, 8_000, 0);
        filter.freeze();
        filter.reset_and_discard();
        assert!(!filter.thaw());
        assert_eq!(filter.offset_us(), 0);
    }

    #[test]
    fn converges_on_jitter_free_link() {
        // Server clock 1000 µs ahead, RTT 10 ms, no jitter: 20 bursts.
        let mut filter = TimeFilter::new();
        warm_up(&mut filter, 20, 1_000, 0);

        assert!(filter.is_ready());
        assert!(filter.is_converged());
        assert!(
            (995..=1_005).contains(&filter.offset_us()),
            "offset {} outside [995, 1005]",
            filter.offset_us()
        );
    }

    #[test]
    fn fourth_consecutive_outlier_is_force_accepted() {
        let mut filter = TimeFilter::new();
        let mut t = warm_up(&mut filter, 10, 10_000, 0);
        let warm_offset = filter.offset_us();

        // Three equally-outlying measurements are rejected.
        for _ in 0..3 {
            let accepted = filter.ingest(TimeMeasurement {
                offset_us: 500_000,
                max_error_us: 5_000,
                client_recv_us: t,
                rtt_us: 10_000,
            });
            assert!(!accepted, "outlier must be gate-rejected");
            assert!(
                (filter.offset_us() - warm_offset).abs() <= 1_000,
                "offset moved during rejection: {}",
                filter.offset_us()
            );
            t += 1_000_000;
        }

        // The fourth is force-accepted and pulls the offset over.
        let accepted = filter.ingest(TimeMeasurement {
            offset_us: 500_000,
            max_error_us: 5_000,
            client_recv_us: t,
            rtt_us: 10_000,
        });
        assert!(accepted, "fourth outlier must be force-accepted");
        assert!(
            filter.offset_us() > 250_000,
            "offset {} did not move toward 500000",
            filter.offset_us()
        );
    }

    #[test]
    fn drift_stays_within_500_ppm() {
        let mut filter = TimeFilter::new();
        // Wildly swinging offsets try to drag drift along.
        let mut t = 0;
        for i in 0..50i64 {
            filter.ingest(TimeMeasurement {
                offset_us: i * 1_000_000,
                max_error_us: 5_000,
                client_recv_us: t,
                rtt_us: 10_000,
            });
            t += 100_000;
        }
        assert!(
            filter.drift().abs() <= MAX_DRIFT,
            "drift {} exceeds ±500ppm",
            filter.drift()
        );
    }

    #[test]
    fn stability_settles_near_unity_under_matched_noise() {
        // Constant true offset at a fixed tiny RTT; measurement jitter on the
        // order of the modeled noise floor (±1 ms).
        let mut filter = TimeFilter::new();
        let mut t = 0;
        for i in 0..60i64 {
            let noise = if i % 2 == 0 { 1_000 } else { -1_000 };
            filter.ingest(TimeMeasurement {
                offset_us: 10_000 + noise,
                max_error_us: 1_000,
                client_recv_us: t,
                rtt_us: 100,
            });
            t += 250_000;
        }
        let stability = filter.stability();
        assert!(
            (0.5..=1.5).contains(&stability),
            "stability {} outside [0.5, 1.5]",
            stability
        );
    }

    #[test]
    fn measurement_from_timestamps_matches_ntp_formulas() {
        // Server 1000 µs ahead, 5 ms each way.
        let t1 = 0;
        let t2 = 5_000 + 1_000;
        let t3 = 6_200;
        let t4 = 6_200 - 1_000 + 5_000;
        let m = TimeMeasurement::from_timestamps(t1, t2, t3, t4);
        assert_eq!(m.offset_us, 1_000);
        assert_eq!(m.rtt_us, 10_000);
        assert_eq!(m.client_recv_us, t4);
    }
}

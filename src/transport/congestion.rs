//! CUBIC congestion control.
//!
//! The window is counted in packets of `mss` bytes; bytes in flight are
//! counted in bytes. Two regimes (slow start and congestion avoidance)
//! plus an idle reset. Nothing here fails: every update saturates or
//! clamps.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// CUBIC constants.
pub mod constants {
    use std::time::Duration;

    /// Multiplicative decrease factor.
    pub const BETA: f64 = 0.7;

    /// Cubic scaling constant.
    pub const C: f64 = 0.4;

    /// Idle time after which the window is reset on the next send.
    pub const IDLE_RESET_THRESHOLD: Duration = Duration::from_secs(1);

    /// Lower clamp for RTT samples in congestion avoidance.
    pub const MIN_RTT: Duration = Duration::from_millis(10);

    /// Upper clamp for RTT samples in congestion avoidance.
    pub const MAX_RTT: Duration = Duration::from_millis(1000);

    /// Per-ACK increment is at most `cwnd / CWND_INCREASE_FACTOR` (and at least 1).
    pub const CWND_INCREASE_FACTOR: u32 = 1000;

    /// Cap on the RTT-compensated growth ratio.
    pub const MAX_RTT_GROWTH: f64 = 1.2;

    /// RTT floor for the pacing computation.
    pub const MIN_PACING_RTT: Duration = Duration::from_millis(1);
}

use constants::*;

/// CUBIC congestion controller.
#[derive(Debug, Clone)]
pub struct CubicController {
    initial_window: u32,
    mss: u32,
    cwnd: u32,
    ssthresh: u32,
    w_max: u32,
    last_max_cwnd: u32,
    k: f64,
    in_slow_start: bool,
    bytes_in_flight: u64,
    last_rtt: Duration,
    pacing_interval: Duration,
    last_sent: Instant,
    last_congestion: Instant,
    next_send: Instant,
}

fn to_window(value: f64) -> u32 {
    // Float-to-int casts saturate; NaN maps to 0.
    value as u32
}

impl CubicController {
    /// Create a controller with `initial_window` packets of `mss` bytes.
    pub fn new(initial_window: u32, mss: u32) -> Self {
        Self::with_start(initial_window, mss, Instant::now())
    }

    /// Create a controller whose clocks start at `now`.
    pub fn with_start(initial_window: u32, mss: u32, now: Instant) -> Self {
        let initial_window = initial_window.max(1);
        Self {
            initial_window,
            mss: mss.max(1),
            cwnd: initial_window,
            ssthresh: u32::MAX,
            w_max: initial_window,
            last_max_cwnd: 0,
            k: 0.0,
            in_slow_start: true,
            bytes_in_flight: 0,
            last_rtt: Duration::ZERO,
            // Unpaced until the first RTT sample arrives.
            pacing_interval: Duration::ZERO,
            last_sent: now,
            last_congestion: now,
            next_send: now,
        }
    }

    /// Return to the initial state (connection reset).
    pub fn reset(&mut self, now: Instant) {
        *self = Self::with_start(self.initial_window, self.mss, now);
    }

    /// Congestion window, in packets.
    pub fn congestion_window(&self) -> u32 {
        self.cwnd
    }

    /// Congestion window, in bytes.
    pub fn window_bytes(&self) -> u64 {
        self.cwnd as u64 * self.mss as u64
    }

    /// Slow-start threshold, in packets.
    pub fn slow_start_threshold(&self) -> u32 {
        self.ssthresh
    }

    /// Window at the last loss event, after fast convergence.
    pub fn w_max(&self) -> u32 {
        self.w_max
    }

    /// Time offset of the cubic curve, in seconds.
    pub fn k(&self) -> f64 {
        self.k
    }

    /// Check if the controller is in slow start.
    pub fn in_slow_start(&self) -> bool {
        self.in_slow_start
    }

    /// Bytes sent and not yet acknowledged.
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Minimum interval between sends.
    pub fn pacing_interval(&self) -> Duration {
        self.pacing_interval
    }

    /// Earliest instant the next packet may leave.
    pub fn next_send_time(&self) -> Instant {
        self.next_send
    }

    /// Ask to send a packet of `size` bytes now.
    pub fn can_send_packet(&mut self, size: u32) -> bool {
        self.can_send_packet_at(size, Instant::now())
    }

    /// Ask to send a packet of `size` bytes at `now`.
    ///
    /// Succeeds when the pacing deadline has passed and either nothing is
    /// in flight or the packet fits the window. Success commits: the bytes
    /// are counted in flight and the next deadline moves out by the pacing
    /// interval.
    pub fn can_send_packet_at(&mut self, size: u32, now: Instant) -> bool {
        let time_ok = now >= self.next_send;
        let bytes_ok = self.bytes_in_flight == 0
            || self.bytes_in_flight + size as u64 <= self.window_bytes();

        if time_ok && bytes_ok {
            self.next_send = now + self.pacing_interval;
            self.bytes_in_flight += size as u64;
            true
        } else {
            trace!(
                size,
                in_flight = self.bytes_in_flight,
                cwnd = self.cwnd,
                paced = !time_ok,
                "send deferred"
            );
            false
        }
    }

    /// Record a send attempt of `size` bytes now.
    pub fn on_packet_sent(&mut self, size: u32) -> bool {
        self.on_packet_sent_at(size, Instant::now())
    }

    /// Record a send attempt of `size` bytes at `now`.
    ///
    /// Resets the window first if the sender was idle for longer than
    /// [`IDLE_RESET_THRESHOLD`]. Returns whether the packet was admitted.
    pub fn on_packet_sent_at(&mut self, size: u32, now: Instant) -> bool {
        self.handle_idle_period(now);
        if self.can_send_packet_at(size, now) {
            self.last_sent = now;
            true
        } else {
            false
        }
    }

    /// Process an acknowledgement of `acked_bytes` with smoothed RTT `rtt`.
    pub fn on_ack_received(&mut self, acked_bytes: u32, rtt: Duration) {
        self.on_ack_received_at(acked_bytes, rtt, Instant::now());
    }

    /// Process an acknowledgement at `now`.
    pub fn on_ack_received_at(&mut self, acked_bytes: u32, rtt: Duration, now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(acked_bytes as u64);

        if self.in_slow_start {
            let acked_packets = acked_bytes.div_ceil(self.mss);
            self.cwnd = self
                .cwnd
                .saturating_add(acked_packets.min(self.initial_window));
            if self.cwnd >= self.ssthresh {
                self.in_slow_start = false;
                debug!(cwnd = self.cwnd, "leaving slow start");
            }
        } else {
            self.update_cubic(rtt, now);
        }

        self.update_pacing(rtt);
        trace!(
            acked_bytes,
            cwnd = self.cwnd,
            in_flight = self.bytes_in_flight,
            "ack processed"
        );
    }

    /// React to a lost packet now.
    pub fn on_packet_loss(&mut self) {
        self.on_packet_loss_at(Instant::now());
    }

    /// React to a lost packet at `now`.
    pub fn on_packet_loss_at(&mut self, now: Instant) {
        let previous = self.cwnd;

        // w_max is the window at this loss. Fast convergence: a peak lower
        // than the previous one means a competing flow is taking bandwidth,
        // so release more of it.
        self.w_max = self.cwnd;
        if self.w_max < self.last_max_cwnd {
            self.last_max_cwnd = self.w_max;
            self.w_max = to_window(self.w_max as f64 * (1.0 + BETA) / 2.0);
        } else {
            self.last_max_cwnd = self.w_max;
            self.w_max = to_window(self.w_max as f64 * (2.0 - BETA) / 2.0);
        }

        self.ssthresh =
            to_window(self.cwnd as f64 * BETA).max(self.initial_window.saturating_mul(2));
        self.cwnd = self.ssthresh;
        self.k = (self.w_max as f64 * (1.0 - BETA) / C).cbrt();
        self.in_slow_start = false;
        self.last_congestion = now;

        debug!(
            previous,
            cwnd = self.cwnd,
            w_max = self.w_max,
            k = self.k,
            "congestion event"
        );
    }

    fn update_cubic(&mut self, rtt: Duration, now: Instant) {
        let rtt = rtt.clamp(MIN_RTT, MAX_RTT);
        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        let elapsed = now.saturating_duration_since(self.last_congestion);
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        let t = elapsed.as_secs_f64().max(0.001);
        let cubic = (C * (t - self.k).powi(3) + self.w_max as f64).max(self.initial_window as f64);
        let tcp_friendly = self.w_max as f64 * BETA + 3.0 * (1.0 - BETA) * (elapsed_ms / rtt_ms);

        let increment = (self.cwnd / CWND_INCREASE_FACTOR).max(1);
        let limited = self.cwnd.saturating_add(increment);

        let rtt_cwnd = if self.last_rtt.is_zero() {
            0
        } else {
            let ratio = (self.last_rtt.as_secs_f64() * 1000.0 / rtt_ms).min(MAX_RTT_GROWTH);
            to_window(self.cwnd as f64 * ratio)
        };

        self.cwnd = [
            to_window(cubic),
            to_window(tcp_friendly),
            limited,
            rtt_cwnd,
            self.cwnd.saturating_add(1),
        ]
        .into_iter()
        .max()
        .unwrap_or(self.cwnd);

        if self.last_max_cwnd > 0 {
            self.w_max = self.w_max.max(self.cwnd).min(self.last_max_cwnd);
        }
        self.last_rtt = rtt;
    }

    fn update_pacing(&mut self, rtt: Duration) {
        let rtt = rtt.max(MIN_PACING_RTT);
        // Pace at half the window-per-RTT rate.
        self.pacing_interval = rtt.saturating_mul(2) / self.cwnd.max(1);
    }

    fn handle_idle_period(&mut self, now: Instant) {
        let idle = now.saturating_duration_since(self.last_sent);
        if idle > IDLE_RESET_THRESHOLD {
            debug!(idle_ms = idle.as_millis() as u64, "idle reset");
            self.cwnd = self.initial_window;
            self.ssthresh = u32::MAX;
            self.w_max = self.initial_window;
            self.k = 0.0;
            self.last_congestion = now;
            self.in_slow_start = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1000;
    const RTT: Duration = Duration::from_millis(100);

    fn grown(start: Instant, target: u32) -> CubicController {
        let mut cubic = CubicController::with_start(10, MSS, start);
        while cubic.congestion_window() < target {
            cubic.on_ack_received_at(MSS, RTT, start);
        }
        cubic
    }

    #[test]
    fn test_initial_state() {
        let cubic = CubicController::with_start(10, MSS, Instant::now());
        assert_eq!(cubic.congestion_window(), 10);
        assert_eq!(cubic.slow_start_threshold(), u32::MAX);
        assert!(cubic.in_slow_start());
        assert_eq!(cubic.bytes_in_flight(), 0);
        assert_eq!(cubic.pacing_interval(), Duration::ZERO);
    }

    #[test]
    fn test_slow_start_growth() {
        let start = Instant::now();
        let mut cubic = CubicController::with_start(10, MSS, start);

        let mut previous = cubic.congestion_window();
        for _ in 0..20 {
            cubic.on_ack_received_at(MSS, RTT, start);
            assert!(cubic.congestion_window() > previous);
            previous = cubic.congestion_window();
        }
        assert_eq!(previous, 30);

        // A large ACK grows by at most the initial window.
        cubic.on_ack_received_at(50 * MSS, RTT, start);
        assert_eq!(cubic.congestion_window(), 40);
    }

    #[test]
    fn test_loss_reduces_window() {
        let start = Instant::now();
        let mut cubic = grown(start, 40);

        cubic.on_packet_loss_at(start);
        assert_eq!(cubic.congestion_window(), 28);
        assert_eq!(cubic.slow_start_threshold(), 28);
        assert!(!cubic.in_slow_start());
        assert_eq!(cubic.w_max(), 26);
        assert!((cubic.k() - (26.0 * 0.3 / 0.4f64).cbrt()).abs() < 1e-9);
    }

    #[test]
    fn test_loss_floor() {
        let start = Instant::now();
        let mut cubic = grown(start, 22);
        cubic.on_packet_loss_at(start);
        assert_eq!(cubic.congestion_window(), 20);

        let mut small = CubicController::with_start(10, MSS, start);
        small.on_packet_loss_at(start);
        assert_eq!(small.congestion_window(), 20);
    }

    #[test]
    fn test_loss_decrease_bounds() {
        let start = Instant::now();
        for target in [30u32, 50, 100, 500] {
            let mut cubic = grown(start, target);
            let before = cubic.congestion_window();
            cubic.on_packet_loss_at(start);
            let after = cubic.congestion_window();
            assert!(after < before);
            assert!(after >= (before as f64 * BETA) as u32);
            assert!(after >= 20);
        }
    }

    #[test]
    fn test_fast_convergence() {
        let start = Instant::now();
        let mut cubic = grown(start, 40);
        cubic.on_packet_loss_at(start);
        assert_eq!(cubic.congestion_window(), 28);

        // Second loss below the previous peak shrinks w_max harder.
        cubic.on_packet_loss_at(start);
        assert_eq!(cubic.w_max(), (28.0 * (1.0 + BETA) / 2.0) as u32);
        assert_eq!(cubic.congestion_window(), 20);
    }

    #[test]
    fn test_congestion_avoidance_growth() {
        let start = Instant::now();
        let mut cubic = grown(start, 40);
        cubic.on_packet_loss_at(start);

        let mut now = start;
        let mut previous = cubic.congestion_window();
        for _ in 0..10 {
            now += Duration::from_millis(50);
            cubic.on_ack_received_at(MSS, RTT, now);
            assert!(cubic.congestion_window() >= previous + 1);
            previous = cubic.congestion_window();
        }
        assert!(!cubic.in_slow_start());
    }

    #[test]
    fn test_window_gates_bytes_in_flight() {
        let start = Instant::now();
        let mut cubic = CubicController::with_start(10, MSS, start);

        for _ in 0..10 {
            assert!(cubic.on_packet_sent_at(MSS, start));
        }
        assert_eq!(cubic.bytes_in_flight(), 10_000);
        assert!(!cubic.on_packet_sent_at(MSS, start));
        assert_eq!(cubic.bytes_in_flight(), 10_000);

        cubic.on_ack_received_at(MSS, RTT, start);
        assert_eq!(cubic.bytes_in_flight(), 9_000);
        assert!(cubic.on_packet_sent_at(MSS, start));
    }

    #[test]
    fn test_oversized_packet_allowed_when_idle() {
        let start = Instant::now();
        let mut cubic = CubicController::with_start(1, MSS, start);
        assert!(cubic.can_send_packet_at(5 * MSS, start));
        assert!(!cubic.can_send_packet_at(1, start));
    }

    #[test]
    fn test_pacing_interval() {
        let start = Instant::now();
        let mut cubic = CubicController::with_start(10, MSS, start);
        cubic.on_ack_received_at(MSS, RTT, start);
        assert_eq!(cubic.congestion_window(), 11);
        assert_eq!(cubic.pacing_interval(), Duration::from_millis(200) / 11);

        assert!(cubic.can_send_packet_at(MSS, start));
        assert!(!cubic.can_send_packet_at(MSS, start));
        assert_eq!(cubic.next_send_time(), start + cubic.pacing_interval());
        assert!(cubic.can_send_packet_at(MSS, cubic.next_send_time()));
    }

    #[test]
    fn test_pacing_rtt_floor() {
        let start = Instant::now();
        let mut cubic = CubicController::with_start(10, MSS, start);
        cubic.on_ack_received_at(MSS, Duration::ZERO, start);
        assert_eq!(cubic.pacing_interval(), Duration::from_millis(2) / 11);
    }

    #[test]
    fn test_idle_reset() {
        let start = Instant::now();
        let mut cubic = grown(start, 40);
        cubic.on_packet_loss_at(start);
        assert!(!cubic.in_slow_start());

        let later = start + Duration::from_secs(2);
        assert!(cubic.on_packet_sent_at(MSS, later));
        assert_eq!(cubic.congestion_window(), 10);
        assert_eq!(cubic.slow_start_threshold(), u32::MAX);
        assert_eq!(cubic.w_max(), 10);
        assert_eq!(cubic.k(), 0.0);
        assert!(cubic.in_slow_start());
    }

    #[test]
    fn test_idle_reset_matches_fresh_controller() {
        let start = Instant::now();
        let fresh = CubicController::with_start(10, MSS, start);
        let mut cubic = grown(start, 60);
        cubic.on_packet_loss_at(start);
        cubic.on_packet_loss_at(start);

        let later = start + Duration::from_secs(5);
        assert!(cubic.on_packet_sent_at(MSS, later));
        assert_eq!(cubic.congestion_window(), fresh.congestion_window());
        assert_eq!(cubic.slow_start_threshold(), fresh.slow_start_threshold());
        assert_eq!(cubic.w_max(), fresh.w_max());
        assert_eq!(cubic.k(), fresh.k());
        assert_eq!(cubic.in_slow_start(), fresh.in_slow_start());

        // A loss after the reset is judged against the window at that loss.
        cubic.on_packet_loss_at(later);
        assert_eq!(cubic.congestion_window(), 20);
        assert_eq!(cubic.w_max(), (10.0 * (1.0 + BETA) / 2.0) as u32);
    }

    #[test]
    fn test_no_idle_reset_when_busy() {
        let start = Instant::now();
        let mut cubic = grown(start, 40);
        assert!(cubic.on_packet_sent_at(MSS, start + Duration::from_millis(500)));
        assert_eq!(cubic.congestion_window(), 40);
    }

    #[test]
    fn test_reset() {
        let start = Instant::now();
        let mut cubic = grown(start, 40);
        cubic.on_packet_sent_at(MSS, start);
        cubic.reset(start);
        assert_eq!(cubic.congestion_window(), 10);
        assert_eq!(cubic.bytes_in_flight(), 0);
    }
}

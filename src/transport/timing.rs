//! RTT estimation.
//!
//! RFC 6298 smoothing. The smoothed RTT feeds the congestion controller,
//! the RTO decides when an unacknowledged chunk is overdue.

use std::time::{Duration, Instant};

/// RTO bounds and smoothing weights.
pub mod constants {
    use std::time::Duration;

    /// RTO used until the first sample arrives.
    pub const INITIAL_RTO: Duration = Duration::from_secs(1);

    /// Floor for the computed RTO.
    pub const MIN_RTO: Duration = Duration::from_millis(200);

    /// Ceiling for the RTO, backoff included. Long-haul links need headroom.
    pub const MAX_RTO: Duration = Duration::from_secs(60);

    /// SRTT takes `1 / SRTT_DIVISOR` of each new sample.
    pub const SRTT_DIVISOR: u32 = 8;

    /// RTTVAR takes `1 / RTTVAR_DIVISOR` of each new deviation.
    pub const RTTVAR_DIVISOR: u32 = 4;

    /// Variance multiplier (`K`).
    pub const VARIANCE_FACTOR: u32 = 4;

    /// Clock granularity (`G`).
    pub const GRANULARITY: Duration = Duration::from_millis(10);
}

use constants::{
    GRANULARITY, INITIAL_RTO, MAX_RTO, MIN_RTO, RTTVAR_DIVISOR, SRTT_DIVISOR, VARIANCE_FACTOR,
};

/// Smoothed round-trip time and retransmission timeout for one connection.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// `None` until the first sample.
    smoothed: Option<Duration>,
    variance: Duration,
    rto: Duration,
    backoffs: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Estimator with no samples; the RTO starts at [`constants::INITIAL_RTO`].
    pub fn new() -> Self {
        Self {
            smoothed: None,
            variance: Duration::ZERO,
            rto: INITIAL_RTO,
            backoffs: 0,
        }
    }

    /// Feed one measured round trip. Clears any backoff.
    pub fn update(&mut self, rtt: Duration) {
        let (smoothed, variance) = match self.smoothed {
            None => (rtt, rtt / 2),
            Some(srtt) => {
                let deviation = srtt.abs_diff(rtt);
                let variance = self.variance * (RTTVAR_DIVISOR - 1) / RTTVAR_DIVISOR
                    + deviation / RTTVAR_DIVISOR;
                let smoothed = srtt * (SRTT_DIVISOR - 1) / SRTT_DIVISOR + rtt / SRTT_DIVISOR;
                (smoothed, variance)
            }
        };
        self.smoothed = Some(smoothed);
        self.variance = variance;
        self.backoffs = 0;
        self.rto = self.computed_rto();
    }

    /// Feed the round trip of a packet sent at `sent_at` and acknowledged
    /// at `now`. A clock that went backwards counts as zero.
    pub fn sample(&mut self, sent_at: Instant, now: Instant) {
        self.update(now.saturating_duration_since(sent_at));
    }

    /// `SRTT + max(G, K * RTTVAR)`, clamped to `[MIN_RTO, MAX_RTO]`.
    fn computed_rto(&self) -> Duration {
        match self.smoothed {
            None => INITIAL_RTO,
            Some(srtt) => (srtt + GRANULARITY.max(self.variance * VARIANCE_FACTOR))
                .clamp(MIN_RTO, MAX_RTO),
        }
    }

    /// Smoothed RTT. Before any sample this is the initial RTO.
    pub fn srtt(&self) -> Duration {
        self.smoothed.unwrap_or(INITIAL_RTO)
    }

    /// RTT variance.
    pub fn rttvar(&self) -> Duration {
        self.variance
    }

    /// Retransmission timeout in force.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Check if at least one sample has been taken.
    pub fn is_initialized(&self) -> bool {
        self.smoothed.is_some()
    }

    /// Double the RTO after a timeout, up to [`constants::MAX_RTO`].
    /// Returns the new RTO.
    pub fn backoff(&mut self) -> Duration {
        self.backoffs = self.backoffs.saturating_add(1);
        self.rto = self.rto.saturating_mul(2).min(MAX_RTO);
        self.rto
    }

    /// Backoffs applied since the last sample.
    pub fn backoffs(&self) -> u32 {
        self.backoffs
    }

    /// Return to the RTO computed from the current estimate.
    pub fn reset_backoff(&mut self) {
        self.backoffs = 0;
        self.rto = self.computed_rto();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_no_samples() {
        let rtt = RttEstimator::new();
        assert!(!rtt.is_initialized());
        assert_eq!(rtt.rto(), INITIAL_RTO);
        assert_eq!(rtt.srtt(), INITIAL_RTO);
    }

    #[test]
    fn test_first_sample_sets_variance_to_half() {
        let mut rtt = RttEstimator::new();
        rtt.update(ms(400));

        assert_eq!(rtt.srtt(), ms(400));
        assert_eq!(rtt.rttvar(), ms(200));
        assert_eq!(rtt.rto(), ms(400 + 4 * 200));
    }

    #[test]
    fn test_smoothing_moves_toward_samples() {
        let mut rtt = RttEstimator::new();
        rtt.update(ms(100));
        rtt.update(ms(300));

        // 7/8 * 100 + 1/8 * 300
        assert_eq!(rtt.srtt(), ms(125));
        // 3/4 * 50 + 1/4 * 200
        assert_eq!(rtt.rttvar(), Duration::from_micros(87_500));
    }

    #[test]
    fn test_sample_from_instants() {
        let start = Instant::now();
        let mut rtt = RttEstimator::new();
        rtt.sample(start, start + ms(250));
        assert_eq!(rtt.srtt(), ms(250));

        rtt.sample(start + ms(1000), start);
        assert!(rtt.srtt() < ms(250));
    }

    #[test]
    fn test_rto_floor() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_micros(100));
        assert_eq!(rtt.rto(), MIN_RTO);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut rtt = RttEstimator::new();
        rtt.update(ms(100));
        let base = rtt.rto();

        assert_eq!(rtt.backoff(), base * 2);
        assert_eq!(rtt.backoffs(), 1);
        for _ in 0..20 {
            rtt.backoff();
        }
        assert_eq!(rtt.rto(), MAX_RTO);

        rtt.reset_backoff();
        assert_eq!(rtt.rto(), base);
        assert_eq!(rtt.backoffs(), 0);
    }

    #[test]
    fn test_new_sample_clears_backoff() {
        let mut rtt = RttEstimator::new();
        rtt.backoff();
        assert_eq!(rtt.rto(), INITIAL_RTO * 2);

        rtt.update(ms(100));
        assert_eq!(rtt.backoffs(), 0);
        assert!(rtt.rto() < INITIAL_RTO);
    }
}

use std::time::{Duration, Instant};

/// Smoothed bytes/s for one transfer
///
/// Each sample is weighted by how much time it covers, so bursts of tiny
/// reports do not swing the estimate.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    half_life: Duration,
    last: Option<(Instant, u64)>,
    rate: f64,
}

impl RateEstimator {
    pub fn new(half_life: Duration) -> Self {
        Self {
            half_life: half_life.max(Duration::from_millis(1)),
            last: None,
            rate: 0.0,
        }
    }

    /// Feed the cumulative byte count observed at `now`
    pub fn sample(&mut self, now: Instant, bytes: u64) -> f64 {
        match self.last {
            None => {
                self.last = Some((now, bytes));
            }
            Some((at, seen)) => {
                let elapsed = now.saturating_duration_since(at);
                if elapsed.is_zero() {
                    return self.rate;
                }
                let delta = bytes.saturating_sub(seen) as f64;
                let instant = delta / elapsed.as_secs_f64();
                let alpha = 1.0 - 0.5f64.powf(elapsed.as_secs_f64() / self.half_life.as_secs_f64());
                self.rate = if self.rate == 0.0 {
                    instant
                } else {
                    self.rate + alpha * (instant - self.rate)
                };
                self.last = Some((now, bytes.max(seen)));
            }
        }
        self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_stream_converges_on_true_rate() {
        let mut rate = RateEstimator::new(Duration::from_millis(500));
        let start = Instant::now();
        assert_eq!(rate.sample(start, 0), 0.0);
        for step in 1..=20u64 {
            rate.sample(start + Duration::from_millis(100 * step), 1_000 * step);
        }
        assert!((rate.rate() - 10_000.0).abs() < 1.0, "got {}", rate.rate());
    }

    #[test]
    fn slowdown_pulls_the_estimate_down_gradually() {
        let mut rate = RateEstimator::new(Duration::from_secs(1));
        let start = Instant::now();
        rate.sample(start, 0);
        rate.sample(start + Duration::from_secs(1), 10_000);
        let fast = rate.rate();
        rate.sample(start + Duration::from_millis(1_100), 10_100);
        assert!(rate.rate() < fast);
        assert!(rate.rate() > 1_000.0);
    }
}

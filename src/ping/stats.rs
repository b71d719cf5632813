use std::time::Duration;

/// Incremental per-target statistics.
///
/// The mean and variance accumulators follow Welford's online algorithm
/// over *successful* round trip times only. The standard deviation is
/// reported as `sqrt(M2 / N)` where `N` counts every resolved probe,
/// failures included; early failures therefore dilute the deviation
/// toward zero. Duplicates contribute nothing, and a probe whose
/// success is later invalidated by a duplicate reply has its sample
/// retracted and is recounted as a failure.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stats {
    successes: u64,
    failures: u64,
    mean: f64,
    m2: f64,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    /// Number of resolved probes (successes and failures).
    pub fn count(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Lost probes as a fraction of resolved ones, 0.0 when nothing
    /// resolved yet.
    pub fn packet_loss(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.failures as f64 / count as f64
        }
    }

    /// Mean round trip time of the successful probes.
    pub fn avg_latency(&self) -> Option<Duration> {
        if self.successes == 0 {
            None
        } else {
            Some(Duration::from_secs_f64(self.mean))
        }
    }

    /// Population standard deviation, diluted by failures (see type
    /// docs).
    pub fn std_dev(&self) -> Option<Duration> {
        let count = self.count();
        if count == 0 {
            None
        } else {
            Some(Duration::from_secs_f64((self.m2 / count as f64).sqrt()))
        }
    }

    pub fn record_success(&mut self, latency: Duration) {
        let x = latency.as_secs_f64();
        self.successes += 1;
        let delta = x - self.mean;
        self.mean += delta / self.successes as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// Reverses a previous [`Stats::record_success`] for the given
    /// sample (Welford's update run backwards). Used when a duplicate
    /// reply invalidates a probe that had already been counted.
    pub fn retract_success(&mut self, latency: Duration) {
        debug_assert!(self.successes > 0);
        let x = latency.as_secs_f64();
        self.successes -= 1;
        if self.successes == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let mean_with = self.mean;
        let mean_without = (mean_with * (self.successes + 1) as f64 - x) / self.successes as f64;
        self.m2 -= (x - mean_without) * (x - mean_with);
        self.mean = mean_without;
        if self.m2 < 0.0 {
            // guard against rounding pushing the accumulator below zero
            self.m2 = 0.0;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn empty() {
        let stats = Stats::new();
        assert_eq!(0, stats.count());
        assert_eq!(0.0, stats.packet_loss());
        assert_eq!(None, stats.avg_latency());
        assert_eq!(None, stats.std_dev());
    }

    #[test]
    fn mean_over_successes_only() {
        let mut stats = Stats::new();
        stats.record_success(ms(10));
        stats.record_success(ms(20));
        stats.record_failure();
        assert_eq!(3, stats.count());
        assert_eq!(Some(ms(15)), stats.avg_latency());
        assert!((stats.packet_loss() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn std_dev_denominator_counts_failures() {
        let mut stats = Stats::new();
        stats.record_success(ms(10));
        stats.record_success(ms(30));
        // m2 = sum of squared deviations = 2 * (10ms)^2
        let without_failures = stats.std_dev().unwrap();
        stats.record_failure();
        stats.record_failure();
        let with_failures = stats.std_dev().unwrap();
        assert!(with_failures < without_failures);
        // sqrt(m2 / 4) = half of sqrt(m2 / 1) ... check the exact value
        let expected = (2.0 * 0.01f64.powi(2) / 4.0).sqrt();
        assert!((with_failures.as_secs_f64() - expected).abs() < 1e-9);
    }

    #[test]
    fn retraction_undoes_a_sample() {
        let mut reference = Stats::new();
        reference.record_success(ms(10));
        reference.record_success(ms(30));

        let mut stats = Stats::new();
        stats.record_success(ms(10));
        stats.record_success(ms(30));
        stats.record_success(ms(70));
        stats.retract_success(ms(70));

        assert_eq!(reference.successes(), stats.successes());
        assert!((reference.mean - stats.mean).abs() < 1e-9);
        assert!((reference.m2 - stats.m2).abs() < 1e-9);
    }

    #[test]
    fn retraction_to_empty() {
        let mut stats = Stats::new();
        stats.record_success(ms(25));
        stats.retract_success(ms(25));
        assert_eq!(0, stats.successes());
        assert_eq!(None, stats.avg_latency());
    }
}

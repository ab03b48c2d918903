use std::time::{Duration, Instant};

/// Smoothing factor for the exponential moving average.
const SMOOTHING_FACTOR: f64 = 0.3;
/// Samples closer together than this are folded into the next one.
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Throughput estimator fed with cumulative byte counters.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    last_bytes: u64,
    last_at: Instant,
    speed: f64,
    primed: bool,
}

impl SpeedMeter {
    pub fn new(initial_bytes: u64, now: Instant) -> Self {
        Self {
            last_bytes: initial_bytes,
            last_at: now,
            speed: 0.0,
            primed: false,
        }
    }

    /// Feeds the total number of bytes received so far.
    pub fn record(&mut self, total_bytes: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed < MIN_SAMPLE_INTERVAL {
            return;
        }
        let delta = total_bytes.saturating_sub(self.last_bytes);
        let instant = delta as f64 / elapsed.as_secs_f64();

        self.speed = if self.primed {
            SMOOTHING_FACTOR * instant + (1.0 - SMOOTHING_FACTOR) * self.speed
        } else {
            self.primed = true;
            instant
        };
        self.last_bytes = total_bytes;
        self.last_at = now;
    }

    /// Restarts the window, e.g. after a pause, without forgetting the smoothed value.
    pub fn rebase(&mut self, total_bytes: u64, now: Instant) {
        self.last_bytes = total_bytes;
        self.last_at = now;
    }

    /// Bytes per second.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        if remaining_bytes == 0 {
            return Some(Duration::ZERO);
        }
        if self.speed < 1.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / self.speed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_sets_speed_directly() {
        let start = Instant::now();
        let mut meter = SpeedMeter::new(0, start);
        meter.record(1000, start + Duration::from_secs(1));
        assert!((meter.speed() - 1000.0).abs() < 1e-6);
        assert_eq!(meter.eta(5000), Some(Duration::from_secs(5)));
    }

    #[test]
    fn later_samples_are_smoothed() {
        let start = Instant::now();
        let mut meter = SpeedMeter::new(0, start);
        meter.record(1000, start + Duration::from_secs(1));
        meter.record(3000, start + Duration::from_secs(2));
        // 0.3 * 2000 + 0.7 * 1000
        assert!((meter.speed() - 1300.0).abs() < 1e-6);
    }

    #[test]
    fn close_samples_are_ignored() {
        let start = Instant::now();
        let mut meter = SpeedMeter::new(0, start);
        meter.record(1000, start + Duration::from_millis(10));
        assert_eq!(meter.speed(), 0.0);
        assert_eq!(meter.eta(10), None);
        assert_eq!(meter.eta(0), Some(Duration::ZERO));
    }

    #[test]
    fn rebase_skips_paused_gap() {
        let start = Instant::now();
        let mut meter = SpeedMeter::new(0, start);
        meter.record(1000, start + Duration::from_secs(1));
        meter.rebase(1000, start + Duration::from_secs(60));
        meter.record(2000, start + Duration::from_secs(61));
        assert!((meter.speed() - 1000.0).abs() < 1e-6);
    }
}

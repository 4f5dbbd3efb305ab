//! Exposure countdown and watchdog sizing.

use crate::CaptureConfig;
use std::time::{Duration, Instant};

/// Tracks one running exposure: when it started and how long it was asked to last.
#[derive(Debug, Clone, Copy)]
pub struct ExposureTimer {
    start: Instant,
    duration: Duration,
}

/// One progress report: the value to show and how long to wait before the next one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Countdown {
    /// Remaining seconds. Rounded to whole seconds in the coarse regime, may be negative.
    pub remaining: f64,
    /// Delay until the next report.
    pub next_poll: Duration,
}

impl ExposureTimer {
    /// Start timing an exposure of `duration` now.
    pub fn start(duration: Duration) -> Self {
        Self::started_at(Instant::now(), duration)
    }

    /// Start timing an exposure that began at `start`.
    pub fn started_at(start: Instant, duration: Duration) -> Self {
        Self { start, duration }
    }

    /// Requested duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Instant the exposure started.
    pub fn start_time(&self) -> Instant {
        self.start
    }

    /// Seconds remaining at `now`. Negative once the exposure is over.
    pub fn remaining_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.start).as_secs_f64();
        self.duration.as_secs_f64() - elapsed
    }

    /// Seconds remaining right now.
    pub fn remaining(&self) -> f64 {
        self.remaining_at(Instant::now())
    }

    /// Progress value and poll delay at `now`.
    ///
    /// Above the coarse threshold the value is rounded to whole seconds and
    /// polled once per coarse period, which keeps a displayed counter on
    /// whole-second boundaries. Below it the fine cadence is used, never
    /// sleeping past the end of the exposure.
    pub fn countdown_at(&self, now: Instant, config: &CaptureConfig) -> Countdown {
        let remaining = self.remaining_at(now);
        if remaining > config.coarse_threshold.as_secs_f64() {
            Countdown {
                remaining: remaining.round(),
                next_poll: config.coarse_poll,
            }
        } else {
            let left = Duration::try_from_secs_f64(remaining).unwrap_or(Duration::ZERO);
            Countdown {
                remaining,
                next_poll: config.fine_poll.min(left).max(Duration::from_millis(1)),
            }
        }
    }
}

/// Sizes the allowance for reading a frame out after its exposure ends.
///
/// The allowance is the previous download time scaled by the safety factor,
/// never below the floor. The estimate itself is also clamped to the floor so
/// an anomalously fast readout cannot shrink the next watchdog to nothing.
///
/// A download is measured from the end of the requested exposure to the end
/// of the frame pull, so it includes readout the camera performs before it
/// signals data-ready.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Watchdog {
    safety_factor: f64,
    floor: Duration,
    download_estimate: Duration,
}

impl Watchdog {
    /// Create a watchdog whose first estimate is `initial`, clamped to the floor.
    pub fn new(safety_factor: f64, floor: Duration, initial: Duration) -> Self {
        Self {
            safety_factor,
            floor,
            download_estimate: initial.max(floor),
        }
    }

    /// Create a watchdog from the supervisor configuration.
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(
            config.watchdog_safety_factor,
            config.watchdog_floor,
            config.initial_download_estimate,
        )
    }

    /// Current download-time estimate.
    pub fn download_estimate(&self) -> Duration {
        self.download_estimate
    }

    /// Record the measured download time of a completed frame.
    pub fn record_download(&mut self, measured: Duration) {
        self.download_estimate = measured.max(self.floor);
    }

    /// Record a download that ended at `pulled`, for an exposure that ended at `exposure_end`.
    pub fn record_readout(&mut self, exposure_end: Instant, pulled: Instant) {
        self.record_download(pulled.saturating_duration_since(exposure_end));
    }

    /// Allowance granted after the exposure for the frame to become ready.
    pub fn download_allowance(&self) -> Duration {
        self.download_estimate
            .mul_f64(self.safety_factor)
            .max(self.floor)
    }

    /// Total watchdog timeout for an exposure of `duration`.
    pub fn timeout_for(&self, duration: Duration) -> Duration {
        duration + self.download_allowance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_time() {
        let start = Instant::now();
        let timer = ExposureTimer::started_at(start, Duration::from_secs(2));
        let r = timer.remaining_at(start + Duration::from_millis(500));
        assert!((r - 1.5).abs() < 1e-9);
        let r = timer.remaining_at(start + Duration::from_secs(3));
        assert!((r + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_coarse_countdown_rounds() {
        let cfg = CaptureConfig::default();
        let start = Instant::now();
        let timer = ExposureTimer::started_at(start, Duration::from_secs(10));
        let c = timer.countdown_at(start + Duration::from_millis(2300), &cfg);
        assert_eq!(c.remaining, 8.0);
        assert_eq!(c.next_poll, Duration::from_secs(1));
    }

    #[test]
    fn test_fine_countdown() {
        let cfg = CaptureConfig::default();
        let start = Instant::now();
        let timer = ExposureTimer::started_at(start, Duration::from_secs(1));
        let c = timer.countdown_at(start + Duration::from_millis(200), &cfg);
        assert!((c.remaining - 0.8).abs() < 1e-9);
        assert_eq!(c.next_poll, Duration::from_millis(100));

        // Never sleep past the end of the exposure.
        let c = timer.countdown_at(start + Duration::from_millis(970), &cfg);
        assert!(c.next_poll <= Duration::from_millis(30));

        // Overdue exposures still poll at a minimal non-zero cadence.
        let c = timer.countdown_at(start + Duration::from_secs(2), &cfg);
        assert!(c.remaining < 0.0);
        assert_eq!(c.next_poll, Duration::from_millis(1));
    }

    #[test]
    fn test_watchdog_initial_estimate() {
        let wd = Watchdog::from_config(&CaptureConfig::default());
        assert_eq!(wd.download_estimate(), Duration::from_secs(5));
        let timeout = wd.timeout_for(Duration::from_millis(100)).as_secs_f64();
        assert!((timeout - 6.1).abs() < 1e-6);
        // The seed never drops below the floor.
        let wd = Watchdog::new(1.2, Duration::from_millis(50), Duration::ZERO);
        assert_eq!(wd.download_estimate(), Duration::from_millis(50));
    }

    #[test]
    fn test_readout_measured_from_exposure_end() {
        let mut wd = Watchdog::new(1.2, Duration::from_millis(50), Duration::from_millis(50));
        let start = Instant::now();
        let timer = ExposureTimer::started_at(start, Duration::from_millis(100));
        let exposure_end = timer.start_time() + timer.duration();
        // Ready and pulled 200 ms after the exposure ended.
        wd.record_readout(exposure_end, exposure_end + Duration::from_millis(200));
        assert_eq!(wd.download_estimate(), Duration::from_millis(200));
        let allowance = wd.download_allowance().as_secs_f64();
        assert!((allowance - 0.24).abs() < 1e-6);
        // A pull finishing before the nominal end counts as instantaneous.
        wd.record_readout(exposure_end, start);
        assert_eq!(wd.download_estimate(), Duration::from_millis(50));
    }

    #[test]
    fn test_watchdog_defaults_to_floor() {
        let wd = Watchdog::new(1.2, Duration::from_millis(50), Duration::from_millis(50));
        assert_eq!(wd.download_estimate(), Duration::from_millis(50));
        let allowance = wd.download_allowance().as_secs_f64();
        assert!((allowance - 0.06).abs() < 1e-6);
        let timeout = wd.timeout_for(Duration::from_secs(2)).as_secs_f64();
        assert!((timeout - 2.06).abs() < 1e-6);
    }

    #[test]
    fn test_fast_download_clamped() {
        let mut wd = Watchdog::new(1.2, Duration::from_millis(50), Duration::from_secs(5));
        wd.record_download(Duration::from_millis(1));
        assert_eq!(wd.download_estimate(), Duration::from_millis(50));
        wd.record_download(Duration::from_millis(500));
        assert_eq!(wd.download_estimate(), Duration::from_millis(500));
        let allowance = wd.download_allowance().as_secs_f64();
        assert!((allowance - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_watchdog_monotonic_in_estimate() {
        let exposure = Duration::from_millis(1500);
        let mut previous = Duration::ZERO;
        for ms in (0..5000).step_by(37) {
            let mut wd = Watchdog::new(1.2, Duration::from_millis(50), Duration::ZERO);
            wd.record_download(Duration::from_millis(ms));
            let timeout = wd.timeout_for(exposure);
            assert!(timeout >= previous, "{ms} ms: {timeout:?} < {previous:?}");
            assert!(timeout >= exposure + Duration::from_millis(50));
            previous = timeout;
        }
    }
}

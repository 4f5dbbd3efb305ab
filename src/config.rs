use crate::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Scalar knobs for the capture supervisor.
///
/// Durations are written as fractional seconds, so a JSON configuration reads
/// `{"watchdog_floor": 0.05}`. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Multiplier applied to the previous download time when sizing the watchdog.
    pub watchdog_safety_factor: f64,
    /// Lower bound of the download allowance and of the download estimate.
    #[serde(with = "seconds")]
    pub watchdog_floor: Duration,
    /// Download-time estimate used until the first frame has been read out.
    #[serde(with = "seconds")]
    pub initial_download_estimate: Duration,
    /// Number of times an exposure is re-triggered after the watchdog expires.
    pub exposure_retry_budget: u32,
    /// Pull attempts per streamed frame before the frame is reported lost.
    pub stream_retry_limit: u32,
    /// Pause between two failed stream pulls.
    #[serde(with = "seconds")]
    pub stream_retry_pause: Duration,
    /// Progress cadence while more than `coarse_threshold` remains.
    #[serde(with = "seconds")]
    pub coarse_poll: Duration,
    /// Progress cadence for the final countdown.
    #[serde(with = "seconds")]
    pub fine_poll: Duration,
    /// Remaining time above which progress is rounded to whole seconds.
    #[serde(with = "seconds")]
    pub coarse_threshold: Duration,
    /// Decode the embedded GPS timing header of every frame.
    pub decode_gps_header: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            watchdog_safety_factor: 1.2,
            watchdog_floor: Duration::from_millis(50),
            initial_download_estimate: Duration::from_secs(5),
            exposure_retry_budget: 3,
            stream_retry_limit: 10,
            stream_retry_pause: Duration::from_millis(1),
            coarse_poll: Duration::from_secs(1),
            fine_poll: Duration::from_millis(100),
            coarse_threshold: Duration::from_millis(1100),
            decode_gps_header: false,
        }
    }
}

impl CaptureConfig {
    /// Check the configuration for values the supervisor cannot work with.
    ///
    /// # Errors
    /// [`Error::InvalidValue`] naming the offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.watchdog_safety_factor.is_finite() || self.watchdog_safety_factor < 1.0 {
            return Err(Error::InvalidValue(format!(
                "watchdog_safety_factor must be >= 1.0, got {}",
                self.watchdog_safety_factor
            )));
        }
        if self.stream_retry_limit == 0 {
            return Err(Error::InvalidValue(
                "stream_retry_limit must be at least 1".to_string(),
            ));
        }
        if self.fine_poll.is_zero() || self.coarse_poll.is_zero() {
            return Err(Error::InvalidValue(
                "poll cadences must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod seconds {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

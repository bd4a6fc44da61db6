//! Concentrator configuration

use std::time::Duration;

use crate::downsampling::DownsamplingMethod;
use crate::error::ConfigError;
use crate::ticks::Ticks;

/// Settings for a [`Concentrator`](crate::Concentrator)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConcentratorConfig {
    /// Frame buckets per second
    pub frames_per_second: u32,
    /// Past tolerance in seconds, also how long a frame waits before publication
    pub lag_time: f64,
    /// Future tolerance in seconds
    pub lead_time: f64,
    /// Re-stamp measurements with bad timestamps using real time instead of dropping them
    pub allow_sorts_by_arrival: bool,
    /// Use the local clock as real time rather than the newest measurement
    pub use_local_clock_as_real_time: bool,
    /// Feed every sorted measurement into the latest-value index
    pub track_latest_measurements: bool,
    /// Publish a frame early once it holds `expected_measurements`
    pub allow_preemptive_publishing: bool,
    /// Measurements a complete frame holds; 0 disables early publication
    pub expected_measurements: usize,
    /// Longest a producer waits for a frame's insertion guard
    pub sort_lock_timeout: Duration,
    /// Backlog monitor period
    pub monitor_interval: Duration,
    /// Longest `stop()` waits for the publication thread
    pub stop_timeout: Duration,
    /// Which value a frame keeps when a stream reports faster than the frame rate
    pub downsampling_method: DownsamplingMethod,
    /// Bucket timestamps are truncated to this many ticks; 0 or 1 keeps full precision
    pub time_resolution: Ticks,
    /// Sort into the nearest bucket instead of the one a timestamp falls in
    pub round_to_nearest_timestamp: bool,
    /// Accept measurements flagged with a bad timestamp as they are
    pub ignore_bad_timestamps: bool,
    /// Only trust timestamps within the lead time of the local clock
    pub perform_timestamp_reasonability_check: bool,
    /// Sort every measurement regardless of its age; forces the local clock
    pub process_by_received_timestamp: bool,
}

impl Default for ConcentratorConfig {
    fn default() -> Self {
        Self {
            frames_per_second: 30,
            lag_time: 3.0,
            lead_time: 1.0,
            allow_sorts_by_arrival: true,
            use_local_clock_as_real_time: false,
            track_latest_measurements: false,
            allow_preemptive_publishing: false,
            expected_measurements: 0,
            sort_lock_timeout: Duration::from_millis(5),
            monitor_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
            downsampling_method: DownsamplingMethod::LastReceived,
            time_resolution: Ticks::ZERO,
            round_to_nearest_timestamp: false,
            ignore_bad_timestamps: false,
            perform_timestamp_reasonability_check: true,
            process_by_received_timestamp: false,
        }
    }
}

impl ConcentratorConfig {
    /// Create a configuration with the given timing and default flags
    pub fn new(frames_per_second: u32, lag_time: f64, lead_time: f64) -> Self {
        Self {
            frames_per_second,
            lag_time,
            lead_time,
            ..Self::default()
        }
    }

    /// Check the timing parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_frames_per_second(self.frames_per_second)?;
        ConfigError::check_lag_time(self.lag_time)?;
        ConfigError::check_lead_time(self.lead_time)?;
        ConfigError::check_time_resolution(self.time_resolution, self.frames_per_second)?;
        Ok(())
    }

    /// Ticks in one frame
    pub fn ticks_per_frame(&self) -> f64 {
        Ticks::PER_SECOND as f64 / self.frames_per_second.max(1) as f64
    }

    /// Set the real-time source
    pub fn with_local_clock(mut self, enabled: bool) -> Self {
        self.use_local_clock_as_real_time = enabled;
        self
    }

    /// Set arrival-time sorting of badly stamped measurements
    pub fn with_sorts_by_arrival(mut self, enabled: bool) -> Self {
        self.allow_sorts_by_arrival = enabled;
        self
    }

    /// Enable or disable the latest-value index
    pub fn with_latest_measurements(mut self, enabled: bool) -> Self {
        self.track_latest_measurements = enabled;
        self
    }

    /// Publish frames early once they hold `expected` measurements
    pub fn with_preemptive_publishing(mut self, expected: usize) -> Self {
        self.allow_preemptive_publishing = expected > 0;
        self.expected_measurements = expected;
        self
    }

    /// Bound the insertion guard wait
    pub fn with_sort_lock_timeout(mut self, timeout: Duration) -> Self {
        self.sort_lock_timeout = timeout;
        self
    }

    /// Set the backlog monitor period
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Bound the publication thread join in `stop()`
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Choose how repeated values for one stream in one frame are reduced
    pub fn with_downsampling(mut self, method: DownsamplingMethod) -> Self {
        self.downsampling_method = method;
        self
    }

    /// Truncate bucket timestamps to `resolution`
    pub fn with_time_resolution(mut self, resolution: Ticks) -> Self {
        self.time_resolution = resolution;
        self
    }

    pub fn with_round_to_nearest_timestamp(mut self, enabled: bool) -> Self {
        self.round_to_nearest_timestamp = enabled;
        self
    }

    pub fn with_ignore_bad_timestamps(mut self, enabled: bool) -> Self {
        self.ignore_bad_timestamps = enabled;
        self
    }

    /// Enable or disable the lead-time gate on incoming timestamps
    pub fn with_reasonability_check(mut self, enabled: bool) -> Self {
        self.perform_timestamp_reasonability_check = enabled;
        self
    }

    /// Sort everything on arrival; turns on the local clock and off sorts by arrival
    pub fn with_process_by_received_timestamp(mut self, enabled: bool) -> Self {
        self.process_by_received_timestamp = enabled;
        if enabled {
            self.use_local_clock_as_real_time = true;
            self.allow_sorts_by_arrival = false;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ConcentratorConfig::default();
        assert_eq!(config.frames_per_second, 30);
        assert_eq!(config.lag_time, 3.0);
        assert_eq!(config.lead_time, 1.0);
        assert!(config.allow_sorts_by_arrival);
        assert!(!config.use_local_clock_as_real_time);
        assert_eq!(config.downsampling_method, DownsamplingMethod::LastReceived);
        assert_eq!(config.time_resolution, Ticks::ZERO);
        assert!(!config.round_to_nearest_timestamp);
        assert!(config.perform_timestamp_reasonability_check);
        assert!(!config.ignore_bad_timestamps);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(
            ConcentratorConfig::new(0, 3.0, 1.0).validate(),
            Err(ConfigError::InvalidFramesPerSecond(0))
        );
        assert_eq!(
            ConcentratorConfig::new(30, 0.0, 1.0).validate(),
            Err(ConfigError::InvalidLagTime(0.0))
        );
        assert_eq!(
            ConcentratorConfig::new(30, 3.0, -0.5).validate(),
            Err(ConfigError::InvalidLeadTime(-0.5))
        );
        assert!(ConcentratorConfig::new(1, 0.01, 0.01).validate().is_ok());
        assert!(matches!(
            ConcentratorConfig::new(30, 3.0, 1.0)
                .with_time_resolution(Ticks::new(Ticks::PER_SECOND))
                .validate(),
            Err(ConfigError::InvalidTimeResolution { .. })
        ));
    }

    #[test]
    fn test_process_by_received_forces_local_clock() {
        let config = ConcentratorConfig::new(30, 3.0, 1.0).with_process_by_received_timestamp(true);
        assert!(config.process_by_received_timestamp);
        assert!(config.use_local_clock_as_real_time);
        assert!(!config.allow_sorts_by_arrival);
    }

    #[test]
    fn test_config_builders() {
        let config = ConcentratorConfig::new(60, 1.0, 0.5)
            .with_local_clock(true)
            .with_preemptive_publishing(12)
            .with_stop_timeout(Duration::from_millis(250));
        assert!(config.use_local_clock_as_real_time);
        assert!(config.allow_preemptive_publishing);
        assert_eq!(config.expected_measurements, 12);
        assert_eq!(config.stop_timeout, Duration::from_millis(250));
        assert!((config.ticks_per_frame() - 166_666.666).abs() < 0.001);
    }
}

//! Error types for the concentrator
//!
//! Late, stale or badly-stamped measurements are never errors: they are
//! discarded and counted. The types here cover invalid construction,
//! invalid configuration and faults raised by the injected publisher.

use thiserror::Error;

use crate::ticks::Ticks;

/// Result type alias for concentrator operations
pub type Result<T> = std::result::Result<T, ConcentratorError>;

/// Boxed error returned by publish callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for concentrator operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConcentratorError {
    /// A value handed to a constructor was rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The publish callback returned an error for a frame
    #[error("Failed to publish frame {timestamp}: {reason}")]
    Publish { timestamp: Ticks, reason: String },

    /// The publish callback panicked while handling a frame
    #[error("Publisher panicked on frame {timestamp}: {message}")]
    PublishPanic { timestamp: Ticks, message: String },

    /// A worker thread could not be spawned
    #[error("Failed to spawn {0} thread")]
    Spawn(String),
}

/// Errors raised while validating concentrator settings
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Frame rate below one frame per second
    #[error("Frames per second must be greater than 0, got {0}")]
    InvalidFramesPerSecond(u32),

    /// Lag time not strictly positive
    #[error("Lag time must be greater than zero, but it can be less than one (got {0})")]
    InvalidLagTime(f64),

    /// Lead time not strictly positive
    #[error("Lead time must be greater than zero, but it can be less than one (got {0})")]
    InvalidLeadTime(f64),

    /// Time resolution negative or coarser than half a frame
    #[error("Time resolution must be between 0 and {max} ticks at this frame rate, got {resolution}")]
    InvalidTimeResolution { resolution: i64, max: i64 },
}

impl ConfigError {
    /// Validate a frame rate
    pub fn check_frames_per_second(frames_per_second: u32) -> std::result::Result<u32, Self> {
        if frames_per_second < 1 {
            return Err(Self::InvalidFramesPerSecond(frames_per_second));
        }
        Ok(frames_per_second)
    }

    /// Validate a lag tolerance in seconds
    pub fn check_lag_time(lag_time: f64) -> std::result::Result<f64, Self> {
        if !(lag_time.is_finite() && lag_time > 0.0) {
            return Err(Self::InvalidLagTime(lag_time));
        }
        Ok(lag_time)
    }

    /// Validate a lead tolerance in seconds
    pub fn check_lead_time(lead_time: f64) -> std::result::Result<f64, Self> {
        if !(lead_time.is_finite() && lead_time > 0.0) {
            return Err(Self::InvalidLeadTime(lead_time));
        }
        Ok(lead_time)
    }

    /// Validate a bucket time resolution against a frame rate
    ///
    /// The resolution may not exceed half a frame, otherwise aligned bucket
    /// starts could collide.
    pub fn check_time_resolution(
        resolution: Ticks,
        frames_per_second: u32,
    ) -> std::result::Result<Ticks, Self> {
        let max = Ticks::PER_SECOND / (2 * i64::from(frames_per_second.max(1)));
        if resolution.value() < 0 || resolution.value() > max {
            return Err(Self::InvalidTimeResolution {
                resolution: resolution.value(),
                max,
            });
        }
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConcentratorError::Publish {
            timestamp: Ticks::new(10_000_000),
            reason: "archive offline".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("archive offline"));
    }

    #[test]
    fn test_error_conversion() {
        let config_err = ConfigError::InvalidLagTime(0.0);
        let err: ConcentratorError = config_err.into();
        assert!(matches!(err, ConcentratorError::Config(_)));
    }

    #[test]
    fn test_config_checks() {
        assert_eq!(ConfigError::check_frames_per_second(30), Ok(30));
        assert_eq!(
            ConfigError::check_frames_per_second(0),
            Err(ConfigError::InvalidFramesPerSecond(0))
        );
        assert!(ConfigError::check_lag_time(0.25).is_ok());
        assert!(ConfigError::check_lag_time(0.0).is_err());
        assert!(ConfigError::check_lag_time(-1.0).is_err());
        assert!(ConfigError::check_lag_time(f64::NAN).is_err());
        assert!(ConfigError::check_lead_time(f64::INFINITY).is_err());
    }

    #[test]
    fn test_time_resolution_check() {
        let millisecond = Ticks::new(Ticks::PER_MILLISECOND);
        assert_eq!(ConfigError::check_time_resolution(millisecond, 30), Ok(millisecond));
        assert!(ConfigError::check_time_resolution(Ticks::ZERO, 30).is_ok());
        assert!(ConfigError::check_time_resolution(Ticks::new(-1), 30).is_err());
        // Half a frame at 100 fps is 50_000 ticks
        assert!(ConfigError::check_time_resolution(Ticks::new(50_000), 100).is_ok());
        assert_eq!(
            ConfigError::check_time_resolution(Ticks::new(50_001), 100),
            Err(ConfigError::InvalidTimeResolution {
                resolution: 50_001,
                max: 50_000
            })
        );
    }
}

//! Measurement value types
//!
//! A [`Measurement`] is one timestamped sample of a stream. Its adjusted
//! value (`value * multiplier + adder`) is always derived, never stored.
//!
//! A [`TemporalMeasurement`] wraps a measurement with lag/lead tolerances.
//! Its value is only visible while the query time stays inside the
//! tolerance window around the sample, so stale cached values stop being
//! reported without anyone removing them.

use std::fmt;

use crate::error::{ConfigError, Result};
use crate::identity::Identity;
use crate::ticks::Ticks;

/// One timestamped sample of a measurement stream
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    identity: Identity,
    /// Raw value as produced by the source
    pub value: f64,
    /// Offset applied after scaling
    pub adder: f64,
    /// Scale applied to the raw value
    pub multiplier: f64,
    /// Source timestamp
    pub timestamp: Ticks,
    /// Whether the source vouches for the value
    pub value_quality_is_good: bool,
    /// Whether the source vouches for the timestamp
    pub timestamp_quality_is_good: bool,
}

impl Measurement {
    /// Create a measurement with unit scaling and good quality
    pub fn new(identity: Identity, value: f64, timestamp: Ticks) -> Self {
        Self {
            identity,
            value,
            adder: 0.0,
            multiplier: 1.0,
            timestamp,
            value_quality_is_good: true,
            timestamp_quality_is_good: true,
        }
    }

    /// Set the linear adjustment applied to the raw value
    pub fn with_adjustment(mut self, multiplier: f64, adder: f64) -> Self {
        self.multiplier = multiplier;
        self.adder = adder;
        self
    }

    /// Set both quality flags
    pub fn with_quality(mut self, value_is_good: bool, timestamp_is_good: bool) -> Self {
        self.value_quality_is_good = value_is_good;
        self.timestamp_quality_is_good = timestamp_is_good;
        self
    }

    /// Stream this sample belongs to
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// `value * multiplier + adder`
    pub fn adjusted_value(&self) -> f64 {
        self.value * self.multiplier + self.adder
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.identity, self.adjusted_value())
    }
}

/// A measurement whose value is only visible near its own timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalMeasurement {
    measurement: Measurement,
    lag_time: f64,
    lead_time: f64,
}

impl TemporalMeasurement {
    /// Create an empty temporal measurement for `identity`
    ///
    /// The initial value is NaN at timestamp zero, so any real sample
    /// replaces it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless both tolerances are positive.
    pub fn new(identity: Identity, lag_time: f64, lead_time: f64) -> Result<Self> {
        Ok(Self {
            measurement: Measurement::new(identity, f64::NAN, Ticks::ZERO),
            lag_time: ConfigError::check_lag_time(lag_time)?,
            lead_time: ConfigError::check_lead_time(lead_time)?,
        })
    }

    /// Wrap an existing measurement
    pub fn from_measurement(
        measurement: Measurement,
        lag_time: f64,
        lead_time: f64,
    ) -> Result<Self> {
        Ok(Self {
            measurement,
            lag_time: ConfigError::check_lag_time(lag_time)?,
            lead_time: ConfigError::check_lead_time(lead_time)?,
        })
    }

    /// Adjusted value if `ticks` is within `[own - lead, own + lag]`, else NaN
    pub fn get(&self, ticks: Ticks) -> f64 {
        if self
            .measurement
            .timestamp
            .time_is_valid(ticks, self.lag_time, self.lead_time)
        {
            self.measurement.adjusted_value()
        } else {
            f64::NAN
        }
    }

    /// Store `value` at `ticks` if strictly newer than the current sample
    ///
    /// Returns `true` if the value was applied. Older or equal timestamps
    /// are ignored.
    pub fn set(&mut self, ticks: Ticks, value: f64) -> bool {
        if ticks <= self.measurement.timestamp {
            return false;
        }
        self.measurement.timestamp = ticks;
        self.measurement.value = value;
        true
    }

    /// Take over every field of `measurement` if it is strictly newer
    pub fn update(&mut self, measurement: &Measurement) -> bool {
        if measurement.timestamp <= self.measurement.timestamp {
            return false;
        }
        self.measurement.timestamp = measurement.timestamp;
        self.measurement.value = measurement.value;
        self.measurement.adder = measurement.adder;
        self.measurement.multiplier = measurement.multiplier;
        self.measurement.value_quality_is_good = measurement.value_quality_is_good;
        self.measurement.timestamp_quality_is_good = measurement.timestamp_quality_is_good;
        true
    }

    /// The wrapped sample
    pub fn measurement(&self) -> &Measurement {
        &self.measurement
    }

    /// Timestamp of the current sample
    pub fn timestamp(&self) -> Ticks {
        self.measurement.timestamp
    }

    /// Past tolerance in seconds
    pub fn lag_time(&self) -> f64 {
        self.lag_time
    }

    /// Future tolerance in seconds
    pub fn lead_time(&self) -> f64 {
        self.lead_time
    }

    /// Change the past tolerance
    pub fn set_lag_time(&mut self, lag_time: f64) -> Result<()> {
        self.lag_time = ConfigError::check_lag_time(lag_time)?;
        Ok(())
    }

    /// Change the future tolerance
    pub fn set_lead_time(&mut self, lead_time: f64) -> Result<()> {
        self.lead_time = ConfigError::check_lead_time(lead_time)?;
        Ok(())
    }
}

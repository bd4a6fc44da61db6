//! Down-sampling of inputs faster than the frame rate
//!
//! When a source reports more often than the concentrator publishes, several
//! measurements for one identity fall into the same frame. The
//! [`DownsamplingMethod`] decides which value the frame keeps.

use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::measurement::Measurement;
use crate::ticks::Ticks;

/// Reduces every raw value received for one identity in one frame
pub type ValueFilter = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// How a frame chooses between several measurements for one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DownsamplingMethod {
    /// Keep the most recently sorted measurement
    #[default]
    LastReceived,
    /// Keep the measurement closest to the frame timestamp
    Closest,
    /// Keep a value filtered over everything received
    Filtered,
    /// Keep the best quality measurement, closest to the frame timestamp among equals
    BestQuality,
}

impl DownsamplingMethod {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::LastReceived => 0,
            Self::Closest => 1,
            Self::Filtered => 2,
            Self::BestQuality => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Closest,
            2 => Self::Filtered,
            3 => Self::BestQuality,
            _ => Self::LastReceived,
        }
    }

    /// Measurement the frame should hold after `incoming` arrives
    ///
    /// `existing` is what the frame holds for the same identity and
    /// `samples` the raw values received for it so far (only kept for
    /// [`DownsamplingMethod::Filtered`]). `None` means the frame keeps
    /// `existing` and `incoming` is dropped.
    pub fn derive(
        self,
        frame_timestamp: Ticks,
        existing: Option<&Measurement>,
        samples: Option<&mut Vec<f64>>,
        incoming: &Measurement,
        filter: &ValueFilter,
    ) -> Option<Measurement> {
        let Some(existing) = existing else {
            if let Some(samples) = samples {
                samples.push(incoming.value);
            }
            return Some(incoming.clone());
        };

        match self {
            Self::LastReceived => Some(incoming.clone()),
            Self::Closest => {
                let closer = distance(frame_timestamp, incoming) <= distance(frame_timestamp, existing);
                closer.then(|| incoming.clone())
            }
            Self::Filtered => {
                let mut derived = incoming.clone();
                derived.value = match samples {
                    Some(samples) => {
                        samples.push(incoming.value);
                        filter(samples.as_slice())
                    }
                    None => filter(&[existing.value, incoming.value][..]),
                };
                Some(derived)
            }
            Self::BestQuality => {
                let (new, old) = (quality(incoming), quality(existing));
                let better = new > old
                    || (new == old
                        && distance(frame_timestamp, incoming) <= distance(frame_timestamp, existing));
                better.then(|| incoming.clone())
            }
        }
    }
}

/// Arithmetic mean, ignoring NaN values
pub fn average(values: &[f64]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        return f64::NAN;
    }
    sum / count as f64
}

/// Default filter for [`DownsamplingMethod::Filtered`]
pub fn average_filter() -> ValueFilter {
    Arc::new(average)
}

fn distance(frame_timestamp: Ticks, measurement: &Measurement) -> u64 {
    (measurement.timestamp - frame_timestamp).value().unsigned_abs()
}

fn quality(measurement: &Measurement) -> u8 {
    u8::from(measurement.value_quality_is_good) + u8::from(measurement.timestamp_quality_is_good)
}

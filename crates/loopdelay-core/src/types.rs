//! Core sample and time types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Complex baseband sample, matching the CF32 stream format.
pub type IQSample = num_complex::Complex<f32>;

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Receive path
    Rx,
    /// Transmit path
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "RX"),
            Direction::Tx => write!(f, "TX"),
        }
    }
}

/// Nanosecond count on a device's internal clock.
///
/// Only comparable with other timestamps taken from the same device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareTimestamp(i64);

impl HardwareTimestamp {
    /// Create a timestamp from raw nanoseconds.
    pub const fn from_nanos(ns: i64) -> Self {
        Self(ns)
    }

    /// Raw nanosecond value.
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Timestamp of sample `index` in a stream starting at `self`.
    ///
    /// The sample offset is rounded to the nearest nanosecond.
    pub fn at_sample(self, index: usize, sample_rate: f64) -> Self {
        Self(self.0 + samples_to_nanos(index as f64, sample_rate))
    }

    /// Signed difference `self - earlier` in nanoseconds.
    pub fn nanos_since(self, earlier: Self) -> i64 {
        self.0 - earlier.0
    }
}

impl Add<i64> for HardwareTimestamp {
    type Output = Self;

    fn add(self, ns: i64) -> Self {
        Self(self.0 + ns)
    }
}

impl Sub<i64> for HardwareTimestamp {
    type Output = Self;

    fn sub(self, ns: i64) -> Self {
        Self(self.0 - ns)
    }
}

impl fmt::Display for HardwareTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ns", self.0)
    }
}

/// Convert a (possibly fractional) sample count to rounded nanoseconds.
pub fn samples_to_nanos(samples: f64, sample_rate: f64) -> i64 {
    (samples / sample_rate * 1e9).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_sample_rounds() {
        let t0 = HardwareTimestamp::from_nanos(1_000);
        assert_eq!(t0.at_sample(500, 1e6).as_nanos(), 501_000);
        // 1 sample at 3 MS/s is 333.33 ns
        assert_eq!(t0.at_sample(1, 3e6).as_nanos(), 1_333);
        assert_eq!(t0.at_sample(2, 3e6).as_nanos(), 1_667);
    }

    #[test]
    fn test_nanos_since_is_signed() {
        let a = HardwareTimestamp::from_nanos(10);
        let b = HardwareTimestamp::from_nanos(25);
        assert_eq!(b.nanos_since(a), 15);
        assert_eq!(a.nanos_since(b), -15);
        assert_eq!((a + 5).as_nanos(), 15);
        assert_eq!((a - 20).as_nanos(), -10);
    }
}

//! Error types for delay measurement.

use crate::device::DeviceError;
use thiserror::Error;

/// Measurement error type.
///
/// Every variant is terminal for the current measurement attempt.
#[derive(Error, Debug)]
pub enum DelayError {
    /// Device cannot schedule streams against a hardware clock
    #[error("device capability error: {0}")]
    DeviceCapability(String),

    /// Transmit burst was not fully consumed
    #[error("transmit underrun: device accepted {actual} of {expected} samples")]
    TransmitUnderrun {
        /// Samples in the burst
        expected: usize,
        /// Samples the device reported as written
        actual: usize,
    },

    /// Capture length differs from the requested burst size
    #[error("short capture: received {actual} of {expected} samples")]
    ShortCapture {
        /// Requested sample count
        expected: usize,
        /// Accumulated sample count
        actual: usize,
    },

    /// First receive batch carried no hardware timestamp
    #[error("no timestamp on first receive batch (flags={flags:#x}, time={time_ns} ns)")]
    MissingOriginTimestamp {
        /// Stream flags reported with the first batch
        flags: u32,
        /// Time value reported with the first batch
        time_ns: i64,
    },

    /// Correlation peak and magnitude peak disagree
    #[error(
        "correlation peak ({correlation_index}) does not match magnitude peak ({peak_index}), \
         tolerance {tolerance} samples; probably bad data"
    )]
    CorrelationMismatch {
        /// Peak index from cross-correlation (direct-index convention)
        correlation_index: usize,
        /// Peak index from the normalized magnitude
        peak_index: usize,
        /// Largest allowed distance in samples
        tolerance: usize,
    },

    /// Buffer cannot be normalized
    #[error("cannot normalize {what}: {reason}")]
    DegenerateSignal {
        /// Which buffer
        what: &'static str,
        /// Why
        reason: &'static str,
    },

    /// Measurement interrupted by the caller
    #[error("measurement cancelled")]
    Cancelled,

    /// Configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Device adapter failure
    #[error("device I/O error: {0}")]
    Device(#[from] DeviceError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for measurement operations
pub type Result<T> = std::result::Result<T, DelayError>;

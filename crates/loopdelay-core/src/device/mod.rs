//! # Device Session Adapter
//!
//! The measurement never talks to hardware directly. It drives an
//! [`SdrSession`], a thin interface over an SDR driver stack that exposes
//! tuning, a hardware clock, and timed stream primitives:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            measure / capture / transmit      │
//! ├──────────────────────────────────────────────┤
//! │               SdrSession (trait)             │
//! ├───────────────────────┬──────────────────────┤
//! │  LoopbackSimulator    │  SoapySession        │
//! │  (in memory)          │  (libSoapySDR)       │
//! └───────────────────────┴──────────────────────┘
//! ```
//!
//! Implementations are selected by [`open`] from a device argument string
//! such as `"driver=sim,latency_ns=5000"` or `"driver=uhd,type=b200"`.

use crate::types::{Direction, HardwareTimestamp, IQSample};
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use thiserror::Error;

pub mod sim;
#[cfg(feature = "soapysdr")]
pub mod soapysdr;

pub use sim::{LoopbackSimulator, SimConfig};

/// Device adapter error type.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Driver library could not be loaded
    #[error("driver library not found: {0}")]
    LibraryNotFound(String),

    /// Device could not be opened
    #[error("failed to open device '{args}': {message}")]
    OpenFailed {
        /// Device arguments used
        args: String,
        /// Driver message
        message: String,
    },

    /// Operation not supported by this device
    #[error("not supported: {0}")]
    Unsupported(String),

    /// A tuning or clock setting was rejected
    #[error("failed to set {what}: {message}")]
    Setting {
        /// Setting name
        what: String,
        /// Driver message
        message: String,
    },

    /// Stream operation failed
    #[error("{op} failed (code {code}): {message}")]
    Stream {
        /// Operation name
        op: &'static str,
        /// Driver error code
        code: i32,
        /// Driver message
        message: String,
    },

    /// Stream handle does not belong to this session
    #[error("unknown stream {0:?}")]
    UnknownStream(StreamId),
}

/// Result type alias for device operations
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Opaque handle for a stream set up on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

/// Stream flag bits, laid out as in the SoapySDR API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags(u32);

impl StreamFlags {
    /// No flags
    pub const NONE: StreamFlags = StreamFlags(0);
    /// Burst ends with this buffer
    pub const END_BURST: StreamFlags = StreamFlags(1 << 1);
    /// Time field is valid
    pub const HAS_TIME: StreamFlags = StreamFlags(1 << 2);

    /// Build from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set.
    pub const fn contains(self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StreamFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for StreamFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::END_BURST) {
            names.push("END_BURST");
        }
        if self.contains(Self::HAS_TIME) {
            names.push("HAS_TIME");
        }
        if names.is_empty() {
            write!(f, "{:#x}", self.0)
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Outcome of a single read or write.
///
/// `samples == 0` on a read means the call timed out or the burst is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamResult {
    /// Samples transferred
    pub samples: usize,
    /// Flags reported by the driver
    pub flags: StreamFlags,
    /// Time of the first sample, valid when `flags` has `HAS_TIME`
    pub time_ns: i64,
}

impl StreamResult {
    /// Hardware timestamp of the first sample, if the driver attached one.
    pub fn timestamp(&self) -> Option<HardwareTimestamp> {
        self.flags
            .contains(StreamFlags::HAS_TIME)
            .then(|| HardwareTimestamp::from_nanos(self.time_ns))
    }
}

/// Inclusive numeric range reported by a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    /// Lower bound
    pub minimum: f64,
    /// Upper bound
    pub maximum: f64,
}

impl Range {
    /// Create a range.
    pub fn new(minimum: f64, maximum: f64) -> Self {
        Self { minimum, maximum }
    }

    /// Midpoint of the range.
    pub fn midpoint(&self) -> f64 {
        (self.minimum + self.maximum) / 2.0
    }
}

/// An open SDR device.
///
/// Methods mirror the driver primitives the measurement needs. A session
/// is a single handle; at most one RX and one TX stream are used at a time.
pub trait SdrSession {
    /// Short human-readable device description.
    fn name(&self) -> String;

    /// Set the master clock rate.
    fn set_master_clock_rate(&mut self, rate: f64) -> DeviceResult<()>;

    /// Set the sample rate of a channel.
    fn set_sample_rate(&mut self, direction: Direction, channel: usize, rate: f64) -> DeviceResult<()>;

    /// Actual sample rate of a channel.
    fn sample_rate(&self, direction: Direction, channel: usize) -> DeviceResult<f64>;

    /// Select an antenna port.
    fn set_antenna(&mut self, direction: Direction, channel: usize, antenna: &str) -> DeviceResult<()>;

    /// Set overall gain in dB.
    fn set_gain(&mut self, direction: Direction, channel: usize, gain_db: f64) -> DeviceResult<()>;

    /// Overall gain range in dB.
    fn gain_range(&self, direction: Direction, channel: usize) -> DeviceResult<Range>;

    /// Tune the center frequency in Hz.
    fn set_frequency(&mut self, direction: Direction, channel: usize, freq_hz: f64) -> DeviceResult<()>;

    /// Tunable frequency range in Hz.
    fn frequency_range(&self, direction: Direction, channel: usize) -> DeviceResult<Range>;

    /// Set the analog filter bandwidth in Hz.
    fn set_bandwidth(&mut self, direction: Direction, channel: usize, bw_hz: f64) -> DeviceResult<()>;

    /// Whether the device keeps a hardware clock usable for timed streaming.
    fn has_hardware_time(&self) -> bool;

    /// Current hardware clock.
    fn hardware_time(&self) -> DeviceResult<HardwareTimestamp>;

    /// Create a CF32 stream on the given channels.
    fn setup_stream(&mut self, direction: Direction, channels: &[usize]) -> DeviceResult<StreamId>;

    /// Activate a stream, optionally at a time and for a fixed sample count.
    ///
    /// `num_samples == 0` means continuous.
    fn activate_stream(
        &mut self,
        stream: StreamId,
        flags: StreamFlags,
        time: Option<HardwareTimestamp>,
        num_samples: usize,
    ) -> DeviceResult<()>;

    /// Deactivate a stream.
    fn deactivate_stream(&mut self, stream: StreamId) -> DeviceResult<()>;

    /// Release a stream.
    fn close_stream(&mut self, stream: StreamId) -> DeviceResult<()>;

    /// Write samples, optionally at a time.
    fn write_stream(
        &mut self,
        stream: StreamId,
        buffer: &[IQSample],
        flags: StreamFlags,
        time: Option<HardwareTimestamp>,
        timeout_us: i64,
    ) -> DeviceResult<StreamResult>;

    /// Read up to `buffer.len()` samples.
    ///
    /// A timeout is reported as `Ok` with zero samples, not as an error.
    fn read_stream(&mut self, stream: StreamId, buffer: &mut [IQSample], timeout_us: i64) -> DeviceResult<StreamResult>;
}

impl<S: SdrSession + ?Sized> SdrSession for Box<S> {
    fn name(&self) -> String {
        (**self).name()
    }
    fn set_master_clock_rate(&mut self, rate: f64) -> DeviceResult<()> {
        (**self).set_master_clock_rate(rate)
    }
    fn set_sample_rate(&mut self, direction: Direction, channel: usize, rate: f64) -> DeviceResult<()> {
        (**self).set_sample_rate(direction, channel, rate)
    }
    fn sample_rate(&self, direction: Direction, channel: usize) -> DeviceResult<f64> {
        (**self).sample_rate(direction, channel)
    }
    fn set_antenna(&mut self, direction: Direction, channel: usize, antenna: &str) -> DeviceResult<()> {
        (**self).set_antenna(direction, channel, antenna)
    }
    fn set_gain(&mut self, direction: Direction, channel: usize, gain_db: f64) -> DeviceResult<()> {
        (**self).set_gain(direction, channel, gain_db)
    }
    fn gain_range(&self, direction: Direction, channel: usize) -> DeviceResult<Range> {
        (**self).gain_range(direction, channel)
    }
    fn set_frequency(&mut self, direction: Direction, channel: usize, freq_hz: f64) -> DeviceResult<()> {
        (**self).set_frequency(direction, channel, freq_hz)
    }
    fn frequency_range(&self, direction: Direction, channel: usize) -> DeviceResult<Range> {
        (**self).frequency_range(direction, channel)
    }
    fn set_bandwidth(&mut self, direction: Direction, channel: usize, bw_hz: f64) -> DeviceResult<()> {
        (**self).set_bandwidth(direction, channel, bw_hz)
    }
    fn has_hardware_time(&self) -> bool {
        (**self).has_hardware_time()
    }
    fn hardware_time(&self) -> DeviceResult<HardwareTimestamp> {
        (**self).hardware_time()
    }
    fn setup_stream(&mut self, direction: Direction, channels: &[usize]) -> DeviceResult<StreamId> {
        (**self).setup_stream(direction, channels)
    }
    fn activate_stream(
        &mut self,
        stream: StreamId,
        flags: StreamFlags,
        time: Option<HardwareTimestamp>,
        num_samples: usize,
    ) -> DeviceResult<()> {
        (**self).activate_stream(stream, flags, time, num_samples)
    }
    fn deactivate_stream(&mut self, stream: StreamId) -> DeviceResult<()> {
        (**self).deactivate_stream(stream)
    }
    fn close_stream(&mut self, stream: StreamId) -> DeviceResult<()> {
        (**self).close_stream(stream)
    }
    fn write_stream(
        &mut self,
        stream: StreamId,
        buffer: &[IQSample],
        flags: StreamFlags,
        time: Option<HardwareTimestamp>,
        timeout_us: i64,
    ) -> DeviceResult<StreamResult> {
        (**self).write_stream(stream, buffer, flags, time, timeout_us)
    }
    fn read_stream(&mut self, stream: StreamId, buffer: &mut [IQSample], timeout_us: i64) -> DeviceResult<StreamResult> {
        (**self).read_stream(stream, buffer, timeout_us)
    }
}

/// Parse `key=value,key=value` device arguments.
///
/// Whitespace around keys and values is trimmed; entries without `=` are
/// ignored.
pub fn parse_args(args: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in args.split(',') {
        if let Some(pos) = pair.find('=') {
            let key = pair[..pos].trim().to_string();
            let value = pair[pos + 1..].trim().to_string();
            map.insert(key, value);
        }
    }
    map
}

/// Open a session from device arguments.
///
/// `driver=sim` selects the in-memory [`LoopbackSimulator`]; anything else
/// goes to libSoapySDR when the `soapysdr` feature is enabled.
pub fn open(args: &str) -> DeviceResult<Box<dyn SdrSession>> {
    let parsed = parse_args(args);
    if parsed.get("driver").map(String::as_str) == Some("sim") {
        let config = SimConfig::from_args(&parsed).map_err(|message| DeviceError::OpenFailed {
            args: args.to_string(),
            message,
        })?;
        tracing::info!("Opened loopback simulator: {:?}", config);
        return Ok(Box::new(LoopbackSimulator::new(config)));
    }

    #[cfg(feature = "soapysdr")]
    {
        Ok(Box::new(soapysdr::SoapySession::open(args)?))
    }

    #[cfg(not(feature = "soapysdr"))]
    {
        Err(DeviceError::OpenFailed {
            args: args.to_string(),
            message: "hardware support not compiled in; enable the 'soapysdr' feature or use driver=sim".into(),
        })
    }
}

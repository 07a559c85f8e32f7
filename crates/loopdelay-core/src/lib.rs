//! # Loopback Delay Measurement
//!
//! Measures the round trip delay of an SDR through RF loopback or leakage.
//! A bandlimited pulse is scheduled for transmission at a future hardware
//! timestamp, a timed receive burst is armed around it, and the arrival
//! time of the pulse is located in the capture.
//!
//! ## Signal Flow
//!
//! ```text
//! Pulse ──► Timed TX burst ──► (RF path) ──► Timed RX burst ──► Capture
//!                                                                 │
//!   Delay ◄── Peak times ◄── Correlation check ◄── Normalize ◄───┘
//! ```
//!
//! Both bursts are scheduled against the device's hardware clock, so the
//! result does not depend on host scheduling jitter.
//!
//! ## Example
//!
//! ```rust,no_run
//! use loopdelay_core::{measure_delay, CancelToken, MeasureConfig};
//!
//! let config = MeasureConfig {
//!     device_args: "driver=sim,latency_ns=42000".to_string(),
//!     settle_ms: 0,
//!     ..Default::default()
//! };
//! let result = measure_delay(&config, &CancelToken::new())?;
//! println!("delay: {:.3} us", result.delta_us());
//! # Ok::<(), loopdelay_core::DelayError>(())
//! ```

#![warn(rust_2018_idioms)]

pub mod cancel;
pub mod capture;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod estimator;
pub mod measure;
pub mod pulse;
pub mod transmit;
pub mod types;

// Re-export main types
pub use cancel::CancelToken;
pub use capture::{Capture, CaptureRequest};
pub use config::{ChannelConfig, MeasureConfig, PulseConfig};
pub use device::{DeviceError, SdrSession, StreamFlags, StreamId, StreamResult};
pub use error::{DelayError, Result};
pub use estimator::{DelayEstimator, DelayResult};
pub use measure::{measure_delay, measure_delay_with};
pub use pulse::WaveformBuffer;
pub use types::{Direction, HardwareTimestamp, IQSample};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::config::MeasureConfig;
    pub use crate::device::SdrSession;
    pub use crate::error::{DelayError, Result};
    pub use crate::estimator::DelayResult;
    pub use crate::measure::{measure_delay, measure_delay_with};
    pub use crate::types::{Direction, HardwareTimestamp, IQSample};
}

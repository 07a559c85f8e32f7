//! Bandlimited reference pulse synthesis.
//!
//! The timing reference is a sinc pulse sampled over `[-width, width]`:
//!
//! ```text
//!              1 ┤        ╭╮
//!                │        ││
//!                │       ╭╯╰╮
//!              0 ┼─╮╭─╮╭─╯  ╰─╮╭─╮╭─
//!                  ╰╯ ╰╯      ╰╯ ╰╯
//!               -w        0        +w
//! ```
//!
//! `width` is in units of sinc zero crossings, so a wider span gives more
//! side lobes and a narrower main lobe relative to the pulse length.

use crate::error::{DelayError, Result};
use crate::types::IQSample;
use std::f64::consts::PI;
use std::ops::Deref;

/// Fixed-length, immutable waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformBuffer {
    samples: Vec<IQSample>,
}

impl WaveformBuffer {
    /// Wrap already synthesized samples.
    pub fn from_samples(samples: Vec<IQSample>) -> Self {
        Self { samples }
    }

    /// Borrow the samples.
    pub fn as_slice(&self) -> &[IQSample] {
        &self.samples
    }

    /// Consume the buffer and return the samples.
    pub fn into_inner(self) -> Vec<IQSample> {
        self.samples
    }
}

impl Deref for WaveformBuffer {
    type Target = [IQSample];

    fn deref(&self) -> &[IQSample] {
        &self.samples
    }
}

/// Normalized sinc, `sin(πx) / (πx)` with `sinc(0) = 1`.
pub fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = PI * x;
        px.sin() / px
    }
}

/// Synthesize a sinc pulse of `num_samples` centered at the midpoint.
///
/// Samples are evenly spaced over the closed interval `[-width, width]`
/// and scaled by `scale`, which must lie in `(0, 1]`. The imaginary part
/// is zero.
pub fn sinc_pulse(num_samples: usize, width: f64, scale: f64) -> Result<WaveformBuffer> {
    if num_samples == 0 {
        return Err(DelayError::InvalidConfig("pulse length must be at least 1 sample".into()));
    }
    if !(width.is_finite() && width > 0.0) {
        return Err(DelayError::InvalidConfig(format!("pulse width must be positive, got {}", width)));
    }
    if !(scale > 0.0 && scale <= 1.0) {
        return Err(DelayError::InvalidConfig(format!("pulse scale must be in (0, 1], got {}", scale)));
    }

    // Integer numerator keeps x[i] == -x[n-1-i] exactly
    let span = (num_samples - 1) as f64;
    let samples = (0..num_samples)
        .map(|i| {
            let x = if num_samples == 1 {
                -width
            } else {
                width * (2.0 * i as f64 - span) / span
            };
            IQSample::new((sinc(x) * scale) as f32, 0.0)
        })
        .collect();

    Ok(WaveformBuffer { samples })
}

//! # Delay Estimation
//!
//! Locates the transmitted pulse in a capture and converts the peak
//! positions of both buffers into hardware time:
//!
//! ```text
//! reference ─► remove DC ─► |x| ─► / max ─► argmax ─────────────► tx_peak
//! capture   ─► remove DC ─► |x| ─► / max ─► argmax ─────────────► rx_peak
//!                                     └──► correlate(ref) ─► argmax + M/2 ─► rx_corr
//!
//! |rx_corr - rx_peak| > M * tolerance  ──►  CorrelationMismatch
//!
//! delay = (rx_origin + rx_peak / fs) - (tx_origin + tx_peak / fs)
//! ```
//!
//! The correlation only validates the magnitude peak; the reported delay
//! is always derived from the direct peak indices.

use crate::error::{DelayError, Result};
use crate::types::{HardwareTimestamp, IQSample};
use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;
use serde::Serialize;
use tracing::debug;

/// Remove the mean, take magnitudes, and scale the maximum to 1.0.
///
/// Fails for an empty buffer and for one with no variation, where the
/// maximum after DC removal is zero.
pub fn normalize(samples: &[IQSample], what: &'static str) -> Result<Vec<f64>> {
    if samples.is_empty() {
        return Err(DelayError::DegenerateSignal {
            what,
            reason: "buffer is empty",
        });
    }

    let mean = mean(samples);
    let magnitudes: Vec<f64> = samples
        .iter()
        .map(|s| (Complex64::new(s.re as f64, s.im as f64) - mean).norm())
        .collect();

    peak_normalize(&magnitudes).ok_or(DelayError::DegenerateSignal {
        what,
        reason: "no signal after DC removal",
    })
}

/// Mean of a complex buffer, accumulated in f64.
pub fn mean(samples: &[IQSample]) -> Complex64 {
    if samples.is_empty() {
        return Complex64::new(0.0, 0.0);
    }
    let sum = samples
        .iter()
        .fold(Complex64::new(0.0, 0.0), |acc, s| acc + Complex64::new(s.re as f64, s.im as f64));
    sum / samples.len() as f64
}

/// Scale so the largest value is 1.0.
///
/// Returns `None` when the maximum is zero or not finite.
pub fn peak_normalize(values: &[f64]) -> Option<Vec<f64>> {
    let peak = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(peak.is_finite() && peak > 0.0) {
        return None;
    }
    Some(values.iter().map(|v| v / peak).collect())
}

/// Index of the first maximum.
pub fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Linear cross-correlation over the positions where `reference` fully
/// overlaps `signal`:
///
/// `out[k] = Σ_j signal[k + j] · reference[j]`, for `k in 0..=N-M`.
///
/// Computed with zero-padded FFTs. Returns an empty vector when the
/// reference is empty or longer than the signal.
pub fn correlate_valid(signal: &[f64], reference: &[f64]) -> Vec<f64> {
    if reference.is_empty() || signal.len() < reference.len() {
        return Vec::new();
    }
    let out_len = signal.len() - reference.len() + 1;
    let fft_len = (signal.len() + reference.len() - 1).next_power_of_two();

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(fft_len);
    let inverse = planner.plan_fft_inverse(fft_len);

    let pad = |x: &[f64]| -> Vec<Complex64> {
        let mut v: Vec<Complex64> = x.iter().map(|&re| Complex64::new(re, 0.0)).collect();
        v.resize(fft_len, Complex64::new(0.0, 0.0));
        v
    };
    let mut sig = pad(signal);
    let mut refr = pad(reference);
    forward.process(&mut sig);
    forward.process(&mut refr);

    for (s, r) in sig.iter_mut().zip(&refr) {
        *s *= r.conj();
    }
    inverse.process(&mut sig);

    let scale = 1.0 / fft_len as f64;
    sig[..out_len].iter().map(|c| c.re * scale).collect()
}

/// A successful delay measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayResult {
    /// Receive peak time minus transmit peak time
    pub delta_ns: i64,
    /// Sample rate used to convert indices to time
    pub sample_rate: f64,
    /// Time of the first transmitted sample
    pub tx_origin: HardwareTimestamp,
    /// Time of the first captured sample
    pub rx_origin: HardwareTimestamp,
    /// Peak index in the reference pulse
    pub tx_peak_index: usize,
    /// Peak index in the capture
    pub rx_peak_index: usize,
    /// Capture index of the correlation peak
    pub rx_correlation_index: usize,
    /// Absolute time of the reference peak
    pub tx_peak_time: HardwareTimestamp,
    /// Absolute time of the received peak
    pub rx_peak_time: HardwareTimestamp,
}

impl DelayResult {
    /// Delay in microseconds.
    pub fn delta_us(&self) -> f64 {
        self.delta_ns as f64 / 1e3
    }

    /// Delay in seconds.
    pub fn delta_seconds(&self) -> f64 {
        self.delta_ns as f64 / 1e9
    }

    /// Delay expressed in sample periods.
    pub fn delta_samples(&self) -> f64 {
        self.delta_seconds() * self.sample_rate
    }
}

/// Peak-based delay estimator.
#[derive(Debug, Clone)]
pub struct DelayEstimator {
    sample_rate: f64,
    tolerance_fraction: f64,
}

impl DelayEstimator {
    /// Estimator for `sample_rate`, accepting a correlation/peak distance
    /// of one quarter of the reference length.
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            tolerance_fraction: 0.25,
        }
    }

    /// Override the accepted correlation/peak distance, as a fraction of
    /// the reference length.
    pub fn with_tolerance(mut self, fraction: f64) -> Self {
        self.tolerance_fraction = fraction;
        self
    }

    /// Sample rate used for index-to-time conversion.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Normalize both buffers and estimate the delay.
    pub fn measure(
        &self,
        reference: &[IQSample],
        tx_origin: HardwareTimestamp,
        capture: &[IQSample],
        rx_origin: HardwareTimestamp,
    ) -> Result<DelayResult> {
        let reference_norm = normalize(reference, "reference pulse")?;
        let capture_norm = normalize(capture, "capture")?;
        self.estimate(&reference_norm, tx_origin, &capture_norm, rx_origin)
    }

    /// Estimate the delay from already normalized buffers.
    pub fn estimate(
        &self,
        reference_norm: &[f64],
        tx_origin: HardwareTimestamp,
        capture_norm: &[f64],
        rx_origin: HardwareTimestamp,
    ) -> Result<DelayResult> {
        let tx_peak_index = argmax(reference_norm).ok_or(DelayError::DegenerateSignal {
            what: "reference pulse",
            reason: "buffer is empty",
        })?;
        let rx_peak_index = argmax(capture_norm).ok_or(DelayError::DegenerateSignal {
            what: "capture",
            reason: "buffer is empty",
        })?;

        let correlation = correlate_valid(capture_norm, reference_norm);
        let corr_peak = argmax(&correlation).ok_or(DelayError::DegenerateSignal {
            what: "capture",
            reason: "shorter than the reference pulse",
        })?;
        let rx_correlation_index = corr_peak + reference_norm.len() / 2;

        let distance = rx_correlation_index.abs_diff(rx_peak_index) as f64;
        let limit = reference_norm.len() as f64 * self.tolerance_fraction;
        if distance > limit {
            return Err(DelayError::CorrelationMismatch {
                correlation_index: rx_correlation_index,
                peak_index: rx_peak_index,
                tolerance: limit as usize,
            });
        }

        let tx_peak_time = tx_origin.at_sample(tx_peak_index, self.sample_rate);
        let rx_peak_time = rx_origin.at_sample(rx_peak_index, self.sample_rate);
        let delta_ns = rx_peak_time.nanos_since(tx_peak_time);

        debug!(
            tx_peak_index,
            rx_peak_index,
            rx_correlation_index,
            delta_ns,
            "delay estimated"
        );

        Ok(DelayResult {
            delta_ns,
            sample_rate: self.sample_rate,
            tx_origin,
            rx_origin,
            tx_peak_index,
            rx_peak_index,
            rx_correlation_index,
            tx_peak_time,
            rx_peak_time,
        })
    }
}

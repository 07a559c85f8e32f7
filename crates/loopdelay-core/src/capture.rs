//! Timed receive capture.
//!
//! A single timed burst of exactly `num_samples` is requested from the
//! device, then drained in fixed-size reads into one contiguous buffer.
//! The loop ends when a read returns nothing (burst over or timeout) or
//! the device flags the end of the burst.

use crate::cancel::CancelToken;
use crate::device::{SdrSession, StreamFlags, StreamId};
use crate::error::{DelayError, Result};
use crate::estimator::mean;
use crate::types::{HardwareTimestamp, IQSample};
use tracing::{debug, trace};

/// Parameters for one timed receive burst.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// Hardware time of the first sample
    pub start: HardwareTimestamp,
    /// Exact number of samples to capture
    pub num_samples: usize,
    /// Samples per read call
    pub chunk_size: usize,
    /// Timeout per read call in microseconds
    pub timeout_us: i64,
}

/// A completed capture.
#[derive(Debug, Clone)]
pub struct Capture {
    /// Received samples
    pub samples: Vec<IQSample>,
    /// Hardware time of `samples[0]`
    pub origin: HardwareTimestamp,
}

impl Capture {
    /// Overwrite the leading `fraction` of the capture with its mean.
    ///
    /// The first samples of a burst carry front-end settling transients.
    /// The mean is taken over the whole buffer before anything is replaced.
    /// Returns the number of samples replaced.
    pub fn suppress_transients(&mut self, fraction: f64) -> usize {
        suppress_leading(&mut self.samples, fraction)
    }
}

/// Replace the first `floor(len * fraction)` samples with the buffer mean.
pub fn suppress_leading(samples: &mut [IQSample], fraction: f64) -> usize {
    let count = ((samples.len() as f64 * fraction.clamp(0.0, 1.0)).floor() as usize).min(samples.len());
    if count == 0 {
        return 0;
    }
    let m = mean(samples);
    let fill = IQSample::new(m.re as f32, m.im as f32);
    samples[..count].fill(fill);
    count
}

/// Arm a timed burst on `stream` and accumulate it.
///
/// The stream must be set up but not active. Cancellation is checked after
/// every read. Fails with `MissingOriginTimestamp` if the first non-empty
/// read carries no time, and with `ShortCapture` if the accumulated length
/// differs from the request.
pub fn capture_burst<S: SdrSession + ?Sized>(
    session: &mut S,
    stream: StreamId,
    request: &CaptureRequest,
    cancel: &CancelToken,
) -> Result<Capture> {
    if request.chunk_size == 0 {
        return Err(DelayError::InvalidConfig("read chunk size must be positive".into()));
    }

    session.activate_stream(
        stream,
        StreamFlags::HAS_TIME | StreamFlags::END_BURST,
        Some(request.start),
        request.num_samples,
    )?;
    debug!(
        "RX burst armed: {} samples at {}",
        request.num_samples, request.start
    );

    let mut samples: Vec<IQSample> = Vec::with_capacity(request.num_samples);
    let mut chunk = vec![IQSample::new(0.0, 0.0); request.chunk_size];
    let mut origin: Option<HardwareTimestamp> = None;

    loop {
        let result = session.read_stream(stream, &mut chunk, request.timeout_us)?;
        cancel.check()?;
        trace!("readStream: {} samples, flags {}, time {}", result.samples, result.flags, result.time_ns);

        if result.samples == 0 {
            break;
        }

        if samples.is_empty() {
            origin = Some(result.timestamp().ok_or(DelayError::MissingOriginTimestamp {
                flags: result.flags.bits(),
                time_ns: result.time_ns,
            })?);
        }

        samples.extend_from_slice(&chunk[..result.samples]);

        if result.flags.contains(StreamFlags::END_BURST) || samples.len() > request.num_samples {
            break;
        }
    }

    if samples.len() != request.num_samples {
        return Err(DelayError::ShortCapture {
            expected: request.num_samples,
            actual: samples.len(),
        });
    }
    // A non-empty capture always recorded its origin above
    let origin = origin.ok_or(DelayError::MissingOriginTimestamp { flags: 0, time_ns: 0 })?;

    debug!("RX burst complete: {} samples from {}", samples.len(), origin);
    Ok(Capture { samples, origin })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{LoopbackSimulator, SimConfig};
    use crate::types::Direction;

    fn request(sim: &LoopbackSimulator, n: usize) -> CaptureRequest {
        CaptureRequest {
            start: sim.hardware_time().unwrap() + 1_000_000,
            num_samples: n,
            chunk_size: 1024,
            timeout_us: 500_000,
        }
    }

    #[test]
    fn test_capture_exact_length() {
        let mut sim = LoopbackSimulator::new(SimConfig::default());
        let rx = sim.setup_stream(Direction::Rx, &[0]).unwrap();
        let req = request(&sim, 10_000);
        let capture = capture_burst(&mut sim, rx, &req, &CancelToken::new()).unwrap();
        assert_eq!(capture.samples.len(), 10_000);
        assert_eq!(capture.origin, req.start);
    }

    #[test]
    fn test_short_capture() {
        let mut sim = LoopbackSimulator::new(SimConfig {
            capture_shortfall: 17,
            ..Default::default()
        });
        let rx = sim.setup_stream(Direction::Rx, &[0]).unwrap();
        let req = request(&sim, 5_000);
        let err = capture_burst(&mut sim, rx, &req, &CancelToken::new()).unwrap_err();
        assert!(matches!(
            err,
            DelayError::ShortCapture {
                expected: 5_000,
                actual: 4_983
            }
        ));
    }

    #[test]
    fn test_missing_origin_timestamp() {
        let mut sim = LoopbackSimulator::new(SimConfig {
            omit_first_timestamp: true,
            ..Default::default()
        });
        let rx = sim.setup_stream(Direction::Rx, &[0]).unwrap();
        let req = request(&sim, 2_000);
        let err = capture_burst(&mut sim, rx, &req, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, DelayError::MissingOriginTimestamp { .. }));
    }

    #[test]
    fn test_read_error_propagates() {
        let mut sim = LoopbackSimulator::new(SimConfig {
            read_error_after: Some(2),
            ..Default::default()
        });
        let rx = sim.setup_stream(Direction::Rx, &[0]).unwrap();
        let req = request(&sim, 10_000);
        let err = capture_burst(&mut sim, rx, &req, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, DelayError::Device(_)));
    }

    #[test]
    fn test_cancel_stops_loop() {
        let mut sim = LoopbackSimulator::new(SimConfig::default());
        let rx = sim.setup_stream(Direction::Rx, &[0]).unwrap();
        let req = request(&sim, 10_000);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = capture_burst(&mut sim, rx, &req, &cancel).unwrap_err();
        assert!(matches!(err, DelayError::Cancelled));
    }

    #[test]
    fn test_suppress_leading() {
        let mut samples: Vec<IQSample> = (0..200).map(|i| IQSample::new(i as f32, 1.0)).collect();
        let replaced = suppress_leading(&mut samples, 0.01);
        assert_eq!(replaced, 2);
        // Mean of 0..200 is 99.5
        assert_eq!(samples[0], IQSample::new(99.5, 1.0));
        assert_eq!(samples[1], IQSample::new(99.5, 1.0));
        assert_eq!(samples[2], IQSample::new(2.0, 1.0));

        let mut short = vec![IQSample::new(1.0, 0.0); 50];
        assert_eq!(suppress_leading(&mut short, 0.01), 0);
        assert_eq!(suppress_leading(&mut short, 0.0), 0);
    }
}

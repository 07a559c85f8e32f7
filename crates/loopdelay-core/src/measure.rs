//! # Measurement Orchestration
//!
//! Runs one complete loopback delay measurement:
//!
//! ```text
//! validate ─► configure device ─► setup RX/TX ─► settle
//!                                                   │
//!   ┌───────────────────────────────────────────────┘
//!   ▼
//! activate TX ─► pulse @ now + lead ─► RX burst @ pulse - span/2 ─► drain
//!                                                                    │
//!   ┌────────────────────────────────────────────────────────────────┘
//!   ▼
//! teardown ─► suppress transients ─► normalize ─► [dump] ─► estimate
//! ```
//!
//! Streams are owned by a guard that tears them down on every exit path,
//! including errors and cancellation.

use crate::cancel::CancelToken;
use crate::capture::{capture_burst, CaptureRequest};
use crate::config::{ChannelConfig, MeasureConfig};
use crate::device::{self, SdrSession, StreamFlags, StreamId};
use crate::diagnostics::DiagnosticDump;
use crate::error::{DelayError, Result};
use crate::estimator::{normalize, DelayEstimator, DelayResult};
use crate::pulse::sinc_pulse;
use crate::transmit::schedule_burst;
use crate::types::Direction;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Open the device named by `config.device_args` and measure once.
pub fn measure_delay(config: &MeasureConfig, cancel: &CancelToken) -> Result<DelayResult> {
    config.validate()?;
    let mut session = device::open(&config.device_args)?;
    info!("Opened device: {}", session.name());
    measure_delay_with(&mut session, config, cancel)
}

/// Measure once on an already opened session.
///
/// The session is left without any open streams whether or not the
/// measurement succeeds.
pub fn measure_delay_with<S: SdrSession + ?Sized>(
    session: &mut S,
    config: &MeasureConfig,
    cancel: &CancelToken,
) -> Result<DelayResult> {
    config.validate()?;
    if !session.has_hardware_time() {
        return Err(DelayError::DeviceCapability(
            "this device does not support timed streaming".into(),
        ));
    }

    // A reference that cannot be normalized must fail before anything radiates
    let reference = sinc_pulse(config.tx_samples, config.pulse.width, config.pulse.scale)?;
    let reference_norm = normalize(&reference, "reference pulse")?;

    let mut config = config.clone();
    config.resolve_defaults(&*session)?;
    configure(session, &config)?;

    let rate = config.sample_rate;
    let (tx_time, mut capture) = {
        let mut streams = StreamGuard::new(session);

        info!("Create Rx and Tx streams");
        streams.rx = Some(streams.setup_stream(Direction::Rx, &[config.rx.channel])?);
        streams.tx = Some(streams.setup_stream(Direction::Tx, &[config.tx.channel])?);
        let (rx, tx) = streams.ids()?;

        if config.settle_ms > 0 {
            debug!("Settling for {} ms", config.settle_ms);
            std::thread::sleep(Duration::from_millis(config.settle_ms));
        }
        cancel.check()?;

        streams.activate_stream(tx, StreamFlags::NONE, None, 0)?;
        streams.tx_active = true;

        let tx_time = streams.hardware_time()? + config.tx_lead_ns;
        schedule_burst(
            &mut *streams,
            tx,
            &reference,
            tx_time,
            config.write_timeout_us,
            cancel,
        )?;

        let request = CaptureRequest {
            start: tx_time - config.capture_span_ns() / 2,
            num_samples: config.rx_samples,
            chunk_size: config.read_chunk,
            timeout_us: config.read_timeout_us,
        };
        streams.rx_active = true;
        let capture = capture_burst(&mut *streams, rx, &request, cancel)?;

        info!("Cleanup streams");
        (tx_time, capture)
    };

    let replaced = capture.suppress_transients(config.transient_fraction);
    debug!("Replaced {} leading samples with the capture mean", replaced);

    let capture_norm = normalize(&capture.samples, "capture")?;

    if let Some(dir) = &config.dump_dir {
        DiagnosticDump::new(dir).write(&reference_norm, &capture_norm, &capture.samples)?;
    }

    let result = DelayEstimator::new(rate)
        .with_tolerance(config.correlation_tolerance)
        .estimate(&reference_norm, tx_time, &capture_norm, capture.origin)?;

    info!(">>> Time delta {:.3} us", result.delta_us());
    Ok(result)
}

fn configure<S: SdrSession + ?Sized>(session: &mut S, config: &MeasureConfig) -> Result<()> {
    if let Some(clock) = config.clock_rate {
        session.set_master_clock_rate(clock)?;
    }

    let rx_chan = config.rx.channel;
    let tx_chan = config.tx.channel;
    session.set_sample_rate(Direction::Rx, rx_chan, config.sample_rate)?;
    session.set_sample_rate(Direction::Tx, tx_chan, config.sample_rate)?;
    let rx_rate = session.sample_rate(Direction::Rx, rx_chan)?;
    let tx_rate = session.sample_rate(Direction::Tx, tx_chan)?;
    info!("Actual Rx Rate {:.6} Msps", rx_rate / 1e6);
    info!("Actual Tx Rate {:.6} Msps", tx_rate / 1e6);
    if rx_rate != config.sample_rate || tx_rate != config.sample_rate {
        warn!(
            "Device rates differ from requested {} sps; timing uses the requested rate",
            config.sample_rate
        );
    }

    configure_channel(session, Direction::Rx, &config.rx, config.frequency)?;
    configure_channel(session, Direction::Tx, &config.tx, config.frequency)?;
    Ok(())
}

fn configure_channel<S: SdrSession + ?Sized>(
    session: &mut S,
    direction: Direction,
    channel: &ChannelConfig,
    frequency: Option<f64>,
) -> Result<()> {
    let ch = channel.channel;
    if let Some(antenna) = &channel.antenna {
        session.set_antenna(direction, ch, antenna)?;
    }
    if let Some(gain) = channel.gain {
        session.set_gain(direction, ch, gain)?;
    }
    if let Some(freq) = frequency {
        session.set_frequency(direction, ch, freq)?;
    }
    if let Some(bw) = channel.bandwidth {
        session.set_bandwidth(direction, ch, bw)?;
    }
    debug!("{} channel {} configured: {:?}", direction, ch, channel);
    Ok(())
}

/// Owns the measurement's streams for the duration of a borrow.
///
/// Dropping the guard deactivates TX, deactivates RX, closes RX and closes
/// TX, skipping anything that was never set up. Teardown failures are
/// logged and otherwise ignored.
struct StreamGuard<'a, S: SdrSession + ?Sized> {
    session: &'a mut S,
    rx: Option<StreamId>,
    tx: Option<StreamId>,
    rx_active: bool,
    tx_active: bool,
}

impl<'a, S: SdrSession + ?Sized> StreamGuard<'a, S> {
    fn new(session: &'a mut S) -> Self {
        Self {
            session,
            rx: None,
            tx: None,
            rx_active: false,
            tx_active: false,
        }
    }

    fn ids(&self) -> Result<(StreamId, StreamId)> {
        match (self.rx, self.tx) {
            (Some(rx), Some(tx)) => Ok((rx, tx)),
            _ => Err(DelayError::DeviceCapability("streams were not set up".into())),
        }
    }
}

impl<S: SdrSession + ?Sized> Deref for StreamGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.session
    }
}

impl<S: SdrSession + ?Sized> DerefMut for StreamGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session
    }
}

impl<S: SdrSession + ?Sized> Drop for StreamGuard<'_, S> {
    fn drop(&mut self) {
        if let (Some(tx), true) = (self.tx, self.tx_active) {
            if let Err(e) = self.session.deactivate_stream(tx) {
                warn!("Failed to deactivate TX stream: {}", e);
            }
        }
        if let (Some(rx), true) = (self.rx, self.rx_active) {
            if let Err(e) = self.session.deactivate_stream(rx) {
                warn!("Failed to deactivate RX stream: {}", e);
            }
        }
        if let Some(rx) = self.rx.take() {
            if let Err(e) = self.session.close_stream(rx) {
                warn!("Failed to close RX stream: {}", e);
            }
        }
        if let Some(tx) = self.tx.take() {
            if let Err(e) = self.session.close_stream(tx) {
                warn!("Failed to close TX stream: {}", e);
            }
        }
    }
}

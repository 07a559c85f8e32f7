//! Timed transmit of a single burst.

use crate::cancel::CancelToken;
use crate::device::{SdrSession, StreamFlags, StreamId};
use crate::error::{DelayError, Result};
use crate::pulse::WaveformBuffer;
use crate::types::HardwareTimestamp;
use tracing::debug;

/// Write `waveform` as one self-contained burst starting at `at`.
///
/// The TX stream must already be active. The burst carries `HAS_TIME` and
/// `END_BURST`, so the transmitter goes idle after the last sample. Any
/// write that does not consume the whole waveform is a `TransmitUnderrun`.
pub fn schedule_burst<S: SdrSession + ?Sized>(
    session: &mut S,
    stream: StreamId,
    waveform: &WaveformBuffer,
    at: HardwareTimestamp,
    timeout_us: i64,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;

    let flags = StreamFlags::HAS_TIME | StreamFlags::END_BURST;
    let result = session.write_stream(stream, waveform, flags, Some(at), timeout_us)?;
    if result.samples != waveform.len() {
        return Err(DelayError::TransmitUnderrun {
            expected: waveform.len(),
            actual: result.samples,
        });
    }

    debug!("TX burst scheduled: {} samples at {}", waveform.len(), at);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{LoopbackSimulator, SimConfig};
    use crate::pulse::sinc_pulse;
    use crate::types::Direction;

    fn active_tx(sim: &mut LoopbackSimulator) -> StreamId {
        let tx = sim.setup_stream(Direction::Tx, &[0]).unwrap();
        sim.activate_stream(tx, StreamFlags::NONE, None, 0).unwrap();
        tx
    }

    #[test]
    fn test_burst_is_timed() {
        let mut sim = LoopbackSimulator::new(SimConfig::default());
        let tx = active_tx(&mut sim);
        let pulse = sinc_pulse(200, 5.0, 0.3).unwrap();
        let at = sim.hardware_time().unwrap() + 100_000_000;

        schedule_burst(&mut sim, tx, &pulse, at, 500_000, &CancelToken::new()).unwrap();

        let bursts = sim.scheduled_bursts();
        assert_eq!(bursts.len(), 1);
        assert_eq!(bursts[0].time, at);
        assert_eq!(bursts[0].samples.as_slice(), pulse.as_slice());
    }

    #[test]
    fn test_partial_write_is_underrun() {
        let mut sim = LoopbackSimulator::new(SimConfig {
            tx_accept_limit: Some(150),
            ..Default::default()
        });
        let tx = active_tx(&mut sim);
        let pulse = sinc_pulse(200, 5.0, 0.3).unwrap();
        let at = sim.hardware_time().unwrap() + 100_000_000;

        let err = schedule_burst(&mut sim, tx, &pulse, at, 500_000, &CancelToken::new()).unwrap_err();
        assert!(matches!(
            err,
            DelayError::TransmitUnderrun {
                expected: 200,
                actual: 150
            }
        ));
    }

    #[test]
    fn test_cancelled_before_write() {
        let mut sim = LoopbackSimulator::new(SimConfig::default());
        let tx = active_tx(&mut sim);
        let pulse = sinc_pulse(200, 5.0, 0.3).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let at = sim.hardware_time().unwrap() + 100_000_000;
        assert!(matches!(
            schedule_burst(&mut sim, tx, &pulse, at, 500_000, &cancel),
            Err(DelayError::Cancelled)
        ));
        assert!(sim.scheduled_bursts().is_empty());
    }
}

//! End-to-end measurements against the loopback simulator.

use loopdelay_core::device::sim::{LoopbackSimulator, SimConfig, SimEvent};
use loopdelay_core::device::{DeviceError, Range};
use loopdelay_core::diagnostics::DiagnosticDump;
use loopdelay_core::{measure_delay_with, CancelToken, DelayError, Direction, MeasureConfig};

fn config() -> MeasureConfig {
    MeasureConfig {
        device_args: "driver=sim".into(),
        settle_ms: 0,
        ..Default::default()
    }
}

fn sim(latency_ns: i64) -> LoopbackSimulator {
    LoopbackSimulator::new(SimConfig {
        latency_ns,
        ..Default::default()
    })
}

fn assert_torn_down(sim: &LoopbackSimulator) {
    assert_eq!(sim.open_streams(), 0, "events: {:?}", sim.events());
    assert_eq!(sim.active_streams(), 0);
}

#[test]
fn test_delay_matches_latency() {
    for latency in [0, 3_000, 42_000, 250_000] {
        let mut sim = sim(latency);
        let result = measure_delay_with(&mut sim, &config(), &CancelToken::new()).unwrap();
        assert!(
            (result.delta_ns - latency).abs() <= 1_000,
            "latency {} measured {}",
            latency,
            result.delta_ns
        );
        assert!((result.rx_correlation_index as i64 - result.rx_peak_index as i64).abs() <= 50);
        assert_torn_down(&sim);
    }
}

#[test]
fn test_delay_at_higher_rate() {
    let mut sim = sim(42_000);
    let config = MeasureConfig {
        sample_rate: 2e6,
        ..config()
    };
    let result = measure_delay_with(&mut sim, &config, &CancelToken::new()).unwrap();
    assert!((result.delta_ns - 42_000).abs() <= 500, "measured {}", result.delta_ns);
    assert_eq!(result.sample_rate, 2e6);
}

#[test]
fn test_stream_lifecycle_order() {
    let mut sim = sim(10_000);
    measure_delay_with(&mut sim, &config(), &CancelToken::new()).unwrap();
    assert_eq!(
        sim.events(),
        &[
            SimEvent::Setup(Direction::Rx),
            SimEvent::Setup(Direction::Tx),
            SimEvent::Activate(Direction::Tx),
            SimEvent::Activate(Direction::Rx),
            SimEvent::Deactivate(Direction::Tx),
            SimEvent::Deactivate(Direction::Rx),
            SimEvent::Close(Direction::Rx),
            SimEvent::Close(Direction::Tx),
        ]
    );
}

#[test]
fn test_pulse_scheduled_after_lead() {
    let mut sim = sim(10_000);
    let result = measure_delay_with(&mut sim, &config(), &CancelToken::new()).unwrap();
    let burst = &sim.scheduled_bursts()[0];
    assert_eq!(burst.samples.len(), 200);
    assert_eq!(burst.time, result.tx_origin);
    // Capture opens half its span before the pulse
    assert_eq!(result.tx_origin.nanos_since(result.rx_origin), 5_000_000);
}

#[test]
fn test_no_hardware_time() {
    let mut sim = LoopbackSimulator::new(SimConfig {
        hardware_time: false,
        ..Default::default()
    });
    let err = measure_delay_with(&mut sim, &config(), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, DelayError::DeviceCapability(_)));
    assert!(sim.events().is_empty());
}

#[test]
fn test_transmit_underrun() {
    let mut sim = LoopbackSimulator::new(SimConfig {
        tx_accept_limit: Some(150),
        ..Default::default()
    });
    let err = measure_delay_with(&mut sim, &config(), &CancelToken::new()).unwrap_err();
    assert!(matches!(
        err,
        DelayError::TransmitUnderrun {
            expected: 200,
            actual: 150
        }
    ));
    assert!(!sim.events().contains(&SimEvent::Activate(Direction::Rx)));
    assert_torn_down(&sim);
}

#[test]
fn test_short_capture() {
    let mut sim = LoopbackSimulator::new(SimConfig {
        capture_shortfall: 24,
        ..Default::default()
    });
    let err = measure_delay_with(&mut sim, &config(), &CancelToken::new()).unwrap_err();
    assert!(matches!(
        err,
        DelayError::ShortCapture {
            expected: 10_000,
            actual: 9_976
        }
    ));
    assert_torn_down(&sim);
}

#[test]
fn test_missing_origin_timestamp() {
    let mut sim = LoopbackSimulator::new(SimConfig {
        omit_first_timestamp: true,
        ..Default::default()
    });
    let err = measure_delay_with(&mut sim, &config(), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, DelayError::MissingOriginTimestamp { .. }));
    assert_torn_down(&sim);
}

#[test]
fn test_read_error_propagates() {
    let mut sim = LoopbackSimulator::new(SimConfig {
        read_error_after: Some(3),
        ..Default::default()
    });
    let err = measure_delay_with(&mut sim, &config(), &CancelToken::new()).unwrap_err();
    assert!(matches!(
        err,
        DelayError::Device(DeviceError::Stream { op: "readStream", .. })
    ));
    assert_torn_down(&sim);
}

#[test]
fn test_spur_rejected_by_correlation() {
    let mut sim = LoopbackSimulator::new(SimConfig {
        spur: Some((8_000, 1.0)),
        ..Default::default()
    });
    let err = measure_delay_with(&mut sim, &config(), &CancelToken::new()).unwrap_err();
    match err {
        DelayError::CorrelationMismatch {
            peak_index,
            correlation_index,
            tolerance,
        } => {
            assert_eq!(peak_index, 8_000);
            assert!(correlation_index.abs_diff(5_100) < 60, "corr {}", correlation_index);
            assert_eq!(tolerance, 50);
        }
        other => panic!("unexpected: {}", other),
    }
    assert_torn_down(&sim);
}

#[test]
fn test_unsuppressed_transient_misleads() {
    let latency = 20_000;
    let mut sim = sim(latency);
    let config = MeasureConfig {
        transient_fraction: 0.0,
        ..config()
    };
    match measure_delay_with(&mut sim, &config, &CancelToken::new()) {
        Err(DelayError::CorrelationMismatch { .. }) => {}
        Ok(result) => assert!((result.delta_ns - latency).abs() > 1_000_000),
        Err(other) => panic!("unexpected: {}", other),
    }
}

#[test]
fn test_cancelled_before_transmit() {
    let mut sim = sim(10_000);
    let cancel = CancelToken::new();
    cancel.cancel();
    let err = measure_delay_with(&mut sim, &config(), &cancel).unwrap_err();
    assert!(matches!(err, DelayError::Cancelled));
    assert!(sim.scheduled_bursts().is_empty());
    assert_torn_down(&sim);
}

#[test]
fn test_dump_written_even_when_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("dump");
    let mut sim = LoopbackSimulator::new(SimConfig {
        spur: Some((8_000, 1.0)),
        ..Default::default()
    });
    let config = MeasureConfig {
        dump_dir: Some(dir.clone()),
        ..config()
    };
    assert!(measure_delay_with(&mut sim, &config, &CancelToken::new()).is_err());
    for name in [
        DiagnosticDump::TX_NORM,
        DiagnosticDump::RX_NORM,
        DiagnosticDump::RX_RAW_I,
        DiagnosticDump::RX_RAW_Q,
    ] {
        let meta = std::fs::metadata(dir.join(name)).unwrap();
        assert!(meta.len() > 64, "{} too small", name);
    }
    // 10000 float32 values after a 128-byte header
    assert_eq!(std::fs::metadata(dir.join(DiagnosticDump::RX_NORM)).unwrap().len(), 128 + 40_000);
}

#[test]
fn test_auto_tune_uses_device_ranges() {
    let mut sim = LoopbackSimulator::new(SimConfig {
        latency_ns: 5_000,
        frequency_range: Range::new(400e6, 500e6),
        ..Default::default()
    });
    let config = MeasureConfig {
        auto_tune: true,
        ..config()
    };
    let result = measure_delay_with(&mut sim, &config, &CancelToken::new()).unwrap();
    assert!((result.delta_ns - 5_000).abs() <= 1_000);
}

#[test]
fn test_rejected_setting_aborts_before_streams() {
    let mut sim = sim(5_000);
    let config = MeasureConfig {
        frequency: Some(10e9),
        ..config()
    };
    let err = measure_delay_with(&mut sim, &config, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, DelayError::Device(DeviceError::Setting { .. })));
    assert!(sim.events().is_empty());
}

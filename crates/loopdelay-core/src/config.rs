//! Measurement configuration.

use crate::device::SdrSession;
use crate::error::{DelayError, Result};
use crate::types::Direction;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Per-direction front-end settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel index
    pub channel: usize,
    /// Antenna port, device default when unset
    pub antenna: Option<String>,
    /// Overall gain in dB, device default when unset
    pub gain: Option<f64>,
    /// Analog filter bandwidth in Hz, device default when unset
    pub bandwidth: Option<f64>,
}

/// Reference pulse shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Half-width of the sinc argument span
    pub width: f64,
    /// Amplitude in (0, 1]
    pub scale: f64,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self { width: 5.0, scale: 0.3 }
    }
}

/// Everything a single delay measurement needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureConfig {
    /// Device arguments (`key=value,...`)
    pub device_args: String,
    /// TX and RX sample rate in Hz
    pub sample_rate: f64,
    /// TX and RX center frequency in Hz
    pub frequency: Option<f64>,
    /// Master clock rate in Hz, applied before the sample rate
    pub clock_rate: Option<f64>,
    /// Receive front end
    pub rx: ChannelConfig,
    /// Transmit front end
    pub tx: ChannelConfig,
    /// Reference pulse length
    pub tx_samples: usize,
    /// Capture length
    pub rx_samples: usize,
    /// Reference pulse shape
    pub pulse: PulseConfig,
    /// How far past "now" the pulse is scheduled, in ns
    pub tx_lead_ns: i64,
    /// Pause between stream setup and transmit, in ms
    pub settle_ms: u64,
    /// Samples per read call
    pub read_chunk: usize,
    /// Timeout per read call in microseconds
    pub read_timeout_us: i64,
    /// Timeout for the burst write in microseconds
    pub write_timeout_us: i64,
    /// Leading fraction of the capture replaced by its mean
    pub transient_fraction: f64,
    /// Allowed correlation/peak distance as a fraction of the pulse length
    pub correlation_tolerance: f64,
    /// Fill in missing frequency and gains from the device's ranges
    pub auto_tune: bool,
    /// Directory for diagnostic array dumps
    pub dump_dir: Option<PathBuf>,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            device_args: String::new(),
            sample_rate: 1e6,
            frequency: None,
            clock_rate: None,
            rx: ChannelConfig::default(),
            tx: ChannelConfig::default(),
            tx_samples: 200,
            rx_samples: 10_000,
            pulse: PulseConfig::default(),
            tx_lead_ns: 100_000_000,
            settle_ms: 1_000,
            read_chunk: 1024,
            read_timeout_us: 500_000,
            write_timeout_us: 500_000,
            transient_fraction: 0.01,
            correlation_tolerance: 0.25,
            auto_tune: false,
            dump_dir: None,
        }
    }
}

impl MeasureConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Nanoseconds spanned by the capture.
    pub fn capture_span_ns(&self) -> i64 {
        (self.rx_samples as f64 / self.sample_rate * 1e9).round() as i64
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(DelayError::InvalidConfig(msg))
        }

        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return invalid(format!("sample rate must be positive, got {}", self.sample_rate));
        }
        if self.tx_samples == 0 {
            return invalid("tx_samples must be at least 1".into());
        }
        if self.rx_samples < self.tx_samples {
            return invalid(format!(
                "rx_samples ({}) must be at least tx_samples ({})",
                self.rx_samples, self.tx_samples
            ));
        }
        if !(self.pulse.width.is_finite() && self.pulse.width > 0.0) {
            return invalid(format!("pulse width must be positive, got {}", self.pulse.width));
        }
        if !(self.pulse.scale > 0.0 && self.pulse.scale <= 1.0) {
            return invalid(format!("pulse scale must be in (0, 1], got {}", self.pulse.scale));
        }
        if !(0.0..1.0).contains(&self.transient_fraction) {
            return invalid(format!("transient_fraction must be in [0, 1), got {}", self.transient_fraction));
        }
        if !(self.correlation_tolerance > 0.0) {
            return invalid(format!(
                "correlation_tolerance must be positive, got {}",
                self.correlation_tolerance
            ));
        }
        if self.read_chunk == 0 {
            return invalid("read_chunk must be positive".into());
        }
        if self.read_timeout_us <= 0 || self.write_timeout_us <= 0 {
            return invalid("stream timeouts must be positive".into());
        }
        // The capture opens half its span before the pulse; that must still be in the future
        if self.tx_lead_ns <= self.capture_span_ns() / 2 {
            return invalid(format!(
                "tx_lead_ns ({}) must exceed half the capture span ({} ns)",
                self.tx_lead_ns,
                self.capture_span_ns() / 2
            ));
        }
        for (name, value) in [("frequency", self.frequency), ("clock_rate", self.clock_rate)] {
            if let Some(v) = value {
                if !(v.is_finite() && v > 0.0) {
                    return invalid(format!("{} must be positive, got {}", name, v));
                }
            }
        }
        Ok(())
    }

    /// Fill in frequency and gains from the device when `auto_tune` is set.
    ///
    /// Unset values take the midpoint of the device's reported range for
    /// the RX channel (frequency) or the respective channel (gain). Values
    /// already present are left alone. Does nothing when `auto_tune` is off.
    pub fn resolve_defaults<S: SdrSession + ?Sized>(&mut self, session: &S) -> Result<()> {
        if !self.auto_tune {
            return Ok(());
        }

        if self.frequency.is_none() {
            let range = session.frequency_range(Direction::Rx, self.rx.channel)?;
            let freq = range.midpoint();
            info!("Auto frequency: {:.3} MHz", freq / 1e6);
            self.frequency = Some(freq);
        }
        if self.rx.gain.is_none() {
            let gain = session.gain_range(Direction::Rx, self.rx.channel)?.midpoint();
            info!("Auto RX gain: {:.1} dB", gain);
            self.rx.gain = Some(gain);
        }
        if self.tx.gain.is_none() {
            let gain = session.gain_range(Direction::Tx, self.tx.channel)?.midpoint();
            info!("Auto TX gain: {:.1} dB", gain);
            self.tx.gain = Some(gain);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{LoopbackSimulator, SimConfig};
    use crate::device::Range;

    #[test]
    fn test_default_is_valid() {
        let config = MeasureConfig::default();
        config.validate().unwrap();
        assert_eq!(config.capture_span_ns(), 10_000_000);
    }

    #[test]
    fn test_validate_rejects() {
        let cases: [fn(&mut MeasureConfig); 11] = [
            |c: &mut MeasureConfig| c.sample_rate = 0.0,
            |c: &mut MeasureConfig| c.tx_samples = 0,
            |c: &mut MeasureConfig| c.rx_samples = 100,
            |c: &mut MeasureConfig| c.pulse.scale = 1.5,
            |c: &mut MeasureConfig| c.pulse.width = -1.0,
            |c: &mut MeasureConfig| c.transient_fraction = 1.0,
            |c: &mut MeasureConfig| c.correlation_tolerance = 0.0,
            |c: &mut MeasureConfig| c.read_chunk = 0,
            |c: &mut MeasureConfig| c.read_timeout_us = 0,
            |c: &mut MeasureConfig| c.tx_lead_ns = 4_000_000,
            |c: &mut MeasureConfig| c.frequency = Some(-1.0),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut config = MeasureConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(DelayError::InvalidConfig(_))),
                "case {} should be rejected",
                i
            );
        }
    }

    #[test]
    fn test_json_partial_uses_defaults() {
        let config: MeasureConfig =
            serde_json::from_str(r#"{ "sample_rate": 2e6, "rx": { "antenna": "LNAW" } }"#).unwrap();
        assert_eq!(config.sample_rate, 2e6);
        assert_eq!(config.rx.antenna.as_deref(), Some("LNAW"));
        assert_eq!(config.tx_samples, 200);
        assert_eq!(config.pulse, PulseConfig::default());
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("measure.json");
        let config = MeasureConfig {
            device_args: "driver=sim".into(),
            frequency: Some(915e6),
            ..Default::default()
        };
        std::fs::write(&path, config.to_json_pretty().unwrap()).unwrap();
        assert_eq!(MeasureConfig::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn test_resolve_defaults_midpoints() {
        let sim = LoopbackSimulator::new(SimConfig {
            frequency_range: Range::new(100e6, 300e6),
            gain_range: Range::new(0.0, 60.0),
            ..Default::default()
        });

        let mut manual = MeasureConfig::default();
        manual.resolve_defaults(&sim).unwrap();
        assert_eq!(manual.frequency, None);

        let mut auto = MeasureConfig {
            auto_tune: true,
            tx: ChannelConfig {
                gain: Some(10.0),
                ..Default::default()
            },
            ..Default::default()
        };
        auto.resolve_defaults(&sim).unwrap();
        assert_eq!(auto.frequency, Some(200e6));
        assert_eq!(auto.rx.gain, Some(30.0));
        assert_eq!(auto.tx.gain, Some(10.0));
    }
}

//! Loopback Delay Command-Line Interface
//!
//! This CLI provides tools for:
//! - Measuring TX-to-RX delay through RF loopback or leakage
//! - Exporting the reference pulse as an I/Q file
//! - Printing a default measurement configuration
//!
//! Real hardware needs the `soapysdr` feature; `--simulate` always works.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use loopdelay_core::pulse::sinc_pulse;
use loopdelay_core::{measure_delay, CancelToken, DelayError, DelayResult, IQSample, MeasureConfig};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "loopdelay")]
#[command(author, version, about = "Measure round trip delay through RF loopback/leakage", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure the TX-to-RX delay
    Measure {
        /// Device arguments (e.g. "driver=uhd,type=b200")
        #[arg(long)]
        args: Option<String>,

        /// Use the built-in loopback simulator
        #[arg(long, conflicts_with = "args")]
        simulate: bool,

        /// JSON configuration file, overridden by the flags below
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// TX and RX sample rate (Hz)
        #[arg(long)]
        rate: Option<f64>,

        /// TX and RX center frequency (Hz)
        #[arg(long)]
        freq: Option<f64>,

        /// Master clock rate (Hz)
        #[arg(long)]
        clock_rate: Option<f64>,

        /// RX antenna
        #[arg(long)]
        rx_ant: Option<String>,

        /// TX antenna
        #[arg(long)]
        tx_ant: Option<String>,

        /// RX gain (dB)
        #[arg(long)]
        rx_gain: Option<f64>,

        /// TX gain (dB)
        #[arg(long)]
        tx_gain: Option<f64>,

        /// RX filter bandwidth (Hz)
        #[arg(long)]
        rx_bw: Option<f64>,

        /// TX filter bandwidth (Hz)
        #[arg(long)]
        tx_bw: Option<f64>,

        /// RX channel
        #[arg(long)]
        rx_chan: Option<usize>,

        /// TX channel
        #[arg(long)]
        tx_chan: Option<usize>,

        /// Reference pulse length (samples)
        #[arg(long)]
        tx_samples: Option<usize>,

        /// Capture length (samples)
        #[arg(long)]
        rx_samples: Option<usize>,

        /// Pick frequency and gains from the device ranges when unset
        #[arg(long)]
        auto_tune: bool,

        /// Directory to dump diagnostic arrays (.npy)
        #[arg(long)]
        dump_dir: Option<PathBuf>,

        /// Number of measurements to run
        #[arg(short = 'n', long, default_value = "1")]
        repeat: usize,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Write the reference pulse as interleaved f32 I/Q
    Pulse {
        /// Output file
        #[arg(short, long, default_value = "pulse.iq")]
        output: PathBuf,

        /// Number of samples
        #[arg(long, default_value = "200")]
        samples: usize,

        /// Half-width of the sinc argument span
        #[arg(long, default_value = "5.0")]
        width: f64,

        /// Amplitude (0, 1]
        #[arg(long, default_value = "0.3")]
        scale: f64,
    },

    /// Print the default configuration as JSON
    Config,
}

/// Flag values layered over the configuration file.
struct MeasureArgs {
    args: Option<String>,
    simulate: bool,
    config: Option<PathBuf>,
    rate: Option<f64>,
    freq: Option<f64>,
    clock_rate: Option<f64>,
    rx_ant: Option<String>,
    tx_ant: Option<String>,
    rx_gain: Option<f64>,
    tx_gain: Option<f64>,
    rx_bw: Option<f64>,
    tx_bw: Option<f64>,
    rx_chan: Option<usize>,
    tx_chan: Option<usize>,
    tx_samples: Option<usize>,
    rx_samples: Option<usize>,
    auto_tune: bool,
    dump_dir: Option<PathBuf>,
}

fn build_config(opts: MeasureArgs) -> Result<MeasureConfig> {
    let mut config = match &opts.config {
        Some(path) => MeasureConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MeasureConfig::default(),
    };

    if opts.simulate {
        config.device_args = "driver=sim".to_string();
    } else if let Some(args) = opts.args {
        config.device_args = args;
    }
    if let Some(rate) = opts.rate {
        config.sample_rate = rate;
    }
    if opts.freq.is_some() {
        config.frequency = opts.freq;
    }
    if opts.clock_rate.is_some() {
        config.clock_rate = opts.clock_rate;
    }
    if opts.rx_ant.is_some() {
        config.rx.antenna = opts.rx_ant;
    }
    if opts.tx_ant.is_some() {
        config.tx.antenna = opts.tx_ant;
    }
    if opts.rx_gain.is_some() {
        config.rx.gain = opts.rx_gain;
    }
    if opts.tx_gain.is_some() {
        config.tx.gain = opts.tx_gain;
    }
    if opts.rx_bw.is_some() {
        config.rx.bandwidth = opts.rx_bw;
    }
    if opts.tx_bw.is_some() {
        config.tx.bandwidth = opts.tx_bw;
    }
    if let Some(ch) = opts.rx_chan {
        config.rx.channel = ch;
    }
    if let Some(ch) = opts.tx_chan {
        config.tx.channel = ch;
    }
    if let Some(n) = opts.tx_samples {
        config.tx_samples = n;
    }
    if let Some(n) = opts.rx_samples {
        config.rx_samples = n;
    }
    config.auto_tune |= opts.auto_tune;
    if opts.dump_dir.is_some() {
        config.dump_dir = opts.dump_dir;
    }

    config.validate().context("Invalid measurement configuration")?;
    Ok(config)
}

/// Statistics over repeated measurements.
#[derive(Debug, Serialize)]
struct Summary {
    count: usize,
    mean_ns: f64,
    min_ns: i64,
    max_ns: i64,
    std_dev_ns: f64,
}

impl Summary {
    fn from_results(results: &[DelayResult]) -> Option<Self> {
        let deltas: Vec<i64> = results.iter().map(|r| r.delta_ns).collect();
        let count = deltas.len();
        if count == 0 {
            return None;
        }
        let mean = deltas.iter().map(|&d| d as f64).sum::<f64>() / count as f64;
        let variance = deltas.iter().map(|&d| (d as f64 - mean).powi(2)).sum::<f64>() / count as f64;
        Some(Self {
            count,
            mean_ns: mean,
            min_ns: deltas.iter().copied().min().unwrap_or_default(),
            max_ns: deltas.iter().copied().max().unwrap_or_default(),
            std_dev_ns: variance.sqrt(),
        })
    }
}

#[derive(Serialize)]
struct Report<'a> {
    device_args: &'a str,
    measurements: &'a [DelayResult],
    summary: Option<Summary>,
}

fn cmd_measure(opts: MeasureArgs, repeat: usize, format: String) -> Result<()> {
    if format != "text" && format != "json" {
        bail!("Unknown output format: {} (use text or json)", format);
    }
    if repeat == 0 {
        bail!("--repeat must be at least 1");
    }
    let config = build_config(opts)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        handler_token.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let mut results = Vec::with_capacity(repeat);
    for i in 0..repeat {
        info!("Measurement {}/{}", i + 1, repeat);
        match measure_delay(&config, &cancel) {
            Ok(result) => {
                if format == "text" {
                    println!(">>> Time delta {:.3} us", result.delta_us());
                }
                results.push(result);
            }
            Err(DelayError::Cancelled) => {
                warn!("Measurement cancelled");
                break;
            }
            Err(e) => return Err(e).context("Delay measurement failed"),
        }
    }

    let summary = if results.len() > 1 {
        Summary::from_results(&results)
    } else {
        None
    };

    if format == "json" {
        let report = Report {
            device_args: &config.device_args,
            measurements: &results,
            summary,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if let Some(first) = results.first() {
        println!();
        println!("Loopback Delay");
        println!("==============");
        println!("Device:       {}", config.device_args);
        println!("Sample Rate:  {} Hz", first.sample_rate);
        println!("TX peak:      index {} at {}", first.tx_peak_index, first.tx_peak_time);
        println!("RX peak:      index {} at {}", first.rx_peak_index, first.rx_peak_time);
        println!("Correlation:  index {}", first.rx_correlation_index);
        println!("Delay:        {:.3} us ({:.2} samples)", first.delta_us(), first.delta_samples());
    }
    if let Some(s) = summary {
        println!();
        println!("Over {} runs:", s.count);
        println!("  Mean:       {:.3} us", s.mean_ns / 1e3);
        println!("  Min / Max:  {:.3} / {:.3} us", s.min_ns as f64 / 1e3, s.max_ns as f64 / 1e3);
        println!("  Std dev:    {:.3} us", s.std_dev_ns / 1e3);
    }
    if results.is_empty() {
        bail!("No measurement completed");
    }
    Ok(())
}

fn cmd_pulse(output: PathBuf, samples: usize, width: f64, scale: f64) -> Result<()> {
    let pulse = sinc_pulse(samples, width, scale).context("Failed to synthesize pulse")?;
    write_samples_f32(&pulse, &output)?;
    println!("Wrote {} samples to {}", pulse.len(), output.display());
    Ok(())
}

fn cmd_config() -> Result<()> {
    println!("{}", MeasureConfig::default().to_json_pretty()?);
    Ok(())
}

fn write_samples_f32(samples: &[IQSample], path: &PathBuf) -> Result<()> {
    use byteorder::{LittleEndian, WriteBytesExt};

    let file = File::create(path).context("Failed to create output file")?;
    let mut writer = BufWriter::new(file);

    for sample in samples {
        writer.write_f32::<LittleEndian>(sample.re)?;
        writer.write_f32::<LittleEndian>(sample.im)?;
    }

    writer.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Measure {
            args,
            simulate,
            config,
            rate,
            freq,
            clock_rate,
            rx_ant,
            tx_ant,
            rx_gain,
            tx_gain,
            rx_bw,
            tx_bw,
            rx_chan,
            tx_chan,
            tx_samples,
            rx_samples,
            auto_tune,
            dump_dir,
            repeat,
            format,
        } => cmd_measure(
            MeasureArgs {
                args,
                simulate,
                config,
                rate,
                freq,
                clock_rate,
                rx_ant,
                tx_ant,
                rx_gain,
                tx_gain,
                rx_bw,
                tx_bw,
                rx_chan,
                tx_chan,
                tx_samples,
                rx_samples,
                auto_tune,
                dump_dir,
            },
            repeat,
            format,
        ),

        Commands::Pulse {
            output,
            samples,
            width,
            scale,
        } => cmd_pulse(output, samples, width, scale),

        Commands::Config => cmd_config(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_flags() -> MeasureArgs {
        MeasureArgs {
            args: None,
            simulate: false,
            config: None,
            rate: None,
            freq: None,
            clock_rate: None,
            rx_ant: None,
            tx_ant: None,
            rx_gain: None,
            tx_gain: None,
            rx_bw: None,
            tx_bw: None,
            rx_chan: None,
            tx_chan: None,
            tx_samples: None,
            rx_samples: None,
            auto_tune: false,
            dump_dir: None,
        }
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, r#"{ "device_args": "driver=uhd", "sample_rate": 2e6, "tx_samples": 100 }"#).unwrap();

        let config = build_config(MeasureArgs {
            config: Some(path),
            rate: Some(4e6),
            rx_gain: Some(20.0),
            ..no_flags()
        })
        .unwrap();
        assert_eq!(config.device_args, "driver=uhd");
        assert_eq!(config.sample_rate, 4e6);
        assert_eq!(config.tx_samples, 100);
        assert_eq!(config.rx.gain, Some(20.0));
    }

    #[test]
    fn test_simulate_sets_driver() {
        let config = build_config(MeasureArgs {
            simulate: true,
            ..no_flags()
        })
        .unwrap();
        assert_eq!(config.device_args, "driver=sim");
    }

    #[test]
    fn test_summary() {
        let result = |delta_ns| DelayResult {
            delta_ns,
            sample_rate: 1e6,
            tx_origin: Default::default(),
            rx_origin: Default::default(),
            tx_peak_index: 0,
            rx_peak_index: 0,
            rx_correlation_index: 0,
            tx_peak_time: Default::default(),
            rx_peak_time: Default::default(),
        };
        let s = Summary::from_results(&[result(1_000), result(3_000)]).unwrap();
        assert_eq!(s.count, 2);
        assert_eq!(s.mean_ns, 2_000.0);
        assert_eq!((s.min_ns, s.max_ns), (1_000, 3_000));
        assert_eq!(s.std_dev_ns, 1_000.0);
        assert!(Summary::from_results(&[]).is_none());
    }
}

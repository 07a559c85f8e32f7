//! In-memory loopback device.
//!
//! The simulator keeps a virtual hardware clock and loops every scheduled
//! transmit burst back into timed receive bursts after a fixed latency:
//!
//! ```text
//! TX burst @ t_tx ──► × loop_gain ──► delay latency_ns ──┐
//!                                                        ▼
//! RX burst @ t_rx:  dc + noise + transient + spur + looped TX
//! ```
//!
//! Fault knobs reproduce the failure modes the measurement has to detect:
//! a device without hardware time, a first batch without timestamp, short
//! captures, partial transmit acceptance, and read errors.

use super::{DeviceError, DeviceResult, Range, SdrSession, StreamFlags, StreamId, StreamResult};
use crate::types::{samples_to_nanos, Direction, HardwareTimestamp, IQSample};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::Cell;
use std::collections::HashMap;

const DEFAULT_RATE: f64 = 1e6;

/// SoapySDR error codes reused for simulated failures
const STREAM_ERROR: i32 = -2;
const TIME_ERROR: i32 = -6;

/// Simulator behavior.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Delay between a TX sample leaving and arriving at RX
    pub latency_ns: i64,
    /// Linear gain of the loopback path
    pub loop_gain: f32,
    /// Peak amplitude of uniform noise on I and Q
    pub noise_amplitude: f32,
    /// Constant receive offset
    pub dc_offset: IQSample,
    /// Length of the decaying transient at the start of each RX burst
    pub transient_samples: usize,
    /// Initial amplitude of that transient
    pub transient_amplitude: f32,
    /// RNG seed for noise
    pub seed: u64,
    /// Hardware clock value at open
    pub clock_start_ns: i64,
    /// Clock advance per hardware time query
    pub clock_step_ns: i64,
    /// Report hardware time support
    pub hardware_time: bool,
    /// Drop the timestamp of the first RX batch
    pub omit_first_timestamp: bool,
    /// Deliver this many samples fewer than requested
    pub capture_shortfall: usize,
    /// Accept at most this many samples per write
    pub tx_accept_limit: Option<usize>,
    /// Fail the n-th read (0-based)
    pub read_error_after: Option<usize>,
    /// Extra single-sample spike `(capture index, amplitude)`
    pub spur: Option<(usize, f32)>,
    /// Reported tunable range
    pub frequency_range: Range,
    /// Reported gain range
    pub gain_range: Range,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency_ns: 25_000,
            loop_gain: 0.5,
            noise_amplitude: 0.001,
            dc_offset: IQSample::new(0.002, -0.001),
            transient_samples: 40,
            transient_amplitude: 1.0,
            seed: 0x5eed,
            clock_start_ns: 1_000_000_000,
            clock_step_ns: 50_000,
            hardware_time: true,
            omit_first_timestamp: false,
            capture_shortfall: 0,
            tx_accept_limit: None,
            read_error_after: None,
            spur: None,
            frequency_range: Range::new(70e6, 6e9),
            gain_range: Range::new(0.0, 76.0),
        }
    }
}

impl SimConfig {
    /// Build from parsed device arguments.
    ///
    /// Recognized keys: `latency_ns`, `gain`, `noise`, `seed`.
    pub fn from_args(args: &HashMap<String, String>) -> Result<Self, String> {
        fn parse<T: std::str::FromStr>(args: &HashMap<String, String>, key: &str) -> Result<Option<T>, String> {
            args.get(key)
                .map(|v| v.parse::<T>().map_err(|_| format!("invalid value for {}: '{}'", key, v)))
                .transpose()
        }

        let mut config = Self::default();
        if let Some(v) = parse(args, "latency_ns")? {
            config.latency_ns = v;
        }
        if let Some(v) = parse(args, "gain")? {
            config.loop_gain = v;
        }
        if let Some(v) = parse(args, "noise")? {
            config.noise_amplitude = v;
        }
        if let Some(v) = parse(args, "seed")? {
            config.seed = v;
        }
        Ok(config)
    }
}

/// Stream lifecycle event, recorded for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// Stream created
    Setup(Direction),
    /// Stream activated
    Activate(Direction),
    /// Stream deactivated
    Deactivate(Direction),
    /// Stream closed
    Close(Direction),
}

#[derive(Debug)]
struct RxBurst {
    start: HardwareTimestamp,
    requested: usize,
    samples: Option<Vec<IQSample>>,
    cursor: usize,
}

#[derive(Debug)]
struct SimStream {
    direction: Direction,
    channel: usize,
    active: bool,
    burst: Option<RxBurst>,
}

/// A transmit burst accepted by the simulator.
#[derive(Debug, Clone)]
pub struct ScheduledBurst {
    /// Time of the first sample
    pub time: HardwareTimestamp,
    /// Samples accepted
    pub samples: Vec<IQSample>,
}

/// In-memory [`SdrSession`] implementation.
#[derive(Debug)]
pub struct LoopbackSimulator {
    config: SimConfig,
    rng: StdRng,
    clock_ns: Cell<i64>,
    rates: HashMap<(Direction, usize), f64>,
    master_clock: Option<f64>,
    streams: HashMap<StreamId, SimStream>,
    next_stream: u32,
    bursts: Vec<ScheduledBurst>,
    reads: usize,
    events: Vec<SimEvent>,
}

impl LoopbackSimulator {
    /// Create a simulator.
    pub fn new(config: SimConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            clock_ns: Cell::new(config.clock_start_ns),
            config,
            rates: HashMap::new(),
            master_clock: None,
            streams: HashMap::new(),
            next_stream: 0,
            bursts: Vec::new(),
            reads: 0,
            events: Vec::new(),
        }
    }

    /// Simulator settings.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Transmit bursts written so far.
    pub fn scheduled_bursts(&self) -> &[ScheduledBurst] {
        &self.bursts
    }

    /// Stream lifecycle events in call order.
    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    /// Number of streams set up and not yet closed.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Number of active streams.
    pub fn active_streams(&self) -> usize {
        self.streams.values().filter(|s| s.active).count()
    }

    /// Master clock rate last set, if any.
    pub fn master_clock_rate(&self) -> Option<f64> {
        self.master_clock
    }

    fn rate(&self, direction: Direction, channel: usize) -> f64 {
        self.rates.get(&(direction, channel)).copied().unwrap_or(DEFAULT_RATE)
    }

    fn stream_mut(&mut self, stream: StreamId) -> DeviceResult<&mut SimStream> {
        self.streams.get_mut(&stream).ok_or(DeviceError::UnknownStream(stream))
    }

    fn check_setting(what: &str, value: f64, range: Range) -> DeviceResult<()> {
        if value.is_finite() && value >= range.minimum && value <= range.maximum {
            Ok(())
        } else {
            Err(DeviceError::Setting {
                what: what.to_string(),
                message: format!("{} outside [{}, {}]", value, range.minimum, range.maximum),
            })
        }
    }

    /// Render the receive burst from the bursts scheduled so far.
    fn render(&mut self, start: HardwareTimestamp, requested: usize, rate: f64) -> Vec<IQSample> {
        let len = requested.saturating_sub(self.config.capture_shortfall);
        let noise = self.config.noise_amplitude;
        let mut samples: Vec<IQSample> = (0..len)
            .map(|_| {
                let n = if noise > 0.0 {
                    IQSample::new(self.rng.gen_range(-noise..=noise), self.rng.gen_range(-noise..=noise))
                } else {
                    IQSample::new(0.0, 0.0)
                };
                self.config.dc_offset + n
            })
            .collect();

        let transient = self.config.transient_samples.min(len);
        for (i, s) in samples.iter_mut().take(transient).enumerate() {
            let decay = 1.0 - i as f32 / self.config.transient_samples as f32;
            s.re += self.config.transient_amplitude * decay;
        }

        for burst in &self.bursts {
            let offset_ns = burst.time.as_nanos() + self.config.latency_ns - start.as_nanos();
            let first = (offset_ns as f64 * rate / 1e9).round() as i64;
            for (j, tx) in burst.samples.iter().enumerate() {
                let idx = first + j as i64;
                if idx >= 0 && (idx as usize) < len {
                    samples[idx as usize] += *tx * self.config.loop_gain;
                }
            }
        }

        if let Some((idx, amplitude)) = self.config.spur {
            if idx < len {
                samples[idx] += IQSample::new(amplitude, 0.0);
            }
        }

        samples
    }
}

impl SdrSession for LoopbackSimulator {
    fn name(&self) -> String {
        format!("loopback simulator (latency {} ns)", self.config.latency_ns)
    }

    fn set_master_clock_rate(&mut self, rate: f64) -> DeviceResult<()> {
        if !(rate > 0.0) {
            return Err(DeviceError::Setting {
                what: "master clock rate".into(),
                message: format!("{} is not positive", rate),
            });
        }
        self.master_clock = Some(rate);
        Ok(())
    }

    fn set_sample_rate(&mut self, direction: Direction, channel: usize, rate: f64) -> DeviceResult<()> {
        if !(rate > 0.0) {
            return Err(DeviceError::Setting {
                what: format!("{} sample rate", direction),
                message: format!("{} is not positive", rate),
            });
        }
        self.rates.insert((direction, channel), rate);
        Ok(())
    }

    fn sample_rate(&self, direction: Direction, channel: usize) -> DeviceResult<f64> {
        Ok(self.rate(direction, channel))
    }

    fn set_antenna(&mut self, _direction: Direction, _channel: usize, antenna: &str) -> DeviceResult<()> {
        if antenna.is_empty() {
            return Err(DeviceError::Setting {
                what: "antenna".into(),
                message: "empty antenna name".into(),
            });
        }
        Ok(())
    }

    fn set_gain(&mut self, direction: Direction, _channel: usize, gain_db: f64) -> DeviceResult<()> {
        Self::check_setting(&format!("{} gain", direction), gain_db, self.config.gain_range)
    }

    fn gain_range(&self, _direction: Direction, _channel: usize) -> DeviceResult<Range> {
        Ok(self.config.gain_range)
    }

    fn set_frequency(&mut self, direction: Direction, _channel: usize, freq_hz: f64) -> DeviceResult<()> {
        Self::check_setting(&format!("{} frequency", direction), freq_hz, self.config.frequency_range)
    }

    fn frequency_range(&self, _direction: Direction, _channel: usize) -> DeviceResult<Range> {
        Ok(self.config.frequency_range)
    }

    fn set_bandwidth(&mut self, direction: Direction, _channel: usize, bw_hz: f64) -> DeviceResult<()> {
        if !(bw_hz > 0.0) {
            return Err(DeviceError::Setting {
                what: format!("{} bandwidth", direction),
                message: format!("{} is not positive", bw_hz),
            });
        }
        Ok(())
    }

    fn has_hardware_time(&self) -> bool {
        self.config.hardware_time
    }

    fn hardware_time(&self) -> DeviceResult<HardwareTimestamp> {
        if !self.config.hardware_time {
            return Err(DeviceError::Unsupported("hardware time".into()));
        }
        let now = self.clock_ns.get() + self.config.clock_step_ns;
        self.clock_ns.set(now);
        Ok(HardwareTimestamp::from_nanos(now))
    }

    fn setup_stream(&mut self, direction: Direction, channels: &[usize]) -> DeviceResult<StreamId> {
        let channel = match channels {
            [channel] => *channel,
            _ => return Err(DeviceError::Unsupported(format!("{} channels per stream", channels.len()))),
        };
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        self.streams.insert(
            id,
            SimStream {
                direction,
                channel,
                active: false,
                burst: None,
            },
        );
        self.events.push(SimEvent::Setup(direction));
        Ok(id)
    }

    fn activate_stream(
        &mut self,
        stream: StreamId,
        flags: StreamFlags,
        time: Option<HardwareTimestamp>,
        num_samples: usize,
    ) -> DeviceResult<()> {
        let now = HardwareTimestamp::from_nanos(self.clock_ns.get());
        let s = self.stream_mut(stream)?;
        if s.direction == Direction::Rx {
            let start = match time {
                Some(t) if flags.contains(StreamFlags::HAS_TIME) => t,
                _ => now,
            };
            if start < now {
                return Err(DeviceError::Stream {
                    op: "activateStream",
                    code: TIME_ERROR,
                    message: format!("activation time {} already passed ({})", start, now),
                });
            }
            if num_samples == 0 {
                return Err(DeviceError::Unsupported("continuous RX streaming".into()));
            }
            s.burst = Some(RxBurst {
                start,
                requested: num_samples,
                samples: None,
                cursor: 0,
            });
        }
        s.active = true;
        let direction = s.direction;
        self.events.push(SimEvent::Activate(direction));
        Ok(())
    }

    fn deactivate_stream(&mut self, stream: StreamId) -> DeviceResult<()> {
        let s = self.stream_mut(stream)?;
        s.active = false;
        s.burst = None;
        let direction = s.direction;
        self.events.push(SimEvent::Deactivate(direction));
        Ok(())
    }

    fn close_stream(&mut self, stream: StreamId) -> DeviceResult<()> {
        let s = self.streams.remove(&stream).ok_or(DeviceError::UnknownStream(stream))?;
        self.events.push(SimEvent::Close(s.direction));
        Ok(())
    }

    fn write_stream(
        &mut self,
        stream: StreamId,
        buffer: &[IQSample],
        flags: StreamFlags,
        time: Option<HardwareTimestamp>,
        _timeout_us: i64,
    ) -> DeviceResult<StreamResult> {
        let now = HardwareTimestamp::from_nanos(self.clock_ns.get());
        let limit = self.config.tx_accept_limit;
        let s = self.stream_mut(stream)?;
        if s.direction != Direction::Tx || !s.active {
            return Err(DeviceError::Stream {
                op: "writeStream",
                code: STREAM_ERROR,
                message: "stream is not an active TX stream".into(),
            });
        }

        let accepted = limit.map_or(buffer.len(), |l| l.min(buffer.len()));
        let start = match time {
            Some(t) if flags.contains(StreamFlags::HAS_TIME) => t,
            _ => now,
        };
        self.bursts.push(ScheduledBurst {
            time: start,
            samples: buffer[..accepted].to_vec(),
        });

        Ok(StreamResult {
            samples: accepted,
            flags,
            time_ns: start.as_nanos(),
        })
    }

    fn read_stream(&mut self, stream: StreamId, buffer: &mut [IQSample], _timeout_us: i64) -> DeviceResult<StreamResult> {
        let read_index = self.reads;
        self.reads += 1;
        if self.config.read_error_after == Some(read_index) {
            return Err(DeviceError::Stream {
                op: "readStream",
                code: STREAM_ERROR,
                message: "simulated stream error".into(),
            });
        }

        let (direction, channel, plan) = {
            let s = self.stream_mut(stream)?;
            let plan = s.burst.as_ref().filter(|_| s.active).map(|b| (b.start, b.requested, b.samples.is_none()));
            (s.direction, s.channel, plan)
        };
        if direction != Direction::Rx {
            return Err(DeviceError::Stream {
                op: "readStream",
                code: STREAM_ERROR,
                message: "stream is not an RX stream".into(),
            });
        }
        let (start, requested, needs_render) = match plan {
            Some(plan) => plan,
            // Nothing armed: behaves like a timeout
            None => return Ok(StreamResult::default()),
        };

        let rate = self.rate(Direction::Rx, channel);
        let rendered = if needs_render {
            Some(self.render(start, requested, rate))
        } else {
            None
        };

        let omit_first = self.config.omit_first_timestamp;
        let s = self.stream_mut(stream)?;
        let burst = match s.burst.as_mut() {
            Some(burst) => burst,
            None => return Ok(StreamResult::default()),
        };
        if let Some(samples) = rendered {
            burst.samples = Some(samples);
        }
        let samples = burst.samples.as_deref().unwrap_or(&[]);

        let remaining = samples.len() - burst.cursor;
        if remaining == 0 {
            return Ok(StreamResult::default());
        }
        let n = remaining.min(buffer.len());
        buffer[..n].copy_from_slice(&samples[burst.cursor..burst.cursor + n]);

        let time = burst.start + samples_to_nanos(burst.cursor as f64, rate);
        let mut flags = if omit_first && burst.cursor == 0 {
            StreamFlags::NONE
        } else {
            StreamFlags::HAS_TIME
        };
        burst.cursor += n;
        if burst.cursor == samples.len() {
            flags = flags | StreamFlags::END_BURST;
        }

        Ok(StreamResult {
            samples: n,
            flags,
            time_ns: time.as_nanos(),
        })
    }
}

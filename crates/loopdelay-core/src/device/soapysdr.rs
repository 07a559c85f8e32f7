//! # libSoapySDR Backend
//!
//! [`SdrSession`] over the SoapySDR C API. The library is loaded at
//! runtime with libloading, so builds do not need SoapySDR headers and
//! the binary still runs (simulator only) where it is not installed.
//!
//! Streams are always CF32, which matches [`IQSample`] in memory.

use super::{DeviceError, DeviceResult, Range, SdrSession, StreamFlags, StreamId, StreamResult};
use crate::types::{Direction, HardwareTimestamp, IQSample};
use libloading::Library;
use std::collections::HashMap;
use std::ffi::{c_char, c_double, c_int, c_long, c_longlong, c_void, CStr, CString};
use std::ptr;
use std::sync::OnceLock;
use tracing::{debug, info};

type DeviceHandle = *mut c_void;
type StreamHandle = *mut c_void;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SoapyRange {
    minimum: c_double,
    maximum: c_double,
    _step: c_double,
}

const SOAPY_SDR_RX: c_int = 0;
const SOAPY_SDR_TX: c_int = 1;
const SOAPY_SDR_CF32: &[u8] = b"CF32\0";
const SOAPY_SDR_TIMEOUT: c_int = -1;

/// Function table resolved from libSoapySDR.
///
/// Pointers are copied out of their symbols; `_lib` keeps them valid.
struct SoapyApi {
    _lib: Library,
    make_str_args: unsafe extern "C" fn(*const c_char) -> DeviceHandle,
    unmake: unsafe extern "C" fn(DeviceHandle) -> c_int,
    last_error: unsafe extern "C" fn() -> *const c_char,
    free: unsafe extern "C" fn(*mut c_void),
    set_master_clock_rate: unsafe extern "C" fn(DeviceHandle, c_double) -> c_int,
    set_sample_rate: unsafe extern "C" fn(DeviceHandle, c_int, usize, c_double) -> c_int,
    get_sample_rate: unsafe extern "C" fn(DeviceHandle, c_int, usize) -> c_double,
    set_antenna: unsafe extern "C" fn(DeviceHandle, c_int, usize, *const c_char) -> c_int,
    set_gain: unsafe extern "C" fn(DeviceHandle, c_int, usize, c_double) -> c_int,
    get_gain_range: unsafe extern "C" fn(DeviceHandle, c_int, usize) -> SoapyRange,
    set_frequency: unsafe extern "C" fn(DeviceHandle, c_int, usize, c_double, *const c_void) -> c_int,
    get_frequency_range: unsafe extern "C" fn(DeviceHandle, c_int, usize, *mut usize) -> *mut SoapyRange,
    set_bandwidth: unsafe extern "C" fn(DeviceHandle, c_int, usize, c_double) -> c_int,
    has_hardware_time: unsafe extern "C" fn(DeviceHandle, *const c_char) -> bool,
    get_hardware_time: unsafe extern "C" fn(DeviceHandle, *const c_char) -> c_longlong,
    setup_stream: unsafe extern "C" fn(
        DeviceHandle,
        c_int,
        *const c_char,
        *const usize,
        usize,
        *const c_void,
    ) -> StreamHandle,
    close_stream: unsafe extern "C" fn(DeviceHandle, StreamHandle) -> c_int,
    activate_stream: unsafe extern "C" fn(DeviceHandle, StreamHandle, c_int, c_longlong, usize) -> c_int,
    deactivate_stream: unsafe extern "C" fn(DeviceHandle, StreamHandle, c_int, c_longlong) -> c_int,
    read_stream: unsafe extern "C" fn(
        DeviceHandle,
        StreamHandle,
        *const *mut c_void,
        usize,
        *mut c_int,
        *mut c_longlong,
        c_long,
    ) -> c_int,
    write_stream: unsafe extern "C" fn(
        DeviceHandle,
        StreamHandle,
        *const *const c_void,
        usize,
        *mut c_int,
        c_longlong,
        c_long,
    ) -> c_int,
}

static SOAPY_API: OnceLock<Result<SoapyApi, String>> = OnceLock::new();

#[cfg(target_os = "linux")]
const LIB_NAMES: &[&str] = &["libSoapySDR.so.0.8", "libSoapySDR.so"];

#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &["libSoapySDR.dylib", "libSoapySDR.0.8.dylib"];

#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &["SoapySDR.dll", "libSoapySDR.dll"];

/// Resolve `name` and copy the function pointer out of its symbol.
unsafe fn symbol<T: Copy>(lib: &Library, name: &str) -> Result<T, String> {
    let sym = lib
        .get::<T>(format!("{}\0", name).as_bytes())
        .map_err(|e| format!("{}: {}", name, e))?;
    Ok(*sym)
}

/// Only the 0.8 ABI returns the stream handle from `setupStream`.
fn abi_supported(abi: &str) -> bool {
    abi.starts_with("0.8")
}

fn load_api() -> Result<SoapyApi, String> {
    let mut last_err = String::from("no candidate library names");
    for name in LIB_NAMES {
        // SAFETY: loading libSoapySDR runs only its own initializers
        let lib = match unsafe { Library::new(name) } {
            Ok(lib) => lib,
            Err(e) => {
                last_err = format!("{}: {}", name, e);
                continue;
            }
        };

        // SAFETY: SoapySDR_getABIVersion takes no arguments and returns a static string
        let abi = unsafe {
            let get_abi: unsafe extern "C" fn() -> *const c_char = symbol(&lib, "SoapySDR_getABIVersion")?;
            let ptr = get_abi();
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        };
        if !abi_supported(&abi) {
            last_err = format!("{}: unsupported ABI version '{}'", name, abi);
            continue;
        }

        // SAFETY: signatures follow SoapySDR/Device.h of the 0.8 ABI
        let api = unsafe {
            SoapyApi {
                make_str_args: symbol(&lib, "SoapySDRDevice_makeStrArgs")?,
                unmake: symbol(&lib, "SoapySDRDevice_unmake")?,
                last_error: symbol(&lib, "SoapySDRDevice_lastError")?,
                free: symbol(&lib, "SoapySDR_free")?,
                set_master_clock_rate: symbol(&lib, "SoapySDRDevice_setMasterClockRate")?,
                set_sample_rate: symbol(&lib, "SoapySDRDevice_setSampleRate")?,
                get_sample_rate: symbol(&lib, "SoapySDRDevice_getSampleRate")?,
                set_antenna: symbol(&lib, "SoapySDRDevice_setAntenna")?,
                set_gain: symbol(&lib, "SoapySDRDevice_setGain")?,
                get_gain_range: symbol(&lib, "SoapySDRDevice_getGainRange")?,
                set_frequency: symbol(&lib, "SoapySDRDevice_setFrequency")?,
                get_frequency_range: symbol(&lib, "SoapySDRDevice_getFrequencyRange")?,
                set_bandwidth: symbol(&lib, "SoapySDRDevice_setBandwidth")?,
                has_hardware_time: symbol(&lib, "SoapySDRDevice_hasHardwareTime")?,
                get_hardware_time: symbol(&lib, "SoapySDRDevice_getHardwareTime")?,
                setup_stream: symbol(&lib, "SoapySDRDevice_setupStream")?,
                close_stream: symbol(&lib, "SoapySDRDevice_closeStream")?,
                activate_stream: symbol(&lib, "SoapySDRDevice_activateStream")?,
                deactivate_stream: symbol(&lib, "SoapySDRDevice_deactivateStream")?,
                read_stream: symbol(&lib, "SoapySDRDevice_readStream")?,
                write_stream: symbol(&lib, "SoapySDRDevice_writeStream")?,
                _lib: lib,
            }
        };
        info!("Loaded SoapySDR library: {}", name);
        return Ok(api);
    }
    Err(last_err)
}

fn api() -> DeviceResult<&'static SoapyApi> {
    SOAPY_API
        .get_or_init(load_api)
        .as_ref()
        .map_err(|e| DeviceError::LibraryNotFound(e.clone()))
}

fn direction_code(direction: Direction) -> c_int {
    match direction {
        Direction::Rx => SOAPY_SDR_RX,
        Direction::Tx => SOAPY_SDR_TX,
    }
}

fn c_string(value: &str) -> DeviceResult<CString> {
    CString::new(value).map_err(|_| DeviceError::Unsupported(format!("interior NUL in '{}'", value)))
}

/// An open libSoapySDR device.
pub struct SoapySession {
    api: &'static SoapyApi,
    device: DeviceHandle,
    args: String,
    streams: HashMap<StreamId, StreamHandle>,
    next_stream: u32,
}

impl std::fmt::Debug for SoapySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoapySession")
            .field("args", &self.args)
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl SoapySession {
    /// Open a device by argument string, e.g. `"driver=uhd,type=b200"`.
    pub fn open(args: &str) -> DeviceResult<Self> {
        let api = api()?;
        let c_args = c_string(args)?;
        // SAFETY: c_args outlives the call
        let device = unsafe { (api.make_str_args)(c_args.as_ptr()) };
        if device.is_null() {
            return Err(DeviceError::OpenFailed {
                args: args.to_string(),
                message: last_error(api),
            });
        }
        info!("Opened SoapySDR device: {}", args);
        Ok(Self {
            api,
            device,
            args: args.to_string(),
            streams: HashMap::new(),
            next_stream: 0,
        })
    }

    fn check(&self, what: impl Into<String>, ret: c_int) -> DeviceResult<()> {
        if ret == 0 {
            Ok(())
        } else {
            Err(DeviceError::Setting {
                what: what.into(),
                message: format!("{} (code {})", last_error(self.api), ret),
            })
        }
    }

    fn handle(&self, stream: StreamId) -> DeviceResult<StreamHandle> {
        self.streams.get(&stream).copied().ok_or(DeviceError::UnknownStream(stream))
    }

    fn stream_error(&self, op: &'static str, code: c_int) -> DeviceError {
        DeviceError::Stream {
            op,
            code,
            message: last_error(self.api),
        }
    }
}

fn last_error(api: &SoapyApi) -> String {
    // SAFETY: returns a thread-local, NUL-terminated string or null
    let ptr = unsafe { (api.last_error)() };
    if ptr.is_null() {
        String::new()
    } else {
        // SAFETY: checked non-null above
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}

impl SdrSession for SoapySession {
    fn name(&self) -> String {
        format!("SoapySDR ({})", self.args)
    }

    fn set_master_clock_rate(&mut self, rate: f64) -> DeviceResult<()> {
        // SAFETY: device is a live handle for the lifetime of self
        let ret = unsafe { (self.api.set_master_clock_rate)(self.device, rate) };
        self.check("master clock rate", ret)
    }

    fn set_sample_rate(&mut self, direction: Direction, channel: usize, rate: f64) -> DeviceResult<()> {
        let ret = unsafe { (self.api.set_sample_rate)(self.device, direction_code(direction), channel, rate) };
        self.check(format!("{} sample rate", direction), ret)
    }

    fn sample_rate(&self, direction: Direction, channel: usize) -> DeviceResult<f64> {
        Ok(unsafe { (self.api.get_sample_rate)(self.device, direction_code(direction), channel) })
    }

    fn set_antenna(&mut self, direction: Direction, channel: usize, antenna: &str) -> DeviceResult<()> {
        let name = c_string(antenna)?;
        let ret = unsafe { (self.api.set_antenna)(self.device, direction_code(direction), channel, name.as_ptr()) };
        self.check(format!("{} antenna", direction), ret)
    }

    fn set_gain(&mut self, direction: Direction, channel: usize, gain_db: f64) -> DeviceResult<()> {
        let ret = unsafe { (self.api.set_gain)(self.device, direction_code(direction), channel, gain_db) };
        self.check(format!("{} gain", direction), ret)
    }

    fn gain_range(&self, direction: Direction, channel: usize) -> DeviceResult<Range> {
        let r = unsafe { (self.api.get_gain_range)(self.device, direction_code(direction), channel) };
        Ok(Range::new(r.minimum, r.maximum))
    }

    fn set_frequency(&mut self, direction: Direction, channel: usize, freq_hz: f64) -> DeviceResult<()> {
        let ret = unsafe {
            (self.api.set_frequency)(self.device, direction_code(direction), channel, freq_hz, ptr::null())
        };
        self.check(format!("{} frequency", direction), ret)
    }

    fn frequency_range(&self, direction: Direction, channel: usize) -> DeviceResult<Range> {
        let mut len: usize = 0;
        let ranges = unsafe { (self.api.get_frequency_range)(self.device, direction_code(direction), channel, &mut len) };
        if ranges.is_null() || len == 0 {
            return Err(DeviceError::Unsupported(format!("{} frequency range", direction)));
        }
        // SAFETY: the driver returned `len` contiguous ranges
        let slice = unsafe { std::slice::from_raw_parts(ranges, len) };
        let minimum = slice.iter().map(|r| r.minimum).fold(f64::INFINITY, f64::min);
        let maximum = slice.iter().map(|r| r.maximum).fold(f64::NEG_INFINITY, f64::max);
        unsafe { (self.api.free)(ranges.cast()) };
        Ok(Range::new(minimum, maximum))
    }

    fn set_bandwidth(&mut self, direction: Direction, channel: usize, bw_hz: f64) -> DeviceResult<()> {
        let ret = unsafe { (self.api.set_bandwidth)(self.device, direction_code(direction), channel, bw_hz) };
        self.check(format!("{} bandwidth", direction), ret)
    }

    fn has_hardware_time(&self) -> bool {
        unsafe { (self.api.has_hardware_time)(self.device, ptr::null()) }
    }

    fn hardware_time(&self) -> DeviceResult<HardwareTimestamp> {
        let ns = unsafe { (self.api.get_hardware_time)(self.device, ptr::null()) };
        Ok(HardwareTimestamp::from_nanos(ns))
    }

    fn setup_stream(&mut self, direction: Direction, channels: &[usize]) -> DeviceResult<StreamId> {
        let handle = unsafe {
            (self.api.setup_stream)(
                self.device,
                direction_code(direction),
                SOAPY_SDR_CF32.as_ptr().cast(),
                channels.as_ptr(),
                channels.len(),
                ptr::null(),
            )
        };
        if handle.is_null() {
            return Err(self.stream_error("setupStream", 0));
        }
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        self.streams.insert(id, handle);
        debug!("setupStream {}: {:?} on channels {:?}", direction, id, channels);
        Ok(id)
    }

    fn activate_stream(
        &mut self,
        stream: StreamId,
        flags: StreamFlags,
        time: Option<HardwareTimestamp>,
        num_samples: usize,
    ) -> DeviceResult<()> {
        let handle = self.handle(stream)?;
        let time_ns = time.map_or(0, HardwareTimestamp::as_nanos);
        let ret = unsafe {
            (self.api.activate_stream)(self.device, handle, flags.bits() as c_int, time_ns, num_samples)
        };
        if ret != 0 {
            return Err(self.stream_error("activateStream", ret));
        }
        Ok(())
    }

    fn deactivate_stream(&mut self, stream: StreamId) -> DeviceResult<()> {
        let handle = self.handle(stream)?;
        let ret = unsafe { (self.api.deactivate_stream)(self.device, handle, 0, 0) };
        if ret != 0 {
            return Err(self.stream_error("deactivateStream", ret));
        }
        Ok(())
    }

    fn close_stream(&mut self, stream: StreamId) -> DeviceResult<()> {
        let handle = self.streams.remove(&stream).ok_or(DeviceError::UnknownStream(stream))?;
        let ret = unsafe { (self.api.close_stream)(self.device, handle) };
        if ret != 0 {
            return Err(self.stream_error("closeStream", ret));
        }
        Ok(())
    }

    fn write_stream(
        &mut self,
        stream: StreamId,
        buffer: &[IQSample],
        flags: StreamFlags,
        time: Option<HardwareTimestamp>,
        timeout_us: i64,
    ) -> DeviceResult<StreamResult> {
        let handle = self.handle(stream)?;
        let buffs: [*const c_void; 1] = [buffer.as_ptr().cast()];
        let mut c_flags = flags.bits() as c_int;
        let time_ns = time.map_or(0, HardwareTimestamp::as_nanos);
        // SAFETY: one CF32 buffer of buffer.len() elements
        let ret = unsafe {
            (self.api.write_stream)(
                self.device,
                handle,
                buffs.as_ptr(),
                buffer.len(),
                &mut c_flags,
                time_ns,
                timeout_us as c_long,
            )
        };
        if ret < 0 {
            return Err(self.stream_error("writeStream", ret));
        }
        Ok(StreamResult {
            samples: ret as usize,
            flags: StreamFlags::from_bits(c_flags as u32),
            time_ns,
        })
    }

    fn read_stream(&mut self, stream: StreamId, buffer: &mut [IQSample], timeout_us: i64) -> DeviceResult<StreamResult> {
        let handle = self.handle(stream)?;
        let buffs: [*mut c_void; 1] = [buffer.as_mut_ptr().cast()];
        let mut c_flags: c_int = 0;
        let mut time_ns: c_longlong = 0;
        // SAFETY: one CF32 buffer of buffer.len() elements
        let ret = unsafe {
            (self.api.read_stream)(
                self.device,
                handle,
                buffs.as_ptr(),
                buffer.len(),
                &mut c_flags,
                &mut time_ns,
                timeout_us as c_long,
            )
        };
        if ret == SOAPY_SDR_TIMEOUT {
            return Ok(StreamResult::default());
        }
        if ret < 0 {
            return Err(self.stream_error("readStream", ret));
        }
        Ok(StreamResult {
            samples: ret as usize,
            flags: StreamFlags::from_bits(c_flags as u32),
            time_ns,
        })
    }
}

impl Drop for SoapySession {
    fn drop(&mut self) {
        for (_, handle) in self.streams.drain() {
            unsafe { (self.api.close_stream)(self.device, handle) };
        }
        let ret = unsafe { (self.api.unmake)(self.device) };
        if ret != 0 {
            tracing::warn!("SoapySDRDevice_unmake failed: {}", last_error(self.api));
        }
    }
}

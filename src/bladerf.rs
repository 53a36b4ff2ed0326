//! bladeRF backend over libbladeRF's asynchronous stream API.
//!
//! libbladeRF owns the sample buffers. Its transfer thread calls
//! [`stream_callback`] with each filled buffer and expects a pointer to the
//! next one to fill, or null to end the stream.

use std::{
    ffi::{CStr, CString},
    os::raw::{c_char, c_int, c_uint, c_void},
    ptr::{self, NonNull},
    slice,
    time::Duration,
};

use tracing::{debug, info};

use crate::{capture::StreamCallback, device::RadioDevice, error::DeviceError};

type BladerfDevice = c_void;
type BladerfStream = c_void;

const BLADERF_MODULE_RX: c_int = 0;
const BLADERF_DIRECTION_RX: c_int = 0;
const BLADERF_RX_X1: c_int = 0;
const BLADERF_FORMAT_SC16_Q11: c_int = 0;

/// libbladeRF moves samples in chunks of this many
const SAMPLES_MULTIPLE: usize = 1024;

type StreamCb = extern "C" fn(
    dev: *mut BladerfDevice,
    stream: *mut BladerfStream,
    meta: *mut c_void,
    samples: *mut c_void,
    num_samples: usize,
    user_data: *mut c_void,
) -> *mut c_void;

extern "C" {
    fn bladerf_open(device: *mut *mut BladerfDevice, identifier: *const c_char) -> c_int;
    fn bladerf_close(device: *mut BladerfDevice);
    fn bladerf_is_fpga_configured(dev: *mut BladerfDevice) -> c_int;
    fn bladerf_set_frequency(dev: *mut BladerfDevice, ch: c_int, frequency: u64) -> c_int;
    fn bladerf_set_sample_rate(
        dev: *mut BladerfDevice,
        ch: c_int,
        rate: c_uint,
        actual: *mut c_uint,
    ) -> c_int;
    fn bladerf_set_bandwidth(
        dev: *mut BladerfDevice,
        ch: c_int,
        bandwidth: c_uint,
        actual: *mut c_uint,
    ) -> c_int;
    fn bladerf_set_gain(dev: *mut BladerfDevice, ch: c_int, gain: c_int) -> c_int;
    fn bladerf_init_stream(
        stream: *mut *mut BladerfStream,
        dev: *mut BladerfDevice,
        callback: StreamCb,
        buffers: *mut *mut *mut c_void,
        num_buffers: usize,
        format: c_int,
        samples_per_buffer: usize,
        num_transfers: usize,
        user_data: *mut c_void,
    ) -> c_int;
    fn bladerf_set_stream_timeout(dev: *mut BladerfDevice, dir: c_int, timeout: c_uint) -> c_int;
    fn bladerf_enable_module(dev: *mut BladerfDevice, ch: c_int, enable: bool) -> c_int;
    fn bladerf_stream(stream: *mut BladerfStream, layout: c_int) -> c_int;
    fn bladerf_deinit_stream(stream: *mut BladerfStream);
    fn bladerf_strerror(error: c_int) -> *const c_char;
}

fn check(status: c_int) -> Result<(), DeviceError> {
    if status == 0 {
        return Ok(());
    }
    // Safety: bladerf_strerror returns a static string for every status
    let message = unsafe {
        let s = bladerf_strerror(status);
        if s.is_null() {
            "unknown error".to_owned()
        } else {
            CStr::from_ptr(s).to_string_lossy().into_owned()
        }
    };
    Err(DeviceError::new(status, message))
}

/// State the transfer thread reaches through `user_data`
struct CallbackState {
    callback: StreamCallback,
    buffers: *mut *mut c_void,
}

extern "C" fn stream_callback(
    _dev: *mut BladerfDevice,
    _stream: *mut BladerfStream,
    _meta: *mut c_void,
    samples: *mut c_void,
    num_samples: usize,
    user_data: *mut c_void,
) -> *mut c_void {
    // Safety: user_data is the CallbackState leaked in init_stream; libbladeRF
    // invokes the callback serially and only while the stream is alive
    let state = unsafe { &mut *(user_data as *mut CallbackState) };
    let words: &[i16] = if samples.is_null() || num_samples == 0 {
        &[]
    } else {
        // Safety: SC16 Q11 delivers num_samples interleaved I/Q pairs of i16
        unsafe { slice::from_raw_parts(samples as *const i16, num_samples * 2) }
    };
    match state.callback.on_samples(words) {
        // Safety: idx < num_buffers, the pool and libbladeRF agree on the count
        Some(idx) => unsafe { *state.buffers.add(idx) },
        None => ptr::null_mut(),
    }
}

pub struct BladerfRadio {
    identifier: Option<String>,
}

pub struct BladerfHandle {
    dev: NonNull<BladerfDevice>,
}

// libbladeRF serializes access to the device internally
unsafe impl Send for BladerfHandle {}

pub struct BladerfStreamHandle {
    stream: NonNull<BladerfStream>,
    state: NonNull<CallbackState>,
}

// Only the stream thread calls bladerf_stream; deinit happens after it has been joined
unsafe impl Send for BladerfStreamHandle {}
unsafe impl Sync for BladerfStreamHandle {}

impl BladerfRadio {
    /// `identifier` follows libbladeRF's device string syntax; `None` opens the first device
    pub fn new(identifier: Option<String>) -> Self {
        Self { identifier }
    }
}

impl RadioDevice for BladerfRadio {
    type Handle = BladerfHandle;
    type Stream = BladerfStreamHandle;

    fn name(&self) -> &str {
        "bladerf"
    }

    fn open(&self) -> Result<BladerfHandle, DeviceError> {
        let identifier = self
            .identifier
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|e| DeviceError::new(-1, format!("invalid identifier: {e}")))?;
        let mut dev: *mut BladerfDevice = ptr::null_mut();
        let status = unsafe {
            bladerf_open(
                &mut dev,
                identifier.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
            )
        };
        check(status)?;
        let dev = NonNull::new(dev).ok_or_else(|| DeviceError::new(-1, "bladerf_open returned null"))?;
        Ok(BladerfHandle { dev })
    }

    fn is_ready(&self, handle: &BladerfHandle) -> Result<bool, DeviceError> {
        let status = unsafe { bladerf_is_fpga_configured(handle.dev.as_ptr()) };
        if status < 0 {
            check(status)?;
        }
        Ok(status > 0)
    }

    fn set_frequency(&self, handle: &BladerfHandle, hz: u64) -> Result<(), DeviceError> {
        check(unsafe { bladerf_set_frequency(handle.dev.as_ptr(), BLADERF_MODULE_RX, hz) })
    }

    fn set_sample_rate(&self, handle: &BladerfHandle, hz: u32) -> Result<u32, DeviceError> {
        let mut actual: c_uint = 0;
        check(unsafe {
            bladerf_set_sample_rate(handle.dev.as_ptr(), BLADERF_MODULE_RX, hz, &mut actual)
        })?;
        Ok(actual)
    }

    fn set_bandwidth(&self, handle: &BladerfHandle, hz: u32) -> Result<u32, DeviceError> {
        let mut actual: c_uint = 0;
        check(unsafe {
            bladerf_set_bandwidth(handle.dev.as_ptr(), BLADERF_MODULE_RX, hz, &mut actual)
        })?;
        Ok(actual)
    }

    fn set_gain(&self, handle: &BladerfHandle, db: i32) -> Result<(), DeviceError> {
        check(unsafe { bladerf_set_gain(handle.dev.as_ptr(), BLADERF_MODULE_RX, db) })
    }

    fn init_stream(
        &self,
        handle: &BladerfHandle,
        callback: StreamCallback,
    ) -> Result<BladerfStreamHandle, DeviceError> {
        let num_buffers = callback.pool().count();
        let samples_per_buffer = callback.pool().samples_per_buffer();
        if samples_per_buffer % SAMPLES_MULTIPLE != 0 {
            return Err(DeviceError::new(
                -1,
                format!("samples per buffer must be a multiple of {SAMPLES_MULTIPLE}"),
            ));
        }
        let state = Box::into_raw(Box::new(CallbackState {
            callback,
            buffers: ptr::null_mut(),
        }));
        let mut stream: *mut BladerfStream = ptr::null_mut();
        let status = unsafe {
            bladerf_init_stream(
                &mut stream,
                handle.dev.as_ptr(),
                stream_callback,
                &mut (*state).buffers,
                num_buffers,
                BLADERF_FORMAT_SC16_Q11,
                samples_per_buffer,
                num_transfers(num_buffers),
                state as *mut c_void,
            )
        };
        let stream = match (check(status), NonNull::new(stream)) {
            (Ok(()), Some(stream)) => stream,
            (result, _) => {
                // Safety: libbladeRF did not keep the pointer
                drop(unsafe { Box::from_raw(state) });
                result?;
                return Err(DeviceError::new(-1, "bladerf_init_stream returned null"));
            }
        };
        debug!(num_buffers, samples_per_buffer, "bladeRF stream ready");
        Ok(BladerfStreamHandle {
            stream,
            // Safety: from Box::into_raw above
            state: unsafe { NonNull::new_unchecked(state) },
        })
    }

    fn set_stream_timeout(&self, handle: &BladerfHandle, timeout: Duration) -> Result<(), DeviceError> {
        let ms = timeout.as_millis().min(c_uint::MAX as u128) as c_uint;
        check(unsafe { bladerf_set_stream_timeout(handle.dev.as_ptr(), BLADERF_DIRECTION_RX, ms) })
    }

    fn enable(&self, handle: &BladerfHandle) -> Result<(), DeviceError> {
        check(unsafe { bladerf_enable_module(handle.dev.as_ptr(), BLADERF_MODULE_RX, true) })
    }

    fn run_stream_blocking(&self, stream: &BladerfStreamHandle) -> Result<(), DeviceError> {
        // Start stream and stay there until the callback hands back null
        let status = unsafe { bladerf_stream(stream.stream.as_ptr(), BLADERF_RX_X1) };
        if status < 0 {
            check(status)?;
        }
        Ok(())
    }

    fn disable(&self, handle: &BladerfHandle) -> Result<(), DeviceError> {
        check(unsafe { bladerf_enable_module(handle.dev.as_ptr(), BLADERF_MODULE_RX, false) })
    }

    fn deinit_stream(&self, stream: BladerfStreamHandle) {
        unsafe {
            bladerf_deinit_stream(stream.stream.as_ptr());
            // Safety: the stream no longer calls back, the state is ours again
            drop(Box::from_raw(stream.state.as_ptr()));
        }
    }

    fn close(&self, handle: BladerfHandle) {
        unsafe { bladerf_close(handle.dev.as_ptr()) };
        info!("bladeRF closed");
    }
}

/// libbladeRF keeps at least one buffer away from in-flight transfers
fn num_transfers(num_buffers: usize) -> usize {
    (num_buffers / 2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_transfers() {
        assert_eq!(num_transfers(2), 1);
        assert_eq!(num_transfers(16), 8);
    }
}

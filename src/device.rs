//! The capability interface a radio backend implements.
//!
//! Calls are issued from the orchestrating thread in the order the lifecycle
//! dictates, except [`RadioDevice::run_stream_blocking`], which is only ever
//! called from the single background stream thread.

use std::time::Duration;

use crate::{capture::StreamCallback, error::DeviceError};

pub trait RadioDevice: Send + Sync + 'static {
    /// An open hardware session
    type Handle: Send + 'static;
    /// An initialized stream. Shared between the stream thread and the orchestrator.
    type Stream: Send + Sync + 'static;

    /// Short name for logs
    fn name(&self) -> &str;

    fn open(&self) -> Result<Self::Handle, DeviceError>;

    /// Whether the device is usable (e.g. its FPGA is loaded)
    fn is_ready(&self, handle: &Self::Handle) -> Result<bool, DeviceError>;

    fn set_frequency(&self, handle: &Self::Handle, hz: u64) -> Result<(), DeviceError>;

    /// Returns the rate actually applied, which may be clamped
    fn set_sample_rate(&self, handle: &Self::Handle, hz: u32) -> Result<u32, DeviceError>;

    /// Returns the bandwidth actually applied, which may be clamped
    fn set_bandwidth(&self, handle: &Self::Handle, hz: u32) -> Result<u32, DeviceError>;

    fn set_gain(&self, handle: &Self::Handle, db: i32) -> Result<(), DeviceError>;

    /// Set up the stream. The callback carries the buffer pool; the backend
    /// invokes it serially for every filled buffer once the stream runs.
    fn init_stream(
        &self,
        handle: &Self::Handle,
        callback: StreamCallback,
    ) -> Result<Self::Stream, DeviceError>;

    /// Hardware idle timeout. Advisory, it never stops a capture by itself.
    fn set_stream_timeout(
        &self,
        _handle: &Self::Handle,
        _timeout: Duration,
    ) -> Result<(), DeviceError> {
        Ok(())
    }

    fn enable(&self, handle: &Self::Handle) -> Result<(), DeviceError>;

    /// Blocks until the callback hands back no buffer or the hardware fails
    fn run_stream_blocking(&self, stream: &Self::Stream) -> Result<(), DeviceError>;

    /// Whether the backend already tore the stream down after a failure, so
    /// the module must not be disabled again
    fn stream_torn_down(&self, _stream: &Self::Stream) -> bool {
        false
    }

    fn disable(&self, handle: &Self::Handle) -> Result<(), DeviceError>;

    fn deinit_stream(&self, stream: Self::Stream);

    fn close(&self, handle: Self::Handle);
}

//! SDR capture front end for a BLE sniffer.
//!
//! A radio is brought up through [`lifecycle::start_capture`], a background
//! thread owns the blocking stream call, and every delivered block is folded
//! into the shared [`cyclic::CyclicSampleBuffer`] that the demodulator trails.

pub mod capture;
pub mod complex;
pub mod config;
pub mod cyclic;
pub mod device;
pub mod error;
pub mod file;
pub mod lifecycle;
pub mod monitoring;
pub mod session;
pub mod shutdown;
pub mod sim;

#[cfg(feature = "bladerf")]
pub mod bladerf;

/// IQ pairs held by the cyclic sample buffer
pub const LEN_BUF_IN_SAMPLE: usize = 4 * 4096;
/// Size of the cyclic sample buffer in bytes (I and Q are one byte each)
pub const LEN_BUF: usize = LEN_BUF_IN_SAMPLE * 2;

/// Samples per BLE symbol at 1 Msym/s, which sets the default sample rate
pub const SAMPLE_PER_SYMBOL: u32 = 4;

pub use capture::{BufferPool, SampleBuffer, StreamCallback};
pub use complex::{Complex, IqSample};
pub use config::StreamConfig;
pub use cyclic::{CyclicReader, CyclicSampleBuffer};
pub use device::RadioDevice;
pub use error::{CaptureError, ConfigParam, DeviceError, SignalError};
pub use lifecycle::{start_capture, Capture, LifecycleState, StopReason};
pub use session::SessionContext;
pub use shutdown::StopFlag;

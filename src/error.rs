//! Error types for bringing up and running a capture.
//!
//! Backends report raw failures as [`DeviceError`]. The lifecycle tags each
//! one with the step it happened in and hands the caller a [`CaptureError`].

use std::fmt;

/// A failure reported by a radio backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (status {code})")]
pub struct DeviceError {
    /// Backend status code, negative for libbladeRF-style failures
    pub code: i32,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e.raw_os_error().unwrap_or(-1), e.to_string())
    }
}

/// The radio parameter a configuration step was setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigParam {
    Frequency,
    SampleRate,
    Bandwidth,
    Gain,
}

impl fmt::Display for ConfigParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigParam::Frequency => "frequency",
            ConfigParam::SampleRate => "sample_rate",
            ConfigParam::Bandwidth => "bandwidth",
            ConfigParam::Gain => "gain",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The stream configuration was rejected before touching hardware
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to open device: {0}")]
    OpenFailed(#[source] DeviceError),

    /// Asking the device whether it is usable failed outright
    #[error("failed to determine FPGA state: {0}")]
    QueryFailed(#[source] DeviceError),

    /// The device answered, but its FPGA/firmware is not loaded
    #[error("FPGA is not loaded")]
    NotReady,

    #[error("failed to set {param}: {source}")]
    ConfigFailed {
        param: ConfigParam,
        #[source]
        source: DeviceError,
    },

    #[error("failed to init stream: {0}")]
    StreamInitFailed(#[source] DeviceError),

    #[error("failed to enable module: {0}")]
    EnableFailed(#[source] DeviceError),

    /// The running stream died with a hardware or I/O error
    #[error("RX stream failure: {0}")]
    StreamFailed(#[source] DeviceError),

    #[error("failed to spawn stream thread: {0}")]
    ThreadSpawnFailed(#[source] std::io::Error),

    /// Retune was requested while the stream is not running
    #[error("capture is not running")]
    NotRunning,
}

/// Failure wiring process signals to the stop flag
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("failed to install termination handler: {0}")]
    Termination(#[from] ctrlc::Error),

    #[error("failed to register signal {signal}: {source}")]
    Register {
        signal: i32,
        #[source]
        source: std::io::Error,
    },
}

impl CaptureError {
    pub(crate) fn config(param: ConfigParam) -> impl FnOnce(DeviceError) -> Self {
        move |source| CaptureError::ConfigFailed { param, source }
    }
}

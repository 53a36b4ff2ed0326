//! State shared by the capture side and its consumers for the life of the process

use crate::{cyclic::CyclicSampleBuffer, error::CaptureError, shutdown::StopFlag, LEN_BUF};

/// The cyclic buffer and the stop flag, allocated once and handed around behind an `Arc`
pub struct SessionContext {
    pub buffer: CyclicSampleBuffer,
    pub stop: StopFlag,
}

impl SessionContext {
    pub fn try_new(len_buf: usize) -> Result<Self, CaptureError> {
        Ok(Self {
            buffer: CyclicSampleBuffer::try_new(len_buf)?,
            stop: StopFlag::new(),
        })
    }

    /// # Panics
    ///
    /// If `len_buf` is not a power of two of at least 2.
    pub fn new(len_buf: usize) -> Self {
        Self {
            buffer: CyclicSampleBuffer::new(len_buf),
            stop: StopFlag::new(),
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(LEN_BUF)
    }
}

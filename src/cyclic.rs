//! The cyclic byte buffer shared between the capture side and the demodulator.
//!
//! There is exactly one writer (the stream callback). The copy and the cursor
//! advance happen under a mutex so multi-byte writes are never torn against
//! each other. Readers are *not* synchronized with the writer at the byte
//! level: a reader only loads the published cursor and then reads bytes that
//! may already be overwritten by the next block. That staleness is accepted,
//! the demodulator's framing tolerates it, and readers never block the writer.

use std::sync::{
    atomic::{AtomicU8, AtomicUsize, Ordering},
    Mutex, PoisonError,
};

use crate::{complex::IqSample, error::CaptureError};

pub struct CyclicSampleBuffer {
    bytes: Box<[AtomicU8]>,
    mask: usize,
    // Authoritative write offset, only touched with the lock held
    writer: Mutex<usize>,
    // Offset published to readers after each copy
    cursor: AtomicUsize,
}

impl CyclicSampleBuffer {
    /// Allocate a zeroed buffer. `len` must be a power of two so wrapping is a mask.
    pub fn try_new(len: usize) -> Result<Self, CaptureError> {
        if len < 2 || !len.is_power_of_two() {
            return Err(CaptureError::InvalidConfig(format!(
                "cyclic buffer length must be a power of two, got {len}"
            )));
        }
        Ok(Self {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
            mask: len - 1,
            writer: Mutex::new(0),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Like [`CyclicSampleBuffer::try_new`], for lengths known to be valid.
    ///
    /// # Panics
    ///
    /// If `len` is not a power of two of at least 2.
    pub fn new(len: usize) -> Self {
        match Self::try_new(len) {
            Ok(buf) => buf,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Current write cursor, the index the next I byte will land at
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Raw byte at `index` (wrapped), possibly in flight
    pub fn byte_at(&self, index: usize) -> u8 {
        self.bytes[index & self.mask].load(Ordering::Relaxed)
    }

    /// Shift each pair down to 8 bits and store I then Q at the cursor, advancing
    /// by two bytes per pair. Returns the new cursor.
    pub fn write_iq<I>(&self, samples: I) -> usize
    where
        I: IntoIterator<Item = IqSample>,
    {
        let mut offset = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        for iq in samples {
            let bytes = iq.to_bytes();
            // offset is always even and len is a power of two, so offset + 1 never wraps
            self.bytes[*offset].store(bytes.re, Ordering::Relaxed);
            self.bytes[*offset + 1].store(bytes.im, Ordering::Relaxed);
            *offset = (*offset + 2) & self.mask;
        }
        self.cursor.store(*offset, Ordering::Release);
        *offset
    }

    /// A reader that starts trailing the writer from the current cursor
    pub fn reader(&self) -> CyclicReader<'_> {
        CyclicReader {
            buffer: self,
            position: self.cursor(),
        }
    }
}

/// Consumer-side view: its own read position plus the writer's published cursor.
///
/// If the writer laps the reader the available count silently wraps; there is
/// no backpressure, so a reader has to keep up on its own.
pub struct CyclicReader<'a> {
    buffer: &'a CyclicSampleBuffer,
    position: usize,
}

impl CyclicReader<'_> {
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes written since this reader last caught up
    pub fn available(&self) -> usize {
        self.buffer.cursor().wrapping_sub(self.position) & self.buffer.mask
    }

    /// Copy up to `out.len()` of the available bytes and advance
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        let n = self.available().min(out.len());
        for (i, byte) in out[..n].iter_mut().enumerate() {
            *byte = self.buffer.byte_at(self.position + i);
        }
        self.position = (self.position + n) & self.buffer.mask;
        n
    }

    /// Drop everything available without reading it
    pub fn skip_to_cursor(&mut self) -> usize {
        let n = self.available();
        self.position = self.buffer.cursor();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complex::shift_down;

    #[test]
    fn test_write_wraps() {
        let buf = CyclicSampleBuffer::new(8);
        let samples: Vec<IqSample> = (0..5).map(|i| IqSample::new(i * 16, -i * 16)).collect();
        assert_eq!(buf.write_iq(samples), 2);
        // The fifth pair overwrote the first
        assert_eq!(buf.byte_at(0), 4);
        assert_eq!(buf.byte_at(1), shift_down(-64));
        assert_eq!(buf.byte_at(2), 1);
        assert_eq!(buf.byte_at(6), 3);
        assert_eq!(buf.byte_at(7), shift_down(-48));
    }

    #[test]
    fn test_cursor_after_many_writes() {
        let buf = CyclicSampleBuffer::new(64);
        buf.write_iq([IqSample::default(); 3]);
        let initial = buf.cursor();
        let n_samples = 7;
        let calls = 11;
        for _ in 0..calls {
            buf.write_iq(vec![IqSample::new(1, 2); n_samples]);
        }
        assert_eq!(buf.cursor(), (initial + 2 * calls * n_samples) % buf.len());
    }

    #[test]
    fn test_empty_write_leaves_cursor() {
        let buf = CyclicSampleBuffer::new(16);
        buf.write_iq([IqSample::new(100, 200)]);
        assert_eq!(buf.write_iq(std::iter::empty()), 2);
        assert_eq!(buf.cursor(), 2);
    }

    #[test]
    fn test_reader_trails_writer() {
        let buf = CyclicSampleBuffer::new(16);
        let mut reader = buf.reader();
        assert_eq!(reader.available(), 0);
        buf.write_iq([IqSample::new(16, 32), IqSample::new(48, 64)]);
        assert_eq!(reader.available(), 4);
        let mut out = [0u8; 3];
        assert_eq!(reader.read_into(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(reader.available(), 1);
        buf.write_iq(vec![IqSample::new(80, 96); 7]);
        // 1 left over + 14 new, crossing the end of the buffer
        assert_eq!(reader.available(), 15);
        assert_eq!(reader.skip_to_cursor(), 15);
        assert_eq!(reader.position(), buf.cursor());
    }

    #[test]
    fn test_try_new_rejects_bad_lengths() {
        for len in [0, 1, 24, 1000] {
            assert!(matches!(
                CyclicSampleBuffer::try_new(len),
                Err(CaptureError::InvalidConfig(_))
            ));
        }
        assert_eq!(CyclicSampleBuffer::try_new(2).unwrap().len(), 2);
    }

    #[test]
    #[should_panic]
    fn test_rejects_non_power_of_two() {
        CyclicSampleBuffer::new(24);
    }
}

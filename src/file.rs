//! Replay a recorded capture as if it were a radio.
//!
//! The file holds interleaved little-endian SC16 words (`I, Q, I, Q, ...`), the
//! same layout a bladeRF delivers in SC16 Q11 mode. Blocks are paced at the
//! configured sample rate so downstream timing behaves like live capture.

use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
    time::Instant,
};

use byte_slice_cast::AsMutByteSlice;
use tracing::{debug, info};

use crate::{
    capture::StreamCallback,
    config::samples_duration,
    device::RadioDevice,
    error::DeviceError,
};

/// Bytes per IQ pair on disk
const BYTES_PER_SAMPLE: u64 = 4;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FileRadio {
    path: PathBuf,
    repeat: bool,
    paced: bool,
}

pub struct FileHandle {
    reader: Mutex<Option<BufReader<File>>>,
    sample_rate: Mutex<u32>,
    frequency: Mutex<u64>,
    len: u64,
}

pub struct FileStream {
    reader: Mutex<BufReader<File>>,
    callback: Mutex<StreamCallback>,
    sample_rate: u32,
}

impl FileRadio {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            repeat: false,
            paced: true,
        }
    }

    /// Start over at the end of the file instead of ending the stream
    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Deliver blocks as fast as they can be read
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fill `words` from the reader, returning whole IQ pairs read. Zero means end of file.
    fn read_block(reader: &mut BufReader<File>, words: &mut [i16]) -> io::Result<usize> {
        let bytes = words.as_mut_byte_slice();
        let mut n = 0;
        while n < bytes.len() {
            match reader.read(&mut bytes[n..]) {
                Ok(0) => break,
                Ok(read) => n += read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let pairs = n / BYTES_PER_SAMPLE as usize;
        for w in &mut words[..pairs * 2] {
            *w = i16::from_le(*w);
        }
        Ok(pairs)
    }
}

impl FileHandle {
    /// The frequency the capture believes it is tuned to
    pub fn frequency(&self) -> u64 {
        *lock(&self.frequency)
    }
}

impl RadioDevice for FileRadio {
    type Handle = FileHandle;
    type Stream = FileStream;

    fn name(&self) -> &str {
        "file"
    }

    fn open(&self) -> Result<FileHandle, DeviceError> {
        let file = File::open(&self.path).map_err(|e| {
            DeviceError::new(e.raw_os_error().unwrap_or(-1), format!("{}: {e}", self.path.display()))
        })?;
        let len = file.metadata()?.len();
        info!("Replaying {} ({} samples)", self.path.display(), len / BYTES_PER_SAMPLE);
        Ok(FileHandle {
            reader: Mutex::new(Some(BufReader::with_capacity(1024 * 1024, file))),
            sample_rate: Mutex::new(0),
            frequency: Mutex::new(0),
            len,
        })
    }

    /// A recording is usable once it holds at least one whole IQ pair
    fn is_ready(&self, handle: &FileHandle) -> Result<bool, DeviceError> {
        Ok(handle.len >= BYTES_PER_SAMPLE)
    }

    fn set_frequency(&self, handle: &FileHandle, hz: u64) -> Result<(), DeviceError> {
        // Nothing to tune, the recording has whatever frequency it was made at
        *lock(&handle.frequency) = hz;
        Ok(())
    }

    fn set_sample_rate(&self, handle: &FileHandle, hz: u32) -> Result<u32, DeviceError> {
        *lock(&handle.sample_rate) = hz;
        Ok(hz)
    }

    fn set_bandwidth(&self, _handle: &FileHandle, hz: u32) -> Result<u32, DeviceError> {
        Ok(hz)
    }

    fn set_gain(&self, _handle: &FileHandle, _db: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn init_stream(
        &self,
        handle: &FileHandle,
        callback: StreamCallback,
    ) -> Result<FileStream, DeviceError> {
        let reader = lock(&handle.reader)
            .take()
            .ok_or_else(|| DeviceError::new(-1, "stream already initialized"))?;
        Ok(FileStream {
            reader: Mutex::new(reader),
            callback: Mutex::new(callback),
            sample_rate: *lock(&handle.sample_rate),
        })
    }

    fn enable(&self, _handle: &FileHandle) -> Result<(), DeviceError> {
        Ok(())
    }

    fn run_stream_blocking(&self, stream: &FileStream) -> Result<(), DeviceError> {
        let mut reader = lock(&stream.reader);
        let mut callback = lock(&stream.callback);
        let mut buffer = match callback.first_buffer() {
            Some(buffer) => buffer,
            None => return Ok(()),
        };
        let start = Instant::now();
        let mut total: u64 = 0;
        loop {
            let pairs = match Self::read_block(&mut reader, buffer.as_mut_words()) {
                Ok(pairs) => pairs,
                Err(e) => {
                    callback.reclaim(buffer);
                    return Err(e.into());
                }
            };
            if pairs == 0 {
                if self.repeat && total > 0 {
                    debug!("End of file, rewinding");
                    if let Err(e) = reader.seek(SeekFrom::Start(0)) {
                        callback.reclaim(buffer);
                        return Err(e.into());
                    }
                    continue;
                }
                info!("End of file: {}", self.path.display());
                callback.reclaim(buffer);
                return Ok(());
            }
            total += pairs as u64;
            if self.paced && stream.sample_rate > 0 {
                let due = samples_duration(total, stream.sample_rate);
                if let Some(wait) = due.checked_sub(start.elapsed()) {
                    thread::sleep(wait);
                }
            }
            buffer.set_filled(pairs);
            match callback.exchange(buffer) {
                Some(next) => buffer = next,
                None => break,
            }
        }
        debug!(total, "File stream stopped");
        Ok(())
    }

    fn disable(&self, _handle: &FileHandle) -> Result<(), DeviceError> {
        Ok(())
    }

    fn deinit_stream(&self, _stream: FileStream) {}

    fn close(&self, _handle: FileHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        complex::shift_down,
        config::StreamConfig,
        lifecycle::{start_capture, StopReason},
        session::SessionContext,
    };
    use std::{io::Write, sync::Arc, time::Duration};

    fn recording(name: &str, words: &[i16]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("btle_rf-{}-{name}.sc16", std::process::id()));
        let mut file = File::create(&path).unwrap();
        for w in words {
            file.write_all(&w.to_le_bytes()).unwrap();
        }
        path
    }

    #[test]
    fn test_replays_whole_file() {
        let words: Vec<i16> = (0..300).map(|i| (i * 11 - 1600) as i16).collect();
        let path = recording("whole", &words);
        let radio = Arc::new(FileRadio::new(&path).unpaced());
        let session = Arc::new(SessionContext::new(1024));
        let config = StreamConfig {
            samples_per_buffer: 64,
            ..Default::default()
        };
        let capture = start_capture(radio, Arc::clone(&session), config).unwrap();
        assert_eq!(capture.wait(Duration::from_millis(5)), StopReason::StreamEnded);
        capture.stop().unwrap();
        // 150 pairs, the last block short
        assert_eq!(session.buffer.cursor(), 300);
        for (i, w) in words.iter().enumerate() {
            assert_eq!(session.buffer.byte_at(i), shift_down(*w));
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_empty_file_is_not_ready() {
        let path = recording("empty", &[]);
        let radio = Arc::new(FileRadio::new(&path));
        let err = start_capture(radio, Arc::new(SessionContext::new(64)), StreamConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, crate::error::CaptureError::NotReady));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let radio = FileRadio::new("/nonexistent/capture.sc16");
        assert!(radio.open().is_err());
    }

    #[test]
    fn test_odd_tail_is_dropped() {
        let path = recording("odd", &[16, 32, 48]);
        let mut reader = BufReader::new(File::open(&path).unwrap());
        let mut words = [0i16; 8];
        assert_eq!(FileRadio::read_block(&mut reader, &mut words).unwrap(), 1);
        assert_eq!(words[..2], [16, 32]);
        std::fs::remove_file(path).unwrap();
    }
}

//! Stream configuration and the BLE defaults it starts from

use std::time::Duration;

use crate::{error::CaptureError, LEN_BUF, SAMPLE_PER_SYMBOL};

/// BLE advertising channel 37
pub const DEFAULT_FREQUENCY_HZ: u64 = 2_402_000_000;
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = SAMPLE_PER_SYMBOL * 1_000_000;
pub const DEFAULT_BANDWIDTH_HZ: u32 = DEFAULT_SAMPLE_RATE_HZ / 2;
pub const DEFAULT_GAIN_DB: i32 = 40;
pub const DEFAULT_BUFFER_COUNT: usize = 2;
pub const DEFAULT_SAMPLES_PER_BUFFER: usize = LEN_BUF / 2;
/// Hardware idle timeout for the stream
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_millis(100);

/// Everything the lifecycle applies to the radio before streaming starts.
/// Fixed for the lifetime of a capture, only the frequency can be retuned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub frequency_hz: u64,
    pub sample_rate_hz: u32,
    pub bandwidth_hz: u32,
    pub gain_db: i32,
    /// IQ pairs per hardware buffer
    pub samples_per_buffer: usize,
    /// Buffers rotating between hardware and driver, at least two
    pub buffer_count: usize,
    pub stream_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            bandwidth_hz: DEFAULT_BANDWIDTH_HZ,
            gain_db: DEFAULT_GAIN_DB,
            samples_per_buffer: DEFAULT_SAMPLES_PER_BUFFER,
            buffer_count: DEFAULT_BUFFER_COUNT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.frequency_hz == 0 {
            return Err(CaptureError::InvalidConfig("frequency must be non-zero".into()));
        }
        if self.sample_rate_hz == 0 {
            return Err(CaptureError::InvalidConfig("sample rate must be non-zero".into()));
        }
        if self.samples_per_buffer == 0 {
            return Err(CaptureError::InvalidConfig(
                "samples per buffer must be non-zero".into(),
            ));
        }
        if self.buffer_count < 2 {
            return Err(CaptureError::InvalidConfig(format!(
                "need at least 2 buffers, got {}",
                self.buffer_count
            )));
        }
        Ok(())
    }

    /// Wall time it takes the radio to fill one buffer at the configured rate
    pub fn buffer_period(&self) -> Duration {
        samples_duration(self.samples_per_buffer as u64, self.sample_rate_hz)
    }
}

/// Time `samples` IQ pairs span at `rate_hz`. Exact for any count, the
/// remainder is scaled on its own so nothing overflows.
pub fn samples_duration(samples: u64, rate_hz: u32) -> Duration {
    let rate = rate_hz.max(1) as u64;
    let secs = samples / rate;
    let nanos = (samples % rate) * 1_000_000_000 / rate;
    Duration::new(secs, nanos as u32)
}

/// Centre frequency of a BLE channel. Advertising channels are 37, 38 and 39,
/// data channels 0..=36 fill the gaps between them.
pub fn channel_frequency(channel: u8) -> Option<u64> {
    let mhz: u64 = match channel {
        37 => 2402,
        38 => 2426,
        39 => 2480,
        c @ 0..=10 => 2404 + 2 * c as u64,
        c @ 11..=36 => 2428 + 2 * (c as u64 - 11),
        _ => return None,
    };
    Some(mhz * 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StreamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sample_rate_hz, 4_000_000);
        assert_eq!(config.bandwidth_hz, 2_000_000);
        assert_eq!(config.samples_per_buffer, 16384);
    }

    #[test]
    fn test_rejects_single_buffer() {
        let config = StreamConfig {
            buffer_count: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CaptureError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_rate() {
        let config = StreamConfig {
            sample_rate_hz: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_period() {
        let config = StreamConfig {
            sample_rate_hz: 1_000_000,
            samples_per_buffer: 1000,
            ..Default::default()
        };
        assert_eq!(config.buffer_period(), Duration::from_millis(1));
    }

    #[test]
    fn test_samples_duration_long_running() {
        assert_eq!(samples_duration(6_000_000, 4_000_000), Duration::from_millis(1500));
        // Well past the point where nanosecond products leave u64
        let samples = 100_000_000_000u64;
        assert_eq!(
            samples_duration(samples, DEFAULT_SAMPLE_RATE_HZ),
            Duration::from_secs(25_000)
        );
        assert_eq!(
            samples_duration(u64::MAX, 1),
            Duration::from_secs(u64::MAX)
        );
        assert_eq!(samples_duration(3, 0), Duration::from_secs(3));
    }

    #[test]
    fn test_channel_frequency() {
        assert_eq!(channel_frequency(37), Some(2_402_000_000));
        assert_eq!(channel_frequency(38), Some(2_426_000_000));
        assert_eq!(channel_frequency(39), Some(2_480_000_000));
        assert_eq!(channel_frequency(0), Some(2_404_000_000));
        assert_eq!(channel_frequency(10), Some(2_424_000_000));
        assert_eq!(channel_frequency(11), Some(2_428_000_000));
        assert_eq!(channel_frequency(36), Some(2_478_000_000));
        assert_eq!(channel_frequency(40), None);
    }
}

//! Argument parsing for running from the command line

use std::{path::PathBuf, time::Duration};

use btle_rf::{
    config::{
        channel_frequency, DEFAULT_BANDWIDTH_HZ, DEFAULT_BUFFER_COUNT, DEFAULT_FREQUENCY_HZ,
        DEFAULT_GAIN_DB, DEFAULT_SAMPLES_PER_BUFFER, DEFAULT_SAMPLE_RATE_HZ,
    },
    StreamConfig,
};
use clap::Parser;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// Built-in simulated radio
    Sim,
    /// Replay a recorded SC16 capture
    File,
    /// bladeRF through libbladeRF (needs the `bladerf` feature)
    Bladerf,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Radio to capture from
    #[clap(short, long, value_enum, default_value = "sim")]
    pub device: DeviceKind,
    /// Recording to replay with `--device file` (interleaved little-endian i16 IQ)
    #[clap(short, long, required_if_eq("device", "file"))]
    pub input: Option<PathBuf>,
    /// Loop the recording instead of stopping at its end
    #[clap(long)]
    pub repeat: bool,
    /// Device identifier passed to libbladeRF (e.g. "*:serial=...")
    #[clap(long)]
    pub identifier: Option<String>,
    /// Center frequency in Hz
    #[clap(short, long, conflicts_with = "channel")]
    pub frequency: Option<u64>,
    /// BLE channel to tune to (37, 38, 39 advertising, 0-36 data)
    #[clap(short, long, value_parser = clap::value_parser!(u8).range(0..=39))]
    pub channel: Option<u8>,
    /// Sample rate in Hz
    #[clap(short = 'r', long, default_value_t = DEFAULT_SAMPLE_RATE_HZ)]
    pub sample_rate: u32,
    /// Analog bandwidth in Hz
    #[clap(short, long, default_value_t = DEFAULT_BANDWIDTH_HZ)]
    pub bandwidth: u32,
    /// RX gain in dB
    #[clap(short, long, default_value_t = DEFAULT_GAIN_DB, allow_hyphen_values = true)]
    pub gain: i32,
    /// Number of hardware buffers
    #[clap(long, default_value_t = DEFAULT_BUFFER_COUNT as u64)]
    #[clap(value_parser = clap::value_parser!(u64).range(2..))]
    pub buffers: u64,
    /// IQ pairs per hardware buffer
    #[clap(long, default_value_t = DEFAULT_SAMPLES_PER_BUFFER)]
    pub samples_per_buffer: usize,
    /// Stream idle timeout in milliseconds
    #[clap(long, default_value_t = 100)]
    pub timeout_ms: u64,
    /// How often to report throughput, in milliseconds
    #[clap(long, default_value_t = 1000)]
    pub stats_ms: u64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn frequency_hz(&self) -> u64 {
        match (self.frequency, self.channel) {
            (Some(hz), _) => hz,
            // Range-checked by the parser
            (None, Some(ch)) => channel_frequency(ch).unwrap_or(DEFAULT_FREQUENCY_HZ),
            (None, None) => DEFAULT_FREQUENCY_HZ,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            frequency_hz: self.frequency_hz(),
            sample_rate_hz: self.sample_rate,
            bandwidth_hz: self.bandwidth,
            gain_db: self.gain,
            samples_per_buffer: self.samples_per_buffer,
            buffer_count: self.buffers as usize,
            stream_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

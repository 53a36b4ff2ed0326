//! In this module, we trail the cyclic buffer the same way the demodulator does
//! and report how fast samples arrive and how strong they are.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::info;

use crate::session::SessionContext;

/// How often the monitor catches up with the writer. Has to stay well under
/// the time it takes the writer to lap the buffer.
const POLL: Duration = Duration::from_millis(1);

/// Mean absolute value of signed 8-bit samples
pub fn mean_magnitude(bytes: &[u8]) -> f32 {
    if bytes.is_empty() {
        return 0.0;
    }
    let sum: u64 = bytes
        .iter()
        .map(|b| (*b as i8).unsigned_abs() as u64)
        .sum();
    sum as f32 / bytes.len() as f32
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Stats {
    /// Bytes seen since the monitor started
    pub total_bytes: u64,
    /// IQ pairs per second over the last interval
    pub sample_rate: f64,
    /// Mean magnitude over the last interval
    pub level: f32,
}

/// Spawn the monitor thread. It exits once the stop flag is set and returns what it saw.
pub fn spawn_monitor(
    session: Arc<SessionContext>,
    interval: Duration,
) -> io::Result<JoinHandle<Stats>> {
    thread::Builder::new()
        .name("rf-monitor".into())
        .spawn(move || monitor(&session, interval))
}

fn monitor(session: &SessionContext, interval: Duration) -> Stats {
    let mut reader = session.buffer.reader();
    let mut scratch = vec![0u8; session.buffer.len()];
    let mut stats = Stats::default();
    let mut window_bytes = 0u64;
    let mut window_mag = 0f64;
    let mut window_start = Instant::now();
    while !session.stop.is_set() {
        thread::sleep(POLL);
        let n = reader.read_into(&mut scratch);
        window_bytes += n as u64;
        window_mag += mean_magnitude(&scratch[..n]) as f64 * n as f64;
        let elapsed = window_start.elapsed();
        if elapsed >= interval {
            stats.total_bytes += window_bytes;
            stats.sample_rate = (window_bytes / 2) as f64 / elapsed.as_secs_f64();
            stats.level = if window_bytes > 0 {
                (window_mag / window_bytes as f64) as f32
            } else {
                0.0
            };
            info!(
                "{:.3} Msps, level {:.1}",
                stats.sample_rate / 1e6,
                stats.level
            );
            window_bytes = 0;
            window_mag = 0.0;
            window_start = Instant::now();
        }
    }
    stats.total_bytes += window_bytes;
    stats
}

//! Bringing a radio from closed to streaming and back.
//!
//! Startup runs open, readiness, frequency, sample rate, bandwidth, gain,
//! stream init, stream timeout and enable in that order, then spawns the one
//! thread that owns the blocking stream call. Any failure releases what was
//! acquired so far in reverse order and no handle escapes.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use crate::{
    capture::{BufferPool, StreamCallback},
    config::StreamConfig,
    device::RadioDevice,
    error::{CaptureError, ConfigParam, DeviceError},
    session::SessionContext,
};

/// Extra time the stop path waits for the stream thread beyond the idle timeout
const JOIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Closed,
    Opened,
    Configured,
    StreamInitialized,
    Enabled,
    Running,
    Disabling,
}

/// Why [`Capture::wait`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stop flag was set (signal or explicit request)
    Requested,
    /// The stream call returned on its own, cleanly or with an error
    StreamEnded,
}

/// Resources acquired so far, released in reverse order
struct Acquired<'a, D: RadioDevice> {
    device: &'a D,
    handle: D::Handle,
    stream: Option<Arc<D::Stream>>,
    enabled: bool,
    state: LifecycleState,
}

impl<'a, D: RadioDevice> Acquired<'a, D> {
    fn advance(&mut self, state: LifecycleState) {
        debug!(from = ?self.state, to = ?state, "lifecycle");
        self.state = state;
    }

    /// Disable, deinit the stream, close. Steps that never happened are skipped.
    fn release(self) {
        if self.enabled {
            match self.device.disable(&self.handle) {
                Ok(()) => info!("Module disabled"),
                Err(e) => warn!("Failed to disable module: {e}"),
            }
        }
        if let Some(stream) = self.stream {
            match Arc::try_unwrap(stream) {
                Ok(stream) => {
                    self.device.deinit_stream(stream);
                    info!("Stream deinitialized");
                }
                Err(_) => error!("Stream still referenced by its thread, not deinitializing"),
            }
        }
        self.device.close(self.handle);
        info!(device = self.device.name(), "Device closed");
    }

    /// Unwind after a failed startup step
    fn fail(self, err: CaptureError) -> CaptureError {
        error!(state = ?self.state, "{err}");
        self.release();
        err
    }
}

fn log_applied(what: &str, requested: u32, actual: u32) {
    if actual == requested {
        info!("{what} set to {actual}Hz");
    } else {
        warn!("{what} set to {actual}Hz (requested {requested}Hz)");
    }
}

/// Bring up `device` with `config` and start streaming into `session`'s cyclic buffer
pub fn start_capture<D: RadioDevice>(
    device: Arc<D>,
    session: Arc<SessionContext>,
    config: StreamConfig,
) -> Result<Capture<D>, CaptureError> {
    config.validate()?;

    let handle = device.open().map_err(CaptureError::OpenFailed)?;
    info!(device = device.name(), "Device opened");
    let mut acq = Acquired {
        device: &*device,
        handle,
        stream: None,
        enabled: false,
        state: LifecycleState::Closed,
    };
    acq.advance(LifecycleState::Opened);

    match device.is_ready(&acq.handle) {
        Ok(true) => info!("FPGA is loaded"),
        Ok(false) => return Err(acq.fail(CaptureError::NotReady)),
        Err(e) => return Err(acq.fail(CaptureError::QueryFailed(e))),
    }

    if let Err(e) = device.set_frequency(&acq.handle, config.frequency_hz) {
        return Err(acq.fail(CaptureError::config(ConfigParam::Frequency)(e)));
    }
    info!("Frequency set to {}Hz", config.frequency_hz);

    match device.set_sample_rate(&acq.handle, config.sample_rate_hz) {
        Ok(actual) => log_applied("Sample rate", config.sample_rate_hz, actual),
        Err(e) => return Err(acq.fail(CaptureError::config(ConfigParam::SampleRate)(e))),
    }

    match device.set_bandwidth(&acq.handle, config.bandwidth_hz) {
        Ok(actual) => log_applied("Bandwidth", config.bandwidth_hz, actual),
        Err(e) => return Err(acq.fail(CaptureError::config(ConfigParam::Bandwidth)(e))),
    }

    if let Err(e) = device.set_gain(&acq.handle, config.gain_db) {
        return Err(acq.fail(CaptureError::config(ConfigParam::Gain)(e)));
    }
    info!("Gain set to {}dB", config.gain_db);
    acq.advance(LifecycleState::Configured);

    let pool = match BufferPool::try_new(config.buffer_count, config.samples_per_buffer) {
        Ok(pool) => pool,
        Err(e) => return Err(acq.fail(e)),
    };
    let callback = StreamCallback::new(Arc::clone(&session), pool);
    match device.init_stream(&acq.handle, callback) {
        // The only owner until the stream thread takes a clone
        Ok(stream) => acq.stream = Some(Arc::new(stream)),
        Err(e) => return Err(acq.fail(CaptureError::StreamInitFailed(e))),
    }
    info!(
        buffers = config.buffer_count,
        samples_per_buffer = config.samples_per_buffer,
        "Stream initialized"
    );
    acq.advance(LifecycleState::StreamInitialized);

    if let Err(e) = device.set_stream_timeout(&acq.handle, config.stream_timeout) {
        warn!("Failed to set stream timeout: {e}");
    }

    if let Err(e) = device.enable(&acq.handle) {
        return Err(acq.fail(CaptureError::EnableFailed(e)));
    }
    acq.enabled = true;
    info!("Module enabled");
    acq.advance(LifecycleState::Enabled);

    let Some(stream) = acq.stream.as_ref().map(Arc::clone) else {
        return Err(acq.fail(CaptureError::NotRunning));
    };
    let (exit_tx, exit_rx) = bounded(1);
    let streaming = Arc::new(AtomicBool::new(true));
    let worker = {
        let device = Arc::clone(&device);
        let streaming = Arc::clone(&streaming);
        thread::Builder::new()
            .name("rf-stream".into())
            .spawn(move || {
                // Start stream and stay there until the callback ends it
                let result = device.run_stream_blocking(&stream);
                match &result {
                    Ok(()) => debug!("Stream returned"),
                    Err(e) => error!("RX stream failure: {e}"),
                }
                drop(stream);
                streaming.store(false, Ordering::SeqCst);
                let _ = exit_tx.send(());
                result
            })
    };
    let worker = match worker {
        Ok(worker) => worker,
        Err(e) => return Err(acq.fail(CaptureError::ThreadSpawnFailed(e))),
    };
    acq.advance(LifecycleState::Running);

    let Acquired {
        handle,
        stream,
        enabled,
        state,
        ..
    } = acq;
    Ok(Capture {
        device,
        session,
        config,
        handle: Some(handle),
        stream,
        enabled,
        worker: Some(worker),
        streaming,
        exited: exit_rx,
        state,
    })
}

/// A live capture: the open radio plus the thread streaming from it
pub struct Capture<D: RadioDevice> {
    device: Arc<D>,
    session: Arc<SessionContext>,
    config: StreamConfig,
    handle: Option<D::Handle>,
    stream: Option<Arc<D::Stream>>,
    enabled: bool,
    worker: Option<JoinHandle<Result<(), DeviceError>>>,
    streaming: Arc<AtomicBool>,
    exited: Receiver<()>,
    state: LifecycleState,
}

impl<D: RadioDevice> Capture<D> {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Whether the stream thread is still inside the blocking call
    pub fn is_streaming(&self) -> bool {
        self.worker.is_some() && self.streaming.load(Ordering::SeqCst)
    }

    /// Retune while streaming. Streaming is not paused, so the cyclic buffer
    /// holds samples from both frequencies around the switch.
    pub fn retune(&self, hz: u64) -> Result<(), CaptureError> {
        let handle = match &self.handle {
            Some(handle) if self.state == LifecycleState::Running && self.is_streaming() => handle,
            _ => return Err(CaptureError::NotRunning),
        };
        self.device
            .set_frequency(handle, hz)
            .map_err(CaptureError::config(ConfigParam::Frequency))?;
        info!("Retuned to {hz}Hz");
        Ok(())
    }

    /// Block until a stop is requested or the stream ends by itself, checking
    /// the stop flag every `poll`
    pub fn wait(&self, poll: Duration) -> StopReason {
        loop {
            if self.session.stop.is_set() {
                return StopReason::Requested;
            }
            match self.exited.recv_timeout(poll) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return StopReason::StreamEnded,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    /// Stop streaming and release the radio.
    ///
    /// Returns [`CaptureError::StreamFailed`] if the stream had died on its own;
    /// the radio is released either way.
    pub fn stop(mut self) -> Result<(), CaptureError> {
        match self.shutdown() {
            Some(e) => Err(CaptureError::StreamFailed(e)),
            None => Ok(()),
        }
    }

    fn shutdown(&mut self) -> Option<DeviceError> {
        if self.state == LifecycleState::Closed {
            return None;
        }
        info!("Stopping capture");
        self.state = LifecycleState::Disabling;
        self.session.stop.request();

        let mut failure = None;
        if let Some(worker) = self.worker.take() {
            let bound = self.config.stream_timeout + JOIN_GRACE;
            let started = Instant::now();
            if let Err(RecvTimeoutError::Timeout) = self.exited.recv_timeout(bound) {
                warn!("Stream thread still running after {bound:?}, waiting for it");
            }
            match worker.join() {
                Ok(Ok(())) => info!("RX thread quit after {:?}", started.elapsed()),
                Ok(Err(e)) => failure = Some(e),
                Err(_) => error!("RX thread panicked"),
            }
        }

        let torn_down = self
            .stream
            .as_ref()
            .map_or(false, |s| self.device.stream_torn_down(s));
        if torn_down {
            debug!("Stream already torn down, skipping disable");
        }

        let stream = self.stream.take();
        if let Some(handle) = self.handle.take() {
            Acquired {
                device: &*self.device,
                handle,
                stream,
                enabled: self.enabled && !torn_down,
                state: self.state,
            }
            .release();
        }
        self.enabled = false;
        self.state = LifecycleState::Closed;
        failure
    }
}

impl<D: RadioDevice> Drop for Capture<D> {
    fn drop(&mut self) {
        if let Some(e) = self.shutdown() {
            error!("Capture ended with a stream failure: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        complex::shift_down,
        sim::{Call, Fault, SimulatedRadio},
    };

    fn session() -> Arc<SessionContext> {
        Arc::new(SessionContext::new(4096))
    }

    fn quick_config() -> StreamConfig {
        StreamConfig {
            samples_per_buffer: 64,
            stream_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_scenario_one_buffer() {
        let radio = Arc::new(
            SimulatedRadio::new()
                .with_buffer_limit(1)
                .with_source(|words: &mut [i16]| {
                    for (i, w) in words.iter_mut().enumerate() {
                        *w = i as i16 * 13 - 1000;
                    }
                }),
        );
        let session = session();
        let config = StreamConfig {
            frequency_hz: 2_440_000_000,
            sample_rate_hz: 20,
            bandwidth_hz: 10,
            gain_db: 40,
            samples_per_buffer: 100,
            ..Default::default()
        };
        let capture = start_capture(Arc::clone(&radio), Arc::clone(&session), config).unwrap();
        assert_eq!(capture.state(), LifecycleState::Running);
        assert!(wait_for(|| session.buffer.cursor() == 200));
        for i in 0..200 {
            assert_eq!(session.buffer.byte_at(i), shift_down(i as i16 * 13 - 1000));
        }
        capture.stop().unwrap();
        // Only the one buffer went through, the rest were empty callbacks
        assert_eq!(session.buffer.cursor(), 200);
        assert_eq!(
            radio.calls()[..6],
            [
                Call::Open,
                Call::IsReady,
                Call::SetFrequency(2_440_000_000),
                Call::SetSampleRate(20),
                Call::SetBandwidth(10),
                Call::SetGain(40),
            ]
        );
    }

    #[test]
    fn test_bandwidth_failure_unwinds() {
        let radio = Arc::new(SimulatedRadio::new().failing_at(Fault::Bandwidth));
        let err = start_capture(Arc::clone(&radio), session(), quick_config())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CaptureError::ConfigFailed {
                param: ConfigParam::Bandwidth,
                ..
            }
        ));
        assert!(err.to_string().contains("bandwidth"));
        assert_eq!(radio.count(|c| matches!(c, Call::Close)), 1);
        assert_eq!(radio.count(|c| matches!(c, Call::SetGain(_))), 0);
        assert_eq!(radio.count(|c| matches!(c, Call::InitStream)), 0);
        assert_eq!(radio.calls().last(), Some(&Call::Close));
    }

    #[test]
    fn test_each_setup_failure_closes_once() {
        let config = quick_config();
        let steps = [
            Call::Open,
            Call::IsReady,
            Call::SetFrequency(config.frequency_hz),
            Call::SetSampleRate(config.sample_rate_hz),
            Call::SetBandwidth(config.bandwidth_hz),
            Call::SetGain(config.gain_db),
            Call::InitStream,
        ];
        let cases = [
            (Fault::ReadyQuery, 2),
            (Fault::Frequency, 3),
            (Fault::SampleRate, 4),
            (Fault::Bandwidth, 5),
            (Fault::Gain, 6),
            (Fault::InitStream, 7),
        ];
        for (fault, reached) in cases {
            let radio = Arc::new(SimulatedRadio::new().failing_at(fault));
            let err = start_capture(Arc::clone(&radio), session(), config.clone())
                .err()
                .unwrap();
            match fault {
                Fault::ReadyQuery => assert!(matches!(err, CaptureError::QueryFailed(_))),
                Fault::InitStream => assert!(matches!(err, CaptureError::StreamInitFailed(_))),
                _ => assert!(matches!(err, CaptureError::ConfigFailed { .. })),
            }
            let mut expected = steps[..reached].to_vec();
            expected.push(Call::Close);
            assert_eq!(radio.calls(), expected, "{fault:?}");
        }
    }

    #[test]
    fn test_config_failure_names_parameter() {
        let cases = [
            (Fault::Frequency, ConfigParam::Frequency),
            (Fault::SampleRate, ConfigParam::SampleRate),
            (Fault::Bandwidth, ConfigParam::Bandwidth),
            (Fault::Gain, ConfigParam::Gain),
        ];
        for (fault, expected) in cases {
            let radio = Arc::new(SimulatedRadio::new().failing_at(fault));
            match start_capture(radio, session(), quick_config()) {
                Err(CaptureError::ConfigFailed { param, .. }) => assert_eq!(param, expected),
                other => panic!("{fault:?}: unexpected {:?}", other.err()),
            }
        }
    }

    #[test]
    fn test_not_ready_fails_fast() {
        let radio = Arc::new(SimulatedRadio::new().failing_at(Fault::NotReady));
        let err = start_capture(Arc::clone(&radio), session(), quick_config())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::NotReady));
        assert_eq!(radio.calls(), vec![Call::Open, Call::IsReady, Call::Close]);
    }

    #[test]
    fn test_open_failure_closes_nothing() {
        let radio = Arc::new(SimulatedRadio::new().failing_at(Fault::Open));
        let err = start_capture(Arc::clone(&radio), session(), quick_config())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::OpenFailed(_)));
        assert_eq!(radio.calls(), vec![Call::Open]);
    }

    #[test]
    fn test_invalid_config_touches_nothing() {
        let radio = Arc::new(SimulatedRadio::new());
        let config = StreamConfig {
            buffer_count: 1,
            ..quick_config()
        };
        let err = start_capture(Arc::clone(&radio), session(), config)
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::InvalidConfig(_)));
        assert!(radio.calls().is_empty());
    }

    #[test]
    fn test_enable_failure_deinits_stream() {
        let radio = Arc::new(SimulatedRadio::new().failing_at(Fault::Enable));
        let err = start_capture(Arc::clone(&radio), session(), quick_config())
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::EnableFailed(_)));
        let calls = radio.calls();
        assert_eq!(
            calls[calls.len() - 3..],
            [
                Call::Enable,
                Call::DeinitStream { in_flight: 0 },
                Call::Close
            ]
        );
        assert_eq!(radio.count(|c| matches!(c, Call::Disable)), 0);
        assert_eq!(radio.count(|c| matches!(c, Call::RunStream)), 0);
    }

    #[test]
    fn test_stream_timeout_failure_is_not_fatal() {
        let radio = Arc::new(SimulatedRadio::new().failing_at(Fault::StreamTimeout));
        let capture = start_capture(Arc::clone(&radio), session(), quick_config()).unwrap();
        capture.stop().unwrap();
        assert_eq!(radio.count(|c| matches!(c, Call::Enable)), 1);
    }

    #[test]
    fn test_clamped_rate_is_not_fatal() {
        let radio = Arc::new(SimulatedRadio::new().with_max_sample_rate(1_000_000));
        let capture = start_capture(Arc::clone(&radio), session(), quick_config()).unwrap();
        assert_eq!(radio.applied_sample_rate(), Some(1_000_000));
        capture.stop().unwrap();
    }

    #[test]
    fn test_start_stop_releases_in_order() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = session();
        let capture = start_capture(Arc::clone(&radio), Arc::clone(&session), quick_config()).unwrap();
        assert!(wait_for(|| session.buffer.cursor() != 0));
        let started = Instant::now();
        capture.stop().unwrap();
        assert!(started.elapsed() < Duration::from_millis(100) + Duration::from_millis(250));
        assert!(session.stop.is_set());
        let calls = radio.calls();
        assert_eq!(
            calls[calls.len() - 3..],
            [
                Call::Disable,
                Call::DeinitStream { in_flight: 0 },
                Call::Close
            ]
        );
        assert_eq!(radio.count(|c| matches!(c, Call::Close)), 1);
    }

    #[test]
    fn test_stop_flag_before_start() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = session();
        session.stop.request();
        let capture = start_capture(Arc::clone(&radio), Arc::clone(&session), quick_config()).unwrap();
        assert_eq!(capture.wait(Duration::from_millis(10)), StopReason::Requested);
        assert!(wait_for(|| !capture.is_streaming()));
        capture.stop().unwrap();
        // The one block already delivered is kept, then the stream ends
        assert_eq!(session.buffer.cursor(), 64 * 2);
        assert_eq!(radio.count(|c| matches!(c, Call::DeinitStream { in_flight: 0 })), 1);
    }

    #[test]
    fn test_retune_while_running() {
        let radio = Arc::new(SimulatedRadio::new());
        let capture = start_capture(Arc::clone(&radio), session(), quick_config()).unwrap();
        capture.retune(2_426_000_000).unwrap();
        assert_eq!(radio.count(|c| *c == Call::SetFrequency(2_426_000_000)), 1);
        capture.stop().unwrap();
    }

    #[test]
    fn test_stream_failure_skips_disable() {
        let radio = Arc::new(SimulatedRadio::new().with_stream_failure_after(3));
        let session = session();
        let capture = start_capture(Arc::clone(&radio), Arc::clone(&session), quick_config()).unwrap();
        assert_eq!(capture.wait(Duration::from_millis(10)), StopReason::StreamEnded);
        assert!(matches!(
            capture.retune(2_480_000_000),
            Err(CaptureError::NotRunning)
        ));
        assert!(matches!(capture.stop(), Err(CaptureError::StreamFailed(_))));
        assert_eq!(session.buffer.cursor(), 3 * 64 * 2);
        assert_eq!(radio.count(|c| matches!(c, Call::Disable)), 0);
        assert_eq!(radio.count(|c| matches!(c, Call::DeinitStream { in_flight: 0 })), 1);
        assert_eq!(radio.count(|c| matches!(c, Call::Close)), 1);
    }

    #[test]
    fn test_drop_releases_radio() {
        let radio = Arc::new(SimulatedRadio::new());
        {
            let _capture = start_capture(Arc::clone(&radio), session(), quick_config()).unwrap();
        }
        assert_eq!(radio.count(|c| matches!(c, Call::Close)), 1);
        assert_eq!(radio.count(|c| matches!(c, Call::Disable)), 1);
    }
}

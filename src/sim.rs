//! An in-process radio for dry runs and tests.
//!
//! It records every capability call, can be told to fail at any setup step or
//! partway through the stream, and fills buffers from a caller-supplied source.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use tracing::{debug, trace};

use crate::{capture::StreamCallback, device::RadioDevice, error::DeviceError};

/// Fills one buffer worth of interleaved `I, Q` words
pub type SampleSource = Box<dyn FnMut(&mut [i16]) + Send>;

/// A capability call as the radio saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open,
    IsReady,
    SetFrequency(u64),
    SetSampleRate(u32),
    SetBandwidth(u32),
    SetGain(i32),
    InitStream,
    SetStreamTimeout(Duration),
    Enable,
    RunStream,
    Disable,
    /// Buffers the radio still held when the stream was torn down
    DeinitStream { in_flight: usize },
    Close,
}

/// Where to inject a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Open,
    /// The readiness query itself errors
    ReadyQuery,
    /// The readiness query answers "not loaded"
    NotReady,
    Frequency,
    SampleRate,
    Bandwidth,
    Gain,
    InitStream,
    StreamTimeout,
    Enable,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimulatedRadio {
    calls: Mutex<Vec<Call>>,
    fault: Option<Fault>,
    max_sample_rate: Option<u32>,
    applied_sample_rate: Mutex<Option<u32>>,
    buffer_limit: Option<usize>,
    fail_after: Option<usize>,
    buffer_period: Duration,
    source: Mutex<SampleSource>,
}

pub struct SimHandle {
    _private: (),
}

pub struct SimStream {
    callback: Mutex<StreamCallback>,
    torn_down: AtomicBool,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    /// A healthy radio delivering a slow ramp every millisecond, forever
    pub fn new() -> Self {
        let mut phase = 0i16;
        Self {
            calls: Mutex::new(Vec::new()),
            fault: None,
            max_sample_rate: None,
            applied_sample_rate: Mutex::new(None),
            buffer_limit: None,
            fail_after: None,
            buffer_period: Duration::from_millis(1),
            source: Mutex::new(Box::new(move |words: &mut [i16]| {
                for w in words.iter_mut() {
                    *w = phase;
                    phase = if phase >= 2047 { -2048 } else { phase + 1 };
                }
            })),
        }
    }

    pub fn failing_at(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Clamp requested sample rates, like hardware with a narrower range
    pub fn with_max_sample_rate(mut self, hz: u32) -> Self {
        self.max_sample_rate = Some(hz);
        self
    }

    /// Deliver only `n` filled buffers, then keep calling back with empty ones
    pub fn with_buffer_limit(mut self, n: usize) -> Self {
        self.buffer_limit = Some(n);
        self
    }

    /// Fail the running stream after `n` filled buffers
    pub fn with_stream_failure_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn with_buffer_period(mut self, period: Duration) -> Self {
        self.buffer_period = period;
        self
    }

    pub fn with_source<F>(self, source: F) -> Self
    where
        F: FnMut(&mut [i16]) + Send + 'static,
    {
        *lock(&self.source) = Box::new(source);
        self
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| pred(c)).count()
    }

    pub fn applied_sample_rate(&self) -> Option<u32> {
        *lock(&self.applied_sample_rate)
    }

    fn record(&self, call: Call) {
        trace!(?call, "sim");
        lock(&self.calls).push(call);
    }

    fn check(&self, fault: Fault) -> Result<(), DeviceError> {
        if self.fault == Some(fault) {
            Err(DeviceError::new(-1, format!("simulated {fault:?} failure")))
        } else {
            Ok(())
        }
    }
}

impl RadioDevice for SimulatedRadio {
    type Handle = SimHandle;
    type Stream = SimStream;

    fn name(&self) -> &str {
        "sim"
    }

    fn open(&self) -> Result<SimHandle, DeviceError> {
        self.record(Call::Open);
        self.check(Fault::Open)?;
        Ok(SimHandle { _private: () })
    }

    fn is_ready(&self, _handle: &SimHandle) -> Result<bool, DeviceError> {
        self.record(Call::IsReady);
        self.check(Fault::ReadyQuery)?;
        Ok(self.fault != Some(Fault::NotReady))
    }

    fn set_frequency(&self, _handle: &SimHandle, hz: u64) -> Result<(), DeviceError> {
        self.record(Call::SetFrequency(hz));
        self.check(Fault::Frequency)
    }

    fn set_sample_rate(&self, _handle: &SimHandle, hz: u32) -> Result<u32, DeviceError> {
        self.record(Call::SetSampleRate(hz));
        self.check(Fault::SampleRate)?;
        let actual = self.max_sample_rate.map_or(hz, |max| hz.min(max));
        *lock(&self.applied_sample_rate) = Some(actual);
        Ok(actual)
    }

    fn set_bandwidth(&self, _handle: &SimHandle, hz: u32) -> Result<u32, DeviceError> {
        self.record(Call::SetBandwidth(hz));
        self.check(Fault::Bandwidth)?;
        Ok(hz)
    }

    fn set_gain(&self, _handle: &SimHandle, db: i32) -> Result<(), DeviceError> {
        self.record(Call::SetGain(db));
        self.check(Fault::Gain)
    }

    fn init_stream(
        &self,
        _handle: &SimHandle,
        callback: StreamCallback,
    ) -> Result<SimStream, DeviceError> {
        self.record(Call::InitStream);
        self.check(Fault::InitStream)?;
        Ok(SimStream {
            callback: Mutex::new(callback),
            torn_down: AtomicBool::new(false),
        })
    }

    fn set_stream_timeout(&self, _handle: &SimHandle, timeout: Duration) -> Result<(), DeviceError> {
        self.record(Call::SetStreamTimeout(timeout));
        self.check(Fault::StreamTimeout)
    }

    fn enable(&self, _handle: &SimHandle) -> Result<(), DeviceError> {
        self.record(Call::Enable);
        self.check(Fault::Enable)
    }

    fn run_stream_blocking(&self, stream: &SimStream) -> Result<(), DeviceError> {
        self.record(Call::RunStream);
        let mut callback = lock(&stream.callback);
        let mut source = lock(&self.source);
        let mut buffer = match callback.first_buffer() {
            Some(buffer) => buffer,
            None => return Ok(()),
        };
        let mut delivered = 0usize;
        loop {
            thread::sleep(self.buffer_period);
            if self.fail_after == Some(delivered) {
                callback.reclaim(buffer);
                stream.torn_down.store(true, Ordering::SeqCst);
                return Err(DeviceError::new(-1, "simulated transfer failure"));
            }
            if self.buffer_limit.map_or(true, |limit| delivered < limit) {
                (*source)(buffer.as_mut_words());
                let capacity = buffer.capacity();
                buffer.set_filled(capacity);
                delivered += 1;
            } else {
                buffer.set_filled(0);
            }
            match callback.exchange(buffer) {
                Some(next) => buffer = next,
                None => break,
            }
        }
        debug!(delivered, "sim stream finished");
        Ok(())
    }

    fn stream_torn_down(&self, stream: &SimStream) -> bool {
        stream.torn_down.load(Ordering::SeqCst)
    }

    fn disable(&self, _handle: &SimHandle) -> Result<(), DeviceError> {
        self.record(Call::Disable);
        Ok(())
    }

    fn deinit_stream(&self, stream: SimStream) {
        let callback = stream
            .callback
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        self.record(Call::DeinitStream {
            in_flight: callback.pool().in_flight(),
        });
    }

    fn close(&self, _handle: SimHandle) {
        self.record(Call::Close);
    }
}

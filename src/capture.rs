//! This module contains the stream callback logic

// The radio calls back every time it has filled a buffer, and in the same call
// wants the next buffer to fill. The callback does one thing, as fast as possible:
// copy the block into the cyclic buffer and hand back the next pool buffer.
// Handing back nothing tells the radio to wind the stream down.

use std::sync::Arc;

use tracing::{error, trace};

use crate::{complex::iq_pairs, error::CaptureError, session::SessionContext};

/// One hardware buffer, moved to the radio while it is being filled and back
/// to the pool when the callback receives it. Samples are interleaved `I, Q` words.
#[derive(Debug)]
pub struct SampleBuffer {
    index: usize,
    data: Vec<i16>,
    filled: usize,
}

impl SampleBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Capacity in IQ pairs
    pub fn capacity(&self) -> usize {
        self.data.len() / 2
    }

    /// The whole buffer, for the radio to write into
    pub fn as_mut_words(&mut self) -> &mut [i16] {
        &mut self.data
    }

    /// Mark how many IQ pairs the radio actually delivered
    pub fn set_filled(&mut self, pairs: usize) {
        self.filled = pairs.min(self.capacity());
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    /// The delivered words
    pub fn samples(&self) -> &[i16] {
        &self.data[..self.filled * 2]
    }
}

/// Equal-sized buffers rotating between radio and driver.
/// A slot holding `None` is currently owned by the radio.
///
/// Memory is only allocated when a buffer is first checked out. Radios that
/// bring their own buffers (libbladeRF) just rotate indices and never pay for it.
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<Option<Vec<i16>>>,
    next: usize,
    samples_per_buffer: usize,
    allocated: usize,
}

impl BufferPool {
    pub fn try_new(count: usize, samples_per_buffer: usize) -> Result<Self, CaptureError> {
        if count < 2 {
            return Err(CaptureError::InvalidConfig(format!(
                "buffer pool needs at least two buffers, got {count}"
            )));
        }
        Ok(Self {
            slots: (0..count).map(|_| Some(Vec::new())).collect(),
            next: 0,
            samples_per_buffer,
            allocated: 0,
        })
    }

    /// # Panics
    ///
    /// If `count` is less than two.
    pub fn new(count: usize, samples_per_buffer: usize) -> Self {
        match Self::try_new(count, samples_per_buffer) {
            Ok(pool) => pool,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn samples_per_buffer(&self) -> usize {
        self.samples_per_buffer
    }

    /// Buffers currently owned by the radio
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Index of the next buffer to hand out, round robin
    pub fn advance(&mut self) -> usize {
        let idx = self.next;
        self.next = (self.next + 1) % self.slots.len();
        idx
    }

    /// Buffers that have been given backing memory so far
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Move buffer `idx` to the radio. `None` if it is already out.
    pub fn checkout(&mut self, idx: usize) -> Option<SampleBuffer> {
        let mut data = self.slots[idx].take()?;
        let words = self.samples_per_buffer * 2;
        if data.len() != words {
            data.resize(words, 0);
            self.allocated += 1;
        }
        Some(SampleBuffer {
            index: idx,
            data,
            filled: 0,
        })
    }

    /// Take a buffer back from the radio
    pub fn checkin(&mut self, buffer: SampleBuffer) {
        let slot = &mut self.slots[buffer.index];
        debug_assert!(slot.is_none(), "buffer {} returned twice", buffer.index);
        *slot = Some(buffer.data);
    }
}

/// The driver side of the buffer exchange.
///
/// The radio invokes this serially from a single execution context, so the pool
/// rotation needs no lock; only the cyclic buffer copy is locked.
pub struct StreamCallback {
    session: Arc<SessionContext>,
    pool: BufferPool,
    invocations: u64,
}

impl StreamCallback {
    pub fn new(session: Arc<SessionContext>, pool: BufferPool) -> Self {
        Self {
            session,
            pool,
            invocations: 0,
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Prime the radio with its first buffer before the first callback
    pub fn first_buffer(&mut self) -> Option<SampleBuffer> {
        let idx = self.pool.advance();
        self.pool.checkout(idx)
    }

    /// Core of the protocol, for radios that own their buffer memory.
    ///
    /// Copies the delivered words into the cyclic buffer and returns the index
    /// of the pool buffer to fill next, or `None` once a stop was requested.
    /// A delivered block is always copied, the flag is only checked afterwards.
    pub fn on_samples(&mut self, samples: &[i16]) -> Option<usize> {
        self.invocations += 1;
        if samples.len() >= 2 {
            self.session.buffer.write_iq(iq_pairs(samples));
        }
        if self.session.stop.is_set() {
            trace!("stop requested, ending stream");
            return None;
        }
        Some(self.pool.advance())
    }

    /// Exchange a filled buffer for the next empty one, for radios that fill
    /// pool buffers directly. `None` ends the stream, the pool then owns every buffer.
    pub fn exchange(&mut self, filled: SampleBuffer) -> Option<SampleBuffer> {
        let next = self.on_samples(filled.samples());
        self.pool.checkin(filled);
        let idx = next?;
        let buffer = self.pool.checkout(idx);
        if buffer.is_none() {
            // Only one buffer is ever out and it was just returned
            error!(idx, "next pool buffer still owned by the radio");
        }
        buffer
    }

    /// Hand a buffer back without delivering it, when the stream ends abnormally
    pub fn reclaim(&mut self, buffer: SampleBuffer) {
        self.pool.checkin(buffer);
    }
}

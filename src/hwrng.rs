//! Random bits from the jitter of a floating ADC input.
//!
//! Each sample is folded into one of eight 16 bit accumulators, which is rotated first. After
//! 128 samples (sixteen per accumulator) the accumulators hold 16 bytes worth of output. The
//! conversion interrupt calls [`HwRng::feed`]. A polled converter is driven through
//! [`HwRng::poll`], which long transfers and flash waits call between their steps.
//!
//! Filling pad material goes through two paragraph buffers: the "rng" buffer is filled while the
//! "nand" buffer is written to flash and sent to the twin, then [`HwRng::swap`] exchanges them.

use crate::error::Error;
use crate::platform::EntropySource;
use crate::raw::{PARAGRAPH_SIZE, Paragraph};

const ACCUMULATORS: usize = 8;
const SAMPLES_PER_CYCLE: usize = 16 * ACCUMULATORS;
// has to be odd so every bit position gets mixed
const ROTATION: u32 = 5;

/// Bytes produced by one sampling cycle.
pub const CYCLE_BYTES: usize = 2 * ACCUMULATORS;

pub struct HwRng<S: EntropySource> {
    source: S,
    bits: [u16; ACCUMULATORS],
    idx: usize,
    sampling: bool,

    buffers: [Paragraph; 2],
    nand: usize,
    fill_len: usize,
    filled: usize,
    filling: bool,
}

impl<S: EntropySource> HwRng<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            bits: [0; ACCUMULATORS],
            idx: SAMPLES_PER_CYCLE,
            sampling: false,
            buffers: [[0u8; PARAGRAPH_SIZE]; 2],
            nand: 0,
            fill_len: 0,
            filled: 0,
            filling: false,
        }
    }

    /// Clear the accumulators and begin a sampling cycle.
    pub fn start(&mut self) {
        self.bits = [0; ACCUMULATORS];
        self.idx = 0;
        self.sampling = true;
    }

    pub fn done(&self) -> bool {
        self.idx >= SAMPLES_PER_CYCLE
    }

    /// The accumulators, only meaningful once [`HwRng::done`] returns true.
    pub fn bits(&self) -> &[u16; ACCUMULATORS] {
        &self.bits
    }

    /// Body of the conversion complete interrupt.
    pub fn feed(&mut self, sample: u16) {
        if !self.sampling {
            return;
        }

        let slot = self.idx % ACCUMULATORS;
        self.bits[slot] = self.bits[slot].rotate_left(ROTATION) ^ sample;
        self.idx += 1;

        if self.idx < SAMPLES_PER_CYCLE {
            return;
        }

        if self.filling {
            let target = &mut self.buffers[1 - self.nand];
            let take = CYCLE_BYTES.min(self.fill_len - self.filled);
            for (i, byte) in target[self.filled..self.filled + take].iter_mut().enumerate() {
                *byte = self.bits[i / 2].to_le_bytes()[i % 2];
            }
            self.filled += take;

            if self.filled < self.fill_len {
                // keep the accumulators, they only get better
                self.idx = 0;
                return;
            }
            self.filling = false;
        }
        self.sampling = false;
    }

    /// Take one conversion from the source and feed it. Stands in for the interrupt when the
    /// converter is polled. Does nothing between cycles.
    pub fn poll(&mut self) {
        if !self.sampling {
            return;
        }
        let sample = self.source.sample();
        self.feed(sample);
    }

    /// Start filling the first `len` bytes of the rng buffer.
    pub fn bits_start(&mut self, len: usize) -> Result<(), Error> {
        if self.filling {
            return Err(Error::RngBusy);
        }

        self.fill_len = len.min(PARAGRAPH_SIZE);
        self.filled = 0;
        self.filling = self.fill_len > 0;
        self.start();
        if !self.filling {
            self.idx = SAMPLES_PER_CYCLE;
            self.sampling = false;
        }
        Ok(())
    }

    pub fn bits_done(&self) -> bool {
        !self.filling
    }

    /// Poll the converter until the current fill is complete.
    pub fn wait_bits(&mut self) {
        while !self.bits_done() {
            self.poll();
        }
    }

    /// Exchange the nand and rng buffers. Refused while the rng buffer is being filled.
    pub fn swap(&mut self) -> Result<(), Error> {
        if self.filling {
            return Err(Error::RngBusy);
        }
        self.nand = 1 - self.nand;
        Ok(())
    }

    /// The buffer holding the last completed fill, after a [`HwRng::swap`].
    pub fn nand_buffer(&self) -> &Paragraph {
        &self.buffers[self.nand]
    }

    /// The buffer being filled. Only handed out while no fill is running.
    pub fn rng_buffer(&self) -> Result<&Paragraph, Error> {
        if self.filling {
            return Err(Error::RngBusy);
        }
        Ok(&self.buffers[1 - self.nand])
    }

    /// One full sampling cycle, read straight from the accumulators.
    pub fn read_raw(&mut self) -> Result<[u8; CYCLE_BYTES], Error> {
        if self.filling {
            return Err(Error::RngBusy);
        }

        self.start();
        while !self.done() {
            self.poll();
        }

        let mut out = [0u8; CYCLE_BYTES];
        for (chunk, word) in out.chunks_exact_mut(2).zip(self.bits.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(out)
    }

    pub fn fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        for chunk in dest.chunks_mut(CYCLE_BYTES) {
            let cycle = self.read_raw()?;
            chunk.copy_from_slice(&cycle[..chunk.len()]);
        }
        Ok(())
    }
}

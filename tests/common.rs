#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snap_pad::platform::{Clock, Confirm, EntropySource, NandStatus, STATUS_FAIL, Serial};
use snap_pad::raw::{BLOCK_SIZE, PAGE_SIZE, SPARE_START, flash_offset};
use snap_pad::{Config, TwinConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

/// Simulated raw NAND. Offsets are linear, spare areas included.
#[derive(Default)]
pub struct Flash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    /// Blocks whose program operations report a failure in the status register
    pub failing_program: Vec<u16>,
    /// Blocks whose erase operations report a failure in the status register
    pub failing_erase: Vec<u16>,
    /// How many times `is_busy` reports busy after each program
    pub busy_polls: usize,
    busy: usize,
    status: u8,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(blocks: usize) -> Self {
        Self {
            buf: vec![0xffu8; BLOCK_SIZE * blocks],
            fail_after_operation: usize::MAX,
            ..Default::default()
        }
    }

    pub fn new_with_fault(blocks: usize, fail_after_operation: usize) -> Self {
        Self {
            buf: vec![0xffu8; BLOCK_SIZE * blocks],
            fail_after_operation,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    /// Clears the bad block marker on the first page of a block, like the factory does.
    pub fn mark_factory_bad(&mut self, block: u16) {
        self.buf[flash_offset(block, 0, SPARE_START) as usize] = 0x00;
    }

    pub fn flip_bit(&mut self, offset: u32, bit: u8) {
        self.buf[offset as usize] ^= 1 << bit;
    }

    pub fn block(&self, block: u16) -> &[u8] {
        let from = flash_offset(block, 0, 0) as usize;
        &self.buf[from..from + BLOCK_SIZE]
    }

    pub fn page(&self, block: u16, page: u8) -> &[u8] {
        let from = flash_offset(block, page, 0) as usize;
        &self.buf[from..from + PAGE_SIZE]
    }

    pub fn erases(&mut self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    fn block_of(offset: u32) -> u16 {
        (offset as usize / BLOCK_SIZE) as u16
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for Flash {
    type Error = FlashError;
}

impl ReadNorFlash for Flash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl NorFlash for Flash {
    const WRITE_SIZE: usize = 1;

    const ERASE_SIZE: usize = BLOCK_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert_eq!((to - from) as usize, BLOCK_SIZE);

        println!(
            "    flash: erase: {from:08X} - {to:08X} #{:>2}",
            self.operations.len()
        );

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        if self.failing_erase.contains(&Self::block_of(from)) {
            self.status = STATUS_FAIL;
            return Ok(());
        }
        self.status = 0;

        for addr in from..to {
            self.buf[addr as usize] = 0xff;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(!bytes.is_empty());

        if self.operations.len() >= self.fail_after_operation {
            println!("    flash: FAULT");
            return Err(FlashError);
        }

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // programming can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }

        self.busy = self.busy_polls;
        self.status = if self.failing_program.contains(&Self::block_of(offset as u32)) {
            STATUS_FAIL
        } else {
            0
        };
        Ok(())
    }
}

impl NandStatus for Flash {
    fn wait_ready(&mut self) {
        self.busy = 0;
    }

    fn is_busy(&mut self) -> bool {
        if self.busy == 0 {
            return false;
        }
        self.busy -= 1;
        true
    }

    fn status(&mut self) -> u8 {
        self.status
    }
}

/// One end of an in-memory UART.
pub struct Wire {
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

pub fn wire_pair() -> (Wire, Wire) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();
    (Wire { tx: a_tx, rx: a_rx }, Wire { tx: b_tx, rx: b_rx })
}

impl Wire {
    /// Everything received so far.
    pub fn drain(&mut self) -> Vec<u8> {
        self.rx.try_iter().collect()
    }
}

impl Serial for Wire {
    fn send(&mut self, byte: u8) {
        // the other side may be gone already
        let _ = self.tx.send(byte);
    }

    fn recv(&mut self) -> u8 {
        self.rx.recv().expect("the other end hung up")
    }

    fn recv_timeout(&mut self, ms: u32) -> Option<u8> {
        match self.rx.recv_timeout(Duration::from_millis(ms as u64)) {
            Ok(byte) => Some(byte),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

pub struct StdClock(Instant);

impl StdClock {
    pub fn new() -> Self {
        Self(Instant::now())
    }
}

impl Clock for StdClock {
    fn now_ms(&mut self) -> u32 {
        self.0.elapsed().as_millis() as u32
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Seeded stand-in for the floating ADC input.
pub struct Noise {
    rng: StdRng,
    /// Conversions taken so far, shared with whoever wants to watch
    pub samples: Arc<AtomicUsize>,
}

impl Noise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            samples: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl EntropySource for Noise {
    fn sample(&mut self) -> u16 {
        self.samples.fetch_add(1, Ordering::Relaxed);
        // 10 bit converter
        self.rng.random::<u16>() & 0x3ff
    }
}

/// A wire that notes the sample counter of a [`Noise`] on every buffer it sends.
pub struct Tap {
    pub wire: Wire,
    samples: Arc<AtomicUsize>,
    /// Length of each buffer and the samples taken when it went out
    pub sent: Vec<(usize, usize)>,
}

impl Tap {
    pub fn new(wire: Wire, noise: &Noise) -> Self {
        Self {
            wire,
            samples: noise.samples.clone(),
            sent: Vec::new(),
        }
    }
}

impl Serial for Tap {
    fn send(&mut self, byte: u8) {
        self.wire.send(byte)
    }

    fn send_buffer(&mut self, bytes: &[u8]) {
        self.sent
            .push((bytes.len(), self.samples.load(Ordering::Relaxed)));
        self.wire.send_buffer(bytes)
    }

    fn recv(&mut self) -> u8 {
        self.wire.recv()
    }

    fn recv_timeout(&mut self, ms: u32) -> Option<u8> {
        self.wire.recv_timeout(ms)
    }
}

/// A button that is either held down for good or never touched.
pub struct Button {
    pub pressed: bool,
    pub confirms: u32,
}

impl Button {
    pub fn pressed() -> Self {
        Self {
            pressed: true,
            confirms: 0,
        }
    }

    pub fn untouched() -> Self {
        Self {
            pressed: false,
            confirms: 0,
        }
    }
}

impl Confirm for Button {
    fn is_pressed(&mut self) -> bool {
        self.pressed
    }

    fn wait_for_confirm(&mut self, _timeout_ms: u32) -> bool {
        if self.pressed {
            self.confirms += 1;
        }
        self.pressed
    }
}

pub fn config(blocks: u16) -> Config {
    Config {
        block_count: blocks,
        confirm_timeout_ms: 50,
        twin: TwinConfig {
            settle_ms: 1,
            window_ms: 200,
            backoff_base_ms: 3,
            backoff_mask: 0x3f,
            max_rounds: 32,
            reply_timeout_ms: 2000,
            reset_timeout_ms: 200,
        },
    }
}

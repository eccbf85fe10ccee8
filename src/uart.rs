//! Interrupt fed receive ring for the twin UART.
//!
//! The receive interrupt owns the [`Producer`] half and calls [`on_receive`], the main loop reads
//! through [`QueuedSerial`], which owns the [`Consumer`] half.

use crate::platform::{Clock, Serial};
use heapless::spsc::{Consumer, Producer, Queue};
#[cfg(feature = "defmt")]
use defmt::warn;

pub const RX_RING_LEN: usize = 128;

pub type RxQueue = Queue<u8, RX_RING_LEN>;

/// Body of the receive interrupt. Returns false if the ring was full and the byte got dropped.
pub fn on_receive(producer: &mut Producer<'_, u8, RX_RING_LEN>, byte: u8) -> bool {
    match producer.enqueue(byte) {
        Ok(()) => true,
        Err(_byte) => {
            #[cfg(feature = "defmt")]
            warn!("uart overrun, dropped {:#x}", _byte);
            false
        }
    }
}

/// `Serial` on top of the receive ring and a blocking transmit function.
pub struct QueuedSerial<'q, W: FnMut(u8), C: Clock> {
    rx: Consumer<'q, u8, RX_RING_LEN>,
    tx: W,
    clock: C,
}

impl<'q, W: FnMut(u8), C: Clock> QueuedSerial<'q, W, C> {
    pub fn new(rx: Consumer<'q, u8, RX_RING_LEN>, tx: W, clock: C) -> Self {
        Self { rx, tx, clock }
    }

    /// Bytes waiting in the ring.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl<W: FnMut(u8), C: Clock> Serial for QueuedSerial<'_, W, C> {
    fn send(&mut self, byte: u8) {
        (self.tx)(byte)
    }

    fn recv(&mut self) -> u8 {
        loop {
            if let Some(byte) = self.rx.dequeue() {
                return byte;
            }
        }
    }

    fn recv_timeout(&mut self, ms: u32) -> Option<u8> {
        let start = self.clock.now_ms();
        loop {
            if let Some(byte) = self.rx.dequeue() {
                return Some(byte);
            }
            if self.clock.now_ms().wrapping_sub(start) >= ms {
                return None;
            }
        }
    }
}

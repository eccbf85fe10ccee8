use embedded_storage::nor_flash::NorFlash;

/// The NAND chip is driven through the `embedded-storage` flash traits. Offsets are linear byte
/// offsets including the spare area, see [`crate::raw::flash_offset`]. `write` is a program
/// operation and may only clear bits, `erase` covers exactly one block.
///
/// See README.md for an example implementation.
pub trait Platform: NandStatus + NorFlash {}

impl<T: NandStatus + NorFlash> Platform for T {}

/// Bit 0 of the ONFI status register: the last program or erase failed.
pub const STATUS_FAIL: u8 = 0x01;

/// Busy/ready handling of the raw NAND bus driver.
pub trait NandStatus {
    /// Spin until the R/B# line reports ready.
    fn wait_ready(&mut self);

    /// Whether the R/B# line still reports busy. Drivers that cannot tell keep the default and
    /// only block in [`NandStatus::wait_ready`].
    fn is_busy(&mut self) -> bool {
        false
    }

    /// Value of the status register (`0x70` command).
    fn status(&mut self) -> u8;
}

impl<T: NandStatus> NandStatus for &mut T {
    fn wait_ready(&mut self) {
        (*self).wait_ready()
    }

    fn is_busy(&mut self) -> bool {
        (*self).is_busy()
    }

    fn status(&mut self) -> u8 {
        (*self).status()
    }
}

/// Byte link to the twin board. On the device the receive side is filled by the UART interrupt,
/// see [`crate::uart::QueuedSerial`].
pub trait Serial {
    fn send(&mut self, byte: u8);

    fn send_buffer(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.send(byte);
        }
    }

    /// Returns true once every queued byte left the transmitter.
    fn send_complete(&mut self) -> bool {
        true
    }

    /// Blocks until a byte arrives.
    fn recv(&mut self) -> u8;

    /// Waits at most `ms` milliseconds for a byte.
    fn recv_timeout(&mut self, ms: u32) -> Option<u8>;
}

impl<T: Serial> Serial for &mut T {
    fn send(&mut self, byte: u8) {
        (*self).send(byte)
    }

    fn send_buffer(&mut self, bytes: &[u8]) {
        (*self).send_buffer(bytes)
    }

    fn send_complete(&mut self) -> bool {
        (*self).send_complete()
    }

    fn recv(&mut self) -> u8 {
        (*self).recv()
    }

    fn recv_timeout(&mut self, ms: u32) -> Option<u8> {
        (*self).recv_timeout(ms)
    }
}

/// Free running millisecond counter. Wraps around.
pub trait Clock {
    fn now_ms(&mut self) -> u32;

    fn delay_ms(&mut self, ms: u32) {
        let start = self.now_ms();
        while self.now_ms().wrapping_sub(start) < ms {}
    }
}

impl<T: Clock> Clock for &mut T {
    fn now_ms(&mut self) -> u32 {
        (*self).now_ms()
    }

    fn delay_ms(&mut self, ms: u32) {
        (*self).delay_ms(ms)
    }
}

/// One conversion of the floating ADC input. On the device this blocks on the conversion
/// complete flag; the returned value only matters for its low, noisy bits.
pub trait EntropySource {
    fn sample(&mut self) -> u16;
}

impl<T: EntropySource> EntropySource for &mut T {
    fn sample(&mut self) -> u16 {
        (*self).sample()
    }
}

/// The confirmation button.
pub trait Confirm {
    fn is_pressed(&mut self) -> bool;

    /// Returns false if nobody pressed the button within `timeout_ms`.
    fn wait_for_confirm(&mut self, timeout_ms: u32) -> bool;
}

impl<T: Confirm> Confirm for &mut T {
    fn is_pressed(&mut self) -> bool {
        (*self).is_pressed()
    }

    fn wait_for_confirm(&mut self, timeout_ms: u32) -> bool {
        (*self).wait_for_confirm(timeout_ms)
    }
}

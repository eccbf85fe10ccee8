#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod ecc;
pub mod error;
pub mod host;
pub mod hwrng;
mod otp;
pub mod platform;
mod provision;
pub mod raw;
pub mod twin;
pub mod uart;

pub use hwrng::HwRng;
pub use provision::{Provision, ReleasedPage};
pub use raw::{BlockStatus, Flag, Flags, Header, Role, WriteOnce};
pub use twin::{Link, SlaveEvent, Token, TwinConfig};

extern crate alloc;

use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{BLOCK_SIZE, BadBlockList, DEFAULT_BLOCK_COUNT, MAX_BLOCK_COUNT};
#[cfg(feature = "defmt")]
use defmt::debug;

/// Runtime settings. The defaults match the Snap-Pad hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Total number of blocks on the chip, block 0 included
    pub block_count: u16,
    /// How long the user has to press the button before a destructive command is abandoned
    pub confirm_timeout_ms: u32,
    pub twin: TwinConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_count: DEFAULT_BLOCK_COUNT,
            confirm_timeout_ms: 10_000,
            twin: TwinConfig::default(),
        }
    }
}

/// Result of the leader election. Only lives in RAM.
#[derive(strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    #[strum(to_string = "Indeterminate")]
    Indeterminate,
    #[strum(to_string = "Single board")]
    Single,
    #[strum(to_string = "Twinned master")]
    TwinnedMaster,
    #[strum(to_string = "Twinned slave")]
    TwinnedSlave,
    #[strum(to_string = "Collision")]
    Collision,
}

/// How far the pad got filling itself with random data.
#[derive(strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RandomState {
    #[strum(to_string = "No header")]
    NoHeader,
    #[strum(to_string = "Not randomized")]
    NotRandomized,
    #[strum(to_string = "Incomplete")]
    Incomplete,
    #[strum(to_string = "Done")]
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Diagnostics {
    pub connection: ConnectionState,
    pub random: RandomState,
    pub header: Option<Header>,
}

/// The device context. Owns the flash driver, caches the header and the bad block list.
pub struct SnapPad<T: Platform> {
    pub(crate) hal: T,
    pub(crate) config: Config,
    pub(crate) faulted: bool,
    pub(crate) connection: ConnectionState,

    // set after calling self.load
    pub(crate) header: Option<Header>,
    pub(crate) bad_blocks: BadBlockList,
}

impl<T: Platform> SnapPad<T> {
    /// Loads the header and the bad block list. A chip without header gets scanned for factory
    /// bad block markers instead.
    pub fn new(hal: T, config: Config) -> Result<SnapPad<T>, Error> {
        if config.block_count < 2 || config.block_count > MAX_BLOCK_COUNT {
            return Err(Error::InvalidBlockCount);
        }

        if hal.capacity() < config.block_count as usize * BLOCK_SIZE {
            return Err(Error::InvalidBlockCount);
        }

        // markers, flags and the usage map are single bytes
        if T::READ_SIZE != 1 || T::WRITE_SIZE != 1 {
            return Err(Error::UnalignedDriver);
        }

        let mut pad = Self {
            hal,
            config,
            faulted: false,
            connection: ConnectionState::Indeterminate,
            header: None,
            bad_blocks: BadBlockList::new(),
        };

        let result = pad.load();
        pad.latch(result)?;
        Ok(pad)
    }

    fn load(&mut self) -> Result<(), Error> {
        match self.read_header()? {
            Some((header, bad_blocks)) => {
                #[cfg(feature = "defmt")]
                debug!("header found: {}", header);

                self.header = Some(header);
                self.bad_blocks = bad_blocks;
            }
            None => {
                self.header = None;
                self.scan_bad_blocks_inner()?;
            }
        }
        Ok(())
    }

    /// Remembers a driver failure, the pad refuses to touch the flash afterwards.
    pub(crate) fn latch<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        if let Err(Error::FlashError) = result {
            self.faulted = true;
        }
        result
    }

    pub(crate) fn ensure_healthy(&self) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::FlashError);
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.header.as_ref().map(|h| h.role)
    }

    pub fn bad_blocks(&self) -> &[u16] {
        &self.bad_blocks
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        #[cfg(feature = "defmt")]
        debug!("connection state: {}", state);

        self.connection = state;
    }

    pub fn flags(&mut self) -> Result<Flags, Error> {
        self.ensure_healthy()?;
        let result = self.read_flags();
        self.latch(result)
    }

    pub fn random_state(&mut self) -> Result<RandomState, Error> {
        if self.header.is_none() {
            return Ok(RandomState::NoHeader);
        }
        let flags = self.flags()?;
        Ok(if flags.is_set(Flag::RandomDataFinished) {
            RandomState::Done
        } else if flags.is_set(Flag::RandomDataStarted) {
            RandomState::Incomplete
        } else {
            RandomState::NotRandomized
        })
    }

    pub fn read_diagnostics(&mut self) -> Result<Diagnostics, Error> {
        Ok(Diagnostics {
            connection: self.connection,
            random: self.random_state()?,
            header: self.header.clone(),
        })
    }

    /// Writes a fresh header for `role`, see [`SnapPad::initialize_header`].
    pub fn write_header(&mut self, role: Role) -> Result<(), Error> {
        self.ensure_healthy()?;
        let result = self.initialize_header(role);
        self.latch(result)
    }

    pub fn scan_bad_blocks(&mut self) -> Result<&[u16], Error> {
        self.ensure_healthy()?;
        let result = self.scan_bad_blocks_inner();
        self.latch(result)?;
        Ok(&self.bad_blocks)
    }

    pub fn block_status(&mut self, block: u16) -> Result<BlockStatus, Error> {
        self.ensure_healthy()?;
        let result = self.read_block_status(block);
        self.latch(result)
    }

    /// Data blocks that left the unused state, bad ones included.
    pub fn used_blocks(&mut self) -> Result<alloc::vec::Vec<u16>, Error> {
        self.ensure_healthy()?;
        let result = self.usage_map().map(|map| {
            map.iter()
                .enumerate()
                .skip(1)
                .filter(|&(_, &status)| BlockStatus::from(status) != BlockStatus::Unused)
                .map(|(block, _)| block as u16)
                .collect()
        });
        self.latch(result)
    }

    /// Erases every block that is not known to be bad. Header, flags and pad material are gone
    /// afterwards.
    pub fn factory_reset(&mut self) -> Result<(), Error> {
        self.ensure_healthy()?;
        let result = self.erase_all();
        self.latch(result)
    }

    pub fn hal_mut(&mut self) -> &mut T {
        &mut self.hal
    }

    /// Gives back the flash driver.
    pub fn into_inner(self) -> T {
        self.hal
    }
}

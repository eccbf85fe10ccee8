use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    self, BlockStatus, Flag, PAGE_DATA_SIZE, PAGE_SIZE, PARAGRAPH_SIZE, Role, SPARE_PER_PARAGRAPH,
    SPARE_START, flash_offset, page_number, split_page_number,
};
use crate::SnapPad;
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{debug, warn};

/// Most pages a single provision request may reveal.
pub const MAX_PROVISION_COUNT: u8 = 4;

/// Pad material that has been destroyed in flash and exists only in this value now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedPage {
    /// `block * 64 + page`
    pub number: u32,
    pub data: Vec<u8>,
}

/// Releases the next pages in allocation order, one per call to `next`. Every page is destroyed
/// in flash before it is yielded, so pages the caller does not pull are left alone.
pub struct Provision<'a, T: Platform> {
    pad: &'a mut SnapPad<T>,
    role: Role,
    remaining: u8,
    done: bool,
}

impl<T: Platform> Iterator for Provision<'_, T> {
    type Item = Result<ReleasedPage, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == 0 {
            return None;
        }

        let result = self.pad.provision_one(self.role);
        match self.pad.latch(result) {
            Ok(page) => {
                self.remaining -= 1;
                Some(Ok(page))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<T: Platform> SnapPad<T> {
    /// Reserve `count` (1 to 4) never used pages, taken from the low end of the chip for role A
    /// and from the high end for role B.
    pub fn provision(&mut self, count: u8) -> Result<Provision<'_, T>, Error> {
        if count == 0 || count > MAX_PROVISION_COUNT {
            return Err(Error::BadCount);
        }
        let role = self.ensure_randomized()?;

        Ok(Provision {
            pad: self,
            role,
            remaining: count,
            done: false,
        })
    }

    /// Reveal an explicit page, usually the counterpart of a page the twin provisioned.
    pub fn retrieve(&mut self, number: u32) -> Result<ReleasedPage, Error> {
        self.ensure_randomized()?;
        let result = self.retrieve_page(number);
        self.latch(result)
    }

    fn ensure_randomized(&mut self) -> Result<Role, Error> {
        self.ensure_healthy()?;
        let role = self.role().ok_or(Error::NoHeader)?;
        let flags = self.flags()?;
        if !flags.is_set(Flag::RandomDataFinished) {
            return Err(Error::NotRandomized);
        }
        Ok(role)
    }

    fn retrieve_page(&mut self, number: u32) -> Result<ReleasedPage, Error> {
        let (block, page) = split_page_number(number);
        if block == 0 || block >= self.config.block_count as u32 {
            return Err(Error::InvalidPage(number));
        }
        let block = block as u16;

        if self.read_block_status(block)? == BlockStatus::Bad {
            return Err(Error::BadBlock(block));
        }

        match self.release_page(block, page) {
            Err(Error::ProgramFailed(block)) => {
                self.mark_block(block, BlockStatus::Bad)?;
                Err(Error::ProgramFailed(block))
            }
            other => other,
        }
    }

    fn provision_one(&mut self, role: Role) -> Result<ReleasedPage, Error> {
        let mut exhausted = 0;
        loop {
            let Some(block) = self.find_unmarked_block(role)? else {
                return Err(Error::NoPagesAvailable);
            };

            let Some(page) = self.find_unmarked_page(block, role)? else {
                self.mark_block(block, BlockStatus::Used)?;
                exhausted += 1;
                if exhausted == 2 {
                    return Err(Error::NoPagesAvailable);
                }
                continue;
            };
            exhausted = 0;

            match self.release_page(block, page) {
                Ok(released) => return Ok(released),
                // the page is burned either way, hand out the next one
                Err(Error::Uncorrectable { .. }) => {
                    #[cfg(feature = "defmt")]
                    warn!("dropping page {} of block {}: uncorrectable", page, block);
                }
                Err(Error::ProgramFailed(block)) => {
                    #[cfg(feature = "defmt")]
                    warn!("program failed in block {}", block);

                    self.mark_block(block, BlockStatus::Bad)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read and correct a page, zero it in flash and only then hand out its content.
    fn release_page(&mut self, block: u16, page: u8) -> Result<ReleasedPage, Error> {
        let number = page_number(block, page);
        if !self.page_available(block, page)? {
            return Err(Error::PageUsed(number));
        }

        #[cfg(feature = "defmt")]
        debug!("release page {}", number);

        #[cfg(feature = "debug-logs")]
        println!("  provision: release page {number}");

        let mut data = vec![0u8; PAGE_SIZE];
        raw::read(&mut self.hal, flash_offset(block, page, 0), &mut data)?;

        let mut corrected = Ok(());
        let mut paragraph = [0u8; PARAGRAPH_SIZE];
        for index in 0..PAGE_DATA_SIZE / PARAGRAPH_SIZE {
            let at = index * PARAGRAPH_SIZE;
            let spare = SPARE_START + index * SPARE_PER_PARAGRAPH;

            paragraph.copy_from_slice(&data[at..at + PARAGRAPH_SIZE]);
            let result = raw::correct(
                block,
                page,
                index as u8,
                &mut paragraph,
                &data[spare..spare + SPARE_PER_PARAGRAPH],
            );
            if corrected.is_ok() {
                corrected = result;
            }
            data[at..at + PARAGRAPH_SIZE].copy_from_slice(&paragraph);
        }

        raw::zero_page(&mut self.hal, block, page)?;
        corrected?;

        data.truncate(PAGE_DATA_SIZE);
        Ok(ReleasedPage { number, data })
    }
}

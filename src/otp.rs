use crate::error::Error;
use crate::platform::Platform;
use crate::raw::{
    self, BadBlockList, BlockStatus, FLAGS_PAGE, Flag, Flags, HEADER_PAGE,
    Header, MAGIC, MAJOR_VERSION, METADATA_BLOCK, MINOR_VERSION, PAGES_PER_BLOCK,
    PARAGRAPH_SIZE, PARAGRAPHS_PER_PAGE, Role, USAGE_PAGE, flash_offset,
};
use crate::SnapPad;
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{debug, warn};

impl<T: Platform> SnapPad<T> {
    /// Returns the header together with the bad block list stored next to it.
    pub(crate) fn read_header(&mut self) -> Result<Option<(Header, BadBlockList)>, Error> {
        let mut raw = [0u8; PARAGRAPH_SIZE];
        match raw::load_paragraph(&mut self.hal, METADATA_BLOCK, HEADER_PAGE, 0, &mut raw) {
            Ok(()) => {}
            // an erased paragraph never matches its code
            Err(Error::Uncorrectable { .. }) if raw[..MAGIC.len()] != MAGIC => return Ok(None),
            Err(e) => return Err(e),
        }

        Ok(Header::parse(&raw).map(|header| (header, raw::parse_bad_blocks(&raw))))
    }

    pub(crate) fn read_flags(&mut self) -> Result<Flags, Error> {
        let mut buf = [0u8; 1];
        raw::read(
            &mut self.hal,
            flash_offset(METADATA_BLOCK, FLAGS_PAGE, 0),
            &mut buf,
        )?;
        Ok(Flags(buf[0]))
    }

    pub(crate) fn set_flag(&mut self, flag: Flag) -> Result<(), Error> {
        let flags = self.read_flags()?;
        let updated = flags.set_once(flag);
        if updated == flags {
            return Ok(());
        }

        #[cfg(feature = "defmt")]
        debug!("set flag {}", flag);

        #[cfg(feature = "debug-logs")]
        println!("  otp: set flag {flag}");

        raw::program(
            &mut self.hal,
            METADATA_BLOCK,
            flash_offset(METADATA_BLOCK, FLAGS_PAGE, 0),
            &[updated.0],
        )
    }

    pub(crate) fn usage_map(&mut self) -> Result<Vec<u8>, Error> {
        let mut map = vec![0u8; self.config.block_count as usize];
        raw::read(
            &mut self.hal,
            flash_offset(METADATA_BLOCK, USAGE_PAGE, 0),
            &mut map,
        )?;
        Ok(map)
    }

    /// Any block of the chip, block 0 included.
    pub(crate) fn check_block(&self, block: u16) -> Result<(), Error> {
        if block >= self.config.block_count {
            return Err(Error::InvalidBlock(block));
        }
        Ok(())
    }

    pub(crate) fn check_data_block(&self, block: u16) -> Result<(), Error> {
        if block == METADATA_BLOCK {
            return Err(Error::InvalidBlock(block));
        }
        self.check_block(block)
    }

    pub(crate) fn read_block_status(&mut self, block: u16) -> Result<BlockStatus, Error> {
        self.check_block(block)?;
        let mut buf = [0u8; 1];
        raw::read(
            &mut self.hal,
            flash_offset(METADATA_BLOCK, USAGE_PAGE, block as usize),
            &mut buf,
        )?;
        Ok(BlockStatus::from(buf[0]))
    }

    /// Moves a block forward in the usage map. Bad is final, and a transition that would have to
    /// set bits is ignored.
    pub(crate) fn mark_block(&mut self, block: u16, status: BlockStatus) -> Result<(), Error> {
        self.check_block(block)?;
        let offset = flash_offset(METADATA_BLOCK, USAGE_PAGE, block as usize);
        let mut current = [0u8; 1];
        raw::read(&mut self.hal, offset, &mut current)?;

        if current[0] == status as u8 {
            return Ok(());
        }
        if BlockStatus::from(current[0]) == BlockStatus::Bad || status as u8 & !current[0] != 0 {
            #[cfg(feature = "defmt")]
            warn!("block {} cannot go from {:#x} to {}", block, current[0], status);
            return Ok(());
        }

        #[cfg(feature = "defmt")]
        debug!("mark block {} {}", block, status);

        #[cfg(feature = "debug-logs")]
        println!("  otp: mark block {block} {status}");

        raw::program(&mut self.hal, METADATA_BLOCK, offset, &[status as u8])
    }

    pub(crate) fn scan_bad_blocks_inner(&mut self) -> Result<(), Error> {
        let mut found = BadBlockList::new();
        for block in 0..self.config.block_count {
            if !raw::is_factory_bad(&mut self.hal, block)? {
                continue;
            }

            #[cfg(feature = "defmt")]
            warn!("factory bad block {}", block);

            if found.push(block).is_err() {
                #[cfg(feature = "defmt")]
                warn!("more than {} bad blocks, ignoring {}", raw::BBL_MAX_ENTRIES, block);
            }
        }
        self.bad_blocks = found;
        Ok(())
    }

    /// Erases block 0 and writes a new header, the bad block list and the matching usage map.
    /// The bad block list of an existing header is carried over, otherwise the chip is scanned.
    pub(crate) fn initialize_header(&mut self, role: Role) -> Result<(), Error> {
        match self.read_header()? {
            Some((_, bad_blocks)) => self.bad_blocks = bad_blocks,
            None => self.scan_bad_blocks_inner()?,
        }

        raw::erase_block(&mut self.hal, METADATA_BLOCK)?;

        let header = Header {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            block_count: self
                .config
                .block_count
                .saturating_sub(1 + self.bad_blocks.len() as u16),
            role,
        };

        #[cfg(feature = "defmt")]
        debug!("write header {}", header);

        #[cfg(feature = "debug-logs")]
        println!("  otp: write header {header:?}");

        let paragraph = header.serialize(&self.bad_blocks);
        raw::save_paragraph(&mut self.hal, METADATA_BLOCK, HEADER_PAGE, 0, &paragraph)?;

        self.mark_block(METADATA_BLOCK, BlockStatus::Used)?;
        for block in self.bad_blocks.clone() {
            if block != METADATA_BLOCK && block < self.config.block_count {
                self.mark_block(block, BlockStatus::Bad)?;
            }
        }
        self.set_flag(Flag::HeaderWritten)?;

        self.header = Some(header);
        Ok(())
    }

    /// First unused block of the half owned by `role`, in its allocation order.
    pub(crate) fn find_unmarked_block(&mut self, role: Role) -> Result<Option<u16>, Error> {
        let map = self.usage_map()?;
        let is_unused = |block: &u16| BlockStatus::from(map[*block as usize]) == BlockStatus::Unused;

        let count = self.config.block_count;
        Ok(if role.ascending() {
            role.blocks(count).find(is_unused)
        } else {
            role.blocks(count).rev().find(is_unused)
        })
    }

    /// First page of `block` that was never released, in allocation order of `role`.
    pub(crate) fn find_unmarked_page(&mut self, block: u16, role: Role) -> Result<Option<u8>, Error> {
        let pages = PAGES_PER_BLOCK as u8;
        for i in 0..pages {
            let page = if role.ascending() { i } else { pages - 1 - i };
            if self.page_available(block, page)? {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }

    pub(crate) fn page_available(&mut self, block: u16, page: u8) -> Result<bool, Error> {
        Ok(raw::page_marker(&mut self.hal, block, page)? == 0xFF)
    }

    /// Additive checksum over the corrected content of a block.
    pub(crate) fn block_checksum(&mut self, block: u16) -> Result<u32, Error> {
        self.check_data_block(block)?;
        let mut data = [0u8; PARAGRAPH_SIZE];
        let mut sum = 0u32;
        for page in 0..PAGES_PER_BLOCK as u8 {
            for paragraph in 0..PARAGRAPHS_PER_PAGE as u8 {
                raw::load_paragraph(&mut self.hal, block, page, paragraph, &mut data)?;
                sum = data
                    .iter()
                    .fold(sum, |acc, &byte| acc.wrapping_add(byte as u32));
            }
        }
        Ok(sum)
    }

    pub(crate) fn is_listed_bad(&self, block: u16) -> bool {
        self.bad_blocks.contains(&block)
    }

    pub(crate) fn erase_all(&mut self) -> Result<(), Error> {
        // bad blocks of an existing header are spared as well
        if let Some((_, bad_blocks)) = self.read_header()? {
            self.bad_blocks = bad_blocks;
        }

        #[cfg(feature = "defmt")]
        debug!("factory reset");

        for block in 0..self.config.block_count {
            if self.is_listed_bad(block) {
                continue;
            }
            match raw::erase_block(&mut self.hal, block) {
                Ok(()) => {}
                Err(Error::EraseFailed(_block)) => {
                    #[cfg(feature = "defmt")]
                    warn!("erase failed for block {}", _block);
                }
                Err(e) => return Err(e),
            }
        }

        self.header = None;
        Ok(())
    }
}

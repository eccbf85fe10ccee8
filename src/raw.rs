use crate::ecc;
use crate::error::Error;
use crate::platform::{Platform, STATUS_FAIL};
#[cfg(feature = "defmt")]
use defmt::trace;

pub const PARAGRAPH_SIZE: usize = 512;
pub const PARAGRAPHS_PER_PAGE: usize = 4;
pub const PAGE_DATA_SIZE: usize = PARAGRAPH_SIZE * PARAGRAPHS_PER_PAGE;
pub const SPARE_PER_PARAGRAPH: usize = 16;
pub const SPARE_START: usize = PAGE_DATA_SIZE;
pub const PAGE_SIZE: usize = PAGE_DATA_SIZE + PARAGRAPHS_PER_PAGE * SPARE_PER_PARAGRAPH;
pub const PAGES_PER_BLOCK: usize = 64;
pub const BLOCK_SIZE: usize = PAGE_SIZE * PAGES_PER_BLOCK;

/// The usage map stores one byte per block on a single page.
pub const MAX_BLOCK_COUNT: u16 = PAGE_DATA_SIZE as u16;
pub const DEFAULT_BLOCK_COUNT: u16 = 2048;
pub const BBL_MAX_ENTRIES: usize = 16;

pub const MAJOR_VERSION: u8 = 0x01;
pub const MINOR_VERSION: u8 = 0x01;

// Compile-time assertion to ensure the page layout matches the chip
const _: () = assert!(
    PAGE_SIZE == 2112,
    "Page structure size must equal 2048 bytes data plus 64 bytes spare"
);

/// Offset of the little endian ECC code inside the 16 spare bytes of a paragraph. Spare byte 0 of
/// a page holds the factory bad block marker and is never programmed.
pub(crate) const ECC_SPARE_OFFSET: usize = 4;
pub(crate) const BAD_BLOCK_MARKER: usize = SPARE_START;
/// Last spare byte of a page, erased until the page is released.
pub const PAGE_MARKER_COLUMN: usize = PAGE_SIZE - 1;
pub(crate) const MARKER_PAGES: [u8; 3] = [0, 1, PAGES_PER_BLOCK as u8 - 1];

pub(crate) const METADATA_BLOCK: u16 = 0;
pub(crate) const HEADER_PAGE: u8 = 0;
pub(crate) const USAGE_PAGE: u8 = 4;
pub(crate) const FLAGS_PAGE: u8 = 5;

pub(crate) const MAGIC: [u8; 8] = *b"SNAP-PAD";
const MAJOR_OFFSET: usize = 8;
const MINOR_OFFSET: usize = 9;
const BLOCK_COUNT_OFFSET: usize = 10;
const ROLE_OFFSET: usize = 12;
pub(crate) const BBL_OFFSET: usize = 0x10;
const BBL_END: u16 = 0xFFFF;

pub type Paragraph = [u8; PARAGRAPH_SIZE];

/// The bad block list snapshot kept next to the header.
pub type BadBlockList = heapless::Vec<u16, BBL_MAX_ENTRIES>;

/// Linear offset of a byte inside the flash, spare areas included.
pub const fn flash_offset(block: u16, page: u8, column: usize) -> u32 {
    ((block as usize * PAGES_PER_BLOCK + page as usize) * PAGE_SIZE + column) as u32
}

pub const fn paragraph_offset(block: u16, page: u8, paragraph: u8) -> u32 {
    flash_offset(block, page, paragraph as usize * PARAGRAPH_SIZE)
}

pub const fn spare_offset(block: u16, page: u8, paragraph: u8) -> u32 {
    flash_offset(block, page, SPARE_START + paragraph as usize * SPARE_PER_PARAGRAPH)
}

/// Page numbers as the host sees them.
pub const fn page_number(block: u16, page: u8) -> u32 {
    block as u32 * PAGES_PER_BLOCK as u32 + page as u32
}

pub const fn split_page_number(number: u32) -> (u32, u8) {
    (
        number / PAGES_PER_BLOCK as u32,
        (number % PAGES_PER_BLOCK as u32) as u8,
    )
}

#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BlockStatus {
    // Erased state of the usage map
    Unused = 0xFF,
    Used = 0x00,
    Bad = 0x70,
}

impl From<u8> for BlockStatus {
    fn from(val: u8) -> Self {
        // anything else is half programmed; never hand it out again
        BlockStatus::from_repr(val).unwrap_or(BlockStatus::Bad)
    }
}

/// Two bit field that starts erased and can only be cleared by programming.
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum WriteOnce {
    Unset = 0b11,
    Set = 0b00,
}

impl From<u8> for WriteOnce {
    fn from(bits: u8) -> Self {
        // a single cleared bit already counts
        WriteOnce::from_repr(bits & 0b11).unwrap_or(WriteOnce::Set)
    }
}

#[derive(strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Flag {
    HeaderWritten,
    RandomDataStarted,
    RandomDataFinished,
}

impl Flag {
    const fn shift(self) -> u8 {
        match self {
            Flag::HeaderWritten => 0,
            Flag::RandomDataStarted => 2,
            Flag::RandomDataFinished => 4,
        }
    }
}

/// The flags byte of block 0.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Flags(pub(crate) u8);

impl Flags {
    pub const fn erased() -> Self {
        Self(0xFF)
    }

    pub fn get(&self, flag: Flag) -> WriteOnce {
        WriteOnce::from(self.0 >> flag.shift())
    }

    pub fn is_set(&self, flag: Flag) -> bool {
        self.get(flag) == WriteOnce::Set
    }

    /// Only ever clears bits, so the result can be programmed over the current value.
    pub(crate) fn set_once(self, flag: Flag) -> Self {
        Self(self.0 & !((WriteOnce::Unset as u8) << flag.shift()))
    }
}

/// Which end of the address space a twin consumes.
#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Role {
    /// Allocates upwards from block 1
    A = 0xFF,
    /// Allocates downwards from the last block
    B = 0x00,
}

impl Role {
    pub const fn ascending(self) -> bool {
        matches!(self, Role::A)
    }

    /// Data blocks this role provisions from. A owns the lower half, B the upper half, so the
    /// twins never hand out the same page no matter how far either of them gets.
    pub const fn blocks(self, block_count: u16) -> core::ops::Range<u16> {
        let split = 1 + block_count / 2;
        match self {
            Role::A => 1..split,
            Role::B => split..block_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    pub major_version: u8,
    pub minor_version: u8,
    /// Usable data blocks, block 0 and bad blocks excluded
    pub block_count: u16,
    pub role: Role,
}

impl Header {
    pub(crate) fn parse(raw: &Paragraph) -> Option<Header> {
        if raw[..MAGIC.len()] != MAGIC {
            return None;
        }

        Some(Header {
            major_version: raw[MAJOR_OFFSET],
            minor_version: raw[MINOR_OFFSET],
            block_count: u16::from_le_bytes([
                raw[BLOCK_COUNT_OFFSET],
                raw[BLOCK_COUNT_OFFSET + 1],
            ]),
            role: if raw[ROLE_OFFSET] == Role::A as u8 {
                Role::A
            } else {
                Role::B
            },
        })
    }

    pub(crate) fn serialize(&self, bad_blocks: &[u16]) -> Paragraph {
        let mut raw = [0xFFu8; PARAGRAPH_SIZE];
        raw[..MAGIC.len()].copy_from_slice(&MAGIC);
        raw[MAJOR_OFFSET] = self.major_version;
        raw[MINOR_OFFSET] = self.minor_version;
        raw[BLOCK_COUNT_OFFSET..BLOCK_COUNT_OFFSET + 2]
            .copy_from_slice(&self.block_count.to_le_bytes());
        raw[ROLE_OFFSET] = self.role as u8;
        for (i, block) in bad_blocks.iter().take(BBL_MAX_ENTRIES).enumerate() {
            let at = BBL_OFFSET + 2 * i;
            raw[at..at + 2].copy_from_slice(&block.to_le_bytes());
        }
        // the terminator is implicit when the list is shorter: the buffer starts out as 0xFF
        raw
    }
}

pub(crate) fn parse_bad_blocks(raw: &Paragraph) -> BadBlockList {
    raw[BBL_OFFSET..BBL_OFFSET + 2 * BBL_MAX_ENTRIES]
        .chunks_exact(2)
        .map(|e| u16::from_le_bytes([e[0], e[1]]))
        .take_while(|&block| block != BBL_END)
        .collect()
}

#[inline(always)]
pub(crate) fn read<T: Platform>(hal: &mut T, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("read @{:#08x}: [{}]", offset, bytes.len());

    hal.read(offset, bytes).map_err(|_| Error::FlashError)
}

/// Program and wait until the chip is done. `block` is only used to report failures.
#[inline(always)]
pub(crate) fn program<T: Platform>(
    hal: &mut T,
    block: u16,
    offset: u32,
    bytes: &[u8],
) -> Result<(), Error> {
    program_with(hal, block, offset, bytes, &mut || {})
}

/// Like [`program`], running `idle` while the chip reports busy.
pub(crate) fn program_with<T: Platform>(
    hal: &mut T,
    block: u16,
    offset: u32,
    bytes: &[u8],
    idle: &mut dyn FnMut(),
) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("program @{:#08x}: [{}]", offset, bytes.len());

    hal.write(offset, bytes).map_err(|_| Error::FlashError)?;
    while hal.is_busy() {
        idle();
    }
    hal.wait_ready();
    if hal.status() & STATUS_FAIL != 0 {
        return Err(Error::ProgramFailed(block));
    }
    Ok(())
}

pub(crate) fn erase_block<T: Platform>(hal: &mut T, block: u16) -> Result<(), Error> {
    #[cfg(feature = "defmt")]
    trace!("erase block {}", block);

    #[cfg(feature = "debug-logs")]
    println!("  raw: erase block {block}");

    let from = flash_offset(block, 0, 0);
    hal.erase(from, from + BLOCK_SIZE as u32)
        .map_err(|_| Error::FlashError)?;
    hal.wait_ready();
    if hal.status() & STATUS_FAIL != 0 {
        return Err(Error::EraseFailed(block));
    }
    Ok(())
}

/// Load a paragraph and correct it with the code from its spare area.
pub(crate) fn load_paragraph<T: Platform>(
    hal: &mut T,
    block: u16,
    page: u8,
    paragraph: u8,
    data: &mut Paragraph,
) -> Result<(), Error> {
    read(hal, paragraph_offset(block, page, paragraph), data)?;
    let mut spare = [0u8; SPARE_PER_PARAGRAPH];
    read(hal, spare_offset(block, page, paragraph), &mut spare)?;
    correct(block, page, paragraph, data, &spare)
}

pub(crate) fn correct(
    block: u16,
    page: u8,
    paragraph: u8,
    data: &mut Paragraph,
    spare: &[u8],
) -> Result<(), Error> {
    let code = u32::from_le_bytes([
        spare[ECC_SPARE_OFFSET],
        spare[ECC_SPARE_OFFSET + 1],
        spare[ECC_SPARE_OFFSET + 2],
        spare[ECC_SPARE_OFFSET + 3],
    ]);

    if ecc::verify(data, code) {
        Ok(())
    } else {
        Err(Error::Uncorrectable {
            block,
            page,
            paragraph,
        })
    }
}

/// Program a paragraph together with its code. The target has to be erased.
pub(crate) fn save_paragraph<T: Platform>(
    hal: &mut T,
    block: u16,
    page: u8,
    paragraph: u8,
    data: &Paragraph,
) -> Result<(), Error> {
    save_paragraph_with(hal, block, page, paragraph, data, &mut || {})
}

pub(crate) fn save_paragraph_with<T: Platform>(
    hal: &mut T,
    block: u16,
    page: u8,
    paragraph: u8,
    data: &Paragraph,
    idle: &mut dyn FnMut(),
) -> Result<(), Error> {
    if page as usize >= PAGES_PER_BLOCK || paragraph as usize >= PARAGRAPHS_PER_PAGE {
        return Err(Error::InvalidParagraph { page, paragraph });
    }

    let mut spare = [0xFFu8; SPARE_PER_PARAGRAPH];
    spare[ECC_SPARE_OFFSET..ECC_SPARE_OFFSET + 4].copy_from_slice(&ecc::generate(data).to_le_bytes());

    program_with(hal, block, paragraph_offset(block, page, paragraph), data, idle)?;
    program_with(hal, block, spare_offset(block, page, paragraph), &spare, idle)
}

/// Zero data, codes and the availability marker of a page. The factory bad block marker is left
/// alone so later scans still see the chip's own markings.
pub(crate) fn zero_page<T: Platform>(hal: &mut T, block: u16, page: u8) -> Result<(), Error> {
    let mut zeros = [0u8; PAGE_SIZE];
    zeros[BAD_BLOCK_MARKER] = 0xFF;
    program(hal, block, flash_offset(block, page, 0), &zeros)
}

pub(crate) fn page_marker<T: Platform>(hal: &mut T, block: u16, page: u8) -> Result<u8, Error> {
    let mut marker = [0u8; 1];
    read(hal, flash_offset(block, page, PAGE_MARKER_COLUMN), &mut marker)?;
    Ok(marker[0])
}

/// Checks the factory markers on the first, second and last page of a block.
pub(crate) fn is_factory_bad<T: Platform>(hal: &mut T, block: u16) -> Result<bool, Error> {
    for page in MARKER_PAGES {
        let mut marker = [0u8; 1];
        read(hal, flash_offset(block, page, BAD_BLOCK_MARKER), &mut marker)?;
        if marker[0] != 0xFF {
            return Ok(true);
        }
    }
    Ok(false)
}

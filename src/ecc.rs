//! SEC-DED code over a 512 byte paragraph.
//!
//! The 25 significant bits are laid out like this (byte 3 only carries the extended bit):
//!
//! ```text
//!  bit     7      6      5      4      3      2      1      0
//!  B0   LP7    LP6    LP5    LP4    LP3    LP2    LP1    LP0      byte index, direct
//!  B1  !LP7   !LP6   !LP5   !LP4   !LP3   !LP2   !LP1   !LP0      byte index, inverted
//!  B2  CP_F0  CP_0F  CP_CC  CP_33  CP_AA  CP_55  LP8   !LP8
//!  B3    --     --     --     --     --     --     --    EXT
//! ```
//!
//! A single flipped data bit changes exactly one of every direct/inverted pair: eight line bits,
//! one of the index bit 8 markers and three column bits, twelve in total, and flips the extended
//! bit. Two flipped bits always leave the extended bit untouched.

use crate::raw::{PARAGRAPH_SIZE, Paragraph};

/// Only the low 25 bits of a stored code carry information.
pub const CODE_MASK: u32 = 0x01FF_FFFF;
const EXTENDED_BIT: u32 = 1 << 24;
const PARITY_BITS: u32 = 0x00FF_FFFF;

/// Number of syndrome bits a correctable single bit data error sets, the extended bit excluded.
const SINGLE_ERROR_WEIGHT: u32 = 12;

/// Outcome of comparing a stored code with the recomputed one.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Syndrome {
    Clean,
    /// A single bit of the stored code flipped, the data is intact.
    CodeError,
    /// A single data bit flipped and can be restored.
    DataError { byte: usize, bit: u8 },
    Uncorrectable,
}

#[inline(always)]
const fn parity(b: u8) -> u8 {
    (b.count_ones() & 1) as u8
}

#[inline(always)]
const fn column_parities(b: u8) -> u8 {
    (parity(b & 0x55) << 2)
        | (parity(b & 0xAA) << 3)
        | (parity(b & 0x33) << 4)
        | (parity(b & 0xCC) << 5)
        | (parity(b & 0x0F) << 6)
        | (parity(b & 0xF0) << 7)
}

/// Generate the code for a paragraph. The result fits into [`CODE_MASK`].
pub fn generate(data: &Paragraph) -> u32 {
    let mut ecc = [0u8; 4];
    for (idx, &c) in data.iter().enumerate() {
        let x = if parity(c) == 1 { 0xFF } else { 0x00 };
        let low = idx as u8;
        ecc[0] ^= low & x;
        ecc[1] ^= !low & x;
        ecc[2] ^= (if idx & 0x100 != 0 { 0x02 } else { 0x01 }) & x;
        ecc[2] ^= column_parities(c);
        ecc[3] ^= x & 0x01;
    }
    // the extended bit also covers both line parity bytes
    ecc[3] ^= parity(ecc[0]) ^ parity(ecc[1]);
    u32::from_le_bytes(ecc)
}

/// Classify the XOR of a stored and a recomputed code.
///
/// A syndrome consisting of the extended bit alone is a flip inside the stored code as well: no
/// combination of data errors below three flips produces it.
pub fn diagnose(syndrome: u32) -> Syndrome {
    let syndrome = syndrome & CODE_MASK;
    if syndrome == 0 {
        return Syndrome::Clean;
    }

    match (syndrome & PARITY_BITS).count_ones() {
        0 | 1 => Syndrome::CodeError,
        SINGLE_ERROR_WEIGHT if syndrome & EXTENDED_BIT != 0 => {
            let bit = (((syndrome >> 23) & 1) << 2)
                | (((syndrome >> 21) & 1) << 1)
                | ((syndrome >> 19) & 1);
            let byte = (((syndrome >> 17) & 1) << 8) | (syndrome & 0xFF);
            debug_assert!((byte as usize) < PARAGRAPH_SIZE);
            Syndrome::DataError {
                byte: byte as usize,
                bit: bit as u8,
            }
        }
        _ => Syndrome::Uncorrectable,
    }
}

/// Verify a paragraph against its stored code, correcting a single flipped bit in place.
///
/// Returns true if the data is consistent with `code` afterwards, false if more than one bit
/// flipped.
pub fn verify(data: &mut Paragraph, code: u32) -> bool {
    match diagnose(generate(data) ^ code) {
        Syndrome::Clean | Syndrome::CodeError => true,
        Syndrome::DataError { byte, bit } => {
            data[byte] ^= 1 << bit;
            true
        }
        Syndrome::Uncorrectable => false,
    }
}

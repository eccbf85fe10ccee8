//! Text framing of the USB command interface.
//!
//! Pad material travels base64 encoded, wrapped at 80 columns, between
//! `---BEGIN PAGE n---` and `---END PAGE---`. Errors are single `ERROR: ` lines.

use crate::error::Error;
use crate::hwrng::HwRng;
use crate::platform::{Confirm, EntropySource, Platform};
use crate::provision::{MAX_PROVISION_COUNT, ReleasedPage};
use crate::raw::{MAJOR_VERSION, MINOR_VERSION};
use crate::{Diagnostics, SnapPad};
use alloc::format;
use alloc::string::String;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

pub const LINE_WIDTH: usize = 80;

/// Length of the binary answer to the raw random command (`#`).
pub const RAW_RANDOM_LEN: usize = 64;

pub fn format_page(page: &ReleasedPage) -> String {
    let encoded = STANDARD.encode(&page.data);

    let mut out = format!("---BEGIN PAGE {}---\n", page.number);
    // base64 output is ascii, every split is on a char boundary
    for line in encoded.as_bytes().chunks(LINE_WIDTH) {
        out.extend(line.iter().map(|&c| c as char));
        out.push('\n');
    }
    out.push_str("---END PAGE---\n");
    out
}

pub fn format_used_page(number: u32) -> String {
    format!("---USED PAGE {number}---\n")
}

pub fn format_error(error: &Error) -> String {
    format!("ERROR: {error}\n")
}

pub fn format_version() -> String {
    format!("{MAJOR_VERSION}.{MINOR_VERSION}\n")
}

pub fn format_diagnostics(diagnostics: &Diagnostics) -> String {
    let mut out = String::from("---BEGIN DIAGNOSTICS---\n");
    out.push_str(&format!("Mode: {}\n", diagnostics.connection));
    match &diagnostics.header {
        None => out.push_str(&format_error(&Error::NoHeader)),
        Some(header) => {
            out.push_str(&format!("Random:{}\n", diagnostics.random));
            out.push_str(&format!("Blocks:{}\n", header.block_count));
        }
    }
    out.push_str("---END DIAGNOSTICS---\n");
    out
}

/// One `BB:` line per bad block, the block number right aligned in hex.
pub fn format_bad_blocks(blocks: &[u16]) -> String {
    blocks.iter().map(|block| format!("BB:{block:>6x}\n")).collect()
}

pub fn format_used_blocks(blocks: &[u16]) -> String {
    blocks.iter().map(|block| format!("USED {block}\n")).collect()
}

/// Four sampling cycles straight from the accumulators, sent unframed.
pub fn raw_random<S: EntropySource>(rng: &mut HwRng<S>) -> Result<[u8; RAW_RANDOM_LEN], Error> {
    let mut out = [0u8; RAW_RANDOM_LEN];
    rng.fill_bytes(&mut out)?;
    Ok(out)
}

/// Provision `count` pages once the user pressed the button, handing every page to `emit` right
/// after it has been destroyed in flash. Nothing happens if the button is not pressed in time.
/// Returns the number of pages emitted.
pub fn provision<T: Platform, U: Confirm>(
    pad: &mut SnapPad<T>,
    confirm: &mut U,
    count: u8,
    mut emit: impl FnMut(&str),
) -> Result<u8, Error> {
    if count == 0 || count > MAX_PROVISION_COUNT {
        return Err(Error::BadCount);
    }
    if !confirm.wait_for_confirm(pad.config().confirm_timeout_ms) {
        return Ok(0);
    }

    let mut emitted = 0;
    for page in pad.provision(count)? {
        emit(&format_page(&page?));
        emitted += 1;
    }
    Ok(emitted)
}

/// Retrieve one page after confirmation. A page that is gone already is reported with a
/// `USED PAGE` frame. Returns false if nothing was revealed.
pub fn retrieve<T: Platform, U: Confirm>(
    pad: &mut SnapPad<T>,
    confirm: &mut U,
    number: u32,
    mut emit: impl FnMut(&str),
) -> Result<bool, Error> {
    if !confirm.wait_for_confirm(pad.config().confirm_timeout_ms) {
        return Ok(false);
    }

    match pad.retrieve(number) {
        Ok(page) => {
            emit(&format_page(&page));
            Ok(true)
        }
        Err(Error::PageUsed(number)) => {
            emit(&format_used_page(number));
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

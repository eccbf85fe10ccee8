use super::{Link, Token};
use crate::error::Error;
use crate::hwrng::HwRng;
use crate::platform::{Clock, EntropySource, Platform, Serial};
use crate::raw::{
    self, BlockStatus, Flag, PAGES_PER_BLOCK, PARAGRAPH_SIZE, PARAGRAPHS_PER_PAGE, Paragraph,
    Role,
};
use crate::{ConnectionState, SnapPad};
#[cfg(feature = "defmt")]
use defmt::{debug, warn};

/// Payload bytes sent between two polls of the random number pipeline.
const SEND_CHUNK: usize = 64;

/// The other side of a randomization run.
pub(crate) trait Replica {
    fn prepare(&mut self) -> Result<(), Error>;

    /// `idle` runs between chunks of the transfer.
    fn send_paragraph(
        &mut self,
        block: u16,
        page: u8,
        paragraph: u8,
        data: &Paragraph,
        idle: &mut dyn FnMut(),
    ) -> Result<(), Error>;

    /// Returns false if the replica could not store the last paragraph. `idle` runs while
    /// waiting.
    fn await_paragraph(&mut self, idle: &mut dyn FnMut()) -> Result<bool, Error>;

    /// Whether completed blocks get compared at all.
    fn audits(&self) -> bool {
        true
    }

    /// `None` if the replica could not read the block back.
    fn remote_checksum(&mut self, block: u16) -> Result<Option<u32>, Error>;

    fn mark_block(&mut self, block: u16, status: BlockStatus) -> Result<(), Error>;

    fn finish(&mut self) -> Result<(), Error>;
}

/// A board without twin.
struct Standalone;

impl Replica for Standalone {
    fn prepare(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn send_paragraph(
        &mut self,
        _: u16,
        _: u8,
        _: u8,
        _: &Paragraph,
        _: &mut dyn FnMut(),
    ) -> Result<(), Error> {
        Ok(())
    }

    fn await_paragraph(&mut self, _: &mut dyn FnMut()) -> Result<bool, Error> {
        Ok(true)
    }

    fn audits(&self) -> bool {
        false
    }

    fn remote_checksum(&mut self, _: u16) -> Result<Option<u32>, Error> {
        Ok(None)
    }

    fn mark_block(&mut self, _: u16, _: BlockStatus) -> Result<(), Error> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<S: Serial, C: Clock> Replica for Link<S, C> {
    fn prepare(&mut self) -> Result<(), Error> {
        let timeout = self.config.reply_timeout_ms;
        self.send_token(Token::InitHeader);
        self.expect(Token::Ack, timeout)?;
        self.send_token(Token::RandStart);
        self.expect(Token::Ack, timeout)
    }

    fn send_paragraph(
        &mut self,
        block: u16,
        page: u8,
        paragraph: u8,
        data: &Paragraph,
        idle: &mut dyn FnMut(),
    ) -> Result<(), Error> {
        self.send_token(Token::BeginData);
        self.serial.send_buffer(&block.to_le_bytes());
        self.serial.send_buffer(&[page, paragraph]);
        for chunk in data.chunks(SEND_CHUNK) {
            self.serial.send_buffer(chunk);
            idle();
        }
        Ok(())
    }

    fn await_paragraph(&mut self, idle: &mut dyn FnMut()) -> Result<bool, Error> {
        match self.recv_token_with(self.config.reply_timeout_ms, idle)? {
            Token::DataAck => Ok(true),
            Token::DataNak => Ok(false),
            found => Err(Error::Protocol {
                expected: Token::DataAck as u8,
                found: found as u8,
            }),
        }
    }

    fn remote_checksum(&mut self, block: u16) -> Result<Option<u32>, Error> {
        self.send_token(Token::ReqChksm);
        self.serial.send_buffer(&block.to_le_bytes());
        match self.recv_token(self.config.reply_timeout_ms)? {
            Token::Chksm => Ok(Some(self.recv_u32()?)),
            Token::ChksmBad => Ok(None),
            found => Err(Error::Protocol {
                expected: Token::Chksm as u8,
                found: found as u8,
            }),
        }
    }

    fn mark_block(&mut self, block: u16, status: BlockStatus) -> Result<(), Error> {
        self.send_token(Token::MarkBlock);
        self.serial.send_buffer(&block.to_le_bytes());
        self.serial.send(status as u8);
        self.expect(Token::MarkAck, self.config.reply_timeout_ms)
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.send_token(Token::RandDone);
        self.expect(Token::Ack, self.config.reply_timeout_ms)
    }
}

impl<T: Platform> SnapPad<T> {
    /// Fill every data block with random data, on a board without twin.
    pub fn randomize_single<E: EntropySource>(&mut self, rng: &mut HwRng<E>) -> Result<(), Error> {
        self.randomize(rng, &mut Standalone)
    }

    /// Fill every data block with random data and replicate it to the slave, which has to run
    /// [`Link::process`] meanwhile.
    pub fn randomize_twinned<E: EntropySource, S: Serial, C: Clock>(
        &mut self,
        rng: &mut HwRng<E>,
        link: &mut Link<S, C>,
    ) -> Result<(), Error> {
        if self.connection != ConnectionState::TwinnedMaster {
            return Err(Error::NotTwinned);
        }
        self.randomize(rng, link)
    }

    fn randomize<E: EntropySource, R: Replica>(
        &mut self,
        rng: &mut HwRng<E>,
        replica: &mut R,
    ) -> Result<(), Error> {
        self.ensure_healthy()?;
        let result = self.randomize_inner(rng, replica);
        self.latch(result)
    }

    fn randomize_inner<E: EntropySource, R: Replica>(
        &mut self,
        rng: &mut HwRng<E>,
        replica: &mut R,
    ) -> Result<(), Error> {
        if self.header.is_some() && self.read_flags()?.is_set(Flag::RandomDataFinished) {
            return Err(Error::AlreadyRandomized);
        }

        // an interrupted run starts over with a fresh usage map
        self.initialize_header(Role::A)?;
        replica.prepare()?;
        self.set_flag(Flag::RandomDataStarted)?;

        rng.bits_start(PARAGRAPH_SIZE)?;
        for block in 1..self.config.block_count {
            if self.is_listed_bad(block) || self.read_block_status(block)? == BlockStatus::Bad {
                replica.mark_block(block, BlockStatus::Bad)?;
                continue;
            }

            #[cfg(feature = "defmt")]
            debug!("randomize block {}", block);

            #[cfg(feature = "debug-logs")]
            println!("  twin: randomize block {block}");

            if !(self.fill_block(block, rng, replica)? && self.audit_block(block, replica)?) {
                #[cfg(feature = "defmt")]
                warn!("block {} failed replication", block);

                self.mark_block(block, BlockStatus::Bad)?;
                replica.mark_block(block, BlockStatus::Bad)?;
            }
        }
        rng.wait_bits();

        replica.finish()?;
        self.set_flag(Flag::RandomDataFinished)
    }

    fn fill_block<E: EntropySource, R: Replica>(
        &mut self,
        block: u16,
        rng: &mut HwRng<E>,
        replica: &mut R,
    ) -> Result<bool, Error> {
        match raw::erase_block(&mut self.hal, block) {
            Ok(()) => {}
            Err(Error::EraseFailed(_)) => return Ok(false),
            Err(e) => return Err(e),
        }

        for page in 0..PAGES_PER_BLOCK as u8 {
            for paragraph in 0..PARAGRAPHS_PER_PAGE as u8 {
                rng.wait_bits();
                rng.swap()?;
                rng.bits_start(PARAGRAPH_SIZE)?;

                // the next paragraph fills while this one is transferred and programmed
                let data = *rng.nand_buffer();
                let mut idle = || rng.poll();
                replica.send_paragraph(block, page, paragraph, &data, &mut idle)?;
                let stored = match raw::save_paragraph_with(
                    &mut self.hal,
                    block,
                    page,
                    paragraph,
                    &data,
                    &mut idle,
                ) {
                    Ok(()) => true,
                    Err(Error::ProgramFailed(_)) => false,
                    Err(e) => return Err(e),
                };
                let replicated = replica.await_paragraph(&mut idle)?;

                if !(stored && replicated) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn audit_block<R: Replica>(&mut self, block: u16, replica: &mut R) -> Result<bool, Error> {
        if !replica.audits() {
            return Ok(true);
        }

        let local = match self.block_checksum(block) {
            Ok(sum) => Some(sum),
            Err(Error::Uncorrectable { .. }) => None,
            Err(e) => return Err(e),
        };
        let remote = replica.remote_checksum(block)?;
        Ok(local.is_some() && local == remote)
    }
}

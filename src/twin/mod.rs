//! Serial protocol between two twinned boards.
//!
//! Every frame starts with a one byte [`Token`], optionally followed by a fixed size payload.
//! Multi byte integers are little endian. The master drives every exchange, the slave only
//! answers from [`Link::process`].

mod election;
mod replicate;

use crate::error::Error;
use crate::platform::{Clock, Confirm, Platform, Serial};
use crate::raw::{
    self, BlockStatus, Flag, PAGES_PER_BLOCK, PARAGRAPH_SIZE, PARAGRAPHS_PER_PAGE, Role,
};
use crate::SnapPad;
#[cfg(feature = "defmt")]
use defmt::{debug, warn};

#[derive(strum::FromRepr, strum::Display, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Token {
    Ping = 0x10,
    Ack = 0x11,
    RstPropose = 0x12,
    RstConfirm = 0x13,
    InitHeader = 0x1A,
    /// followed by block (u16), page (u8), paragraph (u8) and 512 bytes of data
    BeginData = 0x23,
    DataAck = 0x24,
    DataNak = 0x25,
    /// followed by block (u16)
    ReqChksm = 0x26,
    /// followed by the checksum (u32)
    Chksm = 0x27,
    ChksmBad = 0x28,
    /// followed by block (u16) and the new usage map status (u8)
    MarkBlock = 0x29,
    MarkAck = 0x2A,
    RandStart = 0x2B,
    RandDone = 0x2C,
    ButtonQuery = 0x30,
    /// followed by 1 if the button is pressed, 0 otherwise
    ButtonRsp = 0x31,
}

/// Timing of the twin link, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TwinConfig {
    /// Quiet time after power up before the election starts
    pub settle_ms: u32,
    /// Length of one election round
    pub window_ms: u32,
    pub backoff_base_ms: u32,
    /// Applied to a random byte, gives the random part of the backoff
    pub backoff_mask: u8,
    /// Election rounds before giving up
    pub max_rounds: u8,
    /// How long either side waits for an answer or the rest of a frame
    pub reply_timeout_ms: u32,
    /// How long the master waits for the slave to confirm and perform a factory reset
    pub reset_timeout_ms: u32,
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            settle_ms: 1,
            window_ms: 1000,
            backoff_base_ms: 3,
            backoff_mask: 0x3f,
            max_rounds: 8,
            reply_timeout_ms: 1000,
            reset_timeout_ms: 60_000,
        }
    }
}

/// What the slave did with one inbound frame.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlaveEvent {
    /// Nothing arrived within the election window
    Idle,
    Ping,
    HeaderInitialized,
    RandomStarted,
    Paragraph {
        block: u16,
        page: u8,
        paragraph: u8,
        accepted: bool,
    },
    Checksum {
        block: u16,
        value: Option<u32>,
    },
    BlockMarked {
        block: u16,
        status: BlockStatus,
    },
    RandomDone,
    FactoryReset,
    /// The user did not confirm a proposed reset in time, the master gets no answer
    ResetDeclined,
    ButtonQueried {
        pressed: bool,
    },
    /// A token that only the master expects
    Ignored(Token),
}

pub struct Link<S: Serial, C: Clock> {
    serial: S,
    clock: C,
    config: TwinConfig,
}

impl<S: Serial, C: Clock> Link<S, C> {
    pub fn new(serial: S, clock: C, config: TwinConfig) -> Self {
        Self {
            serial,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &TwinConfig {
        &self.config
    }

    pub fn into_inner(self) -> (S, C) {
        (self.serial, self.clock)
    }

    pub(crate) fn send_token(&mut self, token: Token) {
        #[cfg(feature = "debug-logs")]
        println!("  twin: send {token}");

        self.serial.send(token as u8);
    }

    fn recv_byte(&mut self, timeout_ms: u32) -> Result<u8, Error> {
        self.serial.recv_timeout(timeout_ms).ok_or(Error::Timeout)
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let timeout = self.config.reply_timeout_ms;
        for byte in buf.iter_mut() {
            *byte = self.recv_byte(timeout)?;
        }
        Ok(())
    }

    fn recv_u16(&mut self) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        self.recv_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn recv_u32(&mut self) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.recv_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Waits for a byte without blocking in the driver, running `idle` in between.
    fn recv_byte_with(&mut self, timeout_ms: u32, idle: &mut dyn FnMut()) -> Result<u8, Error> {
        let start = self.clock.now_ms();
        loop {
            if let Some(byte) = self.serial.recv_timeout(0) {
                return Ok(byte);
            }
            if self.clock.now_ms().wrapping_sub(start) >= timeout_ms {
                return Err(Error::Timeout);
            }
            idle();
        }
    }

    fn recv_token(&mut self, timeout_ms: u32) -> Result<Token, Error> {
        let byte = self.recv_byte(timeout_ms)?;
        Self::parse_token(byte)
    }

    fn recv_token_with(&mut self, timeout_ms: u32, idle: &mut dyn FnMut()) -> Result<Token, Error> {
        let byte = self.recv_byte_with(timeout_ms, idle)?;
        Self::parse_token(byte)
    }

    fn parse_token(byte: u8) -> Result<Token, Error> {
        let token = Token::from_repr(byte).ok_or(Error::UnknownToken(byte))?;

        #[cfg(feature = "debug-logs")]
        println!("  twin: recv {token}");

        Ok(token)
    }

    fn expect(&mut self, expected: Token, timeout_ms: u32) -> Result<(), Error> {
        let found = self.recv_token(timeout_ms)?;
        if found != expected {
            #[cfg(feature = "defmt")]
            warn!("expected {}, got {}", expected, found);

            return Err(Error::Protocol {
                expected: expected as u8,
                found: found as u8,
            });
        }
        Ok(())
    }

    /// Ask the slave for a factory reset. Returns false if its user did not confirm in time; the
    /// local pad is only erased after the slave confirmed.
    pub fn propose_factory_reset<T: Platform>(
        &mut self,
        pad: &mut SnapPad<T>,
    ) -> Result<bool, Error> {
        if pad.connection_state() != crate::ConnectionState::TwinnedMaster {
            return Err(Error::NotTwinned);
        }

        self.send_token(Token::RstPropose);
        match self.expect(Token::RstConfirm, self.config.reset_timeout_ms) {
            Ok(()) => {}
            Err(Error::Timeout) => return Ok(false),
            Err(e) => return Err(e),
        }

        pad.factory_reset()?;
        Ok(true)
    }

    /// State of the button on the other board.
    pub fn remote_button(&mut self) -> Result<bool, Error> {
        self.send_token(Token::ButtonQuery);
        self.expect(Token::ButtonRsp, self.config.reply_timeout_ms)?;
        Ok(self.recv_byte(self.config.reply_timeout_ms)? != 0)
    }

    /// Handle one frame from the master. Waits one election window for it to arrive.
    pub fn process<T: Platform, U: Confirm>(
        &mut self,
        pad: &mut SnapPad<T>,
        confirm: &mut U,
    ) -> Result<SlaveEvent, Error> {
        let token = match self.recv_token(self.config.window_ms) {
            Ok(token) => token,
            Err(Error::Timeout) => return Ok(SlaveEvent::Idle),
            Err(e) => {
                #[cfg(feature = "defmt")]
                warn!("slave: {}", e);
                return Err(e);
            }
        };

        pad.ensure_healthy()?;
        let result = self.handle(pad, confirm, token);
        if let Err(_e) = &result {
            #[cfg(feature = "defmt")]
            warn!("slave drops {}: {}", token, _e);
        }
        pad.latch(result)
    }

    fn handle<T: Platform, U: Confirm>(
        &mut self,
        pad: &mut SnapPad<T>,
        confirm: &mut U,
        token: Token,
    ) -> Result<SlaveEvent, Error> {
        match token {
            Token::Ping => {
                self.send_token(Token::Ack);
                Ok(SlaveEvent::Ping)
            }
            Token::InitHeader => {
                if pad.read_flags()?.is_set(Flag::RandomDataFinished) {
                    self.send_token(Token::DataNak);
                    return Err(Error::AlreadyRandomized);
                }
                pad.initialize_header(Role::B)?;
                self.send_token(Token::Ack);
                Ok(SlaveEvent::HeaderInitialized)
            }
            Token::RandStart => {
                pad.set_flag(Flag::RandomDataStarted)?;
                self.send_token(Token::Ack);
                Ok(SlaveEvent::RandomStarted)
            }
            Token::BeginData => {
                let block = self.recv_u16()?;
                let mut header = [0u8; 2];
                self.recv_exact(&mut header)?;
                let [page, paragraph] = header;
                let mut data = [0u8; PARAGRAPH_SIZE];
                self.recv_exact(&mut data)?;

                let accepted = pad.store_replica(block, page, paragraph, &data)?;
                self.send_token(if accepted {
                    Token::DataAck
                } else {
                    Token::DataNak
                });
                Ok(SlaveEvent::Paragraph {
                    block,
                    page,
                    paragraph,
                    accepted,
                })
            }
            Token::ReqChksm => {
                let block = self.recv_u16()?;
                pad.check_data_block(block)?;
                let value = match pad.block_checksum(block) {
                    Ok(sum) => Some(sum),
                    Err(Error::Uncorrectable { .. }) => None,
                    Err(e) => return Err(e),
                };
                match value {
                    Some(sum) => {
                        self.send_token(Token::Chksm);
                        self.serial.send_buffer(&sum.to_le_bytes());
                    }
                    None => self.send_token(Token::ChksmBad),
                }
                Ok(SlaveEvent::Checksum { block, value })
            }
            Token::MarkBlock => {
                let block = self.recv_u16()?;
                let status = BlockStatus::from(self.recv_byte(self.config.reply_timeout_ms)?);
                pad.check_data_block(block)?;
                pad.mark_block(block, status)?;
                self.send_token(Token::MarkAck);
                Ok(SlaveEvent::BlockMarked { block, status })
            }
            Token::RandDone => {
                pad.set_flag(Flag::RandomDataFinished)?;
                self.send_token(Token::Ack);
                Ok(SlaveEvent::RandomDone)
            }
            Token::RstPropose => {
                if !confirm.wait_for_confirm(pad.config.confirm_timeout_ms) {
                    #[cfg(feature = "defmt")]
                    debug!("factory reset not confirmed");
                    return Ok(SlaveEvent::ResetDeclined);
                }
                pad.erase_all()?;
                self.send_token(Token::RstConfirm);
                Ok(SlaveEvent::FactoryReset)
            }
            Token::ButtonQuery => {
                let pressed = confirm.is_pressed();
                self.send_token(Token::ButtonRsp);
                self.serial.send(pressed as u8);
                Ok(SlaveEvent::ButtonQueried { pressed })
            }
            other => {
                #[cfg(feature = "defmt")]
                warn!("slave ignores {}", other);
                Ok(SlaveEvent::Ignored(other))
            }
        }
    }
}

impl<T: Platform> SnapPad<T> {
    /// Programs a paragraph received from the master. The first paragraph of a block erases it.
    /// Returns false if the block is bad on this side.
    pub(crate) fn store_replica(
        &mut self,
        block: u16,
        page: u8,
        paragraph: u8,
        data: &[u8; PARAGRAPH_SIZE],
    ) -> Result<bool, Error> {
        self.check_data_block(block)?;
        if page as usize >= PAGES_PER_BLOCK || paragraph as usize >= PARAGRAPHS_PER_PAGE {
            return Err(Error::InvalidParagraph { page, paragraph });
        }

        if page == 0 && paragraph == 0 {
            if self.is_listed_bad(block) || self.read_block_status(block)? == BlockStatus::Bad {
                return Ok(false);
            }
            match raw::erase_block(&mut self.hal, block) {
                Ok(()) => {}
                Err(Error::EraseFailed(block)) => {
                    self.mark_block(block, BlockStatus::Bad)?;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        match raw::save_paragraph(&mut self.hal, block, page, paragraph, data) {
            Ok(()) => Ok(true),
            Err(Error::ProgramFailed(block)) => {
                self.mark_block(block, BlockStatus::Bad)?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

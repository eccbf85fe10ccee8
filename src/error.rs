use thiserror::Error;

/// Errors that can occur while operating the pad. Marked as non-exhaustive to allow for future
/// additions without breaking the API. Bad blocks are not errors: they are recorded in the usage
/// map and skipped.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The configured block count does not fit the flash or the usage map page
    #[error("invalid block count")]
    InvalidBlockCount,

    /// The internal error value is returned from the provided flash driver. The pad refuses any
    /// further access until it is recreated.
    #[error("internal flash error")]
    FlashError,

    /// The flash driver cannot read and program single bytes
    #[error("flash driver is not byte addressable")]
    UnalignedDriver,

    /// The chip reported a failed program operation
    #[error("program failed in block {0}")]
    ProgramFailed(u16),

    /// The chip reported a failed erase operation
    #[error("erase failed in block {0}")]
    EraseFailed(u16),

    /// A paragraph has more than one flipped bit
    #[error("uncorrectable ecc error at {block},{page},{paragraph}")]
    Uncorrectable { block: u16, page: u8, paragraph: u8 },

    /// No OTP header has been written yet
    #[error("no header")]
    NoHeader,

    /// The pad has not been filled with random data yet
    #[error("not randomized")]
    NotRandomized,

    /// Random data has already been written; only a factory reset allows another run
    #[error("already randomized")]
    AlreadyRandomized,

    /// Provisioning accepts between one and four pages
    #[error("bad count")]
    BadCount,

    /// The page number is outside of the data blocks
    #[error("bad page {0}")]
    InvalidPage(u32),

    /// A block number outside of the chip, or block 0 where a data block is required
    #[error("bad block number {0}")]
    InvalidBlock(u16),

    /// A page or paragraph index outside of a block
    #[error("bad paragraph {page},{paragraph}")]
    InvalidParagraph { page: u8, paragraph: u8 },

    /// The page has been released before and its content is gone
    #[error("page {0} already used")]
    PageUsed(u32),

    /// The page lives in a block excluded as bad
    #[error("block {0} is bad")]
    BadBlock(u16),

    /// Every block in allocation order is used up
    #[error("no provisionable pages")]
    NoPagesAvailable,

    /// The random number pipeline is still filling its buffer
    #[error("rng busy")]
    RngBusy,

    /// The twin sent something else than the protocol allows at this point
    #[error("unexpected token 0x{found:02x}, expected 0x{expected:02x}")]
    Protocol { expected: u8, found: u8 },

    /// The twin sent a token this firmware does not know
    #[error("unknown token 0x{0:02x}")]
    UnknownToken(u8),

    /// The twin stopped answering
    #[error("twin timeout")]
    Timeout,

    /// The operation needs a connected twin
    #[error("not twinned")]
    NotTwinned,

    /// Leader election kept colliding
    #[error("negotiation failed")]
    NegotiationFailed,
}

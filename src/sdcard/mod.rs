//! The SD Card Protocol, over SPI
//!
//! Implements the SD card SPI-mode protocol on top of a generic byte
//! [`Transport`].
//!
//! This is currently optimised for readability and debugability, not
//! performance.

pub mod proto;
pub mod registers;
pub mod transport;

mod acquire;
mod spi;

use core::cell::RefCell;

use embedded_hal::delay::DelayNs;

use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx, BLOCK_LEN_U32};
use crate::{debug, trace};
use proto::{R1Status, CMD10, CMD9};
use registers::{CardIdentity, Cid, Csd, Ocr, Register};
use spi::SdCardInner;
pub use transport::{Transport, TransportError};

// =============================================================================
// Types and Implementations
// =============================================================================

/// Driver for an SD Card on an SPI bus.
///
/// Built from a [`Transport`], which gives us the bus and control over the
/// Chip Select pin, and a [`DelayNs`] implementation used while the card is
/// busy.
///
/// Nothing happens on the bus until you call [`SdCard::initialize`]. If that
/// fails, or the card is swapped, call it again: the driver never
/// re-initializes the card on its own.
///
/// All the APIs take `&self` - mutability is handled using an inner
/// `RefCell`. The driver is still single-threaded: it is not `Sync`, and every
/// call blocks until the card answers or a retry budget runs out.
pub struct SdCard<T, DELAYER>
where
    T: Transport,
    DELAYER: DelayNs,
{
    inner: RefCell<SdCardInner<T, DELAYER>>,
}

impl<T, DELAYER> SdCard<T, DELAYER>
where
    T: Transport,
    DELAYER: DelayNs,
{
    /// Create a new SD Card driver using the default options.
    ///
    /// The card will not be initialised at this time.
    pub fn new(transport: T, delayer: DELAYER) -> SdCard<T, DELAYER> {
        Self::new_with_options(transport, delayer, AcquireOpts::default())
    }

    /// Create a new SD Card driver, using the given options.
    pub fn new_with_options(
        transport: T,
        delayer: DELAYER,
        options: AcquireOpts,
    ) -> SdCard<T, DELAYER> {
        SdCard {
            inner: RefCell::new(SdCardInner::new(transport, delayer, options)),
        }
    }

    /// Run the power-up handshake with the card.
    ///
    /// Any previously negotiated state is forgotten first. On success the
    /// card is ready for block reads and the last error is cleared.
    pub fn initialize(&self) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.initialize()
    }

    /// Read one 512-byte block.
    ///
    /// `block_number` counts 512-byte blocks from the start of the card,
    /// whatever addressing scheme the card uses. Returns the number of bytes
    /// read, which is always the full block.
    pub fn read_block(&self, block_number: u32, buffer: &mut Block) -> Result<usize, Error> {
        let mut inner = self.inner.borrow_mut();
        trace!("Read block {}", block_number);
        let result = inner.read_block(block_number, buffer);
        inner.record(result)
    }

    /// Read the raw contents of the CSD or CID register.
    pub fn read_register(&self, register: Register) -> Result<[u8; Register::LEN], Error> {
        let mut inner = self.inner.borrow_mut();
        let result = inner
            .check_init()
            .and_then(|()| inner.read_register(register));
        inner.record(result)
    }

    /// Read and decode the Card Identification register.
    pub fn read_cid(&self) -> Result<CardIdentity, Error> {
        let data = self.read_register(Register::Cid)?;
        let cid = Cid { data };
        debug!("CID: {:?}", cid);
        Ok(cid.identity())
    }

    /// The card generation found by the voltage probe, if the card has been
    /// initialized.
    pub fn card_generation(&self) -> Option<CardGeneration> {
        let inner = self.inner.borrow();
        inner.card.as_ref().map(|card| card.generation)
    }

    /// How the card wants block addresses, if the card has been initialized.
    pub fn addressing(&self) -> Option<Addressing> {
        let inner = self.inner.borrow();
        inner.card.as_ref().map(|card| card.csd.addressing())
    }

    /// The Card Specific Data read during initialization.
    pub fn csd(&self) -> Option<Csd> {
        let inner = self.inner.borrow();
        inner.card.as_ref().map(|card| card.csd)
    }

    /// The Operation Conditions Register, if the card reported one during
    /// initialization. Version 1 cards usually don't.
    pub fn ocr(&self) -> Option<Ocr> {
        let inner = self.inner.borrow();
        inner.card.as_ref().and_then(|card| card.ocr)
    }

    /// Return the number of 512-byte blocks on this card.
    pub fn num_blocks(&self) -> Result<BlockCount, Error> {
        self.with_csd(|csd| BlockCount(csd.card_capacity_blocks()))
    }

    /// Return the usable size of this SD card in bytes.
    pub fn num_bytes(&self) -> Result<u64, Error> {
        Ok(self.num_blocks()?.bytes())
    }

    /// Return the usable size of this SD card in KiB, rounding up.
    pub fn capacity_kib(&self) -> Result<u32, Error> {
        Ok(self.num_blocks()?.kib())
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&self) -> Result<bool, Error> {
        self.with_csd(|csd| csd.erase_single_block_enabled())
    }

    /// Look something up in the CSD, failing (and recording the failure) if
    /// the card hasn't been initialized.
    fn with_csd<R, F>(&self, func: F) -> Result<R, Error>
    where
        F: FnOnce(&Csd) -> R,
    {
        let mut inner = self.inner.borrow_mut();
        let result = inner
            .card
            .as_ref()
            .map(|card| func(&card.csd))
            .ok_or(Error::NotInitialized);
        inner.record(result)
    }

    /// The most recent failure, if any.
    pub fn last_error(&self) -> Option<Error> {
        let inner = self.inner.borrow();
        inner.last_error
    }

    /// Mark the card as requiring a reset.
    ///
    /// Reads fail with [`Error::NotInitialized`] until
    /// [`SdCard::initialize`] succeeds again.
    pub fn mark_card_uninit(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.card = None;
    }

    /// Get a temporary borrow on the underlying transport.
    ///
    /// The given closure will be called exactly once. Useful if you need to
    /// re-clock the SPI bus once the card is initialized.
    pub fn transport<R, F>(&self, func: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut inner = self.inner.borrow_mut();
        func(&mut inner.transport)
    }

    /// Give back the transport and the delay.
    pub fn free(self) -> (T, DELAYER) {
        let inner = self.inner.into_inner();
        (inner.transport, inner.delayer)
    }
}

impl<T, DELAYER> BlockDevice for SdCard<T, DELAYER>
where
    T: Transport,
    DELAYER: DelayNs,
{
    type Error = Error;

    /// Read one block at the given block index.
    fn read(&self, block: &mut Block, block_idx: BlockIdx) -> Result<(), Self::Error> {
        self.read_block(block_idx.0, block)?;
        Ok(())
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        SdCard::num_blocks(self)
    }
}

/// Options for acquiring the card.
///
/// The defaults suit the cards we have seen. Retry counts are counts, not
/// durations: each retry costs one poll plus the matching delay.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOpts {
    /// Turn on CRC checking (CMD59) for commands and data.
    ///
    /// Some cards don't support CRC mode. At least a 512MiB Transcend one.
    pub use_crc: bool,
    /// If ACMD41 with the High Capacity Support bit is rejected as illegal,
    /// try again without it.
    pub hcs_workaround: bool,
    /// Bytes to poll for the status byte after each command.
    pub command_retries: u32,
    /// Polls for the start-of-block token before giving up.
    pub read_retries: u32,
    /// Wait between polls for the start-of-block token, in microseconds.
    pub read_poll_delay_us: u32,
    /// ACMD41 attempts before giving up on the card leaving idle state.
    ///
    /// Zero means initialization fails with `TimeoutACommand(41)` without
    /// sending ACMD41 at all.
    pub acquire_retries: u32,
    /// Wait between ACMD41 attempts, in microseconds.
    pub acquire_poll_delay_us: u32,
    /// Idle bytes clocked with the card deselected at power-on. The card
    /// needs at least 74 clocks.
    pub init_clock_bytes: usize,
}

impl Default for AcquireOpts {
    fn default() -> Self {
        AcquireOpts {
            use_crc: false,
            hcs_workaround: true,
            command_retries: 128,
            // ~100ms, see SD Physical Layer Simplified Specification 4.6.2.1
            read_retries: 1_000,
            read_poll_delay_us: 100,
            acquire_retries: 100,
            acquire_poll_delay_us: 10_000,
            init_clock_bytes: 10,
        }
    }
}

/// The possible errors this crate can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set the Chip Select pin
    ChipSelect,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// The card never left idle state during this application-specific command
    TimeoutACommand(u8),
    /// We didn't get a start-of-block token when reading data from the card
    TimeoutReadBuffer,
    /// The card rejected this command as illegal
    IllegalCommand(u8),
    /// The card does not accept our supply voltage (echoed voltage byte)
    VoltageRangeUnsupported(u8),
    /// The card echoed the wrong CMD8 check pattern
    CheckPatternMismatch(u8),
    /// We got a CRC mismatch (card gave us, we calculated)
    CrcError(u16, u16),
    /// We failed to enable CRC checking on the SD card
    CantEnableCrc,
    /// We failed to read a register (the card's status byte)
    RegisterReadError(u8),
    /// The card reported an error for this command (command, status byte)
    CommandError(u8, u8),
    /// The card sent a data error token instead of a data block
    DataError(u8),
    /// The CSD has a structure version we don't understand
    UnsupportedCsd(u8),
    /// The block number doesn't fit in this card's address space
    BlockOutOfRange(u32),
    /// The card hasn't been initialized, or the last initialization failed
    NotInitialized,
}

impl Error {
    /// Did the card simply fail to answer in time?
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::TimeoutCommand(_) | Error::TimeoutACommand(_) | Error::TimeoutReadBuffer
        )
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Error {
        match value {
            TransportError::Spi => Error::Transport,
            TransportError::Cs => Error::ChipSelect,
        }
    }
}

/// The two generations of card, as told apart by CMD8.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardGeneration {
    /// A card from v1.x of the standard. It rejects CMD8 as illegal.
    ///
    /// Always standard capacity, so limited to 2GiB in size.
    V1,
    /// A card supporting v2.0 of the standard or later.
    V2,
}

/// How a card expects the address in READ_SINGLE_BLOCK.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// The argument is a byte offset (standard capacity cards).
    Byte,
    /// The argument is a 512-byte block number (SDHC and SDXC cards).
    Block,
}

impl Addressing {
    /// Turn a block number into the command argument for this card.
    pub fn card_address(self, block_number: u32) -> Result<u32, Error> {
        match self {
            Addressing::Byte => block_number
                .checked_mul(BLOCK_LEN_U32)
                .ok_or(Error::BlockOutOfRange(block_number)),
            Addressing::Block => Ok(block_number),
        }
    }
}

/// What we learned about the card during initialization.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct CardState {
    generation: CardGeneration,
    csd: Csd,
    ocr: Option<Ocr>,
}

/// A retry budget for busy-waiting on the card.
struct Delay {
    retries_left: u32,
    interval_us: u32,
}

impl Delay {
    /// Create a new Delay object with the given maximum number of retries.
    fn new(max_retries: u32, interval_us: u32) -> Delay {
        Delay {
            retries_left: max_retries,
            interval_us,
        }
    }

    /// Wait for a while.
    ///
    /// Checks the retry counter first, and if we hit the max retry limit, the
    /// value `err` is returned. Otherwise we wait and then return `Ok(())`.
    fn delay<T>(&mut self, delayer: &mut T, err: Error) -> Result<(), Error>
    where
        T: DelayNs,
    {
        if self.retries_left == 0 {
            Err(err)
        } else {
            delayer.delay_us(self.interval_us);
            self.retries_left -= 1;
            Ok(())
        }
    }
}

/// Map a non-zero status byte from a data command onto an error.
fn command_error(command: u8, status: R1Status) -> Error {
    if status.illegal_command() {
        Error::IllegalCommand(command)
    } else if command == CMD9 || command == CMD10 {
        Error::RegisterReadError(status.0)
    } else {
        Error::CommandError(command, status.0)
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

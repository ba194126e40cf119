//! Command and data transfer for an SD Card in SPI mode.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

use embedded_hal::delay::DelayNs;

use super::proto::*;
use super::registers::Register;
use super::{command_error, AcquireOpts, CardState, Delay, Error, Transport};
use crate::blockdevice::Block;
use crate::{debug, trace, warn};

/// Idle bytes sent after deselecting, so the card lets go of its data-out
/// line.
const RELEASE_CLOCK_BYTES: usize = 2;

/// Idle bytes sent after the CRC of a data block, before deselecting.
const BLOCK_TRAILER_BYTES: usize = 2;

/// Inner details for the SD Card driver.
///
/// All the APIs required `&mut self`.
pub(super) struct SdCardInner<T, DELAYER>
where
    T: Transport,
    DELAYER: DelayNs,
{
    pub(super) transport: T,
    pub(super) delayer: DELAYER,
    pub(super) options: AcquireOpts,
    pub(super) card: Option<CardState>,
    pub(super) last_error: Option<Error>,
    /// Chip Select is asserted, left that way by a command that starts a
    /// data transfer.
    selected: bool,
}

impl<T, DELAYER> SdCardInner<T, DELAYER>
where
    T: Transport,
    DELAYER: DelayNs,
{
    /// Wrap up a transport. Touches nothing on the bus.
    pub(super) fn new(transport: T, delayer: DELAYER, options: AcquireOpts) -> Self {
        SdCardInner {
            transport,
            delayer,
            options,
            card: None,
            last_error: None,
            selected: false,
        }
    }

    /// Remember the error, if there was one, and pass the result on.
    pub(super) fn record<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        if let Err(e) = &result {
            debug!("Card error: {:?}", e);
            self.last_error = Some(*e);
        }
        result
    }

    /// Check the card is initialised. We never initialise it implicitly.
    pub(super) fn check_init(&self) -> Result<(), Error> {
        if self.card.is_none() {
            Err(Error::NotInitialized)
        } else {
            Ok(())
        }
    }

    /// Read one 512 byte block with CMD17.
    pub(super) fn read_block(
        &mut self,
        block_number: u32,
        buffer: &mut Block,
    ) -> Result<usize, Error> {
        let addressing = match self.card {
            Some(ref card) => card.csd.addressing(),
            None => return Err(Error::NotInitialized),
        };
        let address = addressing.card_address(block_number)?;
        self.read_block_transfer(Command::new(CMD17, address), buffer)
    }

    /// Read the 16 bytes of a register that the card sends like a data block.
    pub(super) fn read_register(
        &mut self,
        register: Register,
    ) -> Result<[u8; Register::LEN], Error> {
        let mut data = [0u8; Register::LEN];
        self.read_block_transfer(Command::new(register.command(), 0), &mut data)?;
        Ok(data)
    }

    /// Send a command that is answered with a data block, and read the block.
    ///
    /// The bus is always released afterwards, even if the read failed.
    fn read_block_transfer(
        &mut self,
        command: Command,
        buffer: &mut [u8],
    ) -> Result<usize, Error> {
        let response = self.card_command(command.keep_selected())?;
        let status = response.status();
        let result = if status.0 != R1_READY_STATE {
            Err(command_error(command.index, status))
        } else {
            self.read_data(buffer)
        };

        // The card finishes driving the bus a little after the CRC.
        let trailer_res = self.transport.send_idle(BLOCK_TRAILER_BYTES);
        let release_res = self.release();

        let count = result?;
        trailer_res?;
        release_res?;
        Ok(count)
    }

    /// Read an arbitrary number of bytes from the card using the SD Card
    /// protocol and an optional CRC. Always fills the given buffer, so make
    /// sure it's the right size.
    fn read_data(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
        // Get the start token. Some cards send an extra 0xFF or two first.
        let mut delay = Delay::new(self.options.read_retries, self.options.read_poll_delay_us);
        loop {
            let s = self.read_byte()?;
            if s == DATA_START_BLOCK {
                break;
            }
            if s != 0 && (s & DATA_ERROR_TOKEN_MASK) == 0 {
                return Err(Error::DataError(s));
            }
            delay.delay(&mut self.delayer, Error::TimeoutReadBuffer)?;
        }

        for b in buffer.iter_mut() {
            *b = self.read_byte()?;
        }

        // These two bytes are always sent. They are either a valid CRC, or
        // junk, depending on whether CRC mode was enabled.
        let crc_bytes = [self.read_byte()?, self.read_byte()?];
        if self.options.use_crc {
            let crc = u16::from_be_bytes(crc_bytes);
            let calc_crc = crc16(buffer);
            if crc != calc_crc {
                return Err(Error::CrcError(crc, calc_crc));
            }
        }

        Ok(buffer.len())
    }

    /// Perform an application-specific command.
    pub(super) fn card_acmd(&mut self, command: Command) -> Result<Response, Error> {
        self.card_command(Command::new(CMD55, 0))?;
        self.card_command(command)
    }

    /// Perform a command.
    ///
    /// Selects the card if a previous command didn't leave it selected, and
    /// releases it afterwards unless the command asks to keep it. On a
    /// failure the card is always released.
    pub(super) fn card_command(&mut self, command: Command) -> Result<Response, Error> {
        if !self.selected {
            self.transport.select()?;
            self.selected = true;
        }

        let result = self.exchange(command);
        if result.is_err() || !command.keep_selected {
            let release_res = self.release();
            let response = result?;
            release_res?;
            Ok(response)
        } else {
            result
        }
    }

    /// Send a command frame and collect the response bytes.
    fn exchange(&mut self, command: Command) -> Result<Response, Error> {
        let frame = command.frame(self.options.use_crc);
        trace!("CMD{} arg={:x} frame={:?}", command.index, command.arg, frame);
        for b in frame {
            self.transport.transfer_byte(b)?;
        }

        let mut status = None;
        for _ in 0..self.options.command_retries {
            let candidate = R1Status(self.read_byte()?);
            if candidate.is_valid() {
                status = Some(candidate);
                break;
            }
        }
        let status = status.ok_or(Error::TimeoutCommand(command.index))?;

        let mut response = Response::new(status, command.response);
        for b in response.payload_mut() {
            *b = self.read_byte()?;
        }
        trace!("CMD{} -> {:?}", command.index, response);
        Ok(response)
    }

    /// Deselect the card, then clock it so it lets go of the bus.
    pub(super) fn release(&mut self) -> Result<(), Error> {
        self.transport.deselect()?;
        self.selected = false;
        self.transport.send_idle(RELEASE_CLOCK_BYTES)?;
        Ok(())
    }

    /// Deselect the card and clock out `count` idle bytes, to wake it up.
    pub(super) fn power_on_clocks(&mut self, count: usize) -> Result<(), Error> {
        self.transport.deselect()?;
        self.selected = false;
        self.transport.send_idle(count)?;
        Ok(())
    }

    /// Make sure Chip Select is not left asserted, trying once more if an
    /// earlier release failed.
    pub(super) fn ensure_released(&mut self) {
        if self.selected {
            if let Err(_e) = self.release() {
                warn!("Failed to release the card: {:?}", _e);
            }
        }
    }

    /// Receive a byte from the card by clocking out an 0xFF byte.
    fn read_byte(&mut self) -> Result<u8, Error> {
        Ok(self.transport.transfer_byte(0xFF)?)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

//! The power-up handshake that takes a card from reset to ready.

use embedded_hal::delay::DelayNs;

use super::proto::*;
use super::registers::{Csd, Ocr, Register};
use super::spi::SdCardInner;
use super::{CardGeneration, CardState, Delay, Error, Transport};
use crate::{debug, trace, warn};

/// Where we are in the handshake.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug)]
enum AcquireState {
    /// Clock the card with Chip Select deasserted
    PowerOn,
    /// CMD0, which puts the card into SPI mode
    Reset,
    /// CMD8, which only v2 cards understand
    VoltageProbe,
    /// CMD58, to see what the card says about itself
    OcrCheck(CardGeneration),
    /// ACMD41 until the card leaves idle state
    Acmd41Poll(CardGeneration, Option<Ocr>),
    /// CMD9, for the card size
    ReadGeometry(CardGeneration, Option<Ocr>),
    /// Done
    Ready(CardState),
}

impl<T, DELAYER> SdCardInner<T, DELAYER>
where
    T: Transport,
    DELAYER: DelayNs,
{
    /// Forget the card, then run the handshake and keep what it finds.
    pub(super) fn initialize(&mut self) -> Result<(), Error> {
        self.card = None;
        let result = self.acquire();
        self.ensure_released();
        match result {
            Ok(card) => {
                debug!("Card ready: {:?}", card);
                self.card = Some(card);
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                warn!("Card initialization failed: {:?}", e);
                self.last_error = Some(e);
                Err(e)
            }
        }
    }

    /// Initializes the card into a known state (or at least tries to).
    fn acquire(&mut self) -> Result<CardState, Error> {
        debug!("acquiring card with opts: {:?}", self.options);
        let mut state = AcquireState::PowerOn;
        loop {
            debug!("acquire state: {:?}", state);
            state = match state {
                AcquireState::PowerOn => {
                    self.power_on_clocks(self.options.init_clock_bytes)?;
                    AcquireState::Reset
                }
                AcquireState::Reset => {
                    self.reset()?;
                    if self.options.use_crc {
                        self.enable_crc()?;
                    }
                    AcquireState::VoltageProbe
                }
                AcquireState::VoltageProbe => AcquireState::OcrCheck(self.probe_voltage()?),
                AcquireState::OcrCheck(generation) => {
                    AcquireState::Acmd41Poll(generation, self.check_ocr()?)
                }
                AcquireState::Acmd41Poll(generation, ocr) => {
                    self.wait_ready(generation)?;
                    AcquireState::ReadGeometry(generation, ocr)
                }
                AcquireState::ReadGeometry(generation, ocr) => {
                    let csd = Csd::from_bytes(self.read_register(Register::Csd)?)?;
                    debug!("CSD: {:?}", csd);
                    AcquireState::Ready(CardState {
                        generation,
                        csd,
                        ocr,
                    })
                }
                AcquireState::Ready(card) => return Ok(card),
            };
        }
    }

    /// Send CMD0. We only try once: a card that doesn't answer isn't there.
    fn reset(&mut self) -> Result<(), Error> {
        let response = self.card_command(Command::new(CMD0, 0))?;
        if !response.status().in_idle_state() {
            warn!(
                "CMD0 got {:x}, expected idle state. Carrying on.",
                response.status().0
            );
        }
        Ok(())
    }

    /// Turn on CRC checking. Cards start in SPI mode with it off.
    fn enable_crc(&mut self) -> Result<(), Error> {
        debug!("Enable CRC");
        let response = self.card_command(Command::new(CMD59, 1))?;
        if response.status().0 != R1_IDLE_STATE {
            return Err(Error::CantEnableCrc);
        }
        Ok(())
    }

    /// Send CMD8 and work out which generation of card this is.
    fn probe_voltage(&mut self) -> Result<CardGeneration, Error> {
        let response = self.card_command(Command::new(CMD8, CMD8_ARG))?;
        let status = response.status();
        if status.illegal_command() {
            debug!("CMD8 is illegal, v1 card");
            return Ok(CardGeneration::V1);
        }
        if status.has_errors() {
            return Err(Error::CommandError(CMD8, status.0));
        }
        let echo = response.payload();
        let voltage = echo[2] & 0x0F;
        if voltage != CMD8_VOLTAGE_27_36 {
            return Err(Error::VoltageRangeUnsupported(echo[2]));
        }
        if echo[3] != CMD8_CHECK_PATTERN {
            return Err(Error::CheckPatternMismatch(echo[3]));
        }
        debug!("CMD8 echoed correctly, v2 card");
        Ok(CardGeneration::V2)
    }

    /// Read the OCR. The card's answer is only informative, so anything
    /// short of a bus failure is logged and ignored.
    fn check_ocr(&mut self) -> Result<Option<Ocr>, Error> {
        match self.card_command(Command::new(CMD58, 0)) {
            Ok(response) if response.status().has_errors() => {
                warn!("CMD58 got {:x}, no OCR", response.status().0);
                Ok(None)
            }
            Ok(response) => {
                let ocr = Ocr(response.payload_u32());
                debug!("OCR: {:?}", ocr);
                Ok(Some(ocr))
            }
            Err(e) if e.is_timeout() => {
                warn!("CMD58 timed out, no OCR");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Send ACMD41 until the card says it has finished initializing.
    ///
    /// Each failed attempt is followed by a delay, up to
    /// `acquire_retries` attempts in total.
    fn wait_ready(&mut self, generation: CardGeneration) -> Result<(), Error> {
        let mut arg = match generation {
            CardGeneration::V1 => 0,
            CardGeneration::V2 => ACMD41_HCS,
        };
        if self.options.acquire_retries == 0 {
            warn!("No ACMD41 attempts allowed");
            return Err(Error::TimeoutACommand(ACMD41));
        }
        let mut delay = Delay::new(
            self.options.acquire_retries - 1,
            self.options.acquire_poll_delay_us,
        );
        for _attempt in 1.. {
            match self.card_acmd(Command::app(ACMD41, arg)) {
                Ok(response) if response.status().illegal_command() => {
                    if arg & ACMD41_HCS != 0 && self.options.hcs_workaround {
                        warn!("ACMD41 with HCS is illegal, retrying without it");
                        arg &= !ACMD41_HCS;
                    } else {
                        return Err(Error::IllegalCommand(ACMD41));
                    }
                }
                Ok(response) if !response.status().in_idle_state() => {
                    if response.status().has_errors() {
                        return Err(Error::CommandError(ACMD41, response.status().0));
                    }
                    debug!("Card left idle state after {} attempts", _attempt);
                    return Ok(());
                }
                Ok(_) => {
                    trace!("Card still idle, attempt {}", _attempt);
                }
                Err(e) if e.is_timeout() => {
                    warn!("ACMD41 timed out on attempt {}", _attempt);
                }
                Err(e) => return Err(e),
            }
            delay.delay(&mut self.delayer, Error::TimeoutACommand(ACMD41))?;
        }
        Err(Error::TimeoutACommand(ACMD41))
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

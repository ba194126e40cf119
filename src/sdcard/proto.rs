//! Constants and framing from the SD Specifications
//!
//! Based on SdFat, under the following terms:
//!
//! > Copyright (c) 2011-2018 Bill Greiman
//! > This file is part of the SdFat library for SD memory cards.
//! >
//! > MIT License
//! >
//! > Permission is hereby granted, free of charge, to any person obtaining a
//! > copy of this software and associated documentation files (the "Software"),
//! > to deal in the Software without restriction, including without limitation
//! > the rights to use, copy, modify, merge, publish, distribute, sublicense,
//! > and/or sell copies of the Software, and to permit persons to whom the
//! > Software is furnished to do so, subject to the following conditions:
//! >
//! > The above copyright notice and this permission notice shall be included
//! > in all copies or substantial portions of the Software.
//! >
//! > THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//! > OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//! > FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//! > AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//! > LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//! > FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//! > DEALINGS IN THE SOFTWARE.

use byteorder::{BigEndian, ByteOrder};

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the card identification information (CID register)
pub const CMD10: u8 = 0x0A;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SEND_STATUS - read the card status register
pub const CMD13: u8 = 0x0D;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking
pub const CMD59: u8 = 0x3B;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

//==============================================================================

/// Argument for CMD8: 2.7-3.6V window (VHS = 0b0001) and our check pattern.
pub const CMD8_ARG: u32 = 0x0000_01A5;

/// The VHS value we put in CMD8, which the card echoes back if it agrees.
pub const CMD8_VOLTAGE_27_36: u8 = 0x01;

/// The check pattern we put in CMD8, which the card echoes back.
pub const CMD8_CHECK_PATTERN: u8 = 0xA5;

/// Host Capacity Support bit for ACMD41.
pub const ACMD41_HCS: u32 = 0x4000_0000;

/// CMD0 is always CRC checked, even in SPI mode. This is its CRC byte.
pub const CMD0_CRC: u8 = 0x95;

/// CMD8 is always CRC checked, even in SPI mode. This is its CRC byte, and
/// is only valid with [`CMD8_ARG`].
pub const CMD8_CRC: u8 = 0x69;

/// CRC byte sent for every other command when CRC mode is off. The card
/// ignores the CRC bits, but the end bit must still be set.
pub const NO_CRC: u8 = 0x01;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// status bit for erase reset
pub const R1_ERASE_RESET: u8 = 0x02;

/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// status bit for a command CRC error
pub const R1_COM_CRC_ERROR: u8 = 0x08;

/// status bit for an erase sequence error
pub const R1_ERASE_SEQUENCE_ERROR: u8 = 0x10;

/// status bit for an address error
pub const R1_ADDRESS_ERROR: u8 = 0x20;

/// status bit for a parameter error
pub const R1_PARAMETER_ERROR: u8 = 0x40;

/// always zero in a valid response; the bus idles high
pub const R1_START_BIT: u8 = 0x80;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// a data error token has the top three bits clear
pub const DATA_ERROR_TOKEN_MASK: u8 = 0xE0;

//==============================================================================

/// The different response formats a command can produce in SPI mode.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// Just the status byte
    R1,
    /// The status byte, then the card may hold the bus busy
    R1b,
    /// The status byte and one more status byte
    R2,
    /// The status byte and the 32-bit OCR
    R3,
    /// The status byte and the 32-bit interface condition
    R7,
}

impl ResponseKind {
    /// The response format for a given command index.
    pub const fn for_command(index: u8) -> ResponseKind {
        match index {
            CMD8 => ResponseKind::R7,
            CMD12 | 28 | 29 | 38 => ResponseKind::R1b,
            CMD13 => ResponseKind::R2,
            CMD58 => ResponseKind::R3,
            _ => ResponseKind::R1,
        }
    }

    /// Total length on the wire, including the status byte.
    pub const fn len(self) -> usize {
        match self {
            ResponseKind::R1 | ResponseKind::R1b => 1,
            ResponseKind::R2 => 2,
            ResponseKind::R3 | ResponseKind::R7 => 5,
        }
    }
}

/// A command to be sent to the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Command {
    /// The 6-bit command index (e.g. 17 for CMD17)
    pub index: u8,
    /// The 32-bit argument
    pub arg: u32,
    /// What the card sends back
    pub response: ResponseKind,
    /// Leave Chip Select asserted after the response, because a data block
    /// follows
    pub keep_selected: bool,
}

impl Command {
    /// Build a command, picking the response format from the command index.
    pub const fn new(index: u8, arg: u32) -> Command {
        let index = index & 0x3F;
        Command {
            index,
            arg,
            response: ResponseKind::for_command(index),
            keep_selected: false,
        }
    }

    /// Build an application-specific command. It is sent after CMD55.
    ///
    /// The ACMDs we use all answer with a plain R1.
    pub const fn app(index: u8, arg: u32) -> Command {
        Command {
            index: index & 0x3F,
            arg,
            response: ResponseKind::R1,
            keep_selected: false,
        }
    }

    /// Mark this command as the start of a data transfer.
    pub const fn keep_selected(self) -> Command {
        Command {
            keep_selected: true,
            ..self
        }
    }

    /// Render the six bytes that go on the wire.
    pub fn frame(&self, use_crc: bool) -> [u8; 6] {
        let arg = pack_argument(self.arg);
        let mut buf = [0x40 | self.index, arg[0], arg[1], arg[2], arg[3], 0];
        buf[5] = if use_crc {
            crc7(&buf[0..5])
        } else {
            match self.index {
                CMD0 => CMD0_CRC,
                CMD8 => CMD8_CRC,
                _ => NO_CRC,
            }
        };
        buf
    }
}

/// The first byte of every response.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct R1Status(pub u8);

impl R1Status {
    /// Is this a response at all, rather than the idle bus?
    pub const fn is_valid(self) -> bool {
        (self.0 & R1_START_BIT) == 0
    }

    /// The card is running its initialization process.
    pub const fn in_idle_state(self) -> bool {
        (self.0 & R1_IDLE_STATE) != 0
    }

    /// An erase sequence was cleared before executing.
    pub const fn erase_reset(self) -> bool {
        (self.0 & R1_ERASE_RESET) != 0
    }

    /// The card does not know this command.
    pub const fn illegal_command(self) -> bool {
        (self.0 & R1_ILLEGAL_COMMAND) != 0
    }

    /// The CRC of the last command failed.
    pub const fn crc_error(self) -> bool {
        (self.0 & R1_COM_CRC_ERROR) != 0
    }

    /// An error in the sequence of erase commands.
    pub const fn erase_sequence_error(self) -> bool {
        (self.0 & R1_ERASE_SEQUENCE_ERROR) != 0
    }

    /// A misaligned address that did not match the block length.
    pub const fn address_error(self) -> bool {
        (self.0 & R1_ADDRESS_ERROR) != 0
    }

    /// The argument was out of the allowed range for this card.
    pub const fn parameter_error(self) -> bool {
        (self.0 & R1_PARAMETER_ERROR) != 0
    }

    /// Any of the error bits (everything except idle) is set.
    pub const fn has_errors(self) -> bool {
        (self.0 & !(R1_IDLE_STATE | R1_START_BIT)) != 0
    }
}

/// A response to a [`Command`]: the status byte plus up to four more bytes.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Response {
    status: R1Status,
    payload: [u8; 4],
    kind: ResponseKind,
}

impl Response {
    /// A response with the given status and an empty payload.
    pub const fn new(status: R1Status, kind: ResponseKind) -> Response {
        Response {
            status,
            payload: [0; 4],
            kind,
        }
    }

    /// The R1 part of the response
    pub const fn status(&self) -> R1Status {
        self.status
    }

    /// The bytes after the status byte, in the order the card sent them.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.kind.len() - 1]
    }

    pub(crate) fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.kind.len() - 1;
        &mut self.payload[..len]
    }

    /// The R3/R7 payload as a 32-bit value. Zero for other formats.
    pub fn payload_u32(&self) -> u32 {
        match self.kind {
            ResponseKind::R3 | ResponseKind::R7 => BigEndian::read_u32(&self.payload),
            _ => 0,
        }
    }
}

/// Pack a 32-bit command argument into the order it goes on the wire.
pub fn pack_argument(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    buf
}

/// Turn four argument bytes, in wire order, back into a value.
pub fn unpack_argument(bytes: &[u8; 4]) -> u32 {
    BigEndian::read_u32(bytes)
}

/// Perform the 7-bit CRC used on the SD card. The result is shifted up and
/// has the end bit set, ready to send as the last byte of a command.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Perform the X25 CRC calculation, as used for data blocks.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc = ((crc >> 8) & 0xFF) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_crc7() {
        const DATA: [u8; 15] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40");
        assert_eq!(crc7(&DATA), 0xA5);
    }

    #[test]
    fn crc7_of_fixed_commands() {
        assert_eq!(crc7(&hex!("40 00 00 00 00")), CMD0_CRC);
        assert_eq!(crc7(&hex!("48 00 00 01 A5")), CMD8_CRC);
        // The more common check pattern, as used by SdFat
        assert_eq!(crc7(&hex!("48 00 00 01 AA")), 0x87);
    }

    #[test]
    fn test_crc16() {
        // An actual CSD read from an SD card
        const DATA: [u8; 16] = hex!("00 26 00 32 5F 5A 83 AE FE FB CF FF 92 80 40 DF");
        assert_eq!(crc16(&DATA), 0x9fc5);
        assert_eq!(crc16(&[0u8; 512]), 0x0000);
    }

    #[test]
    fn frames_without_crc() {
        assert_eq!(Command::new(CMD0, 0).frame(false), hex!("40 00 00 00 00 95"));
        assert_eq!(
            Command::new(CMD8, CMD8_ARG).frame(false),
            hex!("48 00 00 01 A5 69")
        );
        assert_eq!(
            Command::new(CMD17, 0x0001_0200).frame(false),
            hex!("51 00 01 02 00 01")
        );
    }

    #[test]
    fn frames_with_crc() {
        assert_eq!(Command::new(CMD0, 0).frame(true), hex!("40 00 00 00 00 95"));
        assert_eq!(
            Command::new(CMD8, CMD8_ARG).frame(true),
            hex!("48 00 00 01 A5 69")
        );
        let frame = Command::new(CMD17, 0x0001_0200).frame(true);
        assert_eq!(frame[5], crc7(&frame[0..5]));
        assert_eq!(frame[5] & 1, 1);
    }

    #[test]
    fn command_index_is_six_bits() {
        let cmd = Command::new(0xFF, 0);
        assert_eq!(cmd.index, 0x3F);
        assert_eq!(cmd.frame(false)[0], 0x7F);
    }

    #[test]
    fn response_kinds() {
        assert_eq!(Command::new(CMD0, 0).response, ResponseKind::R1);
        assert_eq!(Command::new(CMD8, 0).response, ResponseKind::R7);
        assert_eq!(Command::new(CMD12, 0).response, ResponseKind::R1b);
        assert_eq!(Command::new(CMD13, 0).response, ResponseKind::R2);
        assert_eq!(Command::new(CMD58, 0).response, ResponseKind::R3);
        assert_eq!(Command::app(ACMD41, ACMD41_HCS).response, ResponseKind::R1);
        assert_eq!(ResponseKind::R7.len(), 5);
        assert_eq!(ResponseKind::R2.len(), 2);
        assert!(!Command::new(CMD17, 0).keep_selected);
        assert!(Command::new(CMD17, 0).keep_selected().keep_selected);
    }

    #[test]
    fn argument_packing() {
        for value in [0, 1, 0x7FFF_FFFF, 0xFFFF_FFFF, 0x1A5] {
            assert_eq!(unpack_argument(&pack_argument(value)), value);
        }
        assert_eq!(pack_argument(0x1234_5678), [0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn r1_bits() {
        let status = R1Status(R1_ILLEGAL_COMMAND | R1_IDLE_STATE);
        assert!(status.is_valid());
        assert!(status.in_idle_state());
        assert!(status.illegal_command());
        assert!(status.has_errors());
        assert!(!status.crc_error());
        assert!(!R1Status(0xFF).is_valid());
        assert!(!R1Status(R1_IDLE_STATE).has_errors());
        assert!(R1Status(R1_PARAMETER_ERROR).parameter_error());
        assert!(R1Status(R1_ADDRESS_ERROR).address_error());
        assert!(R1Status(R1_ERASE_SEQUENCE_ERROR).erase_sequence_error());
        assert!(R1Status(R1_ERASE_RESET).erase_reset());
        assert!(R1Status(R1_COM_CRC_ERROR).crc_error());
    }

    #[test]
    fn response_payloads() {
        let mut r7 = Response::new(R1Status(R1_IDLE_STATE), ResponseKind::R7);
        r7.payload_mut().copy_from_slice(&hex!("00 00 01 A5"));
        assert_eq!(r7.payload(), &hex!("00 00 01 A5"));
        assert_eq!(r7.payload_u32(), CMD8_ARG);

        let r1 = Response::new(R1Status(R1_READY_STATE), ResponseKind::R1);
        assert!(r1.payload().is_empty());
        assert_eq!(r1.payload_u32(), 0);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

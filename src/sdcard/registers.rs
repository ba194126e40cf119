//! Decoders for the CSD, CID and OCR registers.
//!
//! All three are sent by the card most-significant byte first, so `data[0]`
//! holds bits 127..120 of a 128-bit register.

use super::proto::{CMD10, CMD9};
use super::{Addressing, CardGeneration, Error};
use crate::blockdevice::BLOCK_LEN_U64;
use byteorder::{BigEndian, ByteOrder};

/// The registers that are read like a 16-byte data block.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Register {
    /// Card Specific Data, read with CMD9
    Csd,
    /// Card Identification, read with CMD10
    Cid,
}

impl Register {
    /// Length of every register in this set.
    pub const LEN: usize = 16;

    /// The command that makes the card send this register.
    pub const fn command(self) -> u8 {
        match self {
            Register::Csd => CMD9,
            Register::Cid => CMD10,
        }
    }
}

/// Card Specific Data, version 1
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Csd {
    /// A version 1 CSD, from an SDSC card
    V1(CsdV1),
    /// A version 2 CSD, from an SDHC or SDXC card
    V2(CsdV2),
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(data_read_access_time2, u8, 2, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(read_partial_blocks, bool, 6, 7);
    define_field!(write_block_misalignment, bool, 6, 6);
    define_field!(read_block_misalignment, bool, 6, 5);
    define_field!(dsr_implemented, bool, 6, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(max_read_current_vdd_max, u8, 8, 0, 3);
    define_field!(max_read_current_vdd_min, u8, 8, 3, 3);
    define_field!(max_write_current_vdd_max, u8, 9, 2, 3);
    define_field!(max_write_current_vdd_min, u8, 9, 5, 3);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(write_protect_group_size, u8, 11, 0, 7);
    define_field!(write_protect_group_enable, bool, 12, 7);
    define_field!(write_speed_factor, u8, 12, 2, 3);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(write_partial_blocks, bool, 13, 5);
    define_field!(file_format, u8, 14, 2, 2);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(copy_flag_set, bool, 14, 6);
    define_field!(file_format_group_set, bool, 14, 7);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    ///
    /// `(C_SIZE + 1) * 2^(C_SIZE_MULT + 2)` blocks of `2^READ_BL_LEN` bytes.
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + 2 + self.read_block_length();
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.card_capacity_bytes() / BLOCK_LEN_U64) as u32
    }
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(data_read_access_time2, u8, 2, 0, 8);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(read_partial_blocks, bool, 6, 7);
    define_field!(write_block_misalignment, bool, 6, 6);
    define_field!(read_block_misalignment, bool, 6, 5);
    define_field!(dsr_implemented, bool, 6, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(write_protect_group_size, u8, 11, 0, 7);
    define_field!(write_protect_group_enable, bool, 12, 7);
    define_field!(write_speed_factor, u8, 12, 2, 3);
    define_field!(max_write_data_length, u8, [(12, 0, 2), (13, 6, 2)]);
    define_field!(write_partial_blocks, bool, 13, 5);
    define_field!(file_format, u8, 14, 2, 2);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(permanent_write_protection, bool, 14, 5);
    define_field!(copy_flag_set, bool, 14, 6);
    define_field!(file_format_group_set, bool, 14, 7);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        // C_SIZE is 22 bits, so only the top value can overflow
        (self.device_size() + 1).saturating_mul(1024)
    }
}

impl Csd {
    /// Pick the layout from the CSD_STRUCTURE bits in byte 0.
    pub fn from_bytes(data: [u8; 16]) -> Result<Csd, Error> {
        match data[0] >> 6 {
            0 => Ok(Csd::V1(CsdV1 { data })),
            1 => Ok(Csd::V2(CsdV2 { data })),
            other => Err(Error::UnsupportedCsd(other)),
        }
    }

    /// Which generation of card this CSD layout belongs to
    pub fn generation(&self) -> CardGeneration {
        match self {
            Csd::V1(_) => CardGeneration::V1,
            Csd::V2(_) => CardGeneration::V2,
        }
    }

    /// How the card expects READ_SINGLE_BLOCK addresses.
    ///
    /// Only cards with a version 1 CSD are byte-addressed.
    pub fn addressing(&self) -> Addressing {
        match self {
            Csd::V1(_) => Addressing::Byte,
            Csd::V2(_) => Addressing::Block,
        }
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        match self {
            Csd::V1(contents) => contents.card_capacity_blocks(),
            Csd::V2(contents) => contents.card_capacity_blocks(),
        }
    }

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(contents) => contents.card_capacity_bytes(),
            Csd::V2(contents) => contents.card_capacity_bytes(),
        }
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(contents) => contents.erase_single_block_enabled(),
            Csd::V2(contents) => contents.erase_single_block_enabled(),
        }
    }
}

/// Decode a raw CSD into the card generation and its size in 512-byte
/// blocks.
pub fn decode_csd(data: &[u8; 16]) -> Result<(CardGeneration, u32), Error> {
    let csd = Csd::from_bytes(*data)?;
    Ok((csd.generation(), csd.card_capacity_blocks()))
}

/// Card Identification register
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Cid {
    /// The 16-bytes of data in this Card Identification block
    pub data: [u8; 16],
}

impl Cid {
    /// Create a new, empty, CID
    pub fn new() -> Cid {
        Cid::default()
    }

    define_field!(manufacturer_id, u8, 0);
    define_field!(oem_id, bytes, 1, 2);
    define_field!(product_name, bytes, 3, 5);
    define_field!(product_revision, u8, 8);
    define_field!(revision_major, u8, 8, 4, 4);
    define_field!(revision_minor, u8, 8, 0, 4);
    define_field!(serial_number, u32, 9);
    define_field!(manufacture_year_offset, u8, [(13, 0, 4), (14, 4, 4)]);
    define_field!(manufacture_month, u8, 14, 0, 4);
    define_field!(crc, u8, 15, 1, 7);

    /// The year of manufacture, counted from 2000.
    pub fn manufacture_year(&self) -> u16 {
        2000 + u16::from(self.manufacture_year_offset())
    }

    /// Unpack everything into plain values.
    pub fn identity(&self) -> CardIdentity {
        CardIdentity {
            manufacturer_id: self.manufacturer_id(),
            oem_id: ascii_field(self.oem_id()),
            product_name: ascii_field(self.product_name()),
            revision_major: self.revision_major(),
            revision_minor: self.revision_minor(),
            serial_number: self.serial_number(),
            manufacture_month: self.manufacture_month(),
            manufacture_year: self.manufacture_year(),
        }
    }
}

/// The contents of the CID register, unpacked.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardIdentity {
    /// Manufacturer ID, assigned by the SD Card Association
    pub manufacturer_id: u8,
    /// OEM/Application ID, two ASCII characters
    pub oem_id: heapless::String<2>,
    /// Product name, five ASCII characters
    pub product_name: heapless::String<5>,
    /// Product revision, the `n` in `n.m`
    pub revision_major: u8,
    /// Product revision, the `m` in `n.m`
    pub revision_minor: u8,
    /// Product serial number
    pub serial_number: u32,
    /// Month of manufacture, 1 to 12
    pub manufacture_month: u8,
    /// Year of manufacture
    pub manufacture_year: u16,
}

/// Decode a raw CID.
pub fn decode_cid(data: &[u8; 16]) -> CardIdentity {
    Cid { data: *data }.identity()
}

/// Copy fixed-width ASCII text out of a register. Anything that isn't
/// printable becomes `?`.
fn ascii_field<const N: usize>(bytes: &[u8]) -> heapless::String<N> {
    let mut text = heapless::String::new();
    for &b in bytes.iter().take(N) {
        let c = if b.is_ascii_graphic() || b == b' ' {
            char::from(b)
        } else {
            '?'
        };
        // Cannot fail, we never push more than N characters
        let _ = text.push(c);
    }
    text
}

/// Operation Conditions Register, as returned by CMD58.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Ocr(pub u32);

impl Ocr {
    const POWER_UP_STATUS: u32 = 1 << 31;
    const CARD_CAPACITY_STATUS: u32 = 1 << 30;
    const VDD_WINDOW: u32 = 0x00FF_8000;
    const VDD_32_34: u32 = 0x0030_0000;

    /// The card has finished powering up. The other status bits are only
    /// valid once this is set.
    pub const fn powered_up(self) -> bool {
        (self.0 & Self::POWER_UP_STATUS) != 0
    }

    /// CCS: set for SDHC/SDXC cards, once powered up.
    pub const fn card_capacity_status(self) -> bool {
        (self.0 & Self::CARD_CAPACITY_STATUS) != 0
    }

    /// The supported VDD window, bits 15 (2.7-2.8V) to 23 (3.5-3.6V).
    pub const fn voltage_window(self) -> u32 {
        self.0 & Self::VDD_WINDOW
    }

    /// Does the card run from a 3.3V supply?
    pub const fn supports_3v3(self) -> bool {
        (self.0 & Self::VDD_32_34) != 0
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

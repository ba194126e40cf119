//! # embedded-sdspi
//!
//! > A blocking SD Card driver for Embedded Rust
//!
//! This crate lets you read raw 512-byte blocks from an SD card (SDSC, SDHC
//! or SDXC) connected over SPI, and find out how big the card is. It is
//! written in pure-Rust, is `#![no_std]` and does not use `alloc` or
//! `collections` to keep the memory footprint low. In the first instance it
//! is designed for readability and simplicity over performance.
//!
//! There is no filesystem support and no write support. If you need those,
//! put a filesystem crate on top of the [`BlockDevice`] implementation.
//!
//! ## Using the crate
//!
//! You will need something that implements the [`Transport`] trait: one byte
//! in, one byte out, plus control over the card's Chip Select line. The
//! [`SpiTransport`] type builds one from an `embedded-hal` [`SpiBus`] and an
//! [`OutputPin`]. You also need a [`DelayNs`] implementation, which is used
//! between polls while the card is busy.
//!
//! ```rust
//! use embedded_sdspi::{Error, SdCard, SpiTransport};
//!
//! fn example<BUS, CS, D>(bus: BUS, cs: CS, delay: D) -> Result<(), Error>
//! where
//!     BUS: embedded_hal::spi::SpiBus<u8>,
//!     CS: embedded_hal::digital::OutputPin,
//!     D: embedded_hal::delay::DelayNs,
//! {
//!     let sdcard = SdCard::new(SpiTransport::new(bus, cs), delay);
//!     sdcard.initialize()?;
//!     println!("Card is {} KiB", sdcard.capacity_kib()?);
//!     let mut block = [0u8; 512];
//!     let num_read = sdcard.read_block(0, &mut block)?;
//!     println!("Read {} bytes, MBR signature {:02x?}", num_read, &block[510..]);
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over defmt
//!   instead.
//! * `embassy-sync-06`: Enabled by default. Provides a [`Transport`] which
//!   shares the SPI bus through an `embassy-sync` blocking mutex.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.
//!
//! [`SpiBus`]: embedded_hal::spi::SpiBus
//! [`OutputPin`]: embedded_hal::digital::OutputPin
//! [`DelayNs`]: embedded_hal::delay::DelayNs

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

#[macro_use]
mod structure;

pub mod blockdevice;
pub mod sdcard;

#[doc(inline)]
pub use blockdevice::{Block, BlockCache, BlockCount, BlockDevice, BlockIdx};

#[doc(inline)]
pub use sdcard::registers::{CardIdentity, Cid, Csd, CsdV1, CsdV2, Ocr, Register};

#[doc(inline)]
pub use sdcard::transport::{RefCellTransport, SpiTransport, Transport, TransportError};

#[cfg(feature = "embassy-sync-06")]
#[doc(inline)]
pub use sdcard::transport::EmbassyMutexTransport;

#[doc(inline)]
pub use sdcard::{AcquireOpts, Addressing, CardGeneration, Error, SdCard};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

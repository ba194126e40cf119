//! The byte-level link to the card, and provided implementations.

use core::cell::RefCell;

use embedded_hal::{digital::OutputPin, spi::SpiBus};

/// Something that can swap bytes with an SD card and drive its Chip Select
/// line.
///
/// The driver never holds Chip Select across calls into user code, but it
/// does expect [`Transport::select`] to stay in effect until the matching
/// [`Transport::deselect`].
pub trait Transport {
    /// Send one byte and return the byte clocked in at the same time.
    fn transfer_byte(&mut self, out: u8) -> Result<u8, TransportError>;

    /// Clock out `count` bytes of `0xFF`, ignoring what comes back.
    ///
    /// With Chip Select deasserted this is how the card is woken up, and how
    /// it is told to let go of its data-out line.
    fn send_idle(&mut self, count: usize) -> Result<(), TransportError> {
        for _ in 0..count {
            self.transfer_byte(0xFF)?;
        }
        Ok(())
    }

    /// Assert Chip Select (drive it low).
    fn select(&mut self) -> Result<(), TransportError>;

    /// Deassert Chip Select (drive it high).
    fn deselect(&mut self) -> Result<(), TransportError>;
}

/// Errors that can occur when using a [`Transport`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[non_exhaustive]
pub enum TransportError {
    /// An operation on the inner SPI bus failed.
    Spi,
    /// Setting the value of the Chip Select (CS) pin failed.
    Cs,
}

/// A SPI bus and a CS pin, owned outright.
pub struct SpiTransport<BUS, CS> {
    bus: BUS,
    cs: CS,
}

impl<BUS, CS> SpiTransport<BUS, CS> {
    /// Create a new `SpiTransport`.
    pub fn new(bus: BUS, cs: CS) -> Self {
        Self { bus, cs }
    }

    /// Get a mutable reference to the SPI bus, e.g. to change its clock
    /// speed.
    pub fn bus_mut(&mut self) -> &mut BUS {
        &mut self.bus
    }

    /// Give back the bus and the pin.
    pub fn free(self) -> (BUS, CS) {
        (self.bus, self.cs)
    }
}

impl<BUS, CS> Transport for SpiTransport<BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    fn transfer_byte(&mut self, out: u8) -> Result<u8, TransportError> {
        transfer_byte(&mut self.bus, out)
    }

    fn send_idle(&mut self, count: usize) -> Result<(), TransportError> {
        send_idle(&mut self.bus, count)
    }

    fn select(&mut self) -> Result<(), TransportError> {
        set_cs(&mut self.bus, &mut self.cs, false)
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        set_cs(&mut self.bus, &mut self.cs, true)
    }
}

/// A wrapper around a SPI bus and a CS pin, using a `RefCell`.
///
/// This allows sharing the bus within the same thread. The bus is only
/// borrowed for the length of each call, so another device may use it while
/// the card is deselected.
pub struct RefCellTransport<'a, BUS, CS> {
    bus: &'a RefCell<BUS>,
    cs: CS,
}

impl<'a, BUS, CS> RefCellTransport<'a, BUS, CS> {
    /// Create a new `RefCellTransport`.
    pub fn new(bus: &'a RefCell<BUS>, cs: CS) -> Self {
        Self { bus, cs }
    }
}

impl<BUS, CS> Transport for RefCellTransport<'_, BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    fn transfer_byte(&mut self, out: u8) -> Result<u8, TransportError> {
        let mut bus = self.bus.borrow_mut();
        transfer_byte(&mut *bus, out)
    }

    fn send_idle(&mut self, count: usize) -> Result<(), TransportError> {
        let mut bus = self.bus.borrow_mut();
        send_idle(&mut *bus, count)
    }

    fn select(&mut self) -> Result<(), TransportError> {
        let mut bus = self.bus.borrow_mut();
        set_cs(&mut *bus, &mut self.cs, false)
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        let mut bus = self.bus.borrow_mut();
        set_cs(&mut *bus, &mut self.cs, true)
    }
}

#[cfg(feature = "embassy-sync-06")]
mod embassy_sync_06 {
    use core::cell::RefCell;

    use ::embassy_sync_06::blocking_mutex;

    use super::*;

    /// A wrapper around a SPI bus and a CS pin, using an `embassy-sync` blocking mutex.
    ///
    /// This allows sharing the bus with according to the `embassy-sync` mutex model.
    /// See [`blocking_mutex::Mutex`] for more details.
    pub struct EmbassyMutexTransport<'a, BUS, CS, M> {
        bus: &'a blocking_mutex::Mutex<M, RefCell<BUS>>,
        cs: CS,
    }

    impl<'a, BUS, CS, M> EmbassyMutexTransport<'a, BUS, CS, M> {
        /// Create a new `EmbassyMutexTransport`.
        pub fn new(bus: &'a blocking_mutex::Mutex<M, RefCell<BUS>>, cs: CS) -> Self {
            Self { bus, cs }
        }
    }

    impl<CS, BUS, M> Transport for EmbassyMutexTransport<'_, BUS, CS, M>
    where
        CS: OutputPin,
        BUS: SpiBus,
        M: blocking_mutex::raw::RawMutex,
    {
        fn transfer_byte(&mut self, out: u8) -> Result<u8, TransportError> {
            self.bus.lock(|bus| {
                let mut bus = bus.borrow_mut();
                transfer_byte(&mut *bus, out)
            })
        }

        fn send_idle(&mut self, count: usize) -> Result<(), TransportError> {
            self.bus.lock(|bus| {
                let mut bus = bus.borrow_mut();
                send_idle(&mut *bus, count)
            })
        }

        fn select(&mut self) -> Result<(), TransportError> {
            let cs = &mut self.cs;
            self.bus.lock(|bus| {
                let mut bus = bus.borrow_mut();
                set_cs(&mut *bus, cs, false)
            })
        }

        fn deselect(&mut self) -> Result<(), TransportError> {
            let cs = &mut self.cs;
            self.bus.lock(|bus| {
                let mut bus = bus.borrow_mut();
                set_cs(&mut *bus, cs, true)
            })
        }
    }
}

#[cfg(feature = "embassy-sync-06")]
pub use embassy_sync_06::*;

/// Swap a single byte over the bus.
fn transfer_byte<BUS>(bus: &mut BUS, out: u8) -> Result<u8, TransportError>
where
    BUS: SpiBus,
{
    let mut buf = [out];
    bus.transfer_in_place(&mut buf)
        .map_err(|_| TransportError::Spi)?;
    Ok(buf[0])
}

/// Clock out `count` bytes of `0xFF`, a chunk at a time.
fn send_idle<BUS>(bus: &mut BUS, mut count: usize) -> Result<(), TransportError>
where
    BUS: SpiBus,
{
    const IDLE: [u8; 16] = [0xFF; 16];
    let mut send_res = Ok(());
    while count > 0 && send_res.is_ok() {
        let chunk = count.min(IDLE.len());
        send_res = bus.write(&IDLE[..chunk]);
        count -= chunk;
    }

    // On failure, it's important to still flush.
    let flush_res = bus.flush();

    send_res.map_err(|_| TransportError::Spi)?;
    flush_res.map_err(|_| TransportError::Spi)?;
    Ok(())
}

/// Move the CS pin, making sure the bus has finished with the last byte
/// first.
fn set_cs<BUS, CS>(bus: &mut BUS, cs: &mut CS, high: bool) -> Result<(), TransportError>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    bus.flush().map_err(|_| TransportError::Spi)?;
    let cs_res = if high { cs.set_high() } else { cs.set_low() };
    cs_res.map_err(|_| TransportError::Cs)
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

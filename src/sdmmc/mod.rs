//! sdmmc-storage - SD/MMC bus drivers
//!
//! Two ways of talking to a card: the SPI fallback (any SPI peripheral plus a
//! chip select pin) and the native SD/MMC bus with one or four data lines.
//! Both end up as a [`CardDevice`], which is all the layers above care about.

pub mod proto;

mod session;
mod native;
mod spi;

pub use native::{BusWidth, DataLines, HostError, ResponseKind, SdMmcNative, SdmmcHost, SlotConfig};
pub use spi::{AcquireOpts, SdMmcSpi};

use crate::BlockDevice;

const DEFAULT_DELAY_COUNT: u32 = 32_000;

/// The possible errors the bus drivers can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral
    Transport,
    /// We got an error from the native host controller
    Host(HostError),
    /// We failed to enable CRC checking on the SD card
    CantEnableCRC,
    /// We didn't get a response when reading data from the card
    TimeoutReadBuffer,
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// We didn't get a response when executing this application-specific command
    TimeoutACommand(u8),
    /// We got a bad response from Command 58
    Cmd58Error,
    /// The card answered, but not with anything we understand
    InvalidResponse(u8),
    /// We failed to read the Card Specific Data register
    RegisterReadError,
    /// We got a CRC mismatch (card gave us, we calculated)
    CrcError(u16, u16),
    /// Error reading from the card
    ReadError,
    /// Error writing to the card
    WriteError,
    /// Can't perform this operation with the card in this state
    BadState,
    /// Couldn't find the card
    CardNotFound,
    /// Couldn't set a GPIO pin
    GpioError,
    /// The card can't be driven the way it has been wired up
    UnsupportedCard,
}

impl Error {
    /// Errors that suggest the bus is running too fast for the wiring.
    pub fn is_signal_integrity(&self) -> bool {
        matches!(
            self,
            Error::CrcError(_, _) | Error::InvalidResponse(_) | Error::Host(HostError::Crc)
        )
    }
}

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// Version 1 standard capacity card
    SD1,
    /// Version 2 standard capacity card
    SD2,
    /// High (or extended) capacity card, block addressed
    SDHC,
    /// MultiMediaCard
    MMC,
}

impl CardType {
    /// The label published on the card type text sensor.
    pub fn label(&self) -> &'static str {
        match self {
            CardType::SD1 | CardType::SD2 => "SDSC",
            CardType::SDHC => "SDHC/SDXC",
            CardType::MMC => "MMC",
        }
    }

    /// Standard capacity cards take byte addresses; everything else uses
    /// block numbers.
    pub fn block_addressed(&self) -> bool {
        matches!(self, CardType::SDHC)
    }
}

/// Bus clock information.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Frequency {
    /// Highest clock the card says it can handle
    pub max_khz: u32,
    /// Clock the bus actually runs at
    pub real_khz: u32,
}

/// The state of a driver if it is not initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct NotInit;

/// The state of a driver if it is initialized
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct Initialized;

/// A SPI peripheral whose clock we can change after the card is identified.
pub trait BusClock {
    /// Set the SPI clock as close to `khz` as possible, without going over.
    /// Returns the clock the peripheral actually runs at.
    fn set_clock_khz(&mut self, khz: u32) -> u32;
}

impl<T> BusClock for &mut T
where
    T: BusClock,
{
    fn set_clock_khz(&mut self, khz: u32) -> u32 {
        (*self).set_clock_khz(khz)
    }
}

/// An initialised card, on either bus.
pub trait CardDevice: BlockDevice<Error = Error> {
    fn card_type(&self) -> CardType;
    fn frequency(&self) -> Frequency;
}

/// A terrible hack for busy-waiting the CPU while we wait for the card to
/// sort itself out.
struct Delay(u32);

impl Delay {
    fn new() -> Delay {
        Delay(DEFAULT_DELAY_COUNT)
    }

    fn delay(&mut self, err: Error) -> Result<(), Error> {
        if self.0 == 0 {
            Err(err)
        } else {
            let dummy_var: u32 = 0;
            for _ in 0..100 {
                unsafe { core::ptr::read_volatile(&dummy_var) };
            }
            self.0 -= 1;
            Ok(())
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

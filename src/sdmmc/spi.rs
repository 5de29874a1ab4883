//! sdmmc-storage - SD card over SPI
//!
//! Implements the SD/MMC protocol on some generic SPI interface.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

use super::session::SpiSession;
use super::proto::*;
use super::{BusClock, CardDevice, CardType, Delay, Error, Frequency, Initialized, NotInit};
use crate::{Block, BlockCount, BlockDevice, BlockIdx};

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// Represents an SD Card interface on a SPI bus.
/// Built from an SPI peripheral and a Chip Select pin. We need Chip Select
/// to be separate so we can clock out some bytes without Chip Select
/// asserted (which puts the card into SPI mode).
pub struct SdMmcSpi<SPI, CS, State>
where
    SPI: Transfer<u8> + BusClock,
    CS: OutputPin,
{
    card_type: CardType,
    frequency: Frequency,
    csd: Option<Csd>,
    spi: SPI,
    cs: CS,
    #[allow(dead_code)]
    state: State,
}

/// Options for acquiring the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct AcquireOpts {
    /// Some cards don't support CRC mode. At least a 512MiB Transcend one.
    pub require_crc: bool,
    /// The clock to switch to once the card has been identified. The card's
    /// own limit from the CSD still applies.
    pub max_freq_khz: u32,
}

impl Default for AcquireOpts {
    fn default() -> Self {
        AcquireOpts {
            require_crc: true,
            max_freq_khz: DEFAULT_FREQ_KHZ,
        }
    }
}

impl<SPI, CS> SdMmcSpi<SPI, CS, NotInit>
where
    SPI: Transfer<u8> + BusClock,
    CS: OutputPin,
{
    /// Create a new SD/MMC controller using a raw SPI interface.
    pub fn new(spi: SPI, cs: CS) -> Self {
        SdMmcSpi {
            card_type: CardType::SD1,
            frequency: Frequency::default(),
            csd: None,
            spi,
            cs,
            state: NotInit {},
        }
    }

    /// Give back the SPI peripheral and chip select pin.
    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    /// Initializes the card into a known state
    pub fn acquire(self) -> Result<SdMmcSpi<SPI, CS, Initialized>, (Error, Self)> {
        self.acquire_with_opts(Default::default())
    }

    fn discard_byte(&mut self) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [0xFF])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    fn identify(&mut self, options: &AcquireOpts) -> Result<(), Error> {
        trace!("Reset card..");

        // Supply minimum of 74 clock cycles without CS asserted.
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        for _ in 0..10 {
            self.discard_byte()?;
        }

        let mut session = SpiSession::new(&mut self.spi, &mut self.cs)?;

        // Enter SPI mode
        let mut delay = Delay::new();
        let mut attempts = 32;
        while attempts > 0 {
            trace!("Enter SPI mode, attempt: {}..", 32i32 - attempts);
            match session.card_command(CMD0, 0) {
                Err(Error::TimeoutCommand(0)) => {
                    // Try again?
                    warn!("Timed out, trying again..");
                    attempts -= 1;
                }
                Err(e) => {
                    return Err(e);
                }
                Ok(R1_IDLE_STATE) => {
                    break;
                }
                Ok(r) => {
                    // Try again
                    warn!("Got response: {:x}, trying again..", r);
                    attempts -= 1;
                }
            }

            delay.delay(Error::TimeoutCommand(CMD0))?;
        }
        if attempts == 0 {
            return Err(Error::CardNotFound);
        }
        // Enable CRC
        debug!("Enable CRC: {}", options.require_crc);
        if session.card_command(CMD59, 1)? != R1_IDLE_STATE && options.require_crc {
            return Err(Error::CantEnableCRC);
        }
        // Check card version
        let mut delay = Delay::new();
        loop {
            if session.card_command(CMD8, CMD8_ARG)? == (R1_ILLEGAL_COMMAND | R1_IDLE_STATE) {
                self.card_type = CardType::SD1;
                break;
            }
            let echo = session.receive_u32()?;
            if echo & 0xFF == 0xAA {
                self.card_type = CardType::SD2;
                break;
            }
            delay.delay(Error::TimeoutCommand(CMD8))?;
        }
        debug!("Card version: {:?}", self.card_type);

        let arg = match self.card_type {
            CardType::SD1 => 0,
            _ => OCR_CCS,
        };

        let mut delay = Delay::new();
        loop {
            match session.card_acmd(ACMD41, arg)? {
                R1_READY_STATE => break,
                R1_IDLE_STATE => {}
                other => return Err(Error::InvalidResponse(other)),
            }
            delay.delay(Error::TimeoutACommand(ACMD41))?;
        }

        if self.card_type == CardType::SD2 {
            if session.card_command(CMD58, 0)? != 0 {
                return Err(Error::Cmd58Error);
            }
            let ocr = session.receive_u32()?;
            if ocr & OCR_CCS != 0 {
                self.card_type = CardType::SDHC;
            }
        }

        if session.card_command(CMD9, 0)? != 0 {
            return Err(Error::RegisterReadError);
        }
        let mut csd = [0u8; 16];
        session.read_data(&mut csd)?;
        self.csd = Some(Csd::from_bytes(csd));
        Ok(())
    }

    /// Initializes the card into a known state
    pub fn acquire_with_opts(
        mut self,
        options: AcquireOpts,
    ) -> Result<SdMmcSpi<SPI, CS, Initialized>, (Error, Self)> {
        debug!("acquiring card with opts: {:?}", options);
        self.frequency.real_khz = self.spi.set_clock_khz(PROBING_FREQ_KHZ);

        let result = self.identify(&options);
        let _ = self.discard_byte();

        match (result, self.csd) {
            (Ok(()), Some(csd)) => {
                let card_limit = csd.max_frequency_khz();
                let max_khz = if card_limit == 0 {
                    options.max_freq_khz
                } else {
                    options.max_freq_khz.min(card_limit)
                };
                let real_khz = self.spi.set_clock_khz(max_khz);
                debug!("Card clock: max {} kHz, real {} kHz", max_khz, real_khz);
                Ok(SdMmcSpi {
                    card_type: self.card_type,
                    frequency: Frequency { max_khz, real_khz },
                    csd: self.csd,
                    spi: self.spi,
                    cs: self.cs,
                    state: Initialized {},
                })
            }
            (Ok(()), None) => Err((Error::RegisterReadError, self)),
            (Err(e), _) => Err((e, self)),
        }
    }
}

impl<SPI, CS> SdMmcSpi<SPI, CS, Initialized>
where
    SPI: Transfer<u8> + BusClock,
    CS: OutputPin,
{
    /// Mark the card as unused.
    /// This should be kept infallible, because Drop is unable to fail.
    /// See https://github.com/rust-lang/rfcs/issues/814
    // If there is any need to flush data, it should be implemented here.
    pub fn deinit(self) -> SdMmcSpi<SPI, CS, NotInit> {
        SdMmcSpi {
            card_type: self.card_type,
            frequency: Frequency::default(),
            csd: None,
            spi: self.spi,
            cs: self.cs,
            state: NotInit {},
        }
    }

    /// Run a command with chip select asserted.
    ///
    /// Chip select is always deasserted, even if an error occured in `f`
    fn with_chip_select<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut SpiSession<SPI, CS>) -> Result<R, Error>,
    {
        let mut session = SpiSession::new(&mut self.spi, &mut self.cs)?;
        f(&mut session)
    }

    /// The 'card specific data' block read during initialisation.
    pub fn csd(&self) -> Result<Csd, Error> {
        self.csd.ok_or(Error::BadState)
    }

    /// Return the usable size of this SD card in bytes.
    pub fn card_size_bytes(&self) -> Result<u64, Error> {
        Ok(self.csd()?.card_capacity_bytes())
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&self) -> Result<bool, Error> {
        Ok(self.csd()?.erase_single_block_enabled())
    }

    fn card_address(&self, block_idx: BlockIdx) -> u32 {
        if self.card_type.block_addressed() {
            block_idx.0
        } else {
            block_idx.0 * Block::LEN_U32
        }
    }
}

impl<SPI, CS> BlockDevice for SdMmcSpi<SPI, CS, Initialized>
where
    SPI: Transfer<u8> + BusClock,
    CS: OutputPin,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        let start_idx = self.card_address(start_block_idx);
        self.with_chip_select(|s| {
            if blocks.len() == 1 {
                // Start a single-block read
                s.card_command(CMD17, start_idx)?;
                s.read_data(&mut blocks[0].contents)?;
            } else {
                // Start a multi-block read
                s.card_command(CMD18, start_idx)?;
                for block in blocks.iter_mut() {
                    s.read_data(&mut block.contents)?;
                }
                // Stop the read
                s.card_command(CMD12, 0)?;
            }
            Ok(())
        })
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let start_idx = self.card_address(start_block_idx);
        self.with_chip_select(|s| {
            if blocks.len() == 1 {
                // Start a single-block write
                s.card_command(CMD24, start_idx)?;
                s.write_data(DATA_START_BLOCK, &blocks[0].contents)?;
                s.wait_not_busy()?;
                if s.card_command(CMD13, 0)? != 0x00 {
                    return Err(Error::WriteError);
                }
                if s.receive()? != 0x00 {
                    return Err(Error::WriteError);
                }
            } else {
                // Start a multi-block write
                s.card_command(CMD25, start_idx)?;
                for block in blocks.iter() {
                    s.wait_not_busy()?;
                    s.write_data(WRITE_MULTIPLE_TOKEN, &block.contents)?;
                }
                // Stop the write
                s.wait_not_busy()?;
                s.send(&[STOP_TRAN_TOKEN])?;
            }
            Ok(())
        })
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount(self.csd()?.card_capacity_blocks()))
    }
}

impl<SPI, CS> CardDevice for SdMmcSpi<SPI, CS, Initialized>
where
    SPI: Transfer<u8> + BusClock,
    CS: OutputPin,
{
    fn card_type(&self) -> CardType {
        self.card_type
    }

    fn frequency(&self) -> Frequency {
        self.frequency
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

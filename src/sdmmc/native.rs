//! sdmmc-storage - SD card on the native SD/MMC bus
//!
//! The host controller itself is hardware specific, so it is hidden behind
//! [`SdmmcHost`]. This module only knows the command sequence.

use super::proto::*;
use super::{CardDevice, CardType, Delay, Error, Frequency, Initialized, NotInit};
use crate::{Block, BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// Card status: ready for data (bit 8)
const STATUS_READY_FOR_DATA: u32 = 1 << 8;

/// Card status: any of the error bits
const STATUS_ERRORS: u32 = 0xFDF9_8008;

/// The data lines routed to the card. One bit mode only needs DATA0; four
/// bit mode needs all of them, so a missing line can't be expressed.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLines {
    OneBit { data0: u8 },
    FourBit { data0: u8, data1: u8, data2: u8, data3: u8 },
}

/// Pin routing for a native SD/MMC slot.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotConfig {
    pub clk: u8,
    pub cmd: u8,
    pub data: DataLines,
}

impl SlotConfig {
    pub fn bus_width(&self) -> BusWidth {
        match self.data {
            DataLines::OneBit { .. } => BusWidth::One,
            DataLines::FourBit { .. } => BusWidth::Four,
        }
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
}

/// The shape of response the host should wait for.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    None,
    /// Card status
    R1,
    /// Card status, then wait while DATA0 is held low
    R1b,
    /// OCR, no CRC
    R3,
    /// Published RCA
    R6,
    /// Interface condition
    R7,
}

/// Failures reported by a host controller.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    /// No response from the card
    Timeout,
    /// Response or data CRC mismatch
    Crc,
    /// Anything else the controller complained about
    Io,
}

impl From<HostError> for Error {
    fn from(e: HostError) -> Error {
        Error::Host(e)
    }
}

/// A native SD/MMC host controller with one slot.
pub trait SdmmcHost {
    /// Route the slot pins and power the controller up.
    fn init_slot(&mut self, slot: &SlotConfig) -> Result<(), HostError>;
    fn set_bus_width(&mut self, width: BusWidth) -> Result<(), HostError>;
    /// Returns the clock the controller actually achieved.
    fn set_clock_khz(&mut self, khz: u32) -> Result<u32, HostError>;
    /// Send a command and return the 32 bit payload of its response (zero for
    /// [`ResponseKind::None`]).
    fn command(&mut self, cmd: u8, arg: u32, kind: ResponseKind) -> Result<u32, HostError>;
    /// Send a command with a 136 bit response (CID, CSD). The register is
    /// returned MSB first, the last byte holding the CRC7 and end bit.
    fn command_long(&mut self, cmd: u8, arg: u32) -> Result<[u8; 16], HostError>;
    /// Send a read command and receive `blocks.len()` blocks of data.
    fn read_blocks(&mut self, cmd: u8, arg: u32, blocks: &mut [Block]) -> Result<(), HostError>;
    /// Send a write command and transmit the blocks.
    fn write_blocks(&mut self, cmd: u8, arg: u32, blocks: &[Block]) -> Result<(), HostError>;
}

impl<T> SdmmcHost for &mut T
where
    T: SdmmcHost,
{
    fn init_slot(&mut self, slot: &SlotConfig) -> Result<(), HostError> {
        (*self).init_slot(slot)
    }

    fn set_bus_width(&mut self, width: BusWidth) -> Result<(), HostError> {
        (*self).set_bus_width(width)
    }

    fn set_clock_khz(&mut self, khz: u32) -> Result<u32, HostError> {
        (*self).set_clock_khz(khz)
    }

    fn command(&mut self, cmd: u8, arg: u32, kind: ResponseKind) -> Result<u32, HostError> {
        (*self).command(cmd, arg, kind)
    }

    fn command_long(&mut self, cmd: u8, arg: u32) -> Result<[u8; 16], HostError> {
        (*self).command_long(cmd, arg)
    }

    fn read_blocks(&mut self, cmd: u8, arg: u32, blocks: &mut [Block]) -> Result<(), HostError> {
        (*self).read_blocks(cmd, arg, blocks)
    }

    fn write_blocks(&mut self, cmd: u8, arg: u32, blocks: &[Block]) -> Result<(), HostError> {
        (*self).write_blocks(cmd, arg, blocks)
    }
}

/// An SD card on a native SD/MMC host.
pub struct SdMmcNative<H, State>
where
    H: SdmmcHost,
{
    host: H,
    slot: SlotConfig,
    card_type: CardType,
    block_addressed: bool,
    rca: u32,
    csd: Option<Csd>,
    frequency: Frequency,
    #[allow(dead_code)]
    state: State,
}

impl<H> SdMmcNative<H, NotInit>
where
    H: SdmmcHost,
{
    pub fn new(host: H, slot: SlotConfig) -> Self {
        SdMmcNative {
            host,
            slot,
            card_type: CardType::SD1,
            block_addressed: false,
            rca: 0,
            csd: None,
            frequency: Frequency::default(),
            state: NotInit {},
        }
    }

    pub fn release(self) -> H {
        self.host
    }

    /// Initializes the card at the default clock.
    pub fn acquire(self) -> Result<SdMmcNative<H, Initialized>, (Error, Self)> {
        self.acquire_with_opts(Default::default())
    }

    /// Initializes the card into the transfer state.
    pub fn acquire_with_opts(
        mut self,
        options: super::AcquireOpts,
    ) -> Result<SdMmcNative<H, Initialized>, (Error, Self)> {
        debug!("acquiring native card on {:?}", self.slot);
        match self.identify(&options) {
            Ok(frequency) => Ok(SdMmcNative {
                host: self.host,
                slot: self.slot,
                card_type: self.card_type,
                block_addressed: self.block_addressed,
                rca: self.rca,
                csd: self.csd,
                frequency,
                state: Initialized {},
            }),
            Err(e) => Err((e, self)),
        }
    }

    fn identify(&mut self, options: &super::AcquireOpts) -> Result<Frequency, Error> {
        self.host.init_slot(&self.slot)?;
        self.host.set_bus_width(BusWidth::One)?;
        self.host.set_clock_khz(PROBING_FREQ_KHZ)?;

        trace!("Reset card..");
        self.host.command(CMD0, 0, ResponseKind::None)?;

        // Only version 2 cards answer CMD8
        let version2 = match self.host.command(CMD8, CMD8_ARG, ResponseKind::R7) {
            Ok(echo) if echo & 0xFFF == CMD8_ARG => true,
            Ok(echo) => return Err(Error::InvalidResponse(echo as u8)),
            Err(HostError::Timeout) => false,
            Err(e) => return Err(e.into()),
        };

        let ocr = match self.host.command(CMD55, 0, ResponseKind::R1) {
            Ok(_) => {
                let mut arg = OCR_VOLTAGE_WINDOW;
                if version2 {
                    arg |= OCR_CCS;
                }
                let ocr = self.wait_ready(|host| {
                    host.command(CMD55, 0, ResponseKind::R1)?;
                    host.command(ACMD41, arg, ResponseKind::R3)
                }, Error::TimeoutACommand(ACMD41))?;
                self.card_type = if ocr & OCR_CCS != 0 {
                    CardType::SDHC
                } else if version2 {
                    CardType::SD2
                } else {
                    CardType::SD1
                };
                ocr
            }
            Err(HostError::Timeout) => {
                debug!("No answer to APP_CMD, trying MMC");
                let ocr = self.wait_ready(
                    |host| host.command(CMD1, OCR_VOLTAGE_WINDOW | OCR_CCS, ResponseKind::R3),
                    Error::TimeoutCommand(CMD1),
                )?;
                self.card_type = CardType::MMC;
                ocr
            }
            Err(e) => return Err(e.into()),
        };
        self.block_addressed = ocr & OCR_CCS != 0;
        debug!("Card type: {:?}", self.card_type);

        // CID isn't used, but the card won't publish an address without it
        self.host.command_long(CMD2, 0)?;

        self.rca = if self.card_type == CardType::MMC {
            self.host.command(CMD3, 1 << 16, ResponseKind::R1)?;
            1
        } else {
            self.host.command(CMD3, 0, ResponseKind::R6)? >> 16
        };
        trace!("RCA: {:x}", self.rca);

        let raw_csd = self.host.command_long(CMD9, self.rca << 16)?;
        let csd = if self.card_type == CardType::MMC {
            Csd::V1(CsdV1 { data: raw_csd })
        } else {
            Csd::from_bytes(raw_csd)
        };
        self.csd = Some(csd);

        self.host.command(CMD7, self.rca << 16, ResponseKind::R1b)?;
        if !self.block_addressed {
            self.host.command(CMD16, Block::LEN_U32, ResponseKind::R1)?;
        }

        if self.slot.bus_width() == BusWidth::Four {
            if self.card_type == CardType::MMC {
                warn!("MMC cards are driven in 1 bit mode");
            } else {
                self.host.command(CMD55, self.rca << 16, ResponseKind::R1)?;
                self.host.command(ACMD6, 2, ResponseKind::R1)?;
                self.host.set_bus_width(BusWidth::Four)?;
            }
        }

        let card_limit = csd.max_frequency_khz();
        let max_khz = if card_limit == 0 {
            options.max_freq_khz
        } else {
            options.max_freq_khz.min(card_limit)
        };
        let real_khz = self.host.set_clock_khz(max_khz)?;
        debug!("Card clock: max {} kHz, real {} kHz", max_khz, real_khz);
        Ok(Frequency { max_khz, real_khz })
    }

    /// Repeat an operating condition command until the card reports it has
    /// finished powering up. Returns the final OCR.
    fn wait_ready<F>(&mut self, mut f: F, timeout: Error) -> Result<u32, Error>
    where
        F: FnMut(&mut H) -> Result<u32, HostError>,
    {
        let mut delay = Delay::new();
        loop {
            let ocr = f(&mut self.host)?;
            if ocr & OCR_BUSY != 0 {
                return Ok(ocr);
            }
            delay.delay(timeout)?;
        }
    }
}

impl<H> SdMmcNative<H, Initialized>
where
    H: SdmmcHost,
{
    /// Return the card to the uninitialised state, e.g. after a power cycle.
    pub fn deinit(self) -> SdMmcNative<H, NotInit> {
        SdMmcNative::new(self.host, self.slot)
    }

    pub fn slot(&self) -> &SlotConfig {
        &self.slot
    }

    pub fn csd(&self) -> Result<Csd, Error> {
        self.csd.ok_or(Error::BadState)
    }

    /// Return the usable size of this SD card in bytes.
    pub fn card_size_bytes(&self) -> Result<u64, Error> {
        Ok(self.csd()?.card_capacity_bytes())
    }

    fn card_address(&self, block_idx: BlockIdx) -> u32 {
        if self.block_addressed {
            block_idx.0
        } else {
            block_idx.0 * Block::LEN_U32
        }
    }

    /// Poll the card status until the card can take more data.
    fn wait_ready_for_data(&mut self) -> Result<(), Error> {
        let mut delay = Delay::new();
        loop {
            let status = self.host.command(CMD13, self.rca << 16, ResponseKind::R1)?;
            if status & STATUS_ERRORS != 0 {
                warn!("Card status error: {:x}", status);
                return Err(Error::WriteError);
            }
            if status & STATUS_READY_FOR_DATA != 0 {
                return Ok(());
            }
            delay.delay(Error::TimeoutWaitNotBusy)?;
        }
    }
}

impl<H> BlockDevice for SdMmcNative<H, Initialized>
where
    H: SdmmcHost,
{
    type Error = Error;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        let address = self.card_address(start_block_idx);
        if blocks.len() == 1 {
            self.host.read_blocks(CMD17, address, blocks)?;
        } else {
            self.host.read_blocks(CMD18, address, blocks)?;
            self.host.command(CMD12, 0, ResponseKind::R1b)?;
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let address = self.card_address(start_block_idx);
        if blocks.len() == 1 {
            self.host.write_blocks(CMD24, address, blocks)?;
        } else {
            self.host.write_blocks(CMD25, address, blocks)?;
            self.host.command(CMD12, 0, ResponseKind::R1b)?;
        }
        self.wait_ready_for_data()
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount(self.csd()?.card_capacity_blocks()))
    }
}

impl<H> CardDevice for SdMmcNative<H, Initialized>
where
    H: SdmmcHost,
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

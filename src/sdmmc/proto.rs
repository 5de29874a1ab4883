//! sdmmc-storage - SD/MMC Protocol constants
//!
//! Command numbers, response bits, data tokens and register layouts shared by
//! the SPI and the native bus drivers. Registers are stored MSB first, the way
//! they come off the wire.

//==============================================================================

// Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_OP_COND - MMC cards only
pub const CMD1: u8 = 0x01;
/// ALL_SEND_CID - ask all cards for their CID (native bus only)
pub const CMD2: u8 = 0x02;
/// SEND_RELATIVE_ADDR - card publishes its RCA (native bus only)
pub const CMD3: u8 = 0x03;
/// SELECT_CARD - move the card to transfer state (native bus only)
pub const CMD7: u8 = 0x07;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.*/
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SEND_STATUS - read the card status register
pub const CMD13: u8 = 0x0D;
/// SET_BLOCKLEN - only meaningful for byte addressed cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking
pub const CMD59: u8 = 0x3B;
/// SET_BUS_WIDTH - select 1 or 4 data lines (native bus only)
pub const ACMD6: u8 = 0x06;
/// SD_SEND_OP_COMD - Sends host capacity support information and
/// activates the card's initialization process
pub const ACMD41: u8 = 0x29;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// status bit for a command CRC mismatch
pub const R1_COM_CRC_ERROR: u8 = 0x08;

/// start data token for read or write single block*/
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks*/
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks*/
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// The top bit of an R1 response is always clear
pub const ERROR_OK: u8 = 0x00;

/// Voltage window and check pattern sent with CMD8
pub const CMD8_ARG: u32 = 0x1AA;

/// OCR: card capacity status, set for block addressed cards
pub const OCR_CCS: u32 = 1 << 30;

/// OCR: power up finished
pub const OCR_BUSY: u32 = 1 << 31;

/// OCR: the 3.2-3.4V window we ask for on the native bus
pub const OCR_VOLTAGE_WINDOW: u32 = 0x00FF_8000;

/// The clock every card must accept while it is being identified.
pub const PROBING_FREQ_KHZ: u32 = 400;

/// Default speed mode clock.
pub const DEFAULT_FREQ_KHZ: u32 = 20_000;

//==============================================================================

/// Card Specific Data, version 1 (standard capacity cards)
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Default, Debug, Clone, Copy)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2 (high capacity cards)
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Default, Debug, Clone, Copy)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, either version
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub enum Csd {
    V1(CsdV1),
    V2(CsdV2),
}

impl Csd {
    /// Pick the layout from the CSD_STRUCTURE field.
    pub fn from_bytes(data: [u8; 16]) -> Csd {
        if data[0] >> 6 == 0 {
            Csd::V1(CsdV1 { data })
        } else {
            Csd::V2(CsdV2 { data })
        }
    }

    pub fn card_capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_bytes(),
            Csd::V2(csd) => csd.card_capacity_bytes(),
        }
    }

    pub fn card_capacity_blocks(&self) -> u32 {
        (self.card_capacity_bytes() / 512) as u32
    }

    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }

    pub fn max_frequency_khz(&self) -> u32 {
        let tran_speed = match self {
            Csd::V1(csd) => csd.tran_speed(),
            Csd::V2(csd) => csd.tran_speed(),
        };
        tran_speed_khz(tran_speed)
    }
}

/// Decode the TRAN_SPEED field. Zero means the field is reserved/unknown.
pub fn tran_speed_khz(tran_speed: u8) -> u32 {
    // Multipliers are scaled by ten.
    const MULTIPLIER: [u32; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];
    // 100 kbit/s, 1 Mbit/s, 10 Mbit/s, 100 Mbit/s, divided by ten
    const UNIT: [u32; 4] = [10, 100, 1_000, 10_000];
    let unit = usize::from(tran_speed & 0x07);
    let multiplier = usize::from((tran_speed >> 3) & 0x0F);
    UNIT.get(unit).map_or(0, |unit| unit * MULTIPLIER[multiplier])
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(data_read_access_time1, u8, 1, 0, 8);
    define_field!(data_read_access_time2, u8, 2, 0, 8);
    define_field!(tran_speed, u8, 3, 0, 8);
    define_field!(read_bl_len, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_bl_len() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(tran_speed, u8, 3, 0, 8);
    define_field!(read_bl_len, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(crc, u8, 15, 0, 8);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }
}

/// Perform the 7-bit CRC used on the SD card
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


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

//! Card emulators shared by the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use sdmmc_storage::config::{BusType, CardConfig, Variant};
use sdmmc_storage::sdmmc::proto::*;
use sdmmc_storage::sdmmc::{BusClock, BusWidth, HostError, ResponseKind, SdmmcHost, SlotConfig};
use sdmmc_storage::{Block, BusConfig};

/// 32 MiB, the smallest card that still formats as FAT16 behind a
/// partition table.
pub const CARD_BYTES: usize = 32 * 1024 * 1024;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A CSD for a high capacity card of `bytes`, good for 25 MHz.
pub fn csd_v2(bytes: usize) -> [u8; 16] {
    let c_size = (bytes / (512 * 1024) - 1) as u32;
    let mut csd = [0u8; 16];
    csd[0] = 0x40;
    csd[3] = 0x32;
    csd[5] = 0x59;
    csd[7] = (c_size >> 16) as u8 & 0x3F;
    csd[8] = (c_size >> 8) as u8;
    csd[9] = c_size as u8;
    csd[15] = crc7(&csd[..15]);
    csd
}

/// A version 1 CSD for a 32 MiB MMC card, good for 20 MHz.
pub fn csd_mmc() -> [u8; 16] {
    let mut csd = [0u8; 16];
    csd[0] = 0x90;
    csd[3] = 0x2A;
    // READ_BL_LEN 9, C_SIZE 127, C_SIZE_MULT 7
    csd[5] = 0x59;
    csd[7] = 0x1F;
    csd[8] = 0xC0;
    csd[9] = 0x03;
    csd[10] = 0x80;
    csd[15] = crc7(&csd[..15]);
    csd
}

pub fn native_bus(mode_1bit: bool) -> BusConfig {
    let config = CardConfig {
        clk_pin: Some(14),
        cmd_pin: Some(15),
        data0_pin: Some(2),
        data1_pin: Some(4),
        data2_pin: Some(12),
        data3_pin: Some(13),
        mode_1bit: Some(mode_1bit),
        power_ctrl_pin: Some(21),
        ..Default::default()
    };
    config.validate(Variant::Esp32).unwrap()
}

pub fn spi_bus() -> BusConfig {
    let config = CardConfig {
        bus_type: BusType::SdSpi,
        cs_pin: Some(5),
        ..Default::default()
    };
    config.validate(Variant::Esp32C6).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    Sdhc,
    Mmc,
}

/// A native SD/MMC host with a card in the slot.
pub struct FakeHost {
    pub memory: Vec<u8>,
    pub kind: CardKind,
    /// Pull the card out
    pub present: bool,
    pub slot: Option<SlotConfig>,
    pub width: BusWidth,
    pub clock_khz: u32,
    pub commands: Vec<u8>,
    app_cmd: bool,
    polls: u32,
}

impl FakeHost {
    pub fn new(kind: CardKind) -> FakeHost {
        FakeHost {
            memory: vec![0u8; CARD_BYTES],
            kind,
            present: true,
            slot: None,
            width: BusWidth::One,
            clock_khz: 0,
            commands: Vec::new(),
            app_cmd: false,
            polls: 0,
        }
    }

    fn block_index(&self, arg: u32) -> usize {
        match self.kind {
            CardKind::Sdhc => arg as usize,
            CardKind::Mmc => arg as usize / Block::LEN,
        }
    }
}

impl SdmmcHost for FakeHost {
    fn init_slot(&mut self, slot: &SlotConfig) -> Result<(), HostError> {
        self.slot = Some(*slot);
        Ok(())
    }

    fn set_bus_width(&mut self, width: BusWidth) -> Result<(), HostError> {
        self.width = width;
        Ok(())
    }

    fn set_clock_khz(&mut self, khz: u32) -> Result<u32, HostError> {
        // 40 MHz source, integer divider
        let divider = (40_000 + khz - 1) / khz;
        self.clock_khz = 40_000 / divider;
        Ok(self.clock_khz)
    }

    fn command(&mut self, cmd: u8, arg: u32, _kind: ResponseKind) -> Result<u32, HostError> {
        if !self.present {
            return Err(HostError::Timeout);
        }
        self.commands.push(cmd);
        let app = core::mem::replace(&mut self.app_cmd, false);
        let sd = self.kind == CardKind::Sdhc;
        match (app, cmd) {
            (_, CMD0) => Ok(0),
            (false, CMD8) if sd => Ok(arg & 0xFFF),
            (_, CMD55) if sd => {
                self.app_cmd = true;
                Ok(0x120)
            }
            (true, ACMD41) => {
                // Busy for one poll
                self.polls += 1;
                if self.polls < 2 {
                    Ok(OCR_VOLTAGE_WINDOW)
                } else {
                    Ok(OCR_BUSY | OCR_CCS | OCR_VOLTAGE_WINDOW)
                }
            }
            (true, ACMD6) => Ok(0x920),
            (false, CMD1) if !sd => Ok(OCR_BUSY | OCR_VOLTAGE_WINDOW),
            (false, CMD3) if sd => Ok(0x1234_0000),
            (false, CMD3) => Ok(0x500),
            (false, CMD7) | (false, CMD16) | (false, CMD12) => Ok(0x900),
            (false, CMD13) => Ok(0x900),
            _ => Err(HostError::Timeout),
        }
    }

    fn command_long(&mut self, cmd: u8, _arg: u32) -> Result<[u8; 16], HostError> {
        if !self.present {
            return Err(HostError::Timeout);
        }
        self.commands.push(cmd);
        match (cmd, self.kind) {
            (CMD2, _) => Ok([0u8; 16]),
            (CMD9, CardKind::Sdhc) => Ok(csd_v2(self.memory.len())),
            (CMD9, CardKind::Mmc) => Ok(csd_mmc()),
            _ => Err(HostError::Timeout),
        }
    }

    fn read_blocks(&mut self, cmd: u8, arg: u32, blocks: &mut [Block]) -> Result<(), HostError> {
        if !self.present {
            return Err(HostError::Timeout);
        }
        self.commands.push(cmd);
        let first = self.block_index(arg);
        for (i, block) in blocks.iter_mut().enumerate() {
            let start = (first + i) * Block::LEN;
            let source = self.memory.get(start..start + Block::LEN).ok_or(HostError::Io)?;
            block.contents.copy_from_slice(source);
        }
        Ok(())
    }

    fn write_blocks(&mut self, cmd: u8, arg: u32, blocks: &[Block]) -> Result<(), HostError> {
        if !self.present {
            return Err(HostError::Timeout);
        }
        self.commands.push(cmd);
        let first = self.block_index(arg);
        for (i, block) in blocks.iter().enumerate() {
            let start = (first + i) * Block::LEN;
            let target = self.memory.get_mut(start..start + Block::LEN).ok_or(HostError::Io)?;
            target.copy_from_slice(&block.contents);
        }
        Ok(())
    }
}

struct PendingWrite {
    offset: usize,
    started: bool,
    /// Part of a CMD25 write, which runs until the stop token
    multiple: bool,
    data: Vec<u8>,
}

impl PendingWrite {
    fn new(offset: usize, multiple: bool) -> PendingWrite {
        PendingWrite {
            offset,
            started: false,
            multiple,
            data: Vec::new(),
        }
    }

    fn token(&self) -> u8 {
        if self.multiple {
            WRITE_MULTIPLE_TOKEN
        } else {
            DATA_START_BLOCK
        }
    }
}

/// An SDHC card on an SPI bus, one byte at a time.
pub struct SpiCard {
    pub memory: Vec<u8>,
    pub present: bool,
    /// Block data CRCs come out wrong while the clock is above this
    pub flaky_above_khz: Option<u32>,
    pub clocks: Vec<u32>,
    /// Every command the card was sent, in order
    pub commands: Vec<u8>,
    clock_khz: u32,
    idle: bool,
    /// Next block offset of a CMD18 read, until CMD12
    reading: Option<usize>,
    /// 0xFF bytes clocked in with nothing to send back
    idle_polls: u8,
    app_cmd: bool,
    frame: Vec<u8>,
    replies: VecDeque<u8>,
    write: Option<PendingWrite>,
}

impl SpiCard {
    pub fn new() -> SpiCard {
        SpiCard {
            memory: vec![0u8; CARD_BYTES],
            present: true,
            flaky_above_khz: None,
            clocks: Vec::new(),
            commands: Vec::new(),
            clock_khz: 0,
            idle: true,
            reading: None,
            idle_polls: 0,
            app_cmd: false,
            frame: Vec::new(),
            replies: VecDeque::new(),
            write: None,
        }
    }

    fn r1(&self) -> u8 {
        if self.idle {
            R1_IDLE_STATE
        } else {
            R1_READY_STATE
        }
    }

    fn send_block(&mut self, data: &[u8]) {
        let mut crc = crc16(data);
        if matches!(self.flaky_above_khz, Some(limit) if self.clock_khz > limit) {
            crc ^= 0x5555;
        }
        self.replies.push_back(DATA_START_BLOCK);
        self.replies.extend(data.iter().cloned());
        self.replies.push_back((crc >> 8) as u8);
        self.replies.push_back(crc as u8);
    }

    fn take(&mut self, byte: u8) {
        if !self.present {
            return;
        }
        if let Some(write) = self.write.as_mut() {
            if !write.started {
                if write.multiple && byte == STOP_TRAN_TOKEN {
                    self.write = None;
                } else {
                    write.started = byte == write.token();
                }
                return;
            }
            write.data.push(byte);
            if write.data.len() == Block::LEN + 2 {
                let offset = write.offset;
                let data: Vec<u8> = write.data[..Block::LEN].to_vec();
                self.memory[offset..offset + Block::LEN].copy_from_slice(&data);
                self.write = if write.multiple {
                    Some(PendingWrite::new(offset + Block::LEN, true))
                } else {
                    None
                };
                self.replies.push_back(DATA_RES_ACCEPTED);
            }
            return;
        }
        if self.frame.is_empty() && byte & 0xC0 != 0x40 {
            return;
        }
        self.frame.push(byte);
        if self.frame.len() == 6 {
            let cmd = self.frame[0] & 0x3F;
            let arg = u32::from_be_bytes([self.frame[1], self.frame[2], self.frame[3], self.frame[4]]);
            self.frame.clear();
            self.command(cmd, arg);
        }
    }

    /// During a CMD18 read the next block comes out after the host has
    /// polled a couple of idle bytes.
    fn stream(&mut self, byte: u8) {
        let offset = match self.reading {
            Some(offset) if self.replies.is_empty() => offset,
            _ => return,
        };
        if byte != 0xFF {
            self.idle_polls = 0;
            return;
        }
        self.idle_polls += 1;
        if self.idle_polls >= 2 {
            self.idle_polls = 0;
            let block = self.memory[offset..offset + Block::LEN].to_vec();
            self.send_block(&block);
            self.reading = Some(offset + Block::LEN);
        }
    }

    fn command(&mut self, cmd: u8, arg: u32) {
        self.commands.push(cmd);
        let app = core::mem::replace(&mut self.app_cmd, false);
        match (app, cmd) {
            (_, CMD0) => {
                self.idle = true;
                self.replies.push_back(R1_IDLE_STATE);
            }
            (false, CMD59) => self.replies.push_back(self.r1()),
            (false, CMD8) => {
                self.replies.push_back(self.r1());
                self.replies.extend([0x00, 0x00, 0x01, 0xAA].iter().cloned());
            }
            (_, CMD55) => {
                self.app_cmd = true;
                self.replies.push_back(self.r1());
            }
            (true, ACMD41) => {
                self.idle = false;
                self.replies.push_back(R1_READY_STATE);
            }
            (false, CMD58) => {
                self.replies.push_back(self.r1());
                self.replies.extend([0xC0, 0xFF, 0x80, 0x00].iter().cloned());
            }
            (false, CMD9) => {
                self.replies.push_back(self.r1());
                let csd = csd_v2(self.memory.len());
                self.send_block(&csd);
            }
            (false, CMD17) => {
                self.replies.push_back(self.r1());
                let offset = arg as usize * Block::LEN;
                let block = self.memory[offset..offset + Block::LEN].to_vec();
                self.send_block(&block);
            }
            (false, CMD18) => {
                self.replies.push_back(self.r1());
                self.reading = Some(arg as usize * Block::LEN);
                self.idle_polls = 0;
            }
            (false, CMD12) => {
                self.reading = None;
                // stuff byte, then R1
                self.replies.push_back(0xFF);
                self.replies.push_back(self.r1());
            }
            (false, CMD24) => {
                self.replies.push_back(self.r1());
                self.write = Some(PendingWrite::new(arg as usize * Block::LEN, false));
            }
            (false, CMD25) => {
                self.replies.push_back(self.r1());
                self.write = Some(PendingWrite::new(arg as usize * Block::LEN, true));
            }
            (false, CMD13) => self.replies.extend([0x00, 0x00].iter().cloned()),
            _ => self.replies.push_back(R1_ILLEGAL_COMMAND | self.r1()),
        }
    }
}

impl Transfer<u8> for SpiCard {
    type Error = ();

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
        for word in words.iter_mut() {
            let reply = self.replies.pop_front().unwrap_or(0xFF);
            self.stream(*word);
            self.take(*word);
            *word = reply;
        }
        Ok(words)
    }
}

impl BusClock for SpiCard {
    fn set_clock_khz(&mut self, khz: u32) -> u32 {
        self.clock_khz = khz;
        self.clocks.push(khz);
        khz
    }
}

/// A pin that does nothing.
pub struct DummyPin;

impl OutputPin for DummyPin {
    type Error = ();

    fn set_low(&mut self) -> Result<(), ()> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), ()> {
        Ok(())
    }
}

/// A pin that remembers every level it was driven to.
#[derive(Clone, Default)]
pub struct RecordingPin(pub Rc<RefCell<Vec<bool>>>);

impl OutputPin for RecordingPin {
    type Error = ();

    fn set_low(&mut self) -> Result<(), ()> {
        self.0.borrow_mut().push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), ()> {
        self.0.borrow_mut().push(true);
        Ok(())
    }
}

/// A power pin whose driver is broken.
pub struct BrokenPin;

impl OutputPin for BrokenPin {
    type Error = ();

    fn set_low(&mut self) -> Result<(), ()> {
        Err(())
    }

    fn set_high(&mut self) -> Result<(), ()> {
        Err(())
    }
}

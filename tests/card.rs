//! Cards brought up on emulated hosts.

mod common;

use common::*;

use sdmmc_storage::card::{SensorBinding, SensorKind};
use sdmmc_storage::config::BusMode;
use sdmmc_storage::fat::{format_volume, FormatOptions};
use sdmmc_storage::sdmmc::BusWidth;
use sdmmc_storage::sdmmc::proto::{CMD12, CMD18, CMD25};
use sdmmc_storage::{
    Block, BlockDevice, BlockIdx, InitError, MemoryBlockDevice, NoPowerControl, SdCard, SdMmcSpi, Sensor, Storage, StorageError,
};

use std::cell::RefCell;
use std::rc::Rc;

fn superfloppy(memory: &mut [u8]) {
    let mut bd = MemoryBlockDevice::new(memory);
    format_volume(&mut bd, &FormatOptions::default()).unwrap();
}

#[derive(Clone, Default)]
struct Values(Rc<RefCell<Vec<f64>>>);

impl Sensor for Values {
    fn publish(&mut self, value: f64) {
        self.0.borrow_mut().push(value);
    }
}

impl Values {
    fn last(&self) -> f64 {
        *self.0.borrow().last().unwrap()
    }
}

#[test]
fn native_sdhc_in_four_bit_mode() {
    init_logging();
    let mut host = FakeHost::new(CardKind::Sdhc);
    superfloppy(&mut host.memory);
    let pin = RecordingPin::default();

    let mut card = SdCard::setup_native(host, Some(pin.clone()), native_bus(false));
    assert!(!card.is_failed(), "{:?}", card.init_error());
    assert_eq!(*pin.0.borrow(), [true]);
    assert_eq!(card.card_type_label(), "SDHC/SDXC");
    let frequency = card.frequency().unwrap();
    assert_eq!(frequency.max_khz, 20_000);
    assert_eq!(frequency.real_khz, 20_000);

    card.create_directory("/logs").unwrap();
    card.write_file("/logs/boot.txt", b"booted\n").unwrap();
    card.append_file("/logs/boot.txt", b"again\n").unwrap();
    assert_eq!(card.read_file("/logs/boot.txt").unwrap(), b"booted\nagain\n");

    let listing = card.list_directory("/", 1).unwrap();
    let paths: Vec<&str> = listing.iter().map(|info| info.path.as_str()).collect();
    assert_eq!(paths, ["/logs", "/logs/boot.txt"]);

    let (native, _) = card.release();
    let native = native.unwrap();
    assert_eq!(native.card_size_bytes().unwrap(), CARD_BYTES as u64);
    let host = native.deinit().release();
    assert_eq!(host.width, BusWidth::Four);
    assert_eq!(host.clock_khz, 20_000);
    assert!(host.slot.is_some());
}

#[test]
fn native_one_bit_mode() {
    let mut host = FakeHost::new(CardKind::Sdhc);
    superfloppy(&mut host.memory);
    let bus = native_bus(true);
    assert_eq!(bus.mode.label(), "SDMMC 1-bit");

    let card = SdCard::setup_native(host, None::<NoPowerControl>, bus);
    assert!(!card.is_failed());
    let (native, _) = card.release();
    let host = native.unwrap().deinit().release();
    assert_eq!(host.width, BusWidth::One);
}

#[test]
fn mmc_cards_are_byte_addressed() {
    let mut host = FakeHost::new(CardKind::Mmc);
    superfloppy(&mut host.memory);

    let mut card = SdCard::setup_native(host, None::<NoPowerControl>, native_bus(false));
    assert!(!card.is_failed(), "{:?}", card.init_error());
    assert_eq!(card.card_type_label(), "MMC");
    assert_eq!(Storage::card_type(&card), "MMC");

    card.write_file("/mmc.txt", b"multimedia").unwrap();
    assert_eq!(card.read_file("/mmc.txt").unwrap(), b"multimedia");

    let (native, _) = card.release();
    let host = native.unwrap().deinit().release();
    // MMC stays on one data line
    assert_eq!(host.width, BusWidth::One);
}

#[test]
fn empty_slot() {
    let mut host = FakeHost::new(CardKind::Sdhc);
    host.present = false;

    let mut card = SdCard::setup_native(host, None::<NoPowerControl>, native_bus(false));
    assert!(card.is_failed());
    assert_eq!(card.init_error(), Some(InitError::NoCard));
    assert_eq!(card.card_type_label(), "UNKNOWN");
    assert_eq!(card.free_space(), Err(StorageError::Unavailable));
    assert_eq!(card.read_file("/a.txt"), Err(StorageError::Unavailable));
}

#[test]
fn unformatted_card() {
    let host = FakeHost::new(CardKind::Sdhc);
    let mut card = SdCard::setup_native(host, None::<NoPowerControl>, native_bus(false));
    assert_eq!(card.init_error(), Some(InitError::Mount));
    assert_eq!(card.write_file("/a.txt", b"a"), Err(StorageError::Unavailable));

    let mut bus = native_bus(false);
    bus.format_if_mount_failed = true;
    let host = FakeHost::new(CardKind::Sdhc);
    let mut card = SdCard::setup_native(host, None::<NoPowerControl>, bus);
    assert!(!card.is_failed());
    card.write_file("/a.txt", b"a").unwrap();

    // The formatted card carries a partition table
    let (native, _) = card.release();
    let host = native.unwrap().deinit().release();
    assert_eq!(&host.memory[510..512], &[0x55, 0xAA]);
    assert_eq!(host.memory[446 + 4], 0x0E);
}

#[test]
fn broken_power_pin() {
    let mut host = FakeHost::new(CardKind::Sdhc);
    superfloppy(&mut host.memory);
    let card = SdCard::setup_native(host, Some(BrokenPin), native_bus(false));
    assert_eq!(card.init_error(), Some(InitError::PinSetup));
}

#[test]
fn wrong_bus_configuration() {
    let host = FakeHost::new(CardKind::Sdhc);
    let card = SdCard::setup_native(host, None::<NoPowerControl>, spi_bus());
    assert_eq!(card.init_error(), Some(InitError::PinSetup));
}

#[test]
fn power_cycle_and_set_up_again() {
    let mut host = FakeHost::new(CardKind::Sdhc);
    superfloppy(&mut host.memory);
    let pin = RecordingPin::default();
    let free = Values::default();

    let mut card = SdCard::setup_native(host, Some(pin.clone()), native_bus(false));
    card.add_sensor(SensorBinding::new(SensorKind::FreeSpace, Box::new(free.clone())).unwrap());
    card.write_file("/kept.txt", b"still here").unwrap();
    assert!(free.last() > 0.0);

    let native = card.power_cycle().unwrap().unwrap();
    assert_eq!(*pin.0.borrow(), [true, false, true]);
    assert_eq!(card.init_error(), Some(InitError::PowerCycled));
    assert!(free.last().is_nan());
    assert_eq!(card.stat("/kept.txt"), Err(StorageError::Unavailable));

    let (_, pin) = card.release();
    let host = native.deinit().release();
    let mut card = SdCard::setup_native(host, pin, native_bus(false));
    assert!(!card.is_failed());
    assert_eq!(card.read_file("/kept.txt").unwrap(), b"still here");
}

#[test]
fn spi_card() {
    init_logging();
    let mut spi = SpiCard::new();
    superfloppy(&mut spi.memory);

    let bus = spi_bus();
    assert_eq!(bus.mode, BusMode::Spi { cs: 5 });
    let mut card = SdCard::setup_spi(SdMmcSpi::new(spi, DummyPin), None::<NoPowerControl>, bus);
    assert!(!card.is_failed(), "{:?}", card.init_error());
    assert_eq!(card.card_type_label(), "SDHC/SDXC");
    assert_eq!(card.frequency().unwrap().real_khz, 20_000);

    card.write_file("/spi.txt", b"over spi").unwrap();
    assert_eq!(card.read_file("/spi.txt").unwrap(), b"over spi");

    let (spi_card, _) = card.release();
    let spi_card = spi_card.unwrap();
    assert_eq!(spi_card.card_size_bytes().unwrap(), CARD_BYTES as u64);
    let (spi, _cs) = spi_card.deinit().release();
    assert_eq!(spi.clocks, [400, 20_000]);
}

#[test]
fn spi_falls_back_to_the_probing_clock() {
    init_logging();
    let mut spi = SpiCard::new();
    superfloppy(&mut spi.memory);
    spi.flaky_above_khz = Some(1_000);

    let mut card = SdCard::setup_spi(SdMmcSpi::new(spi, DummyPin), None::<NoPowerControl>, spi_bus());
    assert!(!card.is_failed(), "{:?}", card.init_error());
    assert_eq!(card.frequency().unwrap().real_khz, 400);
    card.write_file("/slow.txt", b"slow but fine").unwrap();
    assert_eq!(card.read_file("/slow.txt").unwrap(), b"slow but fine");

    let (spi_card, _) = card.release();
    let (spi, _cs) = spi_card.unwrap().deinit().release();
    assert_eq!(spi.clocks, [400, 20_000, 400, 400]);
}

#[test]
fn spi_without_a_card() {
    let mut spi = SpiCard::new();
    spi.present = false;
    let card = SdCard::setup_spi(SdMmcSpi::new(spi, DummyPin), None::<NoPowerControl>, spi_bus());
    assert!(card.is_failed());
    assert_eq!(card.init_error(), Some(InitError::NoCard));
}

#[test]
fn spi_multi_block_transfers() {
    init_logging();
    let spi = SpiCard::new();
    let mut card = match SdMmcSpi::new(spi, DummyPin).acquire() {
        Ok(card) => card,
        Err((e, _)) => panic!("acquire failed: {:?}", e),
    };

    let mut blocks = [Block::new(), Block::new(), Block::new()];
    for (i, block) in blocks.iter_mut().enumerate() {
        for (j, byte) in block.contents.iter_mut().enumerate() {
            *byte = (i * 7 + j) as u8;
        }
    }
    card.write(&blocks, BlockIdx(10)).unwrap();

    let mut read_back = [Block::new(), Block::new(), Block::new()];
    card.read(&mut read_back, BlockIdx(10), "test").unwrap();
    for (written, read) in blocks.iter().zip(read_back.iter()) {
        assert_eq!(&written.contents[..], &read.contents[..]);
    }

    // Blocks either side are untouched
    let before = card.read_block(BlockIdx(9), "test").unwrap();
    let after = card.read_block(BlockIdx(13), "test").unwrap();
    assert!(before.contents.iter().all(|&b| b == 0));
    assert!(after.contents.iter().all(|&b| b == 0));

    let (spi, _cs) = card.deinit().release();
    assert!(spi.memory[10 * 512..13 * 512]
        .iter()
        .enumerate()
        .all(|(n, &b)| b == ((n / 512) * 7 + n % 512) as u8));
    let multi: Vec<u8> = spi
        .commands
        .iter()
        .cloned()
        .filter(|&c| c == CMD25 || c == CMD18 || c == CMD12)
        .collect();
    assert_eq!(multi, [CMD25, CMD18, CMD12]);
}

//! sdmmc-storage - The SD card component
//!
//! Brings a card up on whichever bus it was configured for, mounts the FAT
//! volume on it and serves it through the `Storage` facade. A card that
//! fails to come up stays failed: every facade call then reports
//! `StorageError::Unavailable` until the card is set up again.

mod sensor;

use alloc::boxed::Box;
use alloc::vec::Vec;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "log")]
use log::{debug, error, info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, error, info, warn};

use crate::config::{BusConfig, BusMode};
use crate::fat::{format_volume, FatType, FatVolume, FormatOptions, TimeSource};
use crate::mbr::{Mbr, Partition, PartitionBlockDevice, PartitionType};
use crate::sdmmc::proto::PROBING_FREQ_KHZ;
use crate::sdmmc::{
    AcquireOpts, BusClock, CardDevice, CardType, Error, Frequency, Initialized, NotInit,
    SdMmcNative, SdMmcSpi, SdmmcHost,
};
use crate::storage::{FileInfo, Storage, StorageError, WriteMode};
use crate::{BlockCount, BlockDevice, BlockIdx};

pub use sensor::{Sensor, SensorBinding, SensorKind, TextSensor};

/// Where a freshly formatted card's only partition starts. 1 MiB keeps it
/// aligned to the erase blocks of any card we are likely to see.
const FIRST_PARTITION_START: BlockCount = BlockCount(2048);

/// Why a card isn't available.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitError {
    /// The bus or the power control pin couldn't be set up
    PinSetup,
    /// The card answered, but holds nothing we can mount
    Mount,
    /// Nothing answered on the bus
    NoCard,
    /// The card was powered off by `power_cycle`
    PowerCycled,
}

impl core::fmt::Display for InitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            InitError::PinSetup => "Failed to set up pins",
            InitError::Mount => "Failed to mount card",
            InitError::NoCard => "No card found",
            InitError::PowerCycled => "Card was power cycled",
        };
        f.write_str(text)
    }
}

impl From<Error> for InitError {
    fn from(e: Error) -> InitError {
        match e {
            Error::GpioError => InitError::PinSetup,
            _ => InitError::NoCard,
        }
    }
}

/// For boards where the card is always powered.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPowerControl;

impl OutputPin for NoPowerControl {
    type Error = core::convert::Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// The volume type a card ends up serving.
pub type CardVolume<D> = FatVolume<PartitionBlockDevice<D>>;

/// One SD card, mounted or failed.
pub struct SdCard<D, P>
where
    D: CardDevice,
    P: OutputPin,
{
    volume: Option<CardVolume<D>>,
    init_error: Option<InitError>,
    card_type: Option<CardType>,
    frequency: Option<Frequency>,
    power: Option<P>,
    bus: BusConfig,
    sensors: Vec<SensorBinding>,
    card_type_sensor: Option<Box<dyn TextSensor>>,
}

impl<D, P> core::fmt::Debug for SdCard<D, P>
where
    D: CardDevice,
    P: OutputPin,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SdCard")
            .field("bus", &self.bus)
            .field("mounted", &self.volume.is_some())
            .field("init_error", &self.init_error)
            .field("card_type", &self.card_type)
            .field("frequency", &self.frequency)
            .field("sensors", &self.sensors)
            .finish()
    }
}

impl<SPI, CS, P> SdCard<SdMmcSpi<SPI, CS, Initialized>, P>
where
    SPI: Transfer<u8> + BusClock,
    CS: OutputPin,
    P: OutputPin,
{
    /// Bring up a card on an SPI bus. If the card can't be read at the
    /// configured clock because of CRC or garbled responses, it is tried
    /// once more at the probing clock.
    pub fn setup_spi(card: SdMmcSpi<SPI, CS, NotInit>, power: Option<P>, bus: BusConfig) -> Self {
        let mut sd = SdCard::new(power, bus);
        if !matches!(bus.mode, BusMode::Spi { .. }) {
            error!("SPI card set up with a native bus configuration");
            sd.fail(InitError::PinSetup);
            return sd;
        }
        if let Err(e) = sd.power_on() {
            sd.fail(e);
            return sd;
        }

        let opts = AcquireOpts {
            require_crc: true,
            max_freq_khz: bus.max_freq_khz,
        };
        let result = match acquire_spi(card, opts) {
            Err((e, card)) if e.is_signal_integrity() && opts.max_freq_khz > PROBING_FREQ_KHZ => {
                warn!(
                    "Card failed at {} kHz ({:?}), retrying at {} kHz",
                    opts.max_freq_khz, e, PROBING_FREQ_KHZ
                );
                acquire_spi(
                    card,
                    AcquireOpts {
                        max_freq_khz: PROBING_FREQ_KHZ,
                        ..opts
                    },
                )
            }
            other => other,
        };
        match result {
            Ok(card) => sd.start(card),
            Err((e, _card)) => {
                error!("Failed to acquire card: {:?}", e);
                sd.fail(e.into());
            }
        }
        sd
    }
}

/// Acquire the card, then read block 0 at full speed to prove the wiring
/// can take it.
fn acquire_spi<SPI, CS>(
    card: SdMmcSpi<SPI, CS, NotInit>,
    opts: AcquireOpts,
) -> Result<SdMmcSpi<SPI, CS, Initialized>, (Error, SdMmcSpi<SPI, CS, NotInit>)>
where
    SPI: Transfer<u8> + BusClock,
    CS: OutputPin,
{
    let mut card = card.acquire_with_opts(opts)?;
    match card.read_block(BlockIdx(0), "probe") {
        Ok(_) => Ok(card),
        Err(e) => Err((e, card.deinit())),
    }
}

impl<H, P> SdCard<SdMmcNative<H, Initialized>, P>
where
    H: SdmmcHost,
    P: OutputPin,
{
    /// Bring up a card on the native SD/MMC host.
    pub fn setup_native(host: H, power: Option<P>, bus: BusConfig) -> Self {
        let mut sd = SdCard::new(power, bus);
        let slot = match bus.mode {
            BusMode::Native(slot) => slot,
            BusMode::Spi { .. } => {
                error!("Native card set up with an SPI bus configuration");
                sd.fail(InitError::PinSetup);
                return sd;
            }
        };
        if let Err(e) = sd.power_on() {
            sd.fail(e);
            return sd;
        }

        let opts = AcquireOpts {
            require_crc: true,
            max_freq_khz: bus.max_freq_khz,
        };
        match SdMmcNative::new(host, slot).acquire_with_opts(opts) {
            Ok(card) => sd.start(card),
            Err((e, _card)) => {
                error!("Failed to acquire card: {:?}", e);
                sd.fail(e.into());
            }
        }
        sd
    }
}

impl<D, P> SdCard<D, P>
where
    D: CardDevice,
    P: OutputPin,
{
    fn new(power: Option<P>, bus: BusConfig) -> Self {
        SdCard {
            volume: None,
            init_error: None,
            card_type: None,
            frequency: None,
            power,
            bus,
            sensors: Vec::new(),
            card_type_sensor: None,
        }
    }

    fn power_on(&mut self) -> Result<(), InitError> {
        if let Some(pin) = self.power.as_mut() {
            debug!("Powering card on");
            pin.set_high().map_err(|_| InitError::PinSetup)?;
        }
        Ok(())
    }

    fn fail(&mut self, e: InitError) {
        error!("{}", e);
        self.volume = None;
        self.init_error = Some(e);
    }

    fn start(&mut self, card: D) {
        self.card_type = Some(card.card_type());
        self.frequency = Some(card.frequency());
        match mount(card, self.bus.format_if_mount_failed) {
            Ok(volume) => {
                info!("Card mounted: {} bytes", volume.total_bytes());
                self.volume = Some(volume);
                self.init_error = None;
            }
            Err(e) => self.fail(e),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.volume.is_none()
    }

    pub fn init_error(&self) -> Option<InitError> {
        self.init_error
    }

    pub fn bus(&self) -> &BusConfig {
        &self.bus
    }

    /// `None` until a card has been identified.
    pub fn frequency(&self) -> Option<Frequency> {
        self.frequency
    }

    pub fn card_type_label(&self) -> &'static str {
        match self.card_type {
            Some(card_type) if self.volume.is_some() => card_type.label(),
            _ => "UNKNOWN",
        }
    }

    /// The mounted volume, for anything the facade doesn't cover.
    pub fn volume(&mut self) -> Option<&mut CardVolume<D>> {
        self.volume.as_mut()
    }

    pub fn set_time_source(&mut self, time_source: Box<dyn TimeSource>) {
        if let Some(volume) = self.volume.as_mut() {
            volume.set_time_source(time_source);
        }
    }

    pub fn add_sensor(&mut self, binding: SensorBinding) {
        self.sensors.push(binding);
    }

    pub fn set_card_type_sensor(&mut self, sensor: Box<dyn TextSensor>) {
        self.card_type_sensor = Some(sensor);
    }

    /// Cut power to the card and turn it back on. The volume is unmounted
    /// and the card stays failed until it is set up again, so the card
    /// driver is handed back for that. Without a power control pin there is
    /// nothing to do.
    pub fn power_cycle(&mut self) -> Result<Option<D>, InitError> {
        let pin = self.power.as_mut().ok_or(InitError::PinSetup)?;
        warn!("Power cycling card");
        pin.set_low().map_err(|_| InitError::PinSetup)?;
        pin.set_high().map_err(|_| InitError::PinSetup)?;
        let card = self.volume.take().map(|volume| volume.release().release());
        self.init_error = Some(InitError::PowerCycled);
        self.card_type = None;
        self.frequency = None;
        self.update_sensors();
        Ok(card)
    }

    /// Give back the card driver (if mounted) and the power control pin.
    pub fn release(self) -> (Option<D>, Option<P>) {
        let card = self.volume.map(|volume| volume.release().release());
        (card, self.power)
    }

    /// Publish every bound sensor. Values that can't be had right now are
    /// published as NaN.
    pub fn update_sensors(&mut self) {
        let label = self.card_type_label();
        if let Some(sensor) = self.card_type_sensor.as_mut() {
            sensor.publish(label);
        }
        let mut sensors = core::mem::take(&mut self.sensors);
        for binding in sensors.iter_mut() {
            let value = self.sensor_value(binding.kind(), binding.path());
            binding.publish(value);
        }
        self.sensors = sensors;
    }

    fn sensor_value(&mut self, kind: SensorKind, path: Option<&str>) -> f64 {
        let frequency = self.frequency.filter(|_| self.volume.is_some());
        let value = match kind {
            SensorKind::UsedSpace => self.used_space(),
            SensorKind::TotalSpace => self.total_space(),
            SensorKind::FreeSpace => self.free_space(),
            SensorKind::FileSize => match path {
                Some(path) => self.file_size(path),
                None => Err(StorageError::NotFound),
            },
            SensorKind::MaxFrequency => frequency
                .map(|f| u64::from(f.max_khz))
                .ok_or(StorageError::Unavailable),
            SensorKind::RealFrequency => frequency
                .map(|f| u64::from(f.real_khz))
                .ok_or(StorageError::Unavailable),
        };
        match value {
            Ok(value) => value as f64,
            Err(_) => f64::NAN,
        }
    }

    pub fn dump_config(&self) {
        info!("SD card:");
        info!("  Mode: {}", self.bus.mode.label());
        match self.bus.mode {
            BusMode::Native(slot) => {
                info!("  CLK pin: {}", slot.clk);
                info!("  CMD pin: {}", slot.cmd);
                info!("  Data lines: {:?}", slot.data);
            }
            BusMode::Spi { cs } => info!("  CS pin: {}", cs),
        }
        if let Some(pin) = self.bus.power_ctrl_pin {
            info!("  Power control pin: {}", pin);
        }
        info!("  Max frequency: {} kHz", self.bus.max_freq_khz);
        for binding in self.sensors.iter() {
            match binding.path() {
                Some(path) => info!("  Sensor: {} ({})", binding.kind().name(), path),
                None => info!("  Sensor: {}", binding.kind().name()),
            }
        }
        if self.card_type_sensor.is_some() {
            info!("  Text sensor: card_type");
        }
        match self.init_error {
            Some(e) => error!("  Setup failed: {}", e),
            None => info!("  Card type: {}", self.card_type_label()),
        }
    }

    fn volume_or_unavailable(&mut self) -> Result<&mut CardVolume<D>, StorageError> {
        self.volume.as_mut().ok_or(StorageError::Unavailable)
    }

    fn updated<T>(&mut self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        if result.is_ok() {
            self.update_sensors();
        }
        result
    }
}

/// Mount a superfloppy if block 0 holds a FAT volume, otherwise the first
/// partition. Formats the card if allowed and neither works.
fn mount<D>(card: D, format: bool) -> Result<CardVolume<D>, InitError>
where
    D: CardDevice,
{
    let whole = PartitionBlockDevice::whole_device(card).map_err(|e| {
        error!("Can't read card size: {:?}", e);
        InitError::NoCard
    })?;
    let mut card = match FatVolume::new(whole) {
        Ok(volume) => {
            debug!("Mounted volume at block 0");
            return Ok(volume);
        }
        Err((_e, whole)) => {
            #[cfg(feature = "log")]
            debug!("No volume at block 0: {:?}", _e);
            whole.release()
        }
    };

    match Mbr::first_fat_partition(&mut card) {
        Ok(partition) => match FatVolume::new(partition.with_block_device(card)) {
            Ok(volume) => {
                debug!("Mounted partition at block {}", partition.lba_start.0);
                return Ok(volume);
            }
            Err((_e, part)) => {
                #[cfg(feature = "log")]
                warn!("FAT partition won't mount: {:?}", _e);
                card = part.release();
            }
        },
        Err(_e) => {
            #[cfg(feature = "log")]
            debug!("No usable partition table: {:?}", _e);
        }
    }

    if !format {
        return Err(InitError::Mount);
    }
    format_card(card)
}

/// Write a partition table with one partition and put a fresh volume on it.
fn format_card<D>(mut card: D) -> Result<CardVolume<D>, InitError>
where
    D: CardDevice,
{
    let blocks = card.num_blocks().map_err(|_| InitError::NoCard)?;
    if blocks <= FIRST_PARTITION_START {
        return Err(InitError::Mount);
    }
    warn!("Formatting card");
    let mut partition = Partition {
        ty: PartitionType::Empty,
        lba_start: FIRST_PARTITION_START,
        block_count: BlockCount(blocks.0 - FIRST_PARTITION_START.0),
    };
    let mut part = partition.with_block_device(card);
    let fat_type = format_volume(&mut part, &FormatOptions::default()).map_err(|_e| {
        #[cfg(feature = "log")]
        error!("Format failed: {:?}", _e);
        InitError::Mount
    })?;
    partition.ty = match fat_type {
        FatType::Fat16 => PartitionType::Fat16Lba,
        FatType::Fat32 => PartitionType::Fat32Lba,
    };
    Mbr::write_single_partition(part.inner_mut(), &partition).map_err(|_e| {
        #[cfg(feature = "log")]
        error!("Can't write partition table: {:?}", _e);
        InitError::Mount
    })?;
    let card = part.release();
    FatVolume::new(partition.with_block_device(card)).map_err(|(_e, _)| {
        #[cfg(feature = "log")]
        error!("Fresh volume won't mount: {:?}", _e);
        InitError::Mount
    })
}

impl<D, P> Storage for SdCard<D, P>
where
    D: CardDevice,
    P: OutputPin,
{
    fn card_type(&self) -> &'static str {
        self.card_type_label()
    }

    fn total_space(&mut self) -> Result<u64, StorageError> {
        self.volume_or_unavailable()?.total_space()
    }

    fn free_space(&mut self) -> Result<u64, StorageError> {
        self.volume_or_unavailable()?.free_space()
    }

    fn stat(&mut self, path: &str) -> Result<FileInfo, StorageError> {
        Storage::stat(self.volume_or_unavailable()?, path)
    }

    fn list_directory(&mut self, path: &str, depth: u8) -> Result<Vec<FileInfo>, StorageError> {
        self.volume_or_unavailable()?.list_directory(path, depth)
    }

    fn read_at(&mut self, path: &str, offset: u64, buffer: &mut [u8]) -> Result<usize, StorageError> {
        Storage::read_at(self.volume_or_unavailable()?, path, offset, buffer)
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, StorageError> {
        Storage::read_file(self.volume_or_unavailable()?, path)
    }

    fn write_file_mode(&mut self, path: &str, data: &[u8], mode: WriteMode) -> Result<(), StorageError> {
        let result = self.volume_or_unavailable()?.write_file_mode(path, data, mode);
        self.updated(result)
    }

    fn create_directory(&mut self, path: &str) -> Result<(), StorageError> {
        let result = self.volume_or_unavailable()?.create_directory(path);
        self.updated(result)
    }

    fn remove_directory(&mut self, path: &str) -> Result<(), StorageError> {
        let result = self.volume_or_unavailable()?.remove_directory(path);
        self.updated(result)
    }

    fn delete_file(&mut self, path: &str) -> Result<(), StorageError> {
        let result = Storage::delete_file(self.volume_or_unavailable()?, path);
        self.updated(result)
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

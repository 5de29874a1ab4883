//! sdmmc-storage - Configuration
//!
//! The options a card and a file server are configured with, and the checks
//! that turn them into something the hardware setup can use. Nothing in here
//! touches a pin: a bad combination is reported before any setup runs.

use alloc::string::String;

use crate::path;
use crate::sdmmc::proto::DEFAULT_FREQ_KHZ;
use crate::sdmmc::{BusWidth, DataLines, SlotConfig};

/// Everything that can be wrong with a configuration.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A pin the selected mode needs was not given
    MissingPin(&'static str),
    /// Both `data3_pin` and `cs_pin` were given for an SPI card
    ChipSelectConflict,
    /// Neither `data3_pin` nor `cs_pin` was given for an SPI card
    ChipSelectMissing,
    /// SPI cards take their bus pins from the SPI bus
    PinsBelongToSpiBus,
    /// SPI only has one data line
    SpiNeedsOneBitMode,
    /// The chip has no native SD/MMC host
    NoSdmmcHost(&'static str),
    UnsupportedVariant(&'static str),
    /// A `file_size` sensor was configured without a path
    SensorNeedsPath,
    UnknownSensor(String),
    UnknownAction(String),
    /// Raw data that is neither text nor a list of bytes
    InvalidData,
    /// A write or append action without data
    MissingData(&'static str),
    /// Data given to an action that takes none
    UnexpectedData(&'static str),
    /// A raw data value outside 0..=255
    ByteOutOfRange(i64),
    /// A path that is empty or climbs out of its root
    InvalidPath(String),
    InvalidUrlPrefix(String),
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::MissingPin(pin) => write!(f, "{} is required for this mode", pin),
            ConfigError::ChipSelectConflict => {
                write!(f, "data3_pin is the same as cs_pin. Please remove one.")
            }
            ConfigError::ChipSelectMissing => {
                write!(f, "data3_pin or cs_pin required. Please specify one.")
            }
            ConfigError::PinsBelongToSpiBus => write!(
                f,
                "Please move pins to SPI bus definition:\n 'cmd_pin' to 'mosi_pin'\n 'data0_pin' to 'miso_pin'\n 'clk_pin' to 'clk_pin'"
            ),
            ConfigError::SpiNeedsOneBitMode => write!(f, "Only 1bit mode supported for SPI"),
            ConfigError::NoSdmmcHost(variant) => write!(
                f,
                "{} doesn't have sdmmc host support. Please use `type: sd_spi`",
                variant
            ),
            ConfigError::UnsupportedVariant(variant) => write!(f, "Unsupported variant {}", variant),
            ConfigError::SensorNeedsPath => write!(f, "path is required for file_size sensors"),
            ConfigError::UnknownSensor(name) => write!(f, "Unknown sensor type '{}'", name),
            ConfigError::UnknownAction(name) => write!(f, "Unknown action '{}'", name),
            ConfigError::InvalidData => write!(
                f,
                "data must either be a string wrapped in quotes or a list of bytes"
            ),
            ConfigError::MissingData(action) => write!(f, "data is required for {}", action),
            ConfigError::UnexpectedData(action) => write!(f, "{} doesn't take data", action),
            ConfigError::ByteOutOfRange(value) => {
                write!(f, "{} is not a byte value (0-255)", value)
            }
            ConfigError::InvalidPath(p) => write!(f, "Invalid path '{}'", p),
            ConfigError::InvalidUrlPrefix(p) => write!(f, "Invalid url_prefix '{}'", p),
        }
    }
}

/// The chip the firmware is built for.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Esp32,
    Esp32S3,
    Esp32C6,
    Other(&'static str),
}

impl Variant {
    pub fn name(&self) -> &'static str {
        match self {
            Variant::Esp32 => "esp32",
            Variant::Esp32S3 => "esp32s3",
            Variant::Esp32C6 => "esp32c6",
            Variant::Other(name) => *name,
        }
    }

    fn has_sdmmc_host(&self) -> bool {
        matches!(self, Variant::Esp32 | Variant::Esp32S3)
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    /// The native SD/MMC host (`type: sd_mmc`)
    SdMmc,
    /// An SPI device (`type: sd_spi`)
    SdSpi,
}

/// How a card is wired up, as written in the configuration.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardConfig {
    pub bus_type: BusType,
    pub clk_pin: Option<u8>,
    pub cmd_pin: Option<u8>,
    pub data0_pin: Option<u8>,
    pub data1_pin: Option<u8>,
    pub data2_pin: Option<u8>,
    /// Doubles as chip select for SPI cards
    pub data3_pin: Option<u8>,
    pub cs_pin: Option<u8>,
    /// `None` takes the default for the bus type
    pub mode_1bit: Option<bool>,
    pub power_ctrl_pin: Option<u8>,
    pub format_if_mount_failed: bool,
    pub max_freq_khz: u32,
}

impl Default for CardConfig {
    fn default() -> Self {
        CardConfig {
            bus_type: BusType::SdMmc,
            clk_pin: None,
            cmd_pin: None,
            data0_pin: None,
            data1_pin: None,
            data2_pin: None,
            data3_pin: None,
            cs_pin: None,
            mode_1bit: None,
            power_ctrl_pin: None,
            format_if_mount_failed: false,
            max_freq_khz: DEFAULT_FREQ_KHZ,
        }
    }
}

/// The validated wiring of a card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Native(SlotConfig),
    Spi { cs: u8 },
}

impl BusMode {
    /// A label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            BusMode::Native(slot) => match slot.bus_width() {
                BusWidth::One => "SDMMC 1-bit",
                BusWidth::Four => "SDMMC 4-bit",
            },
            BusMode::Spi { .. } => "SPI",
        }
    }
}

/// What the card setup needs to know. Only `CardConfig::validate` makes
/// these from user input.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    pub mode: BusMode,
    pub power_ctrl_pin: Option<u8>,
    pub format_if_mount_failed: bool,
    pub max_freq_khz: u32,
}

impl CardConfig {
    pub fn mode_1bit(&self) -> bool {
        self.mode_1bit.unwrap_or(self.bus_type == BusType::SdSpi)
    }

    pub fn validate(&self, variant: Variant) -> Result<BusConfig, ConfigError> {
        match variant {
            Variant::Other(name) => return Err(ConfigError::UnsupportedVariant(name)),
            v if self.bus_type == BusType::SdMmc && !v.has_sdmmc_host() => {
                return Err(ConfigError::NoSdmmcHost(v.name()))
            }
            _ => {}
        }
        let mode = match self.bus_type {
            BusType::SdMmc => BusMode::Native(self.slot()?),
            BusType::SdSpi => BusMode::Spi {
                cs: self.chip_select()?,
            },
        };
        Ok(BusConfig {
            mode,
            power_ctrl_pin: self.power_ctrl_pin,
            format_if_mount_failed: self.format_if_mount_failed,
            max_freq_khz: self.max_freq_khz,
        })
    }

    fn slot(&self) -> Result<SlotConfig, ConfigError> {
        let clk = self.clk_pin.ok_or(ConfigError::MissingPin("clk_pin"))?;
        let cmd = self.cmd_pin.ok_or(ConfigError::MissingPin("cmd_pin"))?;
        let data0 = self.data0_pin.ok_or(ConfigError::MissingPin("data0_pin"))?;
        let data = if self.mode_1bit() {
            DataLines::OneBit { data0 }
        } else {
            DataLines::FourBit {
                data0,
                data1: self.data1_pin.ok_or(ConfigError::MissingPin("data1_pin"))?,
                data2: self.data2_pin.ok_or(ConfigError::MissingPin("data2_pin"))?,
                data3: self.data3_pin.ok_or(ConfigError::MissingPin("data3_pin"))?,
            }
        };
        Ok(SlotConfig { clk, cmd, data })
    }

    fn chip_select(&self) -> Result<u8, ConfigError> {
        let cs = match (self.data3_pin, self.cs_pin) {
            (Some(_), Some(_)) => return Err(ConfigError::ChipSelectConflict),
            (None, None) => return Err(ConfigError::ChipSelectMissing),
            (Some(pin), None) | (None, Some(pin)) => pin,
        };
        if self.cmd_pin.is_some() || self.data0_pin.is_some() || self.clk_pin.is_some() {
            return Err(ConfigError::PinsBelongToSpiBus);
        }
        if !self.mode_1bit() {
            return Err(ConfigError::SpiNeedsOneBitMode);
        }
        Ok(cs)
    }
}

/// File server options.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileServerConfig {
    /// First URL component the server answers under
    pub url_prefix: String,
    /// Directory on the card that the server exposes
    pub root_path: String,
    pub enable_deletion: bool,
    pub enable_download: bool,
    pub enable_upload: bool,
}

impl Default for FileServerConfig {
    fn default() -> Self {
        FileServerConfig {
            url_prefix: String::from("file"),
            root_path: String::from("/"),
            enable_deletion: false,
            enable_download: false,
            enable_upload: false,
        }
    }
}

impl FileServerConfig {
    /// Tidy up the prefix and root, rejecting ones that can't work.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let prefix = self.url_prefix.trim_matches(path::SEPARATOR);
        if prefix.is_empty() || prefix.contains(|c: char| c == '?' || c == '#' || c.is_whitespace()) {
            return Err(ConfigError::InvalidUrlPrefix(self.url_prefix));
        }
        self.url_prefix = String::from(prefix);
        self.root_path = match path::normalize(&self.root_path) {
            Ok(root) => root,
            Err(_) => return Err(ConfigError::InvalidPath(self.root_path)),
        };
        Ok(self)
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

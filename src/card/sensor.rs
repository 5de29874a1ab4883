//! sdmmc-storage - Card sensors
//!
//! Values the card publishes on every poll. Publishing itself belongs to
//! whoever owns the sinks; the card only computes numbers.

use alloc::boxed::Box;
use alloc::string::String;

use crate::config::ConfigError;
use crate::path;

/// A numeric value sink.
pub trait Sensor {
    fn publish(&mut self, value: f64);
}

/// A text value sink.
pub trait TextSensor {
    fn publish(&mut self, value: &str);
}

/// The metrics a card can publish.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    /// Bytes in use
    UsedSpace,
    /// Bytes on the volume
    TotalSpace,
    /// Bytes still available
    FreeSpace,
    /// Bytes in one file
    FileSize,
    /// The fastest clock the card allows, in kHz
    MaxFrequency,
    /// The clock the bus runs at, in kHz
    RealFrequency,
}

static SENSOR_KINDS: [(&str, SensorKind); 6] = [
    ("used_space", SensorKind::UsedSpace),
    ("total_space", SensorKind::TotalSpace),
    ("free_space", SensorKind::FreeSpace),
    ("file_size", SensorKind::FileSize),
    ("max_frequency", SensorKind::MaxFrequency),
    ("real_frequency", SensorKind::RealFrequency),
];

impl SensorKind {
    /// The configuration name, such as `used_space`.
    pub fn name(&self) -> &'static str {
        SENSOR_KINDS
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Configuration names are matched without regard to case.
    pub fn from_name(name: &str) -> Result<SensorKind, ConfigError> {
        SENSOR_KINDS
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|(_, kind)| *kind)
            .ok_or_else(|| ConfigError::UnknownSensor(String::from(name)))
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::MaxFrequency | SensorKind::RealFrequency => "kHz",
            _ => "B",
        }
    }
}

/// One metric tied to the sink it is published on.
pub struct SensorBinding {
    kind: SensorKind,
    path: Option<String>,
    sink: Box<dyn Sensor>,
}

impl core::fmt::Debug for SensorBinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SensorBinding")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish()
    }
}

impl SensorBinding {
    /// Bind a metric that doesn't need a path.
    pub fn new(kind: SensorKind, sink: Box<dyn Sensor>) -> Result<SensorBinding, ConfigError> {
        if kind == SensorKind::FileSize {
            return Err(ConfigError::SensorNeedsPath);
        }
        Ok(SensorBinding {
            kind,
            path: None,
            sink,
        })
    }

    /// Bind the size of the file at `file`.
    pub fn file_size(file: &str, sink: Box<dyn Sensor>) -> Result<SensorBinding, ConfigError> {
        let normalized = match path::normalize(file) {
            Ok(p) if p != "/" => p,
            _ => return Err(ConfigError::InvalidPath(String::from(file))),
        };
        Ok(SensorBinding {
            kind: SensorKind::FileSize,
            path: Some(normalized),
            sink,
        })
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub(crate) fn publish(&mut self, value: f64) {
        self.sink.publish(value);
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

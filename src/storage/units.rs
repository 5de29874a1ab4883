//! Human readable sizes

use alloc::format;
use alloc::string::String;

/// Binary (1024 based) units, as shown in listings and logs.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryUnit {
    Byte = 0,
    KiloByte = 1,
    MegaByte = 2,
    GigaByte = 3,
    TeraByte = 4,
    PetaByte = 5,
}

impl MemoryUnit {
    const ALL: [MemoryUnit; 6] = [
        MemoryUnit::Byte,
        MemoryUnit::KiloByte,
        MemoryUnit::MegaByte,
        MemoryUnit::GigaByte,
        MemoryUnit::TeraByte,
        MemoryUnit::PetaByte,
    ];

    pub fn label(self) -> &'static str {
        match self {
            MemoryUnit::Byte => "B",
            MemoryUnit::KiloByte => "KB",
            MemoryUnit::MegaByte => "MB",
            MemoryUnit::GigaByte => "GB",
            MemoryUnit::TeraByte => "TB",
            MemoryUnit::PetaByte => "PB",
        }
    }

    /// Bytes in one of this unit.
    pub fn bytes(self) -> u64 {
        1u64 << (10 * self as u32)
    }

    /// The largest unit `size` has at least one of.
    pub fn from_size(size: u64) -> MemoryUnit {
        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|unit| size >= unit.bytes())
            .unwrap_or(MemoryUnit::Byte)
    }

    pub fn convert(self, size: u64) -> f64 {
        size as f64 / self.bytes() as f64
    }
}

/// `1536` becomes `"1.50 KB"`.
pub fn format_size(size: u64) -> String {
    let unit = MemoryUnit::from_size(size);
    format!("{:.2} {}", unit.convert(size), unit.label())
}

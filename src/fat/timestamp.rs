//! FAT date and time stamps

/// Something which can tell us the time, for stamping files we modify.
pub trait TimeSource {
    fn get_timestamp(&self) -> Timestamp;
}

/// A clock stuck at one instant. Used until something better is installed.
#[derive(Debug, Clone, Copy)]
pub struct FixedTime(pub Timestamp);

impl TimeSource for FixedTime {
    fn get_timestamp(&self) -> Timestamp {
        self.0
    }
}

/// A date and time, at the two second resolution FAT stores.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Full year, 1980 to 2107
    pub year: u16,
    /// 1 to 12
    pub month: u8,
    /// 1 to 31
    pub day: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl Timestamp {
    /// The earliest time FAT can represent.
    pub const EPOCH: Timestamp = Timestamp {
        year: 1980,
        month: 1,
        day: 1,
        hours: 0,
        minutes: 0,
        seconds: 0,
    };

    /// Decode the packed date and time words of a directory entry.
    pub fn from_fat(date: u16, time: u16) -> Timestamp {
        Timestamp {
            year: 1980 + (date >> 9),
            month: ((date >> 5) & 0x0F) as u8,
            day: (date & 0x1F) as u8,
            hours: (time >> 11) as u8,
            minutes: ((time >> 5) & 0x3F) as u8,
            seconds: ((time & 0x1F) * 2) as u8,
        }
    }

    /// Pack into `(date, time)` words. Years outside 1980..=2107 are clamped.
    pub fn to_fat(&self) -> (u16, u16) {
        let year = self.year.max(1980).min(2107) - 1980;
        let date = (year << 9) | (u16::from(self.month & 0x0F) << 5) | u16::from(self.day & 0x1F);
        let time = (u16::from(self.hours & 0x1F) << 11)
            | (u16::from(self.minutes & 0x3F) << 5)
            | u16::from(self.seconds / 2);
        (date, time)
    }
}

impl core::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hours, self.minutes, self.seconds
        )
    }
}

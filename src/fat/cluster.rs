use super::FatType;

/// A cluster number. Data clusters start at 2.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cluster(pub(crate) u32);

impl Cluster {
    pub const FIRST_DATA: Cluster = Cluster(2);

    pub fn new(cluster_number: u32) -> Self {
        Self(cluster_number)
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    /// Cluster numbers as stored in a directory entry, where 0 means "none".
    pub fn from_entry(hi: u16, lo: u16) -> Option<Self> {
        let value = u32::from(hi) << 16 | u32::from(lo);
        if value == 0 {
            None
        } else {
            Some(Cluster(value))
        }
    }

    pub fn split(cluster: Option<Cluster>) -> (u16, u16) {
        let value = cluster.map_or(0, |c| c.0);
        ((value >> 16) as u16, value as u16)
    }
}

/// One decoded FAT entry.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Free,
    Next(Cluster),
    Bad,
    EndOfChain,
}

impl Entry {
    const FAT16_BAD: u32 = 0xFFF7;
    const FAT16_FINAL: u32 = 0xFFFF;
    const FAT16_RESERVED_RANGE_START: u32 = 0xFFF8;

    const FAT32_MASK: u32 = 0x0FFF_FFFF;
    const FAT32_BAD: u32 = 0x0FFF_FFF7;
    const FAT32_FINAL: u32 = 0x0FFF_FFFF;
    const FAT32_RESERVED_RANGE_START: u32 = 0x0FFF_FFF8;

    pub fn decode(value: u32, fat_type: FatType) -> Self {
        let (value, bad, final_start) = match fat_type {
            FatType::Fat16 => (
                value & 0xFFFF,
                Self::FAT16_BAD,
                Self::FAT16_RESERVED_RANGE_START,
            ),
            FatType::Fat32 => (
                value & Self::FAT32_MASK,
                Self::FAT32_BAD,
                Self::FAT32_RESERVED_RANGE_START,
            ),
        };
        if value == 0 {
            Entry::Free
        } else if value == bad || value == 1 {
            Entry::Bad
        } else if value >= final_start {
            Entry::EndOfChain
        } else {
            Entry::Next(Cluster(value))
        }
    }

    pub fn encode(&self, fat_type: FatType) -> u32 {
        match (self, fat_type) {
            (Entry::Free, _) => 0,
            (Entry::Next(cluster), _) => cluster.0,
            (Entry::Bad, FatType::Fat16) => Self::FAT16_BAD,
            (Entry::Bad, FatType::Fat32) => Self::FAT32_BAD,
            (Entry::EndOfChain, FatType::Fat16) => Self::FAT16_FINAL,
            (Entry::EndOfChain, FatType::Fat32) => Self::FAT32_FINAL,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_entries() {
        assert_eq!(Entry::decode(0, FatType::Fat16), Entry::Free);
        assert_eq!(Entry::decode(0xFFF8, FatType::Fat16), Entry::EndOfChain);
        assert_eq!(Entry::decode(0xFFF7, FatType::Fat16), Entry::Bad);
        assert_eq!(Entry::decode(0x1234, FatType::Fat16), Entry::Next(Cluster(0x1234)));
        // Top nibble is reserved on FAT32
        assert_eq!(Entry::decode(0xF000_0000, FatType::Fat32), Entry::Free);
        assert_eq!(Entry::decode(0xFFFF_FFFF, FatType::Fat32), Entry::EndOfChain);
        assert_eq!(Entry::decode(0x0001_0005, FatType::Fat32), Entry::Next(Cluster(0x1_0005)));
        assert_eq!(Entry::EndOfChain.encode(FatType::Fat32), 0x0FFF_FFFF);
    }

    #[test]
    fn split_first_cluster() {
        assert_eq!(Cluster::split(Some(Cluster(0x0012_3456))), (0x0012, 0x3456));
        assert_eq!(Cluster::split(None), (0, 0));
        assert_eq!(Cluster::from_entry(0x0012, 0x3456), Some(Cluster(0x0012_3456)));
        assert_eq!(Cluster::from_entry(0, 0), None);
    }
}

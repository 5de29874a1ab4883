use alloc::string::String;
use alloc::vec::Vec;
use core::convert::TryInto;

use crate::{BlockCount, BlockDevice, BlockIdx};

use super::{cluster::Cluster, timestamp::Timestamp, FatError, FatType, FatVolume};

bitflags::bitflags! {
    pub struct Attributes: u8 {
        const READ_ONLY = (1 << 0);
        const HIDDEN = (1 << 1);
        const SYSTEM = (1 << 2);
        const VOLUME_ID = (1 << 3);
        const DIRECTORY = (1 << 4);
        const ARCHIVE = (1 << 5);
    }
}

impl Attributes {
    pub fn is_long_name(&self) -> bool {
        self.contains(Self::READ_ONLY | Self::HIDDEN | Self::SYSTEM | Self::VOLUME_ID)
    }

    pub fn is_volume_label(&self) -> bool {
        self.contains(Self::VOLUME_ID) && !self.is_long_name()
    }

    pub fn is_dir(&self) -> bool {
        self.contains(Self::DIRECTORY)
    }
}

/// An 8.3 name, stored upper case and space padded. All lower case base
/// names and extensions are remembered in the NT case byte.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    name: [u8; 11],
    case: u8,
}

impl ShortName {
    const LOWER_BASE: u8 = 0x08;
    const LOWER_EXT: u8 = 0x10;

    pub const DOT: ShortName = ShortName {
        name: *b".          ",
        case: 0,
    };
    pub const DOT_DOT: ShortName = ShortName {
        name: *b"..         ",
        case: 0,
    };

    pub fn parse(name: &str) -> Option<ShortName> {
        let (base, ext) = match name.rfind('.') {
            Some(0) => return None,
            Some(idx) => (&name[..idx], &name[idx + 1..]),
            None => (name, ""),
        };
        if base.is_empty() || base.len() > 8 || ext.len() > 3 {
            return None;
        }
        if !base.bytes().chain(ext.bytes()).all(Self::valid_byte) {
            return None;
        }

        let mut short = ShortName {
            name: [b' '; 11],
            case: 0,
        };
        for (dst, src) in short.name[..8].iter_mut().zip(base.bytes()) {
            *dst = src.to_ascii_uppercase();
        }
        for (dst, src) in short.name[8..].iter_mut().zip(ext.bytes()) {
            *dst = src.to_ascii_uppercase();
        }
        if Self::all_lower(base) {
            short.case |= Self::LOWER_BASE;
        }
        if Self::all_lower(ext) {
            short.case |= Self::LOWER_EXT;
        }
        Some(short)
    }

    fn valid_byte(b: u8) -> bool {
        b.is_ascii_alphanumeric() || b"!#$%&'()-@^_`{}~".contains(&b)
    }

    fn all_lower(part: &str) -> bool {
        part.bytes().any(|b| b.is_ascii_lowercase()) && !part.bytes().any(|b| b.is_ascii_uppercase())
    }

    pub fn from_raw(name: [u8; 11], case: u8) -> ShortName {
        ShortName {
            name,
            case: case & (Self::LOWER_BASE | Self::LOWER_EXT),
        }
    }

    pub fn raw(&self) -> &[u8; 11] {
        &self.name
    }

    pub fn case_flags(&self) -> u8 {
        self.case
    }

    /// Names compare without regard to case.
    pub fn matches(&self, other: &ShortName) -> bool {
        self.name == other.name
    }

    pub fn is_dot_entry(&self) -> bool {
        self.matches(&Self::DOT) || self.matches(&Self::DOT_DOT)
    }

    fn trimmed(part: &[u8]) -> &[u8] {
        let end = part.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
        &part[..end]
    }

    pub fn to_string(&self) -> String {
        let mut out = String::with_capacity(12);
        let push = |out: &mut String, part: &[u8], lower: bool| {
            for &b in part {
                // 0x05 stands in for a leading 0xE5
                let b = if b == 0x05 { 0xE5 } else { b };
                let c = if lower { b.to_ascii_lowercase() } else { b };
                out.push(char::from(c));
            }
        };
        push(&mut out, Self::trimmed(&self.name[..8]), self.case & Self::LOWER_BASE != 0);
        let ext = Self::trimmed(&self.name[8..]);
        if !ext.is_empty() {
            out.push('.');
            push(&mut out, ext, self.case & Self::LOWER_EXT != 0);
        }
        out
    }
}

impl core::fmt::Debug for ShortName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ShortName({:?})", self.to_string())
    }
}

/// Where a directory entry lives on disk.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub block: BlockIdx,
    pub offset: usize,
}

/// The first sector(s) of a directory.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStart {
    /// The fixed root directory region of a FAT16 volume
    RootRegion,
    /// A cluster chain: any subdirectory, or the FAT32 root
    Cluster(Cluster),
}

/// A decoded directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub(crate) name: ShortName,
    pub(crate) attributes: Attributes,
    pub(crate) file_size: u32,
    pub(crate) first_cluster: Option<Cluster>,
    pub(crate) modified: Timestamp,
    pub(crate) location: EntryLocation,
}

impl DirEntry {
    pub fn name(&self) -> &ShortName {
        &self.name
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn is_dir(&self) -> bool {
        self.attributes.is_dir()
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn first_cluster(&self) -> Option<Cluster> {
        self.first_cluster
    }

    pub fn modified(&self) -> Timestamp {
        self.modified
    }

    pub fn location(&self) -> EntryLocation {
        self.location
    }

    fn decode(raw: &DirEntryRaw, location: EntryLocation, fat_type: FatType) -> DirEntry {
        let hi = match fat_type {
            FatType::Fat16 => 0,
            FatType::Fat32 => raw.fst_clus_hi(),
        };
        DirEntry {
            name: ShortName::from_raw(raw.name(), raw.nt_res()),
            attributes: Attributes::from_bits_truncate(raw.attr()),
            file_size: raw.file_size(),
            first_cluster: Cluster::from_entry(hi, raw.fst_clus_lo()),
            modified: Timestamp::from_fat(raw.wrt_date(), raw.wrt_time()),
            location,
        }
    }

    pub(crate) fn encode(&self) -> [u8; 32] {
        let mut raw = DirEntryRaw { data: [0u8; 32] };
        raw.set_name(self.name.raw());
        raw.set_attr(self.attributes.bits());
        raw.set_nt_res(self.name.case_flags());
        let (date, time) = self.modified.to_fat();
        raw.set_crt_time(time);
        raw.set_crt_date(date);
        raw.set_lst_acc_date(date);
        raw.set_wrt_time(time);
        raw.set_wrt_date(date);
        let (hi, lo) = Cluster::split(self.first_cluster);
        raw.set_fst_clus_hi(hi);
        raw.set_fst_clus_lo(lo);
        raw.set_file_size(if self.is_dir() { 0 } else { self.file_size });
        raw.data
    }
}

/// The 32 bytes of a directory entry.
#[derive(Debug, Clone)]
pub struct DirEntryRaw {
    data: [u8; 32],
}

impl DirEntryRaw {
    pub const LEN: usize = 32;
    const END_OF_DIRECTORY: u8 = 0x00;
    const DELETED: u8 = 0xE5;

    pub fn new(data: &[u8]) -> Self {
        let mut raw = DirEntryRaw { data: [0u8; 32] };
        raw.data.copy_from_slice(&data[..Self::LEN]);
        raw
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn name(&self) -> [u8; 11] {
        self.data()[0..11].try_into().expect("Infallible")
    }

    fn set_name(&mut self, name: &[u8; 11]) {
        self.data_mut()[0..11].copy_from_slice(name);
    }

    define_field!(attr, set_attr, u8, 11);
    define_field!(nt_res, set_nt_res, u8, 12);
    define_field!(crt_time_tenth, set_crt_time_tenth, u8, 13);
    define_field!(crt_time, set_crt_time, u16, 14);
    define_field!(crt_date, set_crt_date, u16, 16);
    define_field!(lst_acc_date, set_lst_acc_date, u16, 18);
    define_field!(fst_clus_hi, set_fst_clus_hi, u16, 20);
    define_field!(wrt_time, set_wrt_time, u16, 22);
    define_field!(wrt_date, set_wrt_date, u16, 24);
    define_field!(fst_clus_lo, set_fst_clus_lo, u16, 26);
    define_field!(file_size, set_file_size, u32, 28);
}

/// What a 32 byte directory slot holds.
enum Slot {
    Used(DirEntry),
    /// Long name fragments and the volume label
    Hidden,
    Deleted,
    EndOfDirectory,
}

/// Walks the sectors of one directory.
struct DirSectors {
    start: DirStart,
    cluster: Option<Cluster>,
    sector: u32,
}

impl DirSectors {
    fn new(start: DirStart) -> Self {
        let cluster = match start {
            DirStart::RootRegion => None,
            DirStart::Cluster(c) => Some(c),
        };
        Self {
            start,
            cluster,
            sector: 0,
        }
    }

    fn next<BD>(&mut self, volume: &mut FatVolume<BD>) -> Result<Option<BlockIdx>, FatError<BD::Error>>
    where
        BD: BlockDevice,
    {
        match self.start {
            DirStart::RootRegion => {
                if self.sector >= volume.bpb.root_dir_sectors() {
                    return Ok(None);
                }
                let block = BlockIdx(volume.bpb.first_root_dir_sector() + self.sector);
                self.sector += 1;
                Ok(Some(block))
            }
            DirStart::Cluster(_) => {
                if self.sector == volume.bpb.sectors_per_cluster() {
                    self.sector = 0;
                    self.cluster = match self.cluster {
                        Some(c) => volume.next_cluster(c)?,
                        None => None,
                    };
                }
                match self.cluster {
                    Some(c) => {
                        let block = volume.cluster_start(c)? + BlockCount(self.sector);
                        self.sector += 1;
                        Ok(Some(block))
                    }
                    None => Ok(None),
                }
            }
        }
    }
}

impl<BD> FatVolume<BD>
where
    BD: BlockDevice,
{
    pub(crate) fn root_dir(&self) -> DirStart {
        match self.bpb.root_cluster() {
            Ok(cluster) => DirStart::Cluster(Cluster(cluster)),
            Err(_) => DirStart::RootRegion,
        }
    }

    /// The directory a `..` entry or an entry's first cluster points at.
    pub(crate) fn dir_start(&self, cluster: Option<Cluster>) -> DirStart {
        match cluster {
            Some(c) => DirStart::Cluster(c),
            None => self.root_dir(),
        }
    }

    /// Visit every slot of a directory until `visit` returns something.
    fn scan_dir<F, R>(&mut self, dir: DirStart, mut visit: F) -> Result<Option<R>, FatError<BD::Error>>
    where
        F: FnMut(EntryLocation, Slot) -> Option<R>,
    {
        let fat_type = self.fat_type();
        let mut sectors = DirSectors::new(dir);
        while let Some(block_idx) = sectors.next(self)? {
            let block = self.read_sector(block_idx)?.clone();
            for offset in (0..block.len()).step_by(DirEntryRaw::LEN) {
                let location = EntryLocation {
                    block: block_idx,
                    offset,
                };
                let raw = DirEntryRaw::new(&block[offset..]);
                let slot = match raw.name()[0] {
                    DirEntryRaw::END_OF_DIRECTORY => Slot::EndOfDirectory,
                    DirEntryRaw::DELETED => Slot::Deleted,
                    _ => {
                        let attributes = Attributes::from_bits_truncate(raw.attr());
                        if attributes.is_long_name() || attributes.is_volume_label() {
                            Slot::Hidden
                        } else {
                            Slot::Used(DirEntry::decode(&raw, location, fat_type))
                        }
                    }
                };
                let end = matches!(slot, Slot::EndOfDirectory);
                if let Some(result) = visit(location, slot) {
                    return Ok(Some(result));
                }
                if end {
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn find_in_dir(
        &mut self,
        dir: DirStart,
        name: &ShortName,
    ) -> Result<Option<DirEntry>, FatError<BD::Error>> {
        self.scan_dir(dir, |_, slot| match slot {
            Slot::Used(entry) if entry.name.matches(name) => Some(entry),
            _ => None,
        })
    }

    /// Every entry apart from `.` and `..`.
    pub(crate) fn read_dir(&mut self, dir: DirStart) -> Result<Vec<DirEntry>, FatError<BD::Error>> {
        let mut entries = Vec::new();
        self.scan_dir(dir, |_, slot| {
            if let Slot::Used(entry) = slot {
                if !entry.name.is_dot_entry() {
                    entries.push(entry);
                }
            }
            None::<()>
        })?;
        Ok(entries)
    }

    pub(crate) fn dir_is_empty(&mut self, dir: DirStart) -> Result<bool, FatError<BD::Error>> {
        let found = self.scan_dir(dir, |_, slot| match slot {
            Slot::Used(entry) if !entry.name.is_dot_entry() => Some(()),
            _ => None,
        })?;
        Ok(found.is_none())
    }

    /// Find a free slot, growing the directory by a cluster if it is full.
    pub(crate) fn free_slot(&mut self, dir: DirStart) -> Result<EntryLocation, FatError<BD::Error>> {
        let free = self.scan_dir(dir, |location, slot| match slot {
            Slot::Deleted | Slot::EndOfDirectory => Some(location),
            _ => None,
        })?;
        if let Some(location) = free {
            return Ok(location);
        }
        match dir {
            DirStart::RootRegion => Err(FatError::DirectoryFull),
            DirStart::Cluster(first) => {
                let last = self.last_cluster(first)?;
                let new_cluster = self.allocate_cluster(Some(last), true)?;
                Ok(EntryLocation {
                    block: self.cluster_start(new_cluster)?,
                    offset: 0,
                })
            }
        }
    }

    pub(crate) fn write_entry(&mut self, entry: &DirEntry) -> Result<(), FatError<BD::Error>> {
        let raw = entry.encode();
        let offset = entry.location.offset;
        self.modify_sector(entry.location.block, |block| {
            block[offset..offset + DirEntryRaw::LEN].copy_from_slice(&raw);
        })
    }

    pub(crate) fn mark_deleted(&mut self, location: EntryLocation) -> Result<(), FatError<BD::Error>> {
        self.modify_sector(location.block, |block| {
            block[location.offset] = DirEntryRaw::DELETED;
        })
    }

    /// Build a new entry in `dir`. The caller writes it once the contents
    /// are in place.
    pub(crate) fn new_entry(
        &mut self,
        dir: DirStart,
        name: ShortName,
        attributes: Attributes,
    ) -> Result<DirEntry, FatError<BD::Error>> {
        let location = self.free_slot(dir)?;
        Ok(DirEntry {
            name,
            attributes,
            file_size: 0,
            first_cluster: None,
            modified: self.time_source.get_timestamp(),
            location,
        })
    }
}

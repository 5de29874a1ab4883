//! sdmmc-storage - FAT16/FAT32 volumes
//!
//! A read/write FAT volume on top of any `BlockDevice`, addressed by
//! '/'-separated paths of 8.3 names.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::convert::TryInto;

use crate::{Block, BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

pub use self::{
    bios_param_block::{BiosParameterBlock, BpbError},
    cluster::{Cluster, Entry},
    directory::{Attributes, DirEntry, DirStart, EntryLocation, ShortName},
    file::WriteMode,
    format::{format_volume, FormatOptions},
    timestamp::{FixedTime, TimeSource, Timestamp},
};

use self::cache::BlockCache;

pub mod bios_param_block;
mod cache;
pub mod cluster;
pub mod directory;
mod file;
mod format;
mod timestamp;

#[cfg(test)]
mod test;

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    // Fat12
    Fat16,
    Fat32,
}

impl FatType {
    const FAT16_MIN_CLUSTERS: u32 = 4085;
    const FAT32_MIN_CLUSTERS: u32 = 65525;
    const FAT32_MAX_CLUSTERS: u32 = 0x0FFF_FFF5;

    /// The cluster count alone decides the FAT type. `None` for FAT12.
    pub fn from_cluster_count(cluster_count: u32) -> Option<FatType> {
        if cluster_count < Self::FAT16_MIN_CLUSTERS {
            None
        } else if cluster_count < Self::FAT32_MIN_CLUSTERS {
            Some(FatType::Fat16)
        } else {
            Some(FatType::Fat32)
        }
    }

    fn entry_bytes(&self) -> u32 {
        match self {
            FatType::Fat16 => 2,
            FatType::Fat32 => 4,
        }
    }
}

pub enum FatError<E> {
    DeviceError(E),
    Bpb(BpbError),
    NotFound,
    AlreadyExists,
    NotEmpty,
    NotADirectory,
    IsADirectory,
    NoSpace,
    DirectoryFull,
    InvalidName,
    RootDirectory,
    FileTooLarge,
    /// A cluster chain points somewhere it shouldn't
    Corrupted,
    /// The device is too small (or too big) for the requested FAT type
    UnsupportedGeometry,
}

impl<E> From<BpbError> for FatError<E> {
    fn from(e: BpbError) -> Self {
        Self::Bpb(e)
    }
}

impl<E> core::fmt::Debug for FatError<E>
where
    E: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DeviceError(arg0) => f.debug_tuple("DeviceError").field(arg0).finish(),
            Self::Bpb(arg0) => f.debug_tuple("Bpb").field(arg0).finish(),
            Self::NotFound => write!(f, "NotFound"),
            Self::AlreadyExists => write!(f, "AlreadyExists"),
            Self::NotEmpty => write!(f, "NotEmpty"),
            Self::NotADirectory => write!(f, "NotADirectory"),
            Self::IsADirectory => write!(f, "IsADirectory"),
            Self::NoSpace => write!(f, "NoSpace"),
            Self::DirectoryFull => write!(f, "DirectoryFull"),
            Self::InvalidName => write!(f, "InvalidName"),
            Self::RootDirectory => write!(f, "RootDirectory"),
            Self::FileTooLarge => write!(f, "FileTooLarge"),
            Self::Corrupted => write!(f, "Corrupted"),
            Self::UnsupportedGeometry => write!(f, "UnsupportedGeometry"),
        }
    }
}

/// What a path resolved to.
#[derive(Debug, Clone)]
pub enum Node {
    Root,
    Entry(DirEntry),
}

impl Node {
    pub fn is_dir(&self) -> bool {
        match self {
            Node::Root => true,
            Node::Entry(entry) => entry.is_dir(),
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            Node::Root => 0,
            Node::Entry(entry) if entry.is_dir() => 0,
            Node::Entry(entry) => entry.file_size(),
        }
    }
}

pub struct FatVolume<BD>
where
    BD: BlockDevice,
{
    bpb: BiosParameterBlock,
    block_device: BD,
    cache: BlockCache,
    next_free: Cluster,
    free_count: Option<u32>,
    time_source: Box<dyn TimeSource>,
}

impl<BD> core::fmt::Debug for FatVolume<BD>
where
    BD: BlockDevice,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FatVolume")
            .field("bpb", &self.bpb)
            .field("free_count", &self.free_count)
            .finish()
    }
}

impl<BD> FatVolume<BD>
where
    BD: BlockDevice,
{
    /// Mount the volume whose boot sector is block 0 of `block_device`. On
    /// failure the device is handed back.
    pub fn new(mut block_device: BD) -> Result<Self, (FatError<BD::Error>, BD)> {
        let bpb_block = match block_device.read_block(BlockIdx(0), "read_bpb") {
            Ok(block) => block,
            Err(e) => return Err((FatError::DeviceError(e), block_device)),
        };

        let bpb = match BiosParameterBlock::new(bpb_block) {
            Ok(bpb) => bpb,
            Err(e) => return Err((e.into(), block_device)),
        };
        debug!(
            "Mounted {:?} volume, {} clusters of {} bytes",
            bpb.fat_type(),
            bpb.cluster_count(),
            bpb.bytes_per_cluster()
        );

        Ok(Self {
            bpb,
            block_device,
            cache: BlockCache::new(),
            next_free: Cluster::FIRST_DATA,
            free_count: None,
            time_source: Box::new(FixedTime(Timestamp::EPOCH)),
        })
    }

    /// Stamp modified files with times from `time_source`.
    pub fn set_time_source(&mut self, time_source: Box<dyn TimeSource>) {
        self.time_source = time_source;
    }

    pub fn release(self) -> BD {
        self.block_device
    }

    pub fn device(&mut self) -> &mut BD {
        &mut self.block_device
    }

    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    pub fn fat_type(&self) -> FatType {
        self.bpb.fat_type()
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bpb.bytes_per_cluster()
    }

    /// Space available for file data.
    pub fn total_bytes(&self) -> u64 {
        u64::from(self.bpb.cluster_count()) * u64::from(self.bytes_per_cluster())
    }

    /// Unallocated space. The FAT is scanned once; afterwards the count is
    /// kept up to date as clusters come and go.
    pub fn free_bytes(&mut self) -> Result<u64, FatError<BD::Error>> {
        let free_clusters = match self.free_count {
            Some(count) => count,
            None => {
                let count = self.count_free_clusters()?;
                self.free_count = Some(count);
                count
            }
        };
        Ok(u64::from(free_clusters) * u64::from(self.bytes_per_cluster()))
    }

    // ------------------------------------------------------------------
    // Sectors

    pub(crate) fn read_sector(&mut self, block_idx: BlockIdx) -> Result<&Block, FatError<BD::Error>> {
        self.cache
            .read(&mut self.block_device, block_idx)
            .map_err(FatError::DeviceError)
    }

    pub(crate) fn modify_sector<F, R>(&mut self, block_idx: BlockIdx, f: F) -> Result<R, FatError<BD::Error>>
    where
        F: FnOnce(&mut Block) -> R,
    {
        self.cache
            .modify(&mut self.block_device, block_idx, f)
            .map_err(FatError::DeviceError)
    }

    pub(crate) fn write_sector(&mut self, block: &Block, block_idx: BlockIdx) -> Result<(), FatError<BD::Error>> {
        self.cache
            .write(&mut self.block_device, block, block_idx)
            .map_err(FatError::DeviceError)
    }

    pub(crate) fn cluster_start(&self, cluster: Cluster) -> Result<BlockIdx, FatError<BD::Error>> {
        if cluster.0 < Cluster::FIRST_DATA.0 || cluster.0 > self.bpb.maximum_valid_cluster() {
            return Err(FatError::Corrupted);
        }
        let offset = (cluster.0 - Cluster::FIRST_DATA.0) * self.bpb.sectors_per_cluster();
        Ok(BlockIdx(self.bpb.first_data_sector() + offset))
    }

    // ------------------------------------------------------------------
    // The allocation table

    fn fat_entry_position(&self, cluster: Cluster) -> (BlockIdx, usize) {
        let fat_offset = cluster.0 * self.fat_type().entry_bytes();
        let sector = u32::from(self.bpb.reserved_sector_count().get()) + fat_offset / Block::LEN_U32;
        (BlockIdx(sector), (fat_offset % Block::LEN_U32) as usize)
    }

    /// Read an entry from the first FAT.
    pub(crate) fn fat_entry(&mut self, cluster: Cluster) -> Result<Entry, FatError<BD::Error>> {
        let fat_type = self.fat_type();
        let (sector, offset) = self.fat_entry_position(cluster);
        let block = self.read_sector(sector)?;
        let value = match fat_type {
            FatType::Fat16 => u32::from(u16::from_le_bytes(
                block[offset..offset + 2].try_into().expect("Infallible"),
            )),
            FatType::Fat32 => u32::from_le_bytes(block[offset..offset + 4].try_into().expect("Infallible")),
        };
        Ok(Entry::decode(value, fat_type))
    }

    /// Write an entry to every copy of the FAT.
    pub(crate) fn set_fat_entry(&mut self, cluster: Cluster, entry: Entry) -> Result<(), FatError<BD::Error>> {
        let fat_type = self.fat_type();
        let value = entry.encode(fat_type);
        let (sector, offset) = self.fat_entry_position(cluster);
        for fat in 0..self.bpb.num_fats() {
            let fat_sector = sector + BlockCount(fat * self.bpb.fat_size());
            self.modify_sector(fat_sector, |block| match fat_type {
                FatType::Fat16 => {
                    block[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes());
                }
                FatType::Fat32 => {
                    let old = u32::from_le_bytes(block[offset..offset + 4].try_into().expect("Infallible"));
                    let new = (old & 0xF000_0000) | (value & 0x0FFF_FFFF);
                    block[offset..offset + 4].copy_from_slice(&new.to_le_bytes());
                }
            })?;
        }
        Ok(())
    }

    /// The cluster after `cluster` in its chain, or `None` at the end.
    pub(crate) fn next_cluster(&mut self, cluster: Cluster) -> Result<Option<Cluster>, FatError<BD::Error>> {
        match self.fat_entry(cluster)? {
            Entry::Next(next) if next.0 <= self.bpb.maximum_valid_cluster() => Ok(Some(next)),
            Entry::EndOfChain => Ok(None),
            entry => {
                warn!("Broken chain at cluster {}: {:?}", cluster.0, entry);
                Err(FatError::Corrupted)
            }
        }
    }

    pub(crate) fn last_cluster(&mut self, first: Cluster) -> Result<Cluster, FatError<BD::Error>> {
        let mut cluster = first;
        let mut remaining = self.bpb.cluster_count();
        while let Some(next) = self.next_cluster(cluster)? {
            cluster = next;
            remaining = remaining.checked_sub(1).ok_or(FatError::Corrupted)?;
        }
        Ok(cluster)
    }

    /// Claim a free cluster, marking it as the end of a chain and linking it
    /// to `previous`. Directory clusters are zeroed.
    pub(crate) fn allocate_cluster(
        &mut self,
        previous: Option<Cluster>,
        zero: bool,
    ) -> Result<Cluster, FatError<BD::Error>> {
        let first = Cluster::FIRST_DATA.0;
        let last = self.bpb.maximum_valid_cluster();
        let start = if self.next_free.0 >= first && self.next_free.0 <= last {
            self.next_free.0
        } else {
            first
        };

        let mut candidate = start;
        let found = loop {
            if self.fat_entry(Cluster(candidate))? == Entry::Free {
                break Cluster(candidate);
            }
            candidate = if candidate == last { first } else { candidate + 1 };
            if candidate == start {
                return Err(FatError::NoSpace);
            }
        };

        self.set_fat_entry(found, Entry::EndOfChain)?;
        if let Some(previous) = previous {
            self.set_fat_entry(previous, Entry::Next(found))?;
        }
        if zero {
            let start = self.cluster_start(found)?;
            let empty = Block::new();
            for block_idx in start.range(BlockCount(self.bpb.sectors_per_cluster())) {
                self.write_sector(&empty, block_idx)?;
            }
        }

        trace!("Allocated cluster {}", found.0);
        self.next_free = Cluster(found.0 + 1);
        if let Some(count) = self.free_count.as_mut() {
            *count = count.saturating_sub(1);
        }
        Ok(found)
    }

    /// Release a whole chain.
    pub(crate) fn free_chain(&mut self, first: Cluster) -> Result<(), FatError<BD::Error>> {
        let mut cluster = Some(first);
        let mut remaining = self.bpb.cluster_count();
        while let Some(current) = cluster {
            cluster = self.next_cluster(current)?;
            self.set_fat_entry(current, Entry::Free)?;
            if let Some(count) = self.free_count.as_mut() {
                *count += 1;
            }
            if current < self.next_free {
                self.next_free = current;
            }
            remaining = remaining.checked_sub(1).ok_or(FatError::Corrupted)?;
        }
        Ok(())
    }

    /// Cut a chain down to `keep` clusters. Keeping zero clusters frees the
    /// whole chain.
    pub(crate) fn truncate_chain(&mut self, first: Cluster, keep: u32) -> Result<(), FatError<BD::Error>> {
        if keep == 0 {
            return self.free_chain(first);
        }
        let mut cluster = first;
        for _ in 1..keep {
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(()),
            }
        }
        if let Some(rest) = self.next_cluster(cluster)? {
            self.set_fat_entry(cluster, Entry::EndOfChain)?;
            self.free_chain(rest)?;
        }
        Ok(())
    }

    fn count_free_clusters(&mut self) -> Result<u32, FatError<BD::Error>> {
        let fat_type = self.fat_type();
        let entry_bytes = fat_type.entry_bytes() as usize;
        let last = self.bpb.maximum_valid_cluster();
        let entries_per_sector = Block::LEN_U32 / fat_type.entry_bytes();
        let fat_start = BlockIdx(u32::from(self.bpb.reserved_sector_count().get()));
        let sectors = (last + 1 + entries_per_sector - 1) / entries_per_sector;

        let mut free = 0;
        for sector in 0..sectors {
            let block = self.read_sector(fat_start + BlockCount(sector))?;
            for (idx, raw) in block.chunks(entry_bytes).enumerate() {
                let cluster = sector * entries_per_sector + idx as u32;
                if cluster < Cluster::FIRST_DATA.0 || cluster > last {
                    continue;
                }
                let value = match fat_type {
                    FatType::Fat16 => u32::from(u16::from_le_bytes([raw[0], raw[1]])),
                    FatType::Fat32 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                };
                if Entry::decode(value, fat_type) == Entry::Free {
                    free += 1;
                }
            }
        }
        debug!("{} free clusters", free);
        Ok(free)
    }

    // ------------------------------------------------------------------
    // Paths

    fn components(path: &str) -> impl Iterator<Item = &str> {
        path.split('/').filter(|c| !c.is_empty())
    }

    fn parse_name(name: &str) -> Result<ShortName, FatError<BD::Error>> {
        ShortName::parse(name).ok_or(FatError::InvalidName)
    }

    /// Resolve an absolute path.
    pub fn stat(&mut self, path: &str) -> Result<Node, FatError<BD::Error>> {
        let mut node = Node::Root;
        for component in Self::components(path) {
            let dir = match &node {
                Node::Root => self.root_dir(),
                Node::Entry(entry) if entry.is_dir() => self.dir_start(entry.first_cluster()),
                Node::Entry(_) => return Err(FatError::NotADirectory),
            };
            let name = Self::parse_name(component)?;
            node = match self.find_in_dir(dir, &name)? {
                Some(entry) => Node::Entry(entry),
                None => return Err(FatError::NotFound),
            };
        }
        Ok(node)
    }

    /// Resolve the directory holding `path` and the name within it.
    pub(crate) fn parent_of(&mut self, path: &str) -> Result<(DirStart, ShortName), FatError<BD::Error>> {
        let components: Vec<&str> = Self::components(path).collect();
        let (name, parents) = components.split_last().ok_or(FatError::RootDirectory)?;
        let mut dir = self.root_dir();
        for component in parents {
            let component_name = Self::parse_name(component)?;
            match self.find_in_dir(dir, &component_name)? {
                Some(entry) if entry.is_dir() => dir = self.dir_start(entry.first_cluster()),
                Some(_) => return Err(FatError::NotADirectory),
                None => return Err(FatError::NotFound),
            }
        }
        Ok((dir, Self::parse_name(name)?))
    }

    /// The entries of a directory, without `.` and `..`.
    pub fn list(&mut self, path: &str) -> Result<Vec<DirEntry>, FatError<BD::Error>> {
        let dir = match self.stat(path)? {
            Node::Root => self.root_dir(),
            Node::Entry(entry) if entry.is_dir() => self.dir_start(entry.first_cluster()),
            Node::Entry(_) => return Err(FatError::NotADirectory),
        };
        self.read_dir(dir)
    }

    /// Create one directory. Its parent must already exist.
    pub fn create_dir(&mut self, path: &str) -> Result<(), FatError<BD::Error>> {
        let (parent, name) = self.parent_of(path)?;
        if self.find_in_dir(parent, &name)?.is_some() {
            return Err(FatError::AlreadyExists);
        }
        let mut entry = self.new_entry(parent, name, Attributes::DIRECTORY)?;
        let cluster = self.allocate_cluster(None, true)?;
        entry.first_cluster = Some(cluster);

        let parent_cluster = match parent {
            DirStart::Cluster(c) if parent != self.root_dir() => Some(c),
            _ => None,
        };
        let result = self.write_dot_entries(&entry, parent_cluster).and_then(|_| self.write_entry(&entry));
        if result.is_err() {
            warn!("Failed to create {}, releasing cluster {}", path, cluster.0);
            self.free_chain(cluster).ok();
        }
        result
    }

    fn write_dot_entries(&mut self, entry: &DirEntry, parent: Option<Cluster>) -> Result<(), FatError<BD::Error>> {
        let block_idx = match entry.first_cluster {
            Some(cluster) => self.cluster_start(cluster)?,
            None => return Err(FatError::Corrupted),
        };
        let dot = DirEntry {
            name: ShortName::DOT,
            location: EntryLocation {
                block: block_idx,
                offset: 0,
            },
            ..entry.clone()
        };
        let dot_dot = DirEntry {
            name: ShortName::DOT_DOT,
            first_cluster: parent,
            location: EntryLocation {
                block: block_idx,
                offset: directory::DirEntryRaw::LEN,
            },
            ..entry.clone()
        };
        self.write_entry(&dot)?;
        self.write_entry(&dot_dot)
    }

    /// Remove an empty directory.
    pub fn remove_dir(&mut self, path: &str) -> Result<(), FatError<BD::Error>> {
        let entry = match self.stat(path)? {
            Node::Root => return Err(FatError::RootDirectory),
            Node::Entry(entry) if !entry.is_dir() => return Err(FatError::NotADirectory),
            Node::Entry(entry) => entry,
        };
        let dir = self.dir_start(entry.first_cluster());
        if !self.dir_is_empty(dir)? {
            return Err(FatError::NotEmpty);
        }
        self.mark_deleted(entry.location())?;
        if let Some(cluster) = entry.first_cluster() {
            self.free_chain(cluster)?;
        }
        Ok(())
    }

    /// Remove a file.
    pub fn delete_file(&mut self, path: &str) -> Result<(), FatError<BD::Error>> {
        let entry = match self.stat(path)? {
            Node::Root => return Err(FatError::IsADirectory),
            Node::Entry(entry) if entry.is_dir() => return Err(FatError::IsADirectory),
            Node::Entry(entry) => entry,
        };
        self.mark_deleted(entry.location())?;
        if let Some(cluster) = entry.first_cluster() {
            self.free_chain(cluster)?;
        }
        Ok(())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

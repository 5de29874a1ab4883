//! Laying down a fresh FAT16 or FAT32 file system
//!
//! The volume starts at block 0 of the device (no partition table) and has
//! two FATs. FAT32 volumes get an FSInfo sector and a backup boot sector.

use crate::{Block, BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::info;

#[cfg(feature = "defmt-log")]
use defmt::info;

use super::{
    bios_param_block::{BiosParameterBlock, BiosParameterBlockRaw},
    cluster::Entry,
    FatError, FatType,
};

/// Choices made when formatting.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// `None` picks FAT32 for volumes over 512 MiB, FAT16 otherwise.
    pub fat_type: Option<FatType>,
    /// Preferred cluster size in bytes. Smaller clusters are used when the
    /// volume would otherwise have too few clusters for its FAT type.
    pub allocation_unit: u32,
    pub volume_id: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            fat_type: None,
            allocation_unit: 16 * 1024,
            volume_id: 0x5344_4D43,
        }
    }
}

const NUM_FATS: u32 = 2;
const FAT16_RESERVED_SECTORS: u32 = 1;
const FAT16_ROOT_ENTRIES: u32 = 512;
const FAT32_RESERVED_SECTORS: u32 = 32;
const FAT32_ROOT_CLUSTER: u32 = 2;
const FS_INFO_SECTOR: u32 = 1;
const BACKUP_BOOT_SECTOR: u32 = 6;
const AUTO_FAT32_THRESHOLD: u32 = 1_048_576;
const MEDIA_FIXED: u8 = 0xF8;

/// The computed shape of a new volume.
#[derive(Debug, Clone, Copy)]
struct Layout {
    fat_type: FatType,
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    root_entries: u32,
    fat_size: u32,
    total_sectors: u32,
}

impl Layout {
    fn plan(fat_type: FatType, total_sectors: u32, sectors_per_cluster: u32) -> Option<Layout> {
        let (reserved_sectors, root_entries) = match fat_type {
            FatType::Fat16 => (FAT16_RESERVED_SECTORS, FAT16_ROOT_ENTRIES),
            FatType::Fat32 => (FAT32_RESERVED_SECTORS, 0),
        };
        let root_dir_sectors = BiosParameterBlock::compute_root_dir_sectors(root_entries);

        // Over-estimates the FAT slightly, which is harmless
        let available = total_sectors.checked_sub(reserved_sectors + root_dir_sectors)?;
        let mut divisor = 256 * sectors_per_cluster + NUM_FATS;
        if fat_type == FatType::Fat32 {
            divisor /= 2;
        }
        let fat_size = (available + divisor - 1) / divisor;

        let layout = Layout {
            fat_type,
            sectors_per_cluster,
            reserved_sectors,
            root_entries,
            fat_size,
            total_sectors,
        };
        let clusters = layout.cluster_count()?;
        let entries_per_sector = Block::LEN_U32 / fat_type.entry_bytes();
        if FatType::from_cluster_count(clusters) == Some(fat_type)
            && clusters < FatType::FAT32_MAX_CLUSTERS
            && u64::from(fat_size) * u64::from(entries_per_sector) >= u64::from(clusters) + 2
        {
            Some(layout)
        } else {
            None
        }
    }

    fn root_dir_sectors(&self) -> u32 {
        BiosParameterBlock::compute_root_dir_sectors(self.root_entries)
    }

    fn first_fat(&self) -> BlockIdx {
        BlockIdx(self.reserved_sectors)
    }

    fn first_root_dir_sector(&self) -> BlockIdx {
        BlockIdx(self.reserved_sectors + NUM_FATS * self.fat_size)
    }

    fn first_data_sector(&self) -> BlockIdx {
        self.first_root_dir_sector() + BlockCount(self.root_dir_sectors())
    }

    fn cluster_count(&self) -> Option<u32> {
        let data = self
            .total_sectors
            .checked_sub(self.first_data_sector().0)?;
        Some(data / self.sectors_per_cluster)
    }

    fn boot_sector(&self, volume_id: u32) -> Block {
        let mut raw = BiosParameterBlockRaw::default();
        let fat32 = self.fat_type == FatType::Fat32;

        raw.set_bytes(0, if fat32 { b"\xEB\x58\x90" } else { b"\xEB\x3C\x90" });
        raw.set_bytes(3, b"MSWIN4.1");
        raw.set_bytes_per_sec(Block::LEN as u16);
        raw.set_sec_per_clu(self.sectors_per_cluster as u8);
        raw.set_rsvd_sec_cnt(self.reserved_sectors as u16);
        raw.set_num_fats(NUM_FATS as u8);
        raw.set_root_entr_cnt(self.root_entries as u16);
        raw.set_media(MEDIA_FIXED);
        raw.set_sectors_per_track(63);
        raw.set_number_of_heads(255);
        raw.set_hidden_sectors(0);
        if !fat32 && self.total_sectors < 0x1_0000 {
            raw.set_tot_sec_16(self.total_sectors as u16);
        } else {
            raw.set_tot_sec_32(self.total_sectors);
        }

        let extended = if fat32 {
            raw.set_fat_sz_32(self.fat_size);
            raw.set_ext_flags(0);
            raw.set_fs_ver(0);
            raw.set_root_clus(FAT32_ROOT_CLUSTER);
            raw.set_fs_info(FS_INFO_SECTOR as u16);
            raw.set_bk_boot_sec(BACKUP_BOOT_SECTOR as u16);
            64
        } else {
            raw.set_fat_sz_16(self.fat_size as u16);
            36
        };
        // Drive number, boot signature, serial, label, type string
        raw.set_bytes(extended, &[0x80, 0x00, 0x29]);
        raw.set_bytes(extended + 3, &volume_id.to_le_bytes());
        raw.set_bytes(extended + 7, b"NO NAME    ");
        raw.set_bytes(extended + 18, if fat32 { b"FAT32   " } else { b"FAT16   " });
        raw.set_signature(BiosParameterBlock::SIGNATURE);
        raw.into_block()
    }

    fn fs_info_sector(&self) -> Block {
        let mut block = Block::new();
        let free = self.cluster_count().unwrap_or(0).saturating_sub(1);
        block[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
        block[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
        block[488..492].copy_from_slice(&free.to_le_bytes());
        block[492..496].copy_from_slice(&(FAT32_ROOT_CLUSTER + 1).to_le_bytes());
        block[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
        block
    }

    /// The first FAT sector: the two reserved entries, plus the root
    /// directory's cluster on FAT32.
    fn first_fat_sector(&self) -> Block {
        let mut block = Block::new();
        match self.fat_type {
            FatType::Fat16 => {
                block[0..2].copy_from_slice(&(0xFF00 | u16::from(MEDIA_FIXED)).to_le_bytes());
                block[2..4].copy_from_slice(&0xFFFFu16.to_le_bytes());
            }
            FatType::Fat32 => {
                let eoc = Entry::EndOfChain.encode(FatType::Fat32);
                block[0..4].copy_from_slice(&(0x0FFF_FF00 | u32::from(MEDIA_FIXED)).to_le_bytes());
                block[4..8].copy_from_slice(&eoc.to_le_bytes());
                block[8..12].copy_from_slice(&eoc.to_le_bytes());
            }
        }
        block
    }
}

fn choose_layout(
    fat_type: FatType,
    total_sectors: u32,
    allocation_unit: u32,
) -> Option<Layout> {
    const CANDIDATES: [u32; 8] = [1, 2, 4, 8, 16, 32, 64, 128];
    let preferred = (allocation_unit / Block::LEN_U32).max(1);
    // Largest cluster up to the preferred size, then anything bigger.
    CANDIDATES
        .iter()
        .rev()
        .filter(|&&spc| spc <= preferred)
        .chain(CANDIDATES.iter().filter(|&&spc| spc > preferred))
        .find_map(|&spc| Layout::plan(fat_type, total_sectors, spc))
}

/// Write an empty FAT file system over the whole of `block_device`.
pub fn format_volume<BD>(
    block_device: &mut BD,
    options: &FormatOptions,
) -> Result<FatType, FatError<BD::Error>>
where
    BD: BlockDevice,
{
    let total_sectors = block_device.num_blocks().map_err(FatError::DeviceError)?.0;
    let fat_type = options.fat_type.unwrap_or(if total_sectors > AUTO_FAT32_THRESHOLD {
        FatType::Fat32
    } else {
        FatType::Fat16
    });
    let layout = choose_layout(fat_type, total_sectors, options.allocation_unit)
        .ok_or(FatError::UnsupportedGeometry)?;
    info!(
        "Formatting {} sectors as {:?}, {} sectors per cluster",
        total_sectors, layout.fat_type, layout.sectors_per_cluster
    );

    let write = |bd: &mut BD, block: &Block, idx: BlockIdx| {
        bd.write_block(block, idx).map_err(FatError::DeviceError)
    };
    let empty = Block::new();

    for idx in BlockIdx(0).range(BlockCount(layout.reserved_sectors)) {
        write(block_device, &empty, idx)?;
    }
    let boot = layout.boot_sector(options.volume_id);
    write(block_device, &boot, BlockIdx(0))?;
    if layout.fat_type == FatType::Fat32 {
        let fs_info = layout.fs_info_sector();
        write(block_device, &fs_info, BlockIdx(FS_INFO_SECTOR))?;
        write(block_device, &boot, BlockIdx(BACKUP_BOOT_SECTOR))?;
        write(block_device, &fs_info, BlockIdx(BACKUP_BOOT_SECTOR + FS_INFO_SECTOR))?;
    }

    let first_fat_sector = layout.first_fat_sector();
    for fat in 0..NUM_FATS {
        let start = layout.first_fat() + BlockCount(fat * layout.fat_size);
        write(block_device, &first_fat_sector, start)?;
        for idx in (start + BlockCount(1)).range(BlockCount(layout.fat_size - 1)) {
            write(block_device, &empty, idx)?;
        }
    }

    // The root directory: a fixed region on FAT16, cluster 2 on FAT32
    let root_sectors = match layout.fat_type {
        FatType::Fat16 => layout.root_dir_sectors(),
        FatType::Fat32 => layout.sectors_per_cluster,
    };
    let root_start = match layout.fat_type {
        FatType::Fat16 => layout.first_root_dir_sector(),
        FatType::Fat32 => layout.first_data_sector(),
    };
    for idx in root_start.range(BlockCount(root_sectors)) {
        write(block_device, &empty, idx)?;
    }

    Ok(layout.fat_type)
}

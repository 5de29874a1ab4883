use core::num::{NonZeroU16, NonZeroU32, NonZeroU8};

use crate::Block;

use super::FatType;

#[derive(Debug, Clone)]
pub struct BiosParameterBlock {
    fat_type: FatType,
    fat_size: u32,
    reserved_sector_count: NonZeroU16,
    sectors_per_cluster: NonZeroU8,
    media: NonZeroU8,
    raw: BiosParameterBlockRaw,
    root_entry_count: u16,
    total_sector_count: NonZeroU32,
    cluster_count: u32,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpbError {
    Fat12NotSupported,
    Fat32Field(&'static str),
    InvalidMedia(u8),
    BothSectorCountsZero,
    BothSectorCountsNotZero,
    RootEntryCountSize,
    Fat32(Fat32BpbError),
    InvalidBytesPerSector(u16),
    InvalidSectorsPerCluster(u8),
    ReservedSectorCountZero,
    NoFats,
    /// The FATs and the root directory don't fit in the volume.
    InconsistentLayout,
    InvalidSignature([u8; 2]),
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fat32BpbError {
    Count16NotZero,
    FatSize16NotZero,
    RootEntryCountNotZero,
    FsVerNotZero,
    RootClusterLessThanTwo,
    InvalidBackupBootSector(u16),
}

/// The BPB_Reserved and BS_* fields are not verified.
impl BiosParameterBlock {
    pub const SIGNATURE: [u8; 2] = [0x55, 0xAA];

    pub fn new(block: Block) -> Result<Self, BpbError> {
        let raw = BiosParameterBlockRaw { block };

        let reserved_sector_count =
            NonZeroU16::new(raw.rsvd_sec_cnt()).ok_or(BpbError::ReservedSectorCountZero)?;

        Self::bytes_per_sector_checked(raw.bytes_per_sec())?;

        if raw.num_fats() == 0 {
            return Err(BpbError::NoFats);
        }

        let size_16 = raw.fat_sz_16();
        let size_32 = raw.fat_sz_32();

        let fat_size = if size_16 == 0 {
            size_32
        } else {
            size_16 as u32
        };

        let sectors_per_cluster = Self::sectors_per_cluster_checked(raw.sec_per_clu())?;

        let media = Self::media_checked(raw.media())?;

        let root_entry_count = raw.root_entr_cnt();

        let total_sector_count = Self::total_sector_count_checked(&raw)?;

        let root_dir_sectors = Self::compute_root_dir_sectors(root_entry_count as u32);
        let data_sectors = Self::compute_data_sectors(
            fat_size,
            total_sector_count.get(),
            reserved_sector_count.get() as u32,
            raw.num_fats() as u32,
            root_dir_sectors,
        )
        .ok_or(BpbError::InconsistentLayout)?;
        let cluster_count = data_sectors / u32::from(sectors_per_cluster.get());

        let mut me = Self {
            // Assume we have FAT16, to be overwritten later
            fat_type: FatType::Fat16,
            fat_size,
            reserved_sector_count,
            sectors_per_cluster,
            media,
            raw,
            root_entry_count,
            total_sector_count,
            cluster_count,
        };

        me.fat_type = me.compute_fat_type()?;

        let verification_error = me
            .verify_signature()
            .or_else(|| me.verify_root_entry_count())
            .or_else(|| me.verify_total_sector_count())
            .or_else(|| me.verify_fat_size())
            .or_else(|| me.verify_root_cluster());

        if let Some(err) = verification_error {
            Err(err)
        } else {
            Ok(me)
        }
    }

    pub fn raw(&self) -> &BiosParameterBlockRaw {
        &self.raw
    }

    pub fn reserved_sector_count(&self) -> NonZeroU16 {
        self.reserved_sector_count
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        u32::from(self.sectors_per_cluster.get())
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.sectors_per_cluster() * Block::LEN_U32
    }

    pub fn num_fats(&self) -> u32 {
        u32::from(self.raw.num_fats())
    }

    /// Size of one FAT, in sectors
    pub fn fat_size(&self) -> u32 {
        self.fat_size
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn media(&self) -> NonZeroU8 {
        self.media
    }

    pub fn total_sector_count(&self) -> u32 {
        self.total_sector_count.get()
    }

    pub fn root_entry_count(&self) -> u16 {
        self.root_entry_count
    }

    pub fn compute_root_dir_sectors(root_entry_count: u32) -> u32 {
        (root_entry_count * 32 + (Block::LEN_U32 - 1)) / Block::LEN_U32
    }

    pub fn root_dir_sectors(&self) -> u32 {
        Self::compute_root_dir_sectors(u32::from(self.root_entry_count))
    }

    /// First sector of the fixed root directory region (FAT16 only).
    pub fn first_root_dir_sector(&self) -> u32 {
        u32::from(self.reserved_sector_count.get()) + self.num_fats() * self.fat_size
    }

    pub fn first_data_sector(&self) -> u32 {
        self.first_root_dir_sector() + self.root_dir_sectors()
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn maximum_valid_cluster(&self) -> u32 {
        self.cluster_count + 1
    }

    fn compute_data_sectors(
        fat_size: u32,
        total_sector_count: u32,
        reserved_sectors: u32,
        num_fats: u32,
        root_dir_sectors: u32,
    ) -> Option<u32> {
        let meta_sectors = num_fats
            .checked_mul(fat_size)?
            .checked_add(reserved_sectors)?
            .checked_add(root_dir_sectors)?;
        total_sector_count.checked_sub(meta_sectors)
    }

    fn compute_fat_type(&self) -> Result<FatType, BpbError> {
        FatType::from_cluster_count(self.cluster_count).ok_or(BpbError::Fat12NotSupported)
    }

    fn sectors_per_cluster_checked(sectors_per_cluster: u8) -> Result<NonZeroU8, BpbError> {
        match sectors_per_cluster {
            1 | 2 | 4 | 8 | 16 | 32 | 64 | 128 => NonZeroU8::new(sectors_per_cluster)
                .ok_or(BpbError::InvalidSectorsPerCluster(sectors_per_cluster)),
            _ => Err(BpbError::InvalidSectorsPerCluster(sectors_per_cluster)),
        }
    }

    fn total_sector_count_checked(raw: &BiosParameterBlockRaw) -> Result<NonZeroU32, BpbError> {
        let sec_16 = raw.tot_sec_16();
        let sec_32 = raw.tot_sec_32();
        match (sec_16, sec_32) {
            (0, 0) => Err(BpbError::BothSectorCountsZero),
            (0, sec_32) => NonZeroU32::new(sec_32).ok_or(BpbError::BothSectorCountsZero),
            (sec_16, 0) => NonZeroU32::new(u32::from(sec_16)).ok_or(BpbError::BothSectorCountsZero),
            _ => Err(BpbError::BothSectorCountsNotZero),
        }
    }

    // Cards are addressed in 512 byte blocks, so that is all we can mount.
    fn bytes_per_sector_checked(bytes_per_sec: u16) -> Result<(), BpbError> {
        match bytes_per_sec {
            512 => Ok(()),
            _ => Err(BpbError::InvalidBytesPerSector(bytes_per_sec)),
        }
    }

    fn media_checked(media: u8) -> Result<NonZeroU8, BpbError> {
        match media {
            0xF0 | 0xF8 | 0xF9 | 0xFA | 0xFB | 0xFC | 0xFD | 0xFE | 0xFF => {
                NonZeroU8::new(media).ok_or(BpbError::InvalidMedia(media))
            }
            _ => Err(BpbError::InvalidMedia(media)),
        }
    }

    fn verify_total_sector_count(&self) -> Option<BpbError> {
        match self.fat_type {
            FatType::Fat16 => None,
            FatType::Fat32 => {
                if self.raw.tot_sec_16() == 0 {
                    None
                } else {
                    Some(BpbError::Fat32(Fat32BpbError::Count16NotZero))
                }
            }
        }
    }

    fn verify_root_entry_count(&self) -> Option<BpbError> {
        let value = self.root_entry_count;
        match self.fat_type {
            FatType::Fat16 => {
                if (value as u32 * 32) % Block::LEN_U32 == 0 && value != 0 {
                    None
                } else {
                    Some(BpbError::RootEntryCountSize)
                }
            }
            FatType::Fat32 => {
                if value != 0 {
                    Some(BpbError::Fat32(Fat32BpbError::RootEntryCountNotZero))
                } else {
                    None
                }
            }
        }
    }

    fn verify_fat_size(&self) -> Option<BpbError> {
        match self.fat_type {
            FatType::Fat16 => None,
            FatType::Fat32 => {
                if self.raw.fat_sz_16() == 0 {
                    None
                } else {
                    Some(BpbError::Fat32(Fat32BpbError::FatSize16NotZero))
                }
            }
        }
    }

    fn verify_root_cluster(&self) -> Option<BpbError> {
        match self.fat_type {
            FatType::Fat16 => None,
            FatType::Fat32 => self.root_cluster().err(),
        }
    }

    // This procedure is the same for all FATs
    fn verify_signature(&self) -> Option<BpbError> {
        let signature: [u8; 2] = self.raw.signature_word();
        if signature == Self::SIGNATURE {
            None
        } else {
            Some(BpbError::InvalidSignature(signature))
        }
    }

    // All following functions are fat32 only
    fn fat32_only(&self, field_name: &'static str) -> Result<(), BpbError> {
        if self.fat_type == FatType::Fat32 {
            Ok(())
        } else {
            Err(BpbError::Fat32Field(field_name))
        }
    }

    pub fn fs_version(&self) -> Result<u16, BpbError> {
        self.fat32_only("fs_version")?;
        let value = self.raw.fs_ver();
        if value == 0 {
            Ok(value)
        } else {
            Err(BpbError::Fat32(Fat32BpbError::FsVerNotZero))
        }
    }

    pub fn root_cluster(&self) -> Result<u32, BpbError> {
        self.fat32_only("root_cluster")?;
        let value = self.raw.root_clus();
        if value >= 2 {
            Ok(value)
        } else {
            Err(BpbError::Fat32(Fat32BpbError::RootClusterLessThanTwo))
        }
    }

    pub fn fs_info(&self) -> Result<u16, BpbError> {
        self.fat32_only("fs_info")?;
        Ok(self.raw.fs_info())
    }

    pub fn bk_boot_sector(&self) -> Result<u16, BpbError> {
        self.fat32_only("bk_boot_sector")?;
        let value = self.raw.bk_boot_sec();
        if value == 0 || value == 6 {
            Ok(value)
        } else {
            Err(BpbError::Fat32(Fat32BpbError::InvalidBackupBootSector(
                value,
            )))
        }
    }
}

/// The boot sector as it sits on disk. The formatter fills one of these in.
#[derive(Debug, Clone)]
pub struct BiosParameterBlockRaw {
    block: Block,
}

impl Default for BiosParameterBlockRaw {
    fn default() -> Self {
        Self {
            block: Block::new(),
        }
    }
}

impl BiosParameterBlockRaw {
    pub fn into_block(self) -> Block {
        self.block
    }

    fn data(&self) -> &[u8] {
        &self.block.contents
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.block.contents
    }

    define_field!(bytes_per_sec, set_bytes_per_sec, u16, 11);
    define_field!(sec_per_clu, set_sec_per_clu, u8, 13);
    define_field!(rsvd_sec_cnt, set_rsvd_sec_cnt, u16, 14);
    define_field!(num_fats, set_num_fats, u8, 16);
    define_field!(root_entr_cnt, set_root_entr_cnt, u16, 17);
    define_field!(tot_sec_16, set_tot_sec_16, u16, 19);
    define_field!(media, set_media, u8, 21);
    define_field!(fat_sz_16, set_fat_sz_16, u16, 22);
    define_field!(sectors_per_track, set_sectors_per_track, u16, 24);
    define_field!(number_of_heads, set_number_of_heads, u16, 26);
    define_field!(hidden_sectors, set_hidden_sectors, u32, 28);
    define_field!(tot_sec_32, set_tot_sec_32, u32, 32);

    // FAT32 specific structure
    define_field!(fat_sz_32, set_fat_sz_32, u32, 36);
    define_field!(ext_flags, set_ext_flags, u16, 40);
    define_field!(fs_ver, set_fs_ver, u16, 42);
    define_field!(root_clus, set_root_clus, u32, 44);
    define_field!(fs_info, set_fs_info, u16, 48);
    define_field!(bk_boot_sec, set_bk_boot_sec, u16, 50);

    fn signature_word(&self) -> [u8; 2] {
        let d = self.data();
        [d[510], d[511]]
    }

    pub fn set_signature(&mut self, signature: [u8; 2]) {
        self.data_mut()[510..512].copy_from_slice(&signature);
    }

    /// Copy raw bytes in at `offset`, for the fields we never read back
    /// (jump instruction, OEM name, volume label...).
    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

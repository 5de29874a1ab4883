//! sdmmc-storage - Master Boot Record
//!
//! SD cards leave the factory with an MBR and a single FAT partition. This
//! module finds that partition and exposes it as a `BlockDevice` of its own.

use crate::{Block, BlockCount, BlockDevice, BlockIdx};
use core::{convert::TryInto, fmt::Debug};

#[derive(Debug)]
pub enum Error<BlockDeviceError>
where
    BlockDeviceError: Debug,
{
    DeviceError(BlockDeviceError),
    InvalidMbrSignature,
    InvalidPartitionStatus,
    UnsupportedPartitionType(u8),
    InfoTooShort,
}

impl<BDE> From<BDE> for Error<BDE>
where
    BDE: Debug,
{
    fn from(e: BDE) -> Self {
        Self::DeviceError(e)
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionNumber {
    One,
    Two,
    Three,
    Four,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Fat32ChsLba,
    Fat32Lba,
    Fat16Lba,
    Fat16,
    Empty,
    Unknown(u8),
}

impl PartitionType {
    /// Marker for a FAT32 partition. What Macosx disk utility (and also SD-Card formatter?)
    /// use.
    const FAT32_CHS_LBA: u8 = 0x0B;
    /// Marker for a FAT32 partition. Sometimes also use for FAT16 formatted
    /// partitions.
    const FAT32_LBA: u8 = 0x0C;
    /// Marker for a FAT16 partition with LBA. Seen on a Raspberry Pi SD card.
    const FAT16_LBA: u8 = 0x0E;
    /// Marker for a FAT16 partition. Seen on a card formatted with the official
    /// SD-Card formatter.
    const FAT16: u8 = 0x06;
    const EMPTY: u8 = 0x00;

    pub fn from_u8(value: u8) -> Self {
        match value {
            Self::FAT32_CHS_LBA => Self::Fat32ChsLba,
            Self::FAT32_LBA => Self::Fat32Lba,
            Self::FAT16_LBA => Self::Fat16Lba,
            Self::FAT16 => Self::Fat16,
            Self::EMPTY => Self::Empty,
            _ => Self::Unknown(value),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Fat32ChsLba => Self::FAT32_CHS_LBA,
            Self::Fat32Lba => Self::FAT32_LBA,
            Self::Fat16Lba => Self::FAT16_LBA,
            Self::Fat16 => Self::FAT16,
            Self::Empty => Self::EMPTY,
            Self::Unknown(value) => value,
        }
    }

    /// Can this partition hold a volume we know how to mount?
    pub fn is_fat(self) -> bool {
        matches!(
            self,
            Self::Fat32ChsLba | Self::Fat32Lba | Self::Fat16Lba | Self::Fat16
        )
    }
}

#[derive(Debug)]
pub enum PartitionError<E>
where
    E: Debug,
{
    DeviceError(E),
    OutOfRange { partition_block_count: BlockCount },
}

/// A block device which only sees the blocks of one partition. Block 0 of
/// this device is the first block of the partition.
pub struct PartitionBlockDevice<BD>
where
    BD: BlockDevice,
{
    block_device: BD,
    partition: Partition,
}

impl<BD> core::fmt::Debug for PartitionBlockDevice<BD>
where
    BD: BlockDevice,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PartitionBlockDevice")
            .field("partition", &self.partition)
            .finish()
    }
}

impl<BD> PartitionBlockDevice<BD>
where
    BD: BlockDevice,
{
    /// Treat the whole device as one partition (a "superfloppy").
    pub fn whole_device(mut block_device: BD) -> Result<Self, BD::Error> {
        let block_count = block_device.num_blocks()?;
        Ok(Self {
            block_device,
            partition: Partition {
                ty: PartitionType::Empty,
                lba_start: BlockCount(0),
                block_count,
            },
        })
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn inner_mut(&mut self) -> &mut BD {
        &mut self.block_device
    }

    pub fn release(self) -> BD {
        self.block_device
    }

    fn range_check(&self, start: u32, len: u32) -> Result<(), PartitionError<BD::Error>> {
        let last_block = u64::from(start) + u64::from(len);

        if last_block > u64::from(self.partition.block_count.0) {
            Err(PartitionError::OutOfRange {
                partition_block_count: self.partition.block_count,
            })
        } else {
            Ok(())
        }
    }
}

impl<BD> BlockDevice for PartitionBlockDevice<BD>
where
    BD: BlockDevice,
{
    type Error = PartitionError<BD::Error>;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        let blocks_to_read = blocks.len() as u32;
        self.range_check(start_block_idx.0, blocks_to_read)?;

        let part_start_block_idx = start_block_idx + self.partition.lba_start;

        self.block_device
            .read(blocks, part_start_block_idx, reason)
            .map_err(PartitionError::DeviceError)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let blocks_to_write = blocks.len() as u32;
        self.range_check(start_block_idx.0, blocks_to_write)?;

        let part_start_block_idx = start_block_idx + self.partition.lba_start;

        self.block_device
            .write(blocks, part_start_block_idx)
            .map_err(PartitionError::DeviceError)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(self.partition.block_count)
    }
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub ty: PartitionType,
    pub lba_start: BlockCount,
    pub block_count: BlockCount,
}

impl Partition {
    const STATUS_IDX: usize = 0;
    const TYPE_IDX: usize = 4;
    const LBA_START_IDX: usize = 8;
    const NUM_BLOCKS_IDX: usize = 12;
    pub(crate) const PARTITION_INFO_LENGTH: usize = 16;

    pub fn from_info<E>(info: &[u8]) -> Result<Self, Error<E>>
    where
        E: Debug,
    {
        if info.len() != Self::PARTITION_INFO_LENGTH {
            return Err(Error::InfoTooShort);
        }

        let pstatus = info[Self::STATUS_IDX];
        if pstatus != 0x80 && pstatus != 0x00 {
            return Err(Error::InvalidPartitionStatus);
        }

        let lba_start = u32::from_le_bytes(
            info[Self::LBA_START_IDX..Self::LBA_START_IDX + 4]
                .try_into()
                .expect("Infallible"),
        );

        let num_blocks = u32::from_le_bytes(
            info[Self::NUM_BLOCKS_IDX..Self::NUM_BLOCKS_IDX + 4]
                .try_into()
                .expect("Infallible"),
        );

        let partition_type = PartitionType::from_u8(info[Self::TYPE_IDX]);

        Ok(Partition {
            ty: partition_type,
            lba_start: BlockCount(lba_start),
            block_count: BlockCount(num_blocks),
        })
    }

    /// Encode this partition as a 16 byte partition table entry.
    pub fn to_info(&self) -> [u8; Self::PARTITION_INFO_LENGTH] {
        let mut info = [0u8; Self::PARTITION_INFO_LENGTH];
        info[Self::TYPE_IDX] = self.ty.to_u8();
        info[Self::LBA_START_IDX..Self::LBA_START_IDX + 4]
            .copy_from_slice(&self.lba_start.0.to_le_bytes());
        info[Self::NUM_BLOCKS_IDX..Self::NUM_BLOCKS_IDX + 4]
            .copy_from_slice(&self.block_count.0.to_le_bytes());
        info
    }

    /// Restrict `block_device` to this partition.
    pub fn with_block_device<BD>(self, block_device: BD) -> PartitionBlockDevice<BD>
    where
        BD: BlockDevice,
    {
        PartitionBlockDevice {
            block_device,
            partition: self,
        }
    }
}

pub struct Mbr;

impl Mbr {
    const FOOTER_START: usize = 510;
    const FOOTER_VALUE: u16 = 0xAA55;
    const PARTITION1_START: usize = 446;
    const PARTITION2_START: usize = Self::PARTITION1_START + Partition::PARTITION_INFO_LENGTH;
    const PARTITION3_START: usize = Self::PARTITION2_START + Partition::PARTITION_INFO_LENGTH;
    const PARTITION4_START: usize = Self::PARTITION3_START + Partition::PARTITION_INFO_LENGTH;

    fn partition_start(partition_num: PartitionNumber) -> usize {
        match partition_num {
            PartitionNumber::One => Self::PARTITION1_START,
            PartitionNumber::Two => Self::PARTITION2_START,
            PartitionNumber::Three => Self::PARTITION3_START,
            PartitionNumber::Four => Self::PARTITION4_START,
        }
    }

    pub fn read_partition<BlockDev>(
        block_dev: &mut BlockDev,
        partition_num: PartitionNumber,
    ) -> Result<Partition, Error<BlockDev::Error>>
    where
        BlockDev: BlockDevice,
    {
        let first_block = block_dev.read_block(BlockIdx(0), "read_mbr")?;

        let footer = u16::from_le_bytes(
            first_block[Self::FOOTER_START..Self::FOOTER_START + 2]
                .try_into()
                .expect("Infallible"),
        );

        if footer != Self::FOOTER_VALUE {
            return Err(Error::InvalidMbrSignature);
        }

        let pinfo_start = Self::partition_start(partition_num);
        let pinfo_data = &first_block[pinfo_start..pinfo_start + Partition::PARTITION_INFO_LENGTH];
        Partition::from_info(pinfo_data)
    }

    /// Find the first partition and check that it can hold a FAT volume.
    pub fn first_fat_partition<BlockDev>(
        block_dev: &mut BlockDev,
    ) -> Result<Partition, Error<BlockDev::Error>>
    where
        BlockDev: BlockDevice,
    {
        let partition = Self::read_partition(block_dev, PartitionNumber::One)?;
        if partition.ty.is_fat() {
            Ok(partition)
        } else {
            Err(Error::UnsupportedPartitionType(partition.ty.to_u8()))
        }
    }

    /// Write a partition table holding the given partition in slot one.
    pub fn write_single_partition<BlockDev>(
        block_dev: &mut BlockDev,
        partition: &Partition,
    ) -> Result<(), Error<BlockDev::Error>>
    where
        BlockDev: BlockDevice,
    {
        let mut block = Block::new();
        let start = Self::partition_start(PartitionNumber::One);
        block[start..start + Partition::PARTITION_INFO_LENGTH].copy_from_slice(&partition.to_info());
        block[Self::FOOTER_START..Self::FOOTER_START + 2]
            .copy_from_slice(&Self::FOOTER_VALUE.to_le_bytes());
        block_dev.write_block(&block, BlockIdx(0))?;
        Ok(())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

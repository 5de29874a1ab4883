use alloc::vec::Vec;
use core::convert::TryFrom;

use crate::{Block, BlockCount, BlockDevice};

#[cfg(feature = "log")]
use log::{trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{trace, warn};

use super::{
    cluster::Cluster,
    directory::{Attributes, DirEntry},
    FatError, FatVolume, Node,
};

/// How `FatVolume::write` treats an existing file.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the contents
    Truncate,
    /// Add to the end
    Append,
}

impl<BD> FatVolume<BD>
where
    BD: BlockDevice,
{
    fn file_entry(&mut self, path: &str) -> Result<DirEntry, FatError<BD::Error>> {
        match self.stat(path)? {
            Node::Entry(entry) if !entry.is_dir() => Ok(entry),
            _ => Err(FatError::IsADirectory),
        }
    }

    /// Read from `offset` into `buffer`. Returns how many bytes were read,
    /// which is zero at or past the end of the file.
    pub fn read_at(
        &mut self,
        path: &str,
        offset: u32,
        buffer: &mut [u8],
    ) -> Result<usize, FatError<BD::Error>> {
        let entry = self.file_entry(path)?;
        if offset >= entry.file_size {
            return Ok(0);
        }
        let len = buffer.len().min((entry.file_size - offset) as usize);
        let bytes_per_cluster = self.bytes_per_cluster();

        let mut cluster = entry.first_cluster.ok_or(FatError::Corrupted)?;
        for _ in 0..offset / bytes_per_cluster {
            cluster = self.next_cluster(cluster)?.ok_or(FatError::Corrupted)?;
        }

        let mut position = offset;
        let mut done = 0;
        while done < len {
            let in_cluster = position % bytes_per_cluster;
            if in_cluster == 0 && done > 0 {
                cluster = self.next_cluster(cluster)?.ok_or(FatError::Corrupted)?;
            }
            let sector = self.cluster_start(cluster)? + BlockCount(in_cluster / Block::LEN_U32);
            let in_sector = (position % Block::LEN_U32) as usize;
            let n = (Block::LEN - in_sector).min(len - done);
            let block = self.read_sector(sector)?;
            buffer[done..done + n].copy_from_slice(&block[in_sector..in_sector + n]);
            done += n;
            position += n as u32;
        }
        Ok(done)
    }

    /// Read a whole file.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, FatError<BD::Error>> {
        let entry = self.file_entry(path)?;
        let mut contents = Vec::new();
        contents.resize(entry.file_size as usize, 0);
        let read = self.read_at(path, 0, &mut contents)?;
        contents.truncate(read);
        Ok(contents)
    }

    /// Write `data` to a file, creating it if needed. The parent directory
    /// must exist.
    ///
    /// If the write fails part way, a truncating write removes the file and
    /// an append leaves the file as it was.
    pub fn write(
        &mut self,
        path: &str,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), FatError<BD::Error>> {
        let (parent, name) = self.parent_of(path)?;
        let (mut entry, created) = match self.find_in_dir(parent, &name)? {
            Some(entry) if entry.is_dir() => return Err(FatError::IsADirectory),
            Some(entry) => (entry, false),
            None => (self.new_entry(parent, name, Attributes::ARCHIVE)?, true),
        };

        let original_size = entry.file_size;
        let original_first = entry.first_cluster;
        let start = match mode {
            WriteMode::Truncate => 0,
            WriteMode::Append => original_size,
        };
        let new_size = u32::try_from(data.len())
            .ok()
            .and_then(|len| start.checked_add(len))
            .ok_or(FatError::FileTooLarge)?;

        if mode == WriteMode::Truncate && !created {
            entry.file_size = 0;
            entry.first_cluster = None;
            self.write_entry(&entry)?;
            if let Some(first) = original_first {
                self.free_chain(first)?;
            }
        }

        match self.write_data(&mut entry, start, data) {
            Ok(()) => {
                entry.file_size = new_size;
                entry.modified = self.time_source.get_timestamp();
                trace!("Wrote {} bytes to {}, now {} bytes", data.len(), path, new_size);
                self.write_entry(&entry)
            }
            Err(e) => {
                warn!("Write to {} failed, rolling back", path);
                if mode == WriteMode::Append && !created {
                    self.restore_chain(&entry, original_first, original_size).ok();
                } else {
                    if let Some(first) = entry.first_cluster {
                        self.free_chain(first).ok();
                    }
                    self.mark_deleted(entry.location).ok();
                }
                Err(e)
            }
        }
    }

    /// Put a chain back to how it was before an append.
    fn restore_chain(
        &mut self,
        entry: &DirEntry,
        original_first: Option<Cluster>,
        original_size: u32,
    ) -> Result<(), FatError<BD::Error>> {
        match (original_first, entry.first_cluster) {
            (Some(first), _) => {
                let bytes_per_cluster = self.bytes_per_cluster();
                let keep = ((original_size + bytes_per_cluster - 1) / bytes_per_cluster).max(1);
                self.truncate_chain(first, keep)
            }
            (None, Some(first)) => self.free_chain(first),
            (None, None) => Ok(()),
        }
    }

    fn write_data(
        &mut self,
        entry: &mut DirEntry,
        offset: u32,
        data: &[u8],
    ) -> Result<(), FatError<BD::Error>> {
        if data.is_empty() {
            return Ok(());
        }
        let bytes_per_cluster = self.bytes_per_cluster();

        let mut cluster = match entry.first_cluster {
            Some(first) => first,
            None => {
                let first = self.allocate_cluster(None, false)?;
                entry.first_cluster = Some(first);
                first
            }
        };
        for _ in 0..offset / bytes_per_cluster {
            cluster = self.next_or_allocate(cluster)?;
        }

        let mut position = offset;
        let mut written = 0;
        while written < data.len() {
            let in_cluster = position % bytes_per_cluster;
            if in_cluster == 0 && written > 0 {
                cluster = self.next_or_allocate(cluster)?;
            }
            let sector = self.cluster_start(cluster)? + BlockCount(in_cluster / Block::LEN_U32);
            let in_sector = (position % Block::LEN_U32) as usize;
            let n = (Block::LEN - in_sector).min(data.len() - written);
            let chunk = &data[written..written + n];
            if n == Block::LEN {
                let mut block = Block::new();
                block.contents.copy_from_slice(chunk);
                self.write_sector(&block, sector)?;
            } else {
                self.modify_sector(sector, |block| {
                    block[in_sector..in_sector + n].copy_from_slice(chunk);
                })?;
            }
            written += n;
            position += n as u32;
        }
        Ok(())
    }

    fn next_or_allocate(&mut self, cluster: Cluster) -> Result<Cluster, FatError<BD::Error>> {
        match self.next_cluster(cluster)? {
            Some(next) => Ok(next),
            None => self.allocate_cluster(Some(cluster), false),
        }
    }
}

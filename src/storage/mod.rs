//! sdmmc-storage - The storage facade
//!
//! One trait over everything that can hold files: a mounted `FatVolume`, or
//! an `SdCard` which may not have managed to mount one. The file server and
//! the actions only ever talk to a `Storage`.

#[cfg(feature = "refcell-storage")]
mod refcell;
mod units;

use alloc::string::String;
use alloc::vec::Vec;
use core::convert::TryFrom;

#[cfg(feature = "log")]
use log::{debug, error};

#[cfg(feature = "defmt-log")]
use defmt::debug;

use crate::fat::{FatError, FatVolume, Node, Timestamp};
use crate::path::{self, PathEscape};
use crate::BlockDevice;

pub use crate::fat::WriteMode;
pub use units::{format_size, MemoryUnit};

/// One file or directory, as reported by `stat` and listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Absolute path
    pub path: String,
    /// Zero for directories
    pub size: u64,
    pub is_directory: bool,
    pub modified: Option<Timestamp>,
}

#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The card never came up, or has been powered off
    Unavailable,
    /// Someone else is using the storage right now, such as a download in
    /// progress
    Busy,
    /// The card or the file system failed
    Io,
    NotFound,
    AlreadyExists,
    NotEmpty,
    NotADirectory,
    IsADirectory,
    NoSpace,
    InvalidName,
    PathEscape,
}

impl core::fmt::Display for StorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            StorageError::Unavailable => "storage unavailable",
            StorageError::Busy => "storage busy",
            StorageError::Io => "I/O error",
            StorageError::NotFound => "not found",
            StorageError::AlreadyExists => "already exists",
            StorageError::NotEmpty => "directory not empty",
            StorageError::NotADirectory => "not a directory",
            StorageError::IsADirectory => "is a directory",
            StorageError::NoSpace => "no space left",
            StorageError::InvalidName => "invalid name",
            StorageError::PathEscape => "path escapes root",
        };
        f.write_str(text)
    }
}

impl From<PathEscape> for StorageError {
    fn from(_: PathEscape) -> Self {
        StorageError::PathEscape
    }
}

impl<E> From<FatError<E>> for StorageError
where
    E: core::fmt::Debug,
{
    fn from(e: FatError<E>) -> Self {
        match e {
            FatError::NotFound => StorageError::NotFound,
            FatError::AlreadyExists => StorageError::AlreadyExists,
            FatError::NotEmpty => StorageError::NotEmpty,
            FatError::NotADirectory => StorageError::NotADirectory,
            FatError::IsADirectory | FatError::RootDirectory => StorageError::IsADirectory,
            FatError::NoSpace | FatError::DirectoryFull | FatError::FileTooLarge => StorageError::NoSpace,
            FatError::InvalidName => StorageError::InvalidName,
            other => {
                #[cfg(feature = "log")]
                error!("File system error: {:?}", other);
                StorageError::Io
            }
        }
    }
}

/// Files and directories on some medium. Paths are absolute and are
/// normalized by the implementation before use.
pub trait Storage {
    /// A label for diagnostics, such as `SDHC/SDXC`.
    fn card_type(&self) -> &'static str;

    fn total_space(&mut self) -> Result<u64, StorageError>;

    fn free_space(&mut self) -> Result<u64, StorageError>;

    fn used_space(&mut self) -> Result<u64, StorageError> {
        let total = self.total_space()?;
        let free = self.free_space()?;
        Ok(total.saturating_sub(free))
    }

    fn stat(&mut self, path: &str) -> Result<FileInfo, StorageError>;

    /// The size of a file. Directories have no size.
    fn file_size(&mut self, path: &str) -> Result<u64, StorageError> {
        let info = self.stat(path)?;
        if info.is_directory {
            Err(StorageError::IsADirectory)
        } else {
            Ok(info.size)
        }
    }

    fn is_directory(&mut self, path: &str) -> bool {
        self.stat(path).map(|info| info.is_directory).unwrap_or(false)
    }

    /// The entries of a directory, and of its subdirectories down to
    /// `depth` more levels.
    fn list_directory(&mut self, path: &str, depth: u8) -> Result<Vec<FileInfo>, StorageError>;

    /// Read from `offset` into `buffer`, returning the number of bytes read.
    fn read_at(&mut self, path: &str, offset: u64, buffer: &mut [u8]) -> Result<usize, StorageError>;

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, StorageError> {
        let size = self.file_size(path)?;
        let mut contents = Vec::new();
        contents.resize(usize::try_from(size).map_err(|_| StorageError::NoSpace)?, 0);
        let read = self.read_at(path, 0, &mut contents)?;
        contents.truncate(read);
        Ok(contents)
    }

    fn write_file_mode(&mut self, path: &str, data: &[u8], mode: WriteMode) -> Result<(), StorageError>;

    /// Create or replace a file.
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.write_file_mode(path, data, WriteMode::Truncate)
    }

    /// Add to the end of a file, creating it if needed.
    fn append_file(&mut self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.write_file_mode(path, data, WriteMode::Append)
    }

    /// Create a directory. The parent must already exist.
    fn create_directory(&mut self, path: &str) -> Result<(), StorageError>;

    /// Remove an empty directory.
    fn remove_directory(&mut self, path: &str) -> Result<(), StorageError>;

    fn delete_file(&mut self, path: &str) -> Result<(), StorageError>;
}

impl<S> Storage for &mut S
where
    S: Storage + ?Sized,
{
    fn card_type(&self) -> &'static str {
        (**self).card_type()
    }

    fn total_space(&mut self) -> Result<u64, StorageError> {
        (**self).total_space()
    }

    fn free_space(&mut self) -> Result<u64, StorageError> {
        (**self).free_space()
    }

    fn used_space(&mut self) -> Result<u64, StorageError> {
        (**self).used_space()
    }

    fn stat(&mut self, path: &str) -> Result<FileInfo, StorageError> {
        (**self).stat(path)
    }

    fn list_directory(&mut self, path: &str, depth: u8) -> Result<Vec<FileInfo>, StorageError> {
        (**self).list_directory(path, depth)
    }

    fn read_at(&mut self, path: &str, offset: u64, buffer: &mut [u8]) -> Result<usize, StorageError> {
        (**self).read_at(path, offset, buffer)
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, StorageError> {
        (**self).read_file(path)
    }

    fn write_file_mode(&mut self, path: &str, data: &[u8], mode: WriteMode) -> Result<(), StorageError> {
        (**self).write_file_mode(path, data, mode)
    }

    fn create_directory(&mut self, path: &str) -> Result<(), StorageError> {
        (**self).create_directory(path)
    }

    fn remove_directory(&mut self, path: &str) -> Result<(), StorageError> {
        (**self).remove_directory(path)
    }

    fn delete_file(&mut self, path: &str) -> Result<(), StorageError> {
        (**self).delete_file(path)
    }
}

fn node_info(path: String, node: &Node) -> FileInfo {
    match node {
        Node::Root => FileInfo {
            path,
            size: 0,
            is_directory: true,
            modified: None,
        },
        Node::Entry(entry) => FileInfo {
            path,
            size: u64::from(node.size()),
            is_directory: entry.is_dir(),
            modified: Some(entry.modified()),
        },
    }
}

impl<BD> FatVolume<BD>
where
    BD: BlockDevice,
{
    fn list_recursive(
        &mut self,
        dir: &str,
        depth: u8,
        list: &mut Vec<FileInfo>,
    ) -> Result<(), StorageError> {
        for entry in self.list(dir)? {
            let child = path::join(dir, &entry.name().to_string());
            let node = Node::Entry(entry);
            let info = node_info(child, &node);
            let recurse = info.is_directory && depth > 0;
            let child = info.path.clone();
            list.push(info);
            if recurse {
                self.list_recursive(&child, depth - 1, list)?;
            }
        }
        Ok(())
    }
}

impl<BD> Storage for FatVolume<BD>
where
    BD: BlockDevice,
{
    fn card_type(&self) -> &'static str {
        "UNKNOWN"
    }

    fn total_space(&mut self) -> Result<u64, StorageError> {
        Ok(self.total_bytes())
    }

    fn free_space(&mut self) -> Result<u64, StorageError> {
        Ok(self.free_bytes()?)
    }

    fn stat(&mut self, path: &str) -> Result<FileInfo, StorageError> {
        let path = path::normalize(path)?;
        let node = FatVolume::stat(self, &path)?;
        Ok(node_info(path, &node))
    }

    fn list_directory(&mut self, path: &str, depth: u8) -> Result<Vec<FileInfo>, StorageError> {
        let path = path::normalize(path)?;
        let mut list = Vec::new();
        self.list_recursive(&path, depth, &mut list)?;
        Ok(list)
    }

    fn read_at(&mut self, path: &str, offset: u64, buffer: &mut [u8]) -> Result<usize, StorageError> {
        let path = path::normalize(path)?;
        // Files can't be bigger than this anyway
        let offset = match u32::try_from(offset) {
            Ok(offset) => offset,
            Err(_) => return Ok(0),
        };
        Ok(FatVolume::read_at(self, &path, offset, buffer)?)
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, StorageError> {
        let path = path::normalize(path)?;
        Ok(FatVolume::read_file(self, &path)?)
    }

    fn write_file_mode(&mut self, path: &str, data: &[u8], mode: WriteMode) -> Result<(), StorageError> {
        let path = path::normalize(path)?;
        debug!("{:?} {} bytes to {}", mode, data.len(), path.as_str());
        Ok(self.write(&path, data, mode)?)
    }

    fn create_directory(&mut self, path: &str) -> Result<(), StorageError> {
        let path = path::normalize(path)?;
        debug!("Create directory {}", path.as_str());
        Ok(self.create_dir(&path)?)
    }

    fn remove_directory(&mut self, path: &str) -> Result<(), StorageError> {
        let path = path::normalize(path)?;
        debug!("Remove directory {}", path.as_str());
        Ok(self.remove_dir(&path)?)
    }

    fn delete_file(&mut self, path: &str) -> Result<(), StorageError> {
        let path = path::normalize(path)?;
        debug!("Delete file {}", path.as_str());
        Ok(FatVolume::delete_file(self, &path)?)
    }
}

#[cfg(test)]
mod test;

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

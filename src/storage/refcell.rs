use alloc::vec::Vec;
use core::cell::{RefCell, RefMut};

use super::{FileInfo, Storage, StorageError, WriteMode};

/// Lets the file server and any number of actions share one card. Each call
/// holds the borrow for the whole operation, so operations never interleave.
///
/// While someone holds the card borrowed, for instance to stream a download,
/// every call fails with [`StorageError::Busy`] instead of panicking.
impl<S> Storage for &RefCell<S>
where
    S: Storage,
{
    fn card_type(&self) -> &'static str {
        match self.try_borrow() {
            Ok(underlying) => underlying.card_type(),
            Err(_) => "UNKNOWN",
        }
    }

    fn total_space(&mut self) -> Result<u64, StorageError> {
        claim(self)?.total_space()
    }

    fn free_space(&mut self) -> Result<u64, StorageError> {
        claim(self)?.free_space()
    }

    fn used_space(&mut self) -> Result<u64, StorageError> {
        claim(self)?.used_space()
    }

    fn stat(&mut self, path: &str) -> Result<FileInfo, StorageError> {
        claim(self)?.stat(path)
    }

    fn list_directory(&mut self, path: &str, depth: u8) -> Result<Vec<FileInfo>, StorageError> {
        claim(self)?.list_directory(path, depth)
    }

    fn read_at(&mut self, path: &str, offset: u64, buffer: &mut [u8]) -> Result<usize, StorageError> {
        claim(self)?.read_at(path, offset, buffer)
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, StorageError> {
        claim(self)?.read_file(path)
    }

    fn write_file_mode(&mut self, path: &str, data: &[u8], mode: WriteMode) -> Result<(), StorageError> {
        claim(self)?.write_file_mode(path, data, mode)
    }

    fn create_directory(&mut self, path: &str) -> Result<(), StorageError> {
        claim(self)?.create_directory(path)
    }

    fn remove_directory(&mut self, path: &str) -> Result<(), StorageError> {
        claim(self)?.remove_directory(path)
    }

    fn delete_file(&mut self, path: &str) -> Result<(), StorageError> {
        claim(self)?.delete_file(path)
    }
}

fn claim<S>(cell: &RefCell<S>) -> Result<RefMut<'_, S>, StorageError> {
    cell.try_borrow_mut().map_err(|_| StorageError::Busy)
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************

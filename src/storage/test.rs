use core::cell::RefCell;

use crate::fat::{format_volume, FatVolume, FormatOptions};
use crate::MemoryBlockDevice;

use super::*;

fn volume(memory: &mut [u8]) -> FatVolume<MemoryBlockDevice<'_>> {
    let mut bd = MemoryBlockDevice::new(memory);
    format_volume(&mut bd, &FormatOptions::default()).unwrap();
    FatVolume::new(bd).unwrap()
}

fn paths(list: &[FileInfo]) -> Vec<&str> {
    let mut paths: Vec<&str> = list.iter().map(|info| info.path.as_str()).collect();
    paths.sort_unstable();
    paths
}

#[test]
fn facade_round_trip() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);

    storage.write_file("/hello.txt", b"Hello").unwrap();
    storage.append_file("/hello.txt", b", World").unwrap();
    assert_eq!(Storage::read_file(&mut storage, "/hello.txt").unwrap(), b"Hello, World");
    assert_eq!(storage.file_size("/hello.txt").unwrap(), 12);

    let info = Storage::stat(&mut storage, "//hello.txt").unwrap();
    assert_eq!(info.path, "/hello.txt");
    assert!(!info.is_directory);
    assert!(info.modified.is_some());

    assert_eq!(storage.file_size("/"), Err(StorageError::IsADirectory));
    assert_eq!(storage.file_size("/missing.txt"), Err(StorageError::NotFound));
    assert!(storage.is_directory("/"));
    assert!(!storage.is_directory("/hello.txt"));
}

#[test]
fn errors_map_to_the_facade() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);

    storage.create_directory("/d").unwrap();
    assert_eq!(storage.create_directory("/d"), Err(StorageError::AlreadyExists));
    assert_eq!(storage.create_directory("/x/y"), Err(StorageError::NotFound));
    storage.write_file("/d/f.txt", b"f").unwrap();
    assert_eq!(storage.remove_directory("/d"), Err(StorageError::NotEmpty));
    assert_eq!(Storage::delete_file(&mut storage, "/d"), Err(StorageError::IsADirectory));
    assert_eq!(storage.write_file("/../f.txt", b""), Err(StorageError::PathEscape));
    assert_eq!(storage.write_file("/bad name.txt", b""), Err(StorageError::InvalidName));

    // `..` inside the volume is fine
    storage.write_file("/d/../g.txt", b"g").unwrap();
    assert_eq!(Storage::read_file(&mut storage, "/g.txt").unwrap(), b"g");
}

#[test]
fn recursive_listing() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);

    storage.create_directory("/a").unwrap();
    storage.create_directory("/a/b").unwrap();
    storage.write_file("/a/b/deep.txt", b"deep").unwrap();
    storage.write_file("/a/one.txt", b"1").unwrap();
    storage.write_file("/top.txt", b"top").unwrap();

    let flat = storage.list_directory("/", 0).unwrap();
    assert_eq!(paths(&flat), vec!["/a", "/top.txt"]);

    let all = storage.list_directory("/", 2).unwrap();
    assert_eq!(
        paths(&all),
        vec!["/a", "/a/b", "/a/b/deep.txt", "/a/one.txt", "/top.txt"]
    );
    let deep = all.iter().find(|info| info.path == "/a/b/deep.txt").unwrap();
    assert_eq!(deep.size, 4);

    assert_eq!(paths(&storage.list_directory("/a", 0).unwrap()), vec!["/a/b", "/a/one.txt"]);
    assert_eq!(storage.list_directory("/top.txt", 0), Err(StorageError::NotADirectory));
}

#[test]
fn space_queries() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut storage = volume(&mut memory);

    let total = storage.total_space().unwrap();
    assert_eq!(storage.used_space().unwrap(), 0);
    storage.write_file("/blob.bin", &[0xAA; 4000]).unwrap();
    let used = storage.used_space().unwrap();
    assert!(used >= 4000);
    assert_eq!(storage.free_space().unwrap(), total - used);
    assert_eq!(storage.card_type(), "UNKNOWN");
}

#[cfg(feature = "refcell-storage")]
#[test]
fn shared_through_refcell() {
    let mut memory = vec![0u8; 16384 * 512];
    let cell = RefCell::new(volume(&mut memory));

    let mut server = &cell;
    let mut action = &cell;
    action.write_file("/shared.txt", b"from an action").unwrap();
    assert_eq!(server.read_file("/shared.txt").unwrap(), b"from an action");
    assert_eq!(server.card_type(), "UNKNOWN");
}

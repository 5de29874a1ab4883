use crate::mbr::{Mbr, Partition, PartitionType};
use crate::{BlockCount, MemoryBlockDevice};

use super::*;

fn fat16_volume(memory: &mut [u8]) -> FatVolume<MemoryBlockDevice<'_>> {
    let mut bd = MemoryBlockDevice::new(memory);
    let options = FormatOptions {
        fat_type: Some(FatType::Fat16),
        ..Default::default()
    };
    assert_eq!(format_volume(&mut bd, &options).unwrap(), FatType::Fat16);
    FatVolume::new(bd).unwrap()
}

fn fat32_volume(memory: &mut [u8]) -> FatVolume<MemoryBlockDevice<'_>> {
    let mut bd = MemoryBlockDevice::new(memory);
    let options = FormatOptions {
        fat_type: Some(FatType::Fat32),
        ..Default::default()
    };
    assert_eq!(format_volume(&mut bd, &options).unwrap(), FatType::Fat32);
    FatVolume::new(bd).unwrap()
}

fn names<BD: BlockDevice>(volume: &mut FatVolume<BD>, path: &str) -> Vec<String>
where
    BD::Error: core::fmt::Debug,
{
    let mut names: Vec<String> = volume
        .list(path)
        .unwrap()
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn write_then_read_back() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut memory = vec![0u8; 16384 * 512];
    let mut volume = fat16_volume(&mut memory);

    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    volume.write("/data.bin", &data, WriteMode::Truncate).unwrap();

    let node = volume.stat("/data.bin").unwrap();
    assert!(!node.is_dir());
    assert_eq!(node.size(), 3000);
    assert_eq!(volume.read_file("/data.bin").unwrap(), data);

    let mut middle = [0u8; 100];
    assert_eq!(volume.read_at("/data.bin", 1000, &mut middle).unwrap(), 100);
    assert_eq!(&middle[..], &data[1000..1100]);

    // Short read at the end, nothing past it
    assert_eq!(volume.read_at("/data.bin", 2950, &mut middle).unwrap(), 50);
    assert_eq!(volume.read_at("/data.bin", 3000, &mut middle).unwrap(), 0);
}

#[test]
fn truncate_replaces_contents() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut volume = fat16_volume(&mut memory);

    volume.write("/a.txt", &[b'x'; 5000], WriteMode::Truncate).unwrap();
    let free_before = volume.free_bytes().unwrap();
    volume.write("/a.txt", b"short", WriteMode::Truncate).unwrap();
    assert_eq!(volume.read_file("/a.txt").unwrap(), b"short");
    assert!(volume.free_bytes().unwrap() > free_before);
}

#[test]
fn append_adds_to_the_end() {
    let mut memory = vec![0u8; 68000 * 512];
    let mut volume = fat32_volume(&mut memory);

    volume.write("/log.txt", b"hello ", WriteMode::Append).unwrap();
    volume.write("/log.txt", b"world", WriteMode::Append).unwrap();
    assert_eq!(volume.read_file("/log.txt").unwrap(), b"hello world");

    // Crossing several cluster boundaries
    let first: Vec<u8> = vec![1u8; 511];
    let second: Vec<u8> = vec![2u8; 1537];
    volume.write("/big.bin", &first, WriteMode::Truncate).unwrap();
    volume.write("/big.bin", &second, WriteMode::Append).unwrap();
    let contents = volume.read_file("/big.bin").unwrap();
    assert_eq!(contents.len(), 2048);
    assert_eq!(&contents[..511], &first[..]);
    assert_eq!(&contents[511..], &second[..]);
}

#[test]
fn lower_case_names_survive() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut volume = fat16_volume(&mut memory);

    volume.write("/notes.txt", b"1", WriteMode::Truncate).unwrap();
    volume.write("/README.MD", b"2", WriteMode::Truncate).unwrap();
    assert_eq!(names(&mut volume, "/"), vec!["README.MD", "notes.txt"]);
    // Lookups ignore case
    assert_eq!(volume.read_file("/NOTES.TXT").unwrap(), b"1");
}

#[test]
fn directories() {
    let mut memory = vec![0u8; 68000 * 512];
    let mut volume = fat32_volume(&mut memory);

    volume.create_dir("/logs").unwrap();
    assert!(matches!(volume.create_dir("/logs"), Err(FatError::AlreadyExists)));
    assert!(matches!(volume.create_dir("/a/b"), Err(FatError::NotFound)));
    assert!(volume.stat("/logs").unwrap().is_dir());

    volume.create_dir("/logs/old").unwrap();
    volume.write("/logs/today.txt", b"entry", WriteMode::Truncate).unwrap();
    assert_eq!(names(&mut volume, "/logs"), vec!["old", "today.txt"]);

    assert!(matches!(volume.remove_dir("/logs"), Err(FatError::NotEmpty)));
    assert!(matches!(volume.delete_file("/logs"), Err(FatError::IsADirectory)));
    assert!(matches!(volume.remove_dir("/logs/today.txt"), Err(FatError::NotADirectory)));
    assert!(matches!(
        volume.write("/logs/today.txt/x", b"", WriteMode::Truncate),
        Err(FatError::NotADirectory)
    ));

    volume.delete_file("/logs/today.txt").unwrap();
    volume.remove_dir("/logs/old").unwrap();
    volume.remove_dir("/logs").unwrap();
    assert!(matches!(volume.stat("/logs"), Err(FatError::NotFound)));
    assert!(names(&mut volume, "/").is_empty());
    assert!(matches!(volume.remove_dir("/"), Err(FatError::RootDirectory)));
}

#[test]
fn directory_grows_past_one_cluster() {
    let mut memory = vec![0u8; 68000 * 512];
    let mut volume = fat32_volume(&mut memory);

    // One sector per cluster holds 16 entries, two of them dots
    volume.create_dir("/many").unwrap();
    for i in 0..40 {
        let path = format!("/many/f{}.txt", i);
        volume.write(&path, path.as_bytes(), WriteMode::Truncate).unwrap();
    }
    assert_eq!(volume.list("/many").unwrap().len(), 40);
    assert_eq!(volume.read_file("/many/f39.txt").unwrap(), b"/many/f39.txt");
}

#[test]
fn space_accounting() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut volume = fat16_volume(&mut memory);
    let cluster = u64::from(volume.bytes_per_cluster());

    let total = volume.total_bytes();
    let free = volume.free_bytes().unwrap();
    assert_eq!(total, free);

    volume.write("/one.bin", &vec![0u8; 3 * cluster as usize], WriteMode::Truncate).unwrap();
    assert_eq!(volume.free_bytes().unwrap(), free - 3 * cluster);

    volume.delete_file("/one.bin").unwrap();
    assert_eq!(volume.free_bytes().unwrap(), free);
}

#[test]
fn full_volume_reports_no_space_and_cleans_up() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut volume = fat16_volume(&mut memory);
    let free = volume.free_bytes().unwrap();

    let too_big = vec![7u8; free as usize + 1];
    assert!(matches!(
        volume.write("/huge.bin", &too_big, WriteMode::Truncate),
        Err(FatError::NoSpace)
    ));
    assert!(matches!(volume.stat("/huge.bin"), Err(FatError::NotFound)));
    assert_eq!(volume.free_bytes().unwrap(), free);

    // A failed append keeps what was there
    volume.write("/keep.txt", b"keep", WriteMode::Truncate).unwrap();
    let free = volume.free_bytes().unwrap();
    assert!(matches!(
        volume.write("/keep.txt", &too_big, WriteMode::Append),
        Err(FatError::NoSpace)
    ));
    assert_eq!(volume.read_file("/keep.txt").unwrap(), b"keep");
    assert_eq!(volume.free_bytes().unwrap(), free);
}

#[test]
fn invalid_names_are_rejected() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut volume = fat16_volume(&mut memory);
    assert!(matches!(
        volume.write("/a very long name.txt", b"", WriteMode::Truncate),
        Err(FatError::InvalidName)
    ));
    assert!(matches!(volume.create_dir("/"), Err(FatError::RootDirectory)));
}

#[test]
fn timestamps_come_from_the_time_source() {
    let mut memory = vec![0u8; 16384 * 512];
    let mut volume = fat16_volume(&mut memory);
    let now = Timestamp {
        year: 2022,
        month: 3,
        day: 4,
        hours: 5,
        minutes: 6,
        seconds: 8,
    };
    volume.set_time_source(Box::new(FixedTime(now)));
    volume.write("/t.txt", b"t", WriteMode::Truncate).unwrap();
    match volume.stat("/t.txt").unwrap() {
        Node::Entry(entry) => assert_eq!(entry.modified(), now),
        Node::Root => panic!("expected a file"),
    }
}

#[test]
fn mount_through_partition_table() {
    let mut memory = vec![0u8; 20000 * 512];
    let mut bd = MemoryBlockDevice::new(&mut memory);
    let partition = Partition {
        ty: PartitionType::Fat16Lba,
        lba_start: BlockCount(2048),
        block_count: BlockCount(16384),
    };
    Mbr::write_single_partition(&mut bd, &partition).unwrap();

    let found = Mbr::first_fat_partition(&mut bd).unwrap();
    assert_eq!(found.lba_start, BlockCount(2048));
    let mut part = found.with_block_device(bd);
    format_volume(&mut part, &FormatOptions::default()).unwrap();

    let mut volume = FatVolume::new(part).unwrap();
    volume.write("/inside.txt", b"partitioned", WriteMode::Truncate).unwrap();
    assert_eq!(volume.read_file("/inside.txt").unwrap(), b"partitioned");

    // The MBR is still intact
    let mut bd = volume.release().release();
    assert!(Mbr::first_fat_partition(&mut bd).is_ok());
}

#[test]
fn fat12_is_rejected() {
    let mut memory = vec![0u8; 2000 * 512];
    let mut bd = MemoryBlockDevice::new(&mut memory);
    assert!(matches!(
        format_volume(&mut bd, &FormatOptions::default()),
        Err(FatError::UnsupportedGeometry)
    ));
    match FatVolume::new(bd) {
        Err((FatError::Bpb(_), _)) => {}
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
}

#[test]
fn shared_block_device() {
    let mut memory = vec![0u8; 16384 * 512];
    let cell = core::cell::RefCell::new(MemoryBlockDevice::new(&mut memory));
    let mut raw = &cell;
    format_volume(&mut raw, &FormatOptions::default()).unwrap();

    let mut volume = FatVolume::new(&cell).unwrap();
    volume.write("/shared.txt", b"one device", WriteMode::Truncate).unwrap();

    // Raw access through the same cell between volume calls
    let boot = raw.read_block(BlockIdx(0), "inspect").unwrap();
    assert_eq!(&boot.contents[510..512], &[0x55, 0xAA]);
    assert_eq!(raw.num_blocks().unwrap(), BlockCount(16384));

    assert_eq!(volume.read_file("/shared.txt").unwrap(), b"one device");
}

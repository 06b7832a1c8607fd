//! End-to-end scenarios against a RAM-backed device.

mod common;

use common::RamDisk;
use txvol::config::{ApiFlavor, Config};
use txvol::error::Error;
use txvol::volume::Volume;

fn small_config() -> Config {
    Config {
        block_size: 4096,
        direct_pointers: 4,
        indirect_pointers: 32,
        api: ApiFlavor::Posix,
        ..Config::default()
    }
}

fn formatted_disk(sector_count: u64) -> RamDisk {
    let dev = RamDisk::new(sector_count, 512);
    Volume::format(dev, &small_config()).unwrap()
}

/// A config small enough that its double-indirect region is reachable with
/// a modest number of block writes: one direct pointer, one indirect
/// pointer (27 entries per indirect node at this block size), so logical
/// block 28 is the first one that must go through the double-indirect
/// slot.
fn tiny_config() -> Config {
    Config {
        block_size: 128,
        direct_pointers: 1,
        indirect_pointers: 1,
        name_max: 32,
        api: ApiFlavor::Posix,
        ..Config::default()
    }
}

#[test]
fn format_then_stat_root() {
    let dev = formatted_disk(8192); // 4 MiB at 512-byte sectors
    let mut vol = Volume::mount(dev, small_config()).unwrap();
    let (size, link_count, inode_num) = vol.stat_root().unwrap();
    assert_eq!(size, 0);
    assert_eq!(inode_num, 2);
    assert_eq!(link_count, 2);
}

// A write followed by a successful call (which transacts internally)
// survives a simulated power-cycle: drop the mounted volume
// and its buffer cache, then mount a fresh `Volume` over the same durable
// bytes and read the data back.
#[test]
fn write_survives_power_cycle() {
    let dev = formatted_disk(8192);
    let mut vol = Volume::mount(dev, small_config()).unwrap();
    let ino = vol.create(2, b"a", false).unwrap();
    let pattern = [0xAAu8; 8192];
    vol.write(ino, 0, &pattern).unwrap();
    let durable = vol.into_device();

    let mut remounted = Volume::mount(durable, small_config()).unwrap();
    let file_ino = remounted.lookup(2, b"a").unwrap();
    let mut readback = [0u8; 8192];
    remounted.read(file_ino, 0, &mut readback).unwrap();
    assert_eq!(&readback[..], &pattern[..]);
}

// Create, unlink, create again, enumerate with no duplicates.
#[test]
fn create_unlink_enumerate_skips_deleted_and_has_no_duplicates() {
    let dev = formatted_disk(8192);
    let mut vol = Volume::mount(dev, small_config()).unwrap();
    for i in 0..10 {
        let name = alloc_name(i);
        vol.create(2, name.as_bytes(), false).unwrap();
    }
    vol.unlink(2, b"f5").unwrap();
    vol.create(2, b"f10", false).unwrap();

    let mut seen = std::collections::HashSet::new();
    let mut cursor = 0u64;
    while let Some((next, name, _ino)) = vol.read_dir(2, cursor).unwrap() {
        assert!(seen.insert(name.clone()), "duplicate entry {name}");
        assert_ne!(name, "f5");
        cursor = next;
    }
    assert!(seen.contains("f0"));
    assert!(seen.contains("f10"));
    assert!(!seen.contains("f5"));
}

fn alloc_name(i: u32) -> String {
    format!("f{i}")
}

// A corrupted metaroot CRC does not prevent mount; both corrupted
// fails with Io.
#[test]
fn single_corrupt_metaroot_still_mounts() {
    let mut dev = formatted_disk(8192);
    // Flip a byte inside metaroot block 2 (physical block 2, sector 16 at
    // 512B sectors / 4096B blocks = 8 sectors per block).
    corrupt_block(&mut dev, 2, 512);
    let vol = Volume::mount(dev, small_config());
    assert!(vol.is_ok());
}

#[test]
fn both_corrupt_metaroots_fail_with_io() {
    let mut dev = formatted_disk(8192);
    corrupt_block(&mut dev, 1, 512);
    corrupt_block(&mut dev, 2, 512);
    let vol = Volume::mount(dev, small_config());
    assert_eq!(vol.err(), Some(Error::Io));
}

// Write far enough into a file to force allocation through the first
// double-indirect slot, then truncate back to 0. Every data block and
// every indirect/double-indirect node block this path allocated should
// come back: `free_blocks` should return to the baseline set right after
// the root directory's own first entry was written, since the file
// itself is gone.
#[test]
fn double_indirect_then_truncate_reclaims_data_and_nodes() {
    let cfg = tiny_config();
    let dev = RamDisk::new(4096, 128);
    let dev = Volume::format(dev, &cfg).unwrap();
    let mut vol = Volume::mount(dev, cfg.clone()).unwrap();
    let baseline = vol.meta.free_blocks();

    let ino = vol.create(2, b"big", false).unwrap();
    let block_size = cfg.block_size as usize;
    // 29 logical blocks: 1 direct + 27 via the single indirect node + 1
    // that only fits through the double-indirect slot.
    let pattern = vec![0x5Au8; block_size * 29];
    vol.write(ino, 0, &pattern).unwrap();
    let after_write = vol.meta.free_blocks();
    // 1 root-directory data block (this file's own first entry) + 29 file
    // data blocks + 3 node-overhead blocks.
    assert_eq!(baseline - after_write, 1 + 29 + 3);

    vol.truncate(ino, 0).unwrap();
    let after_truncate = vol.meta.free_blocks();
    // Only the root directory's own entry block remains charged against
    // the baseline; every node and data block the file owned is back.
    assert_eq!(baseline - after_truncate, 1);
}

fn corrupt_block(dev: &mut RamDisk, block: u32, sector_size: u32) {
    use txvol::device::BlockDevice;
    let sectors_per_block = 4096 / sector_size;
    let mut buf = vec![0u8; sector_size as usize];
    let sector = block as u64 * sectors_per_block as u64;
    dev.read_sectors(sector, &mut buf).unwrap();
    buf[8] ^= 0xFF;
    dev.write_sectors(sector, &buf).unwrap();
}

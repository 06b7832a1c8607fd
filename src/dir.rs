//! Directory store: name -> inode mapping held as the data of a directory
//! inode.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::Geometry;
use crate::device::BlockDevice;
use crate::buffer::BufferCache;
use crate::error::{Error, Result};
use crate::inode::{self, CachedInode};
use crate::metaroot::MetaRoot;

/// Root directory's fixed inode number.
pub const ROOT_INODE: u32 = 2;

/// On-disk entry size: 4-byte inode number plus a null-padded name field.
pub fn entry_size(name_max: u32) -> u32 {
    4 + name_max
}

fn read_entry(buf: &[u8], name_max: u32) -> (u32, &[u8]) {
    let inode = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let raw = &buf[4..4 + name_max as usize];
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    (inode, &raw[..len])
}

fn write_entry(buf: &mut [u8], name_max: u32, inode: u32, name: &[u8]) {
    buf[0..4].copy_from_slice(&inode.to_le_bytes());
    let field = &mut buf[4..4 + name_max as usize];
    field.fill(0);
    field[..name.len()].copy_from_slice(name);
}

/// Linear scan for `name` under `parent`. Returns the byte offset of the
/// matching entry and its inode number.
pub fn lookup<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    geom: &Geometry,
    parent: &mut CachedInode,
    name: &[u8],
) -> Result<(u64, u32)> {
    let esize = entry_size(geom.name_max) as u64;
    let count = parent.fixed.size / esize;
    let mut buf = vec![0u8; esize as usize];
    for i in 0..count {
        let off = i * esize;
        inode::data_read(cache, meta, geom, parent, off, &mut buf)?;
        let (ino, nm) = read_entry(&buf, geom.name_max);
        if ino != 0 && nm == name {
            return Ok((off, ino));
        }
    }
    Err(Error::NoEntry)
}

/// Creates a new entry, reusing the first tombstone or extending the
/// directory's data.
pub fn create<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    geom: &Geometry,
    parent: &mut CachedInode,
    name: &[u8],
    inode_num: u32,
) -> Result<()> {
    if name.len() as u32 > geom.name_max {
        return Err(Error::NameTooLong);
    }
    if lookup(cache, meta, geom, parent, name).is_ok() {
        return Err(Error::Exists);
    }
    let esize = entry_size(geom.name_max) as u64;
    let count = parent.fixed.size / esize;
    let mut buf = vec![0u8; esize as usize];
    for i in 0..count {
        let off = i * esize;
        inode::data_read(cache, meta, geom, parent, off, &mut buf)?;
        let (ino, _) = read_entry(&buf, geom.name_max);
        if ino == 0 {
            write_entry(&mut buf, geom.name_max, inode_num, name);
            inode::data_write(cache, meta, geom, parent, off, &buf)?;
            return Ok(());
        }
    }
    write_entry(&mut buf, geom.name_max, inode_num, name);
    inode::data_write(cache, meta, geom, parent, parent.fixed.size, &buf)?;
    Ok(())
}

/// Tombstones the entry at `offset` (writes inode=0); no compaction.
pub fn delete<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    geom: &Geometry,
    parent: &mut CachedInode,
    offset: u64,
) -> Result<()> {
    let esize = entry_size(geom.name_max) as usize;
    let mut buf = vec![0u8; esize];
    write_entry(&mut buf, geom.name_max, 0, b"");
    inode::data_write(cache, meta, geom, parent, offset, &buf)?;
    Ok(())
}

/// Enumeration cursor: a byte offset into the directory's data, skipping
/// tombstones.
pub fn read_next<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    geom: &Geometry,
    parent: &mut CachedInode,
    cursor: u64,
) -> Result<Option<(u64, String, u32)>> {
    let esize = entry_size(geom.name_max) as u64;
    let count = parent.fixed.size / esize;
    let mut idx = cursor / esize;
    let mut buf = vec![0u8; esize as usize];
    while idx < count {
        let off = idx * esize;
        inode::data_read(cache, meta, geom, parent, off, &mut buf)?;
        let (ino, nm) = read_entry(&buf, geom.name_max);
        if ino != 0 {
            let name = String::from_utf8_lossy(nm).into_owned();
            return Ok(Some((off + esize, name, ino)));
        }
        idx += 1;
    }
    Ok(None)
}

/// True if `dir`'s data contains no live (non-tombstone) entries.
pub fn is_empty<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    geom: &Geometry,
    dir: &mut CachedInode,
) -> Result<bool> {
    Ok(read_next(cache, meta, geom, dir, 0)?.is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    #[test]
    fn entry_round_trips_through_bytes() {
        let name_max = 16u32;
        let mut buf = vec![0u8; entry_size(name_max) as usize];
        write_entry(&mut buf, name_max, 7, b"hello");
        let (ino, nm) = read_entry(&buf, name_max);
        assert_eq!(ino, 7);
        assert_eq!(nm, b"hello");
    }
}

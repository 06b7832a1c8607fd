//! Buffer cache: a fixed pool of block-sized buffers mediating all
//! metadata I/O.
//!
//! Buffers are addressed by an opaque `BufHandle` token rather than an
//! RAII guard. A guard borrowing `&mut BufferCache` for its lifetime would
//! make it impossible to hold more than one buffer pinned at a time (the
//! inode/indirect/data tree walk routinely needs three); callers instead
//! call [`BufferCache::put`] on every exit path, one release per acquire.

use alloc::vec;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::io::BlockIo;
use crate::node::{self, NodeHeader};

pub type BufHandle = usize;

/// Tags a buffer with the node signature expected at `get` time, so the
/// cache can verify it after reading from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Master,
    MetaRoot,
    Imap,
    Inode,
    Indirect,
    Dindirect,
    DirData,
    /// Raw, non-metadata block (file data): no signature/CRC discipline.
    Raw,
}

impl MetaKind {
    fn signature(self) -> Option<u32> {
        match self {
            MetaKind::Master => Some(node::signature::MASTER),
            MetaKind::MetaRoot => Some(node::signature::META),
            MetaKind::Imap => Some(node::signature::IMAP),
            MetaKind::Inode => Some(node::signature::INODE),
            MetaKind::Indirect => Some(node::signature::INDI),
            MetaKind::Dindirect => Some(node::signature::DBLI),
            MetaKind::DirData => Some(node::signature::DIRD),
            MetaKind::Raw => None,
        }
    }

    /// Master block carries no node header (no CRC/sequence discipline).
    fn has_node_header(self) -> bool {
        !matches!(self, MetaKind::Master | MetaKind::Raw)
    }
}

/// Flags controlling how `get` populates a buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetFlags {
    /// Zero the buffer and mark dirty instead of reading it from disk.
    pub new: bool,
}

struct Slot {
    block: u32,
    data: Vec<u8>,
    kind: MetaKind,
    dirty: bool,
    pins: u32,
    age: u64,
}

pub struct BufferCache<D: BlockDevice> {
    io: BlockIo<D>,
    slots: Vec<Option<Slot>>,
    index: HashMap<u32, BufHandle>,
    clock: u64,
    sequence: u64,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(io: BlockIo<D>, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            io,
            slots,
            index: HashMap::new(),
            clock: 0,
            sequence: 0,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.io.block_size()
    }

    pub fn io(&mut self) -> &mut BlockIo<D> {
        &mut self.io
    }

    pub fn into_io(self) -> BlockIo<D> {
        self.io
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_victim(&mut self) -> Result<usize> {
        if let Some(free) = self.slots.iter().position(|s| s.is_none()) {
            return Ok(free);
        }
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().map(|s| s.pins == 0 && !s.dirty).unwrap_or(false))
            .min_by_key(|(_, s)| s.as_ref().unwrap().age)
            .map(|(i, _)| i)
            .ok_or(Error::Busy)?;
        self.index.remove(&self.slots[victim].as_ref().unwrap().block);
        self.slots[victim] = None;
        Ok(victim)
    }

    /// Returns a pinned handle for `block`, loading or allocating it per
    /// `flags` and `kind`.
    pub fn get(&mut self, block: u32, kind: MetaKind, flags: GetFlags) -> Result<BufHandle> {
        if let Some(&h) = self.index.get(&block) {
            let slot = self.slots[h].as_mut().unwrap();
            slot.pins += 1;
            return Ok(h);
        }
        let h = self.evict_victim()?;
        let size = self.io.block_size() as usize;
        let mut data = vec![0u8; size];
        let dirty;
        if flags.new {
            dirty = true;
        } else {
            self.io.read_block(block, &mut data)?;
            if let Some(sig) = kind.signature() {
                if kind.has_node_header() {
                    let hdr = NodeHeader::read(&data);
                    if hdr.signature != sig || !node::verify_crc(&data) {
                        crate::warn!("buffer", "block {} failed signature/CRC check", block);
                        return Err(Error::Io);
                    }
                }
            }
            dirty = false;
        }
        let age = self.tick();
        self.slots[h] = Some(Slot {
            block,
            data,
            kind,
            dirty,
            pins: 1,
            age,
        });
        self.index.insert(block, h);
        Ok(h)
    }

    pub fn data(&self, h: BufHandle) -> &[u8] {
        &self.slots[h].as_ref().expect("stale handle").data
    }

    pub fn data_mut(&mut self, h: BufHandle) -> &mut [u8] {
        &mut self.slots[h].as_mut().expect("stale handle").data
    }

    pub fn block_of(&self, h: BufHandle) -> u32 {
        self.slots[h].as_ref().expect("stale handle").block
    }

    pub fn put(&mut self, h: BufHandle) {
        if let Some(slot) = self.slots[h].as_mut() {
            slot.pins = slot.pins.saturating_sub(1);
        }
    }

    pub fn mark_dirty(&mut self, h: BufHandle) {
        if let Some(slot) = self.slots[h].as_mut() {
            slot.dirty = true;
            slot.age = self.clock;
        }
    }

    /// Reassign a dirty, pinned buffer to `new_block` without reloading it
    /// from disk (copy-on-write branch).
    pub fn branch(&mut self, h: BufHandle, new_block: u32) -> Result<()> {
        let old_block = {
            let slot = self.slots[h].as_mut().ok_or(Error::BadF)?;
            if slot.pins == 0 {
                return Err(fubar!("branch on unpinned buffer"));
            }
            let old = slot.block;
            slot.block = new_block;
            slot.dirty = true;
            old
        };
        self.index.remove(&old_block);
        self.index.insert(new_block, h);
        Ok(())
    }

    /// Drop a single unpinned entry without flushing.
    pub fn discard(&mut self, h: BufHandle) -> Result<()> {
        let block = match &self.slots[h] {
            Some(s) if s.pins == 0 => s.block,
            Some(_) => return Err(fubar!("discard of pinned buffer")),
            None => return Ok(()),
        };
        self.index.remove(&block);
        self.slots[h] = None;
        Ok(())
    }

    /// Drop every unpinned entry whose block lies in `[start, start+count)`.
    pub fn discard_range(&mut self, start: u32, count: u32) -> Result<()> {
        let end = start + count;
        let victims: Vec<BufHandle> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.as_ref()
                    .filter(|s| s.block >= start && s.block < end)
                    .map(|_| i)
            })
            .collect();
        for h in victims {
            self.discard(h)?;
        }
        Ok(())
    }

    /// Flush every dirty buffer whose block lies in `[start, start+count)`,
    /// stamping metadata buffers with a fresh sequence number and CRC.
    pub fn flush_range(&mut self, start: u32, count: u32) -> Result<()> {
        let end = start + count;
        let handles: Vec<BufHandle> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.as_ref()
                    .filter(|s| s.dirty && s.block >= start && s.block < end)
                    .map(|_| i)
            })
            .collect();
        for h in handles {
            self.flush_one(h)?;
        }
        Ok(())
    }

    pub fn flush_one(&mut self, h: BufHandle) -> Result<()> {
        let block = {
            let slot = self.slots[h].as_mut().ok_or(Error::BadF)?;
            if slot.kind.has_node_header() {
                self.sequence += 1;
                let seq = self.sequence;
                let mut hdr = NodeHeader::read(&slot.data);
                hdr.sequence = seq;
                hdr.write(&mut slot.data);
                node::stamp_crc(&mut slot.data);
            }
            slot.block
        };
        let data = self.slots[h].as_ref().unwrap().data.clone();
        self.io.write_block(block, &data)?;
        self.slots[h].as_mut().unwrap().dirty = false;
        Ok(())
    }

    /// Bypass the cache for a large contiguous read, flushing any cached
    /// overlap first to preserve coherency.
    pub fn read_range(&mut self, start: u32, count: u32, buf: &mut [u8]) -> Result<()> {
        self.flush_range(start, count)?;
        let bs = self.io.block_size() as usize;
        for i in 0..count {
            self.io.read_block(start + i, &mut buf[i as usize * bs..(i as usize + 1) * bs])?;
        }
        Ok(())
    }

    pub fn write_range(&mut self, start: u32, count: u32, buf: &[u8]) -> Result<()> {
        self.discard_range(start, count)?;
        let bs = self.io.block_size() as usize;
        for i in 0..count {
            self.io.write_block(start + i, &buf[i as usize * bs..(i as usize + 1) * bs])?;
        }
        Ok(())
    }

    pub fn flush_device(&mut self) -> Result<()> {
        self.io.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::vec;

    struct RamDisk {
        sectors: Vec<u8>,
        sector_size: u32,
    }

    impl RamDisk {
        fn new(sector_count: u64, sector_size: u32) -> Self {
            Self {
                sectors: vec![0u8; sector_count as usize * sector_size as usize],
                sector_size,
            }
        }
    }

    impl BlockDevice for RamDisk {
        fn sector_size(&self) -> u32 {
            self.sector_size
        }
        fn sector_count(&self) -> u64 {
            self.sectors.len() as u64 / self.sector_size as u64
        }
        fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()> {
            let off = sector as usize * self.sector_size as usize;
            buf.copy_from_slice(&self.sectors[off..off + buf.len()]);
            Ok(())
        }
        fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
            let off = sector as usize * self.sector_size as usize;
            self.sectors[off..off + buf.len()].copy_from_slice(buf);
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn cache() -> BufferCache<RamDisk> {
        let dev = RamDisk::new(256, 512);
        let io = BlockIo::new(dev, 4096).unwrap();
        BufferCache::new(io, 8)
    }

    #[test]
    fn new_buffer_is_dirty_and_zeroed() {
        let mut c = cache();
        let h = c.get(5, MetaKind::Raw, GetFlags { new: true }).unwrap();
        assert!(c.data(h).iter().all(|&b| b == 0));
        c.put(h);
    }

    #[test]
    fn flush_then_reload_round_trips() {
        let mut c = cache();
        let h = c.get(3, MetaKind::Raw, GetFlags { new: true }).unwrap();
        c.data_mut(h)[0] = 0xAB;
        c.mark_dirty(h);
        c.flush_range(3, 1).unwrap();
        c.put(h);
        c.discard_range(3, 1).unwrap();
        let h2 = c.get(3, MetaKind::Raw, GetFlags::default()).unwrap();
        assert_eq!(c.data(h2)[0], 0xAB);
        c.put(h2);
    }

    #[test]
    fn branch_reassigns_block_without_reload() {
        let mut c = cache();
        let h = c.get(3, MetaKind::Raw, GetFlags { new: true }).unwrap();
        c.data_mut(h)[0] = 0x42;
        c.branch(h, 9).unwrap();
        assert_eq!(c.block_of(h), 9);
        assert_eq!(c.data(h)[0], 0x42);
        c.put(h);
    }
}

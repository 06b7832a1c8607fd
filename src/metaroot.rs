//! Dual-metaroot commit protocol: free-block accounting, sequence
//! numbering, copy-on-write branching, and `transact`.

use bytemuck::{Pod, Zeroable};

use crate::buffer::{BufHandle, BufferCache, GetFlags, MetaKind};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::imap::{Imap, ImapBits, ImapLayout, View};
use crate::node::{self, NodeHeader};

/// Physical blocks 1 and 2 always hold the two metaroots.
pub const METAROOT_BLOCKS: [u32; 2] = [1, 2];

/// Fixed fields of a metaroot, immediately following the node header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MetaRootFixed {
    pub sector_crc: u32,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub alloc_ptr: u32,
    pub orphan_head: u32,
    pub orphan_tail: u32,
    pub defunct_orphan_head: u32,
}

pub const METAROOT_FIXED_SIZE: usize = core::mem::size_of::<MetaRootFixed>();
pub const METAROOT_HEADER_SIZE: usize = node::NODE_HEADER_SIZE + METAROOT_FIXED_SIZE;

impl MetaRootFixed {
    pub fn to_le(self) -> Self {
        Self {
            sector_crc: self.sector_crc.to_le(),
            free_blocks: self.free_blocks.to_le(),
            free_inodes: self.free_inodes.to_le(),
            alloc_ptr: self.alloc_ptr.to_le(),
            orphan_head: self.orphan_head.to_le(),
            orphan_tail: self.orphan_tail.to_le(),
            defunct_orphan_head: self.defunct_orphan_head.to_le(),
        }
    }

    pub fn from_le(self) -> Self {
        Self {
            sector_crc: u32::from_le(self.sector_crc),
            free_blocks: u32::from_le(self.free_blocks),
            free_inodes: u32::from_le(self.free_inodes),
            alloc_ptr: u32::from_le(self.alloc_ptr),
            orphan_head: u32::from_le(self.orphan_head),
            orphan_tail: u32::from_le(self.orphan_tail),
            defunct_orphan_head: u32::from_le(self.defunct_orphan_head),
        }
    }
}

/// In-memory view of one on-disk metaroot: its buffer handle, parsed fixed
/// fields, and the imap bitmap carved out of the block's remainder.
pub struct MetaRootView {
    pub handle: BufHandle,
    pub fixed: MetaRootFixed,
    pub bits: ImapBits,
}

/// Per-volume transaction state: the two metaroot views and which one is
/// currently the working copy. `branched` tracks whether any block has
/// been copy-on-written since the last `transact`.
pub struct MetaRoot {
    pub views: [Option<MetaRootView>; 2],
    pub current: usize,
    pub branched: bool,
    pub imap_layout: ImapLayout,
    /// First block number the imap bitmap tracks, i.e. the start of the
    /// inode table: per the original driver, the same bitmap covers both
    /// inode-table blocks and general allocable blocks (rednodes.h's
    /// METAROOT::abEntries comment), not just the latter.
    pub imap_start_block: u32,
    pub first_allocable_block: u32,
    pub block_count: u32,
    /// Blocks withheld from ordinary allocation so truncate/unlink, which
    /// may need to copy-on-write branch an already-`Used` block before
    /// immediately freeing it, can still make progress on a volume that
    /// ordinary writers already see as full.
    pub reserved_blocks: u32,
}

/// Size of the reserved pool withheld from ordinary `alloc_block` calls,
/// given the number of blocks allocable at format time.
pub fn reserved_block_count(total_allocable: u32) -> u32 {
    core::cmp::max(4, total_allocable / 50)
}

impl MetaRoot {
    fn other(&self) -> usize {
        1 - self.current
    }

    pub fn working(&self) -> &MetaRootView {
        self.views[self.current].as_ref().expect("metaroot not mounted")
    }

    pub fn working_mut(&mut self) -> &mut MetaRootView {
        self.views[self.current].as_mut().expect("metaroot not mounted")
    }

    pub fn committed(&self) -> &MetaRootView {
        self.views[self.other()].as_ref().expect("metaroot not mounted")
    }

    pub fn free_blocks(&self) -> u32 {
        self.working().fixed.free_blocks
    }

    fn imap(&mut self) -> Imap<'_> {
        let cur = self.current;
        let other = self.other();
        let (first, second) = self.views.split_at_mut(cur.max(other));
        let (working, committed) = if cur < other {
            (&mut first[cur], &second[0])
        } else {
            (&mut second[0], &first[other])
        };
        let working = working.as_mut().expect("metaroot not mounted");
        let committed = committed.as_ref().expect("metaroot not mounted");
        Imap {
            layout: self.imap_layout,
            committed: &committed.bits,
            working: &mut working.bits,
        }
    }

    /// Allocates a block: scans for a FREE block from the forward-allocation
    /// pointer, marks it USED-in-working (NEW), decrements `free_blocks`,
    /// advances the pointer, and sets `branched`.
    ///
    /// `reserved` must be true only for allocations made on behalf of
    /// truncate/unlink; such callers may dip into the withheld pool, while
    /// ordinary writers are refused once `free_blocks` would drop to or
    /// below `reserved_blocks`.
    pub fn alloc_block<D: BlockDevice>(&mut self, cache: &mut BufferCache<D>, reserved: bool) -> Result<u32> {
        if !reserved && self.working().fixed.free_blocks <= self.reserved_blocks {
            return Err(Error::NoSpace);
        }
        let start = self.working().fixed.alloc_ptr;
        let base = self.imap_start_block;
        let len = self.block_count - base;
        let block = {
            let imap = self.imap();
            imap.find_free(cache, start, base, len)?
        };
        self.imap().set(cache, block, base, true)?;
        let fixed = &mut self.working_mut().fixed;
        fixed.alloc_ptr = if block + 1 >= base + len { base } else { block + 1 };
        fixed.free_blocks = fixed
            .free_blocks
            .checked_sub(1)
            .ok_or_else(|| fubar!("free_blocks underflow"))?;
        self.branched = true;
        Ok(block)
    }

    /// Marks `block` AFREE: clears the working bit, leaving the committed
    /// bit set so the block remains allocated until the next commit.
    pub fn free_block<D: BlockDevice>(&mut self, cache: &mut BufferCache<D>, block: u32) -> Result<()> {
        let base = self.imap_start_block;
        self.imap().set(cache, block, base, false)?;
        self.working_mut().fixed.free_blocks += 1;
        self.branched = true;
        Ok(())
    }

    /// Marks `block`'s imap bit used in the working view without touching
    /// `free_blocks` or the allocation pointer. Format uses this once per
    /// inode-table block, since those blocks are permanently allocated and
    /// were never counted among the free blocks to begin with.
    pub fn mark_preallocated<D: BlockDevice>(&mut self, cache: &mut BufferCache<D>, block: u32) -> Result<()> {
        let base = self.imap_start_block;
        self.imap().set(cache, block, base, true)
    }

    /// Current four-state classification of `block`.
    pub fn state<D: BlockDevice>(&mut self, cache: &mut BufferCache<D>, block: u32) -> Result<BlockState> {
        let base = self.imap_start_block;
        let imap = self.imap();
        let committed = imap.get(cache, View::Committed, block, base)?;
        let working = imap.get(cache, View::Working, block, base)?;
        Ok(match (committed, working) {
            (false, false) => BlockState::Free,
            (true, true) => BlockState::Used,
            (false, true) => BlockState::New,
            (true, false) => BlockState::AFree,
        })
    }

    /// Commits the working metaroot.
    pub fn transact<D: BlockDevice>(&mut self, cache: &mut BufferCache<D>) -> Result<()> {
        if !self.branched {
            return Ok(());
        }
        crate::debug!("metaroot", "transaction begin, free_blocks={}", self.working().fixed.free_blocks);
        let base = self.first_allocable_block;
        let len = self.block_count - base;
        cache.flush_range(base, len)?;
        cache.flush_device()?;

        let h = self.working().handle;
        {
            let data = cache.data_mut(h);
            let fixed = self.working().fixed;
            data[node::NODE_HEADER_SIZE..node::NODE_HEADER_SIZE + METAROOT_FIXED_SIZE]
                .copy_from_slice(bytemuck::bytes_of(&fixed.to_le()));
            let bits = self.working().bits.as_bytes();
            data[METAROOT_HEADER_SIZE..METAROOT_HEADER_SIZE + bits.len()].copy_from_slice(bits);
        }
        cache.mark_dirty(h);
        cache.flush_one(h)?;
        cache.flush_device()?;

        self.current = self.other();
        self.branched = false;
        self.sync_working_to_committed();
        crate::info!("metaroot", "transaction committed, metaroot {} now current", self.current);
        Ok(())
    }

    /// After the swap, the newly demoted metaroot becomes the working
    /// copy for the next transaction; mirror the freshly promoted
    /// committed view's fixed fields and bitmap into it so the two views
    /// start identical and no block reads as NEW or AFREE.
    fn sync_working_to_committed(&mut self) {
        let fixed = self.committed().fixed;
        let bits = self.committed().bits.as_bytes().to_vec();
        let working = self.working_mut();
        working.fixed = fixed;
        working.bits = ImapBits::from_bytes(&bits);
    }

    pub fn node_header(kind_signature: u32) -> NodeHeader {
        NodeHeader::new(kind_signature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Used,
    New,
    AFree,
}

/// Loads both metaroot blocks and selects the committed one: the higher
/// sequence number whose signature and CRC both validate.
/// A corrupt metaroot is resynced in-cache from the valid one so both
/// in-memory views start identical; the stale on-disk copy is only
/// overwritten for real on the next `transact`.
pub fn select_committed<D: BlockDevice>(
    cache: &mut BufferCache<D>,
) -> Result<(usize, [BufHandle; 2])> {
    let block_size = cache.block_size() as usize;
    let mut raw = [alloc::vec![0u8; block_size], alloc::vec![0u8; block_size]];
    let mut valid = [false; 2];
    let mut seq = [0u64; 2];
    for (i, &block) in METAROOT_BLOCKS.iter().enumerate() {
        cache.io().read_block(block, &mut raw[i])?;
        valid[i] = node::verify_crc(&raw[i])
            && NodeHeader::read(&raw[i]).signature == node::signature::META;
        seq[i] = NodeHeader::read(&raw[i]).sequence;
    }

    let winner = match (valid[0], valid[1]) {
        (true, true) if seq[0] == seq[1] => {
            return Err(fubar!("both metaroots share sequence {}", seq[0]))
        }
        (true, true) => {
            if seq[0] > seq[1] {
                0
            } else {
                1
            }
        }
        (true, false) => 0,
        (false, true) => 1,
        (false, false) => return Err(Error::Io),
    };
    let loser = 1 - winner;

    let h_winner = cache.get(METAROOT_BLOCKS[winner], MetaKind::MetaRoot, GetFlags::default())?;
    let h_loser = cache.get(METAROOT_BLOCKS[loser], MetaKind::MetaRoot, GetFlags { new: true })?;
    cache.data_mut(h_loser).copy_from_slice(&raw[winner]);

    let mut handles = [0usize; 2];
    handles[winner] = h_winner;
    handles[loser] = h_loser;
    Ok((winner, handles))
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;
    use std::vec;

    use crate::io::BlockIo;

    struct RamDisk {
        sectors: vec::Vec<u8>,
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

    impl crate::device::BlockDevice for RamDisk {
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

    /// A metaroot with no backing imap/inode table to speak of: enough to
    /// exercise `alloc_block`'s reserve check and accounting in isolation.
    fn tiny_meta(free_blocks: u32, reserved_blocks: u32) -> (BufferCache<RamDisk>, MetaRoot) {
        let dev = RamDisk::new(64, 512);
        let io = BlockIo::new(dev, 512).unwrap();
        let mut cache = BufferCache::new(io, 8);
        let mut views = [None, None];
        for (i, &block) in METAROOT_BLOCKS.iter().enumerate() {
            let h = cache.get(block, MetaKind::MetaRoot, GetFlags { new: true }).unwrap();
            NodeHeader::new(node::signature::META).write(cache.data_mut(h));
            views[i] = Some(MetaRootView {
                handle: h,
                fixed: MetaRootFixed {
                    sector_crc: 0,
                    free_blocks,
                    free_inodes: 0,
                    alloc_ptr: 8,
                    orphan_head: 0,
                    orphan_tail: 0,
                    defunct_orphan_head: 0,
                },
                bits: ImapBits::zeroed(512 - METAROOT_HEADER_SIZE),
            });
        }
        let meta = MetaRoot {
            views,
            current: 0,
            branched: false,
            imap_layout: ImapLayout::Inline,
            imap_start_block: 8,
            first_allocable_block: 8,
            block_count: 64,
            reserved_blocks,
        };
        (cache, meta)
    }

    #[test]
    fn alloc_block_refuses_ordinary_allocation_inside_reserve() {
        let (mut cache, mut meta) = tiny_meta(4, 4);
        assert_eq!(meta.alloc_block(&mut cache, false), Err(Error::NoSpace));
        assert_eq!(meta.alloc_block(&mut cache, true), Ok(8));
    }

    #[test]
    fn alloc_block_allows_ordinary_allocation_above_the_reserve() {
        let (mut cache, mut meta) = tiny_meta(10, 4);
        assert_eq!(meta.alloc_block(&mut cache, false), Ok(8));
        assert_eq!(meta.working().fixed.free_blocks, 9);
    }
}

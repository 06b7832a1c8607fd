//! Cached inode and the indirect/double-indirect block tree.
//!
//! Grounded on the buffer-pinning discipline of the inline-imap driver
//! (every acquire paired with a release on every exit path) and on the
//! newtype-per-field style of an ext4 inode reader, simplified to a single
//! `Pod` header struct since this format carries far fewer fields.

use alloc::vec;
use alloc::vec::Vec;
use bytemuck::{Pod, Zeroable};

use crate::buffer::{BufHandle, BufferCache, GetFlags, MetaKind};
use crate::config::Geometry;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::metaroot::{BlockState, MetaRoot};
use crate::node::{self, NodeHeader};

/// Mode bits: high nibble is the type, low bits are POSIX-style permission
/// bits when `posix_owner_perm` is enabled.
pub mod mode {
    pub const TYPE_MASK: u32 = 0xF000;
    pub const DIR: u32 = 0x4000;
    pub const REG: u32 = 0x8000;
    pub const SYMLINK: u32 = 0xA000;
    pub const PERM_MASK: u32 = 0x0FFF;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InodeFixed {
    pub size: u64,
    pub blocks: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub uid: u32,
    pub gid: u32,
    pub link_count: u32,
    pub parent: u32,
    pub next_orphan: u32,
    pub mode: u32,
}

pub const INODE_FIXED_SIZE: usize = core::mem::size_of::<InodeFixed>();
pub const INODE_HEADER_SIZE: usize = node::NODE_HEADER_SIZE + INODE_FIXED_SIZE;

impl InodeFixed {
    pub fn to_le(self) -> Self {
        Self {
            size: self.size.to_le(),
            blocks: self.blocks.to_le(),
            atime: self.atime.to_le(),
            mtime: self.mtime.to_le(),
            ctime: self.ctime.to_le(),
            uid: self.uid.to_le(),
            gid: self.gid.to_le(),
            link_count: self.link_count.to_le(),
            parent: self.parent.to_le(),
            next_orphan: self.next_orphan.to_le(),
            mode: self.mode.to_le(),
        }
    }

    pub fn from_le(self) -> Self {
        Self {
            size: u64::from_le(self.size),
            blocks: u32::from_le(self.blocks),
            atime: u64::from_le(self.atime),
            mtime: u64::from_le(self.mtime),
            ctime: u64::from_le(self.ctime),
            uid: u32::from_le(self.uid),
            gid: u32::from_le(self.gid),
            link_count: u32::from_le(self.link_count),
            parent: u32::from_le(self.parent),
            next_orphan: u32::from_le(self.next_orphan),
            mode: u32::from_le(self.mode),
        }
    }
}

/// Which mode-type bits a caller will accept from `mount`.
#[derive(Debug, Clone, Copy)]
pub struct ExpectedType(u32);

impl ExpectedType {
    pub const DIR: ExpectedType = ExpectedType(mode::DIR);
    pub const REG: ExpectedType = ExpectedType(mode::REG);
    pub const SYMLINK: ExpectedType = ExpectedType(mode::SYMLINK);
    pub const ANY: ExpectedType = ExpectedType(0);

    pub const fn or(self, other: ExpectedType) -> ExpectedType {
        ExpectedType(self.0 | other.0)
    }

    fn matches(self, mode: u32) -> bool {
        self.0 == 0 || (mode & mode::TYPE_MASK) & self.0 != 0
    }
}

/// Exact path reaching logical block `logical` through the pointer tree:
/// which level it lives at, and the entry index at each level.
#[derive(Debug, Clone, Copy, Default)]
pub struct Coordinate {
    pub logical: u32,
    pub depth: u8,
    pub dindir_slot: u32,
    pub indir_slot: u32,
    pub data_slot: u32,
}

/// In-memory handle for a mounted inode: the inode buffer plus whichever
/// indirection-level buffers are currently pinned for the last traversal.
pub struct CachedInode {
    pub number: u32,
    pub handle: BufHandle,
    pub fixed: InodeFixed,
    pub coord: Coordinate,
    pub dindir: Option<(BufHandle, u32)>,
    pub indir: Option<(BufHandle, u32)>,
    /// Physical block of the current logical block, if allocated. Not
    /// pinned: `data_read`/`data_write` pin it transiently themselves.
    pub data: Option<u32>,
    pub branched: bool,
    pub dirty: bool,
}

pub fn inode_block(inode_table_start: u32, inode_num: u32) -> u32 {
    inode_table_start + (inode_num - 2)
}

impl CachedInode {
    /// Releases every buffer this handle may still hold pinned. Callers
    /// must invoke this on every exit path that tears down the handle.
    pub fn release<D: BlockDevice>(&mut self, cache: &mut BufferCache<D>) {
        self.data = None;
        if let Some((h, _)) = self.indir.take() {
            cache.put(h);
        }
        if let Some((h, _)) = self.dindir.take() {
            cache.put(h);
        }
        cache.put(self.handle);
    }

    fn write_back(&self, data: &mut [u8]) {
        data[node::NODE_HEADER_SIZE..node::NODE_HEADER_SIZE + INODE_FIXED_SIZE]
            .copy_from_slice(bytemuck::bytes_of(&self.fixed.to_le()));
    }

    fn pointers<'a>(data: &'a [u8]) -> &'a [u8] {
        &data[INODE_HEADER_SIZE..]
    }

    fn slot(data: &[u8], index: u32) -> u32 {
        let off = index as usize * 4;
        u32::from_le_bytes(Self::pointers(data)[off..off + 4].try_into().unwrap())
    }

    fn set_slot(data: &mut [u8], index: u32, value: u32) {
        let off = INODE_HEADER_SIZE + index as usize * 4;
        data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn node_slot(data: &[u8], index: u32) -> u32 {
        let off = node::NODE_HEADER_SIZE + 4 + index as usize * 4;
        u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
    }

    fn set_node_slot(data: &mut [u8], index: u32, value: u32) {
        let off = node::NODE_HEADER_SIZE + 4 + index as usize * 4;
        data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Loads the inode block, validates it, and optionally copy-on-write
/// branches it.
pub fn mount<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    inode_table_start: u32,
    number: u32,
    expected: ExpectedType,
    branch: bool,
) -> Result<CachedInode> {
    let block = inode_block(inode_table_start, number);
    let h = cache.get(block, MetaKind::Inode, GetFlags::default())?;
    let raw: InodeFixed = *bytemuck::from_bytes(
        &cache.data(h)[node::NODE_HEADER_SIZE..node::NODE_HEADER_SIZE + INODE_FIXED_SIZE],
    );
    let fixed = raw.from_le();
    if !expected.matches(fixed.mode) {
        cache.put(h);
        return Err(Error::Inval);
    }
    let mut ci = CachedInode {
        number,
        handle: h,
        fixed,
        coord: Coordinate::default(),
        dindir: None,
        indir: None,
        data: None,
        branched: false,
        dirty: false,
    };
    if branch {
        branch_inode(cache, meta, &mut ci)?;
    }
    Ok(ci)
}

fn branch_block<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    handle: BufHandle,
    old_block: u32,
    reserved: bool,
) -> Result<u32> {
    match meta.state(cache, old_block)? {
        BlockState::New => Ok(old_block),
        _ => {
            let new_block = meta.alloc_block(cache, reserved)?;
            cache.branch(handle, new_block)?;
            cache.mark_dirty(handle);
            meta.free_block(cache, old_block)?;
            Ok(new_block)
        }
    }
}

/// Inode blocks live at a fixed, formula-derived position in the inode
/// table (`inode_block`) for the inode's entire lifetime; unlike
/// indirect/double-indirect/data blocks they have no parent slot a
/// relocation could patch, so "branching" an inode is not a physical
/// copy-on-write move. Crash safety instead comes from the buffer cache
/// never touching the device until `MetaRoot::transact` flushes it:
/// a crash before that leaves the fixed-position bytes exactly as the
/// last commit wrote them. `branched` only gates the no-op fast path so
/// repeated mutating calls on the same handle don't redo any future
/// inode-local setup.
fn branch_inode<D: BlockDevice>(
    _cache: &mut BufferCache<D>,
    _meta: &mut MetaRoot,
    ci: &mut CachedInode,
) -> Result<()> {
    ci.branched = true;
    Ok(())
}

/// Populates `ci.coord` for logical block `logical`.
pub fn seek_and_read<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    geom: &Geometry,
    ci: &mut CachedInode,
    logical: u32,
    branch: bool,
    reserved: bool,
) -> Result<()> {
    ci.data = None;
    if let Some((h, _)) = ci.indir.take() {
        cache.put(h);
    }
    if let Some((h, _)) = ci.dindir.take() {
        cache.put(h);
    }

    let d = geom.direct;
    let i = geom.indirect;
    let epi = geom.entries_per_indirect;

    if logical < d {
        ci.coord = Coordinate {
            logical,
            depth: 1,
            data_slot: logical,
            ..Default::default()
        };
        let mut data_block = CachedInode::slot(cache.data(ci.handle), logical);
        if branch && data_block != 0 && meta.state(cache, data_block)? == BlockState::Used {
            let h = cache.get(data_block, MetaKind::Raw, GetFlags::default())?;
            let new_block = branch_block(cache, meta, h, data_block, reserved)?;
            cache.put(h);
            CachedInode::set_slot(cache.data_mut(ci.handle), logical, new_block);
            cache.mark_dirty(ci.handle);
            data_block = new_block;
        } else if branch && data_block == 0 {
            data_block = meta.alloc_block(cache, reserved)?;
            CachedInode::set_slot(cache.data_mut(ci.handle), logical, data_block);
            cache.mark_dirty(ci.handle);
        }
        ci.data = if data_block != 0 { Some(data_block) } else { None };
        return Ok(());
    }

    if logical < d + i * epi {
        let rel = logical - d;
        let indir_pointer_slot = d + rel / epi;
        let entry = rel % epi;
        let mut indir_block = CachedInode::slot(cache.data(ci.handle), indir_pointer_slot);
        if branch && indir_block != 0 {
            indir_block = branch_node(cache, meta, ci, indir_pointer_slot, indir_block, false, reserved)?;
        } else if branch && indir_block == 0 {
            indir_block = alloc_node(cache, meta, ci, indir_pointer_slot, false, 0, reserved)?;
        }
        ci.coord = Coordinate {
            logical,
            depth: 2,
            indir_slot: indir_pointer_slot,
            data_slot: entry,
            ..Default::default()
        };
        if indir_block != 0 {
            let h = cache.get(indir_block, MetaKind::Indirect, GetFlags::default())?;
            ci.indir = Some((h, indir_block));
            load_data_slot(cache, meta, ci, entry, branch, true, reserved)?;
        }
        return Ok(());
    }

    let rel = logical - d - i * epi;
    let dindir_pointer_slot = d + i + rel / (epi * epi);
    let inner_slot = (rel / epi) % epi;
    let entry = rel % epi;

    let mut dindir_block = CachedInode::slot(cache.data(ci.handle), dindir_pointer_slot);
    if branch && dindir_block != 0 {
        dindir_block = branch_node(cache, meta, ci, dindir_pointer_slot, dindir_block, false, reserved)?;
    } else if branch && dindir_block == 0 {
        dindir_block = alloc_node(cache, meta, ci, dindir_pointer_slot, false, 0, reserved)?;
    }
    ci.coord = Coordinate {
        logical,
        depth: 3,
        dindir_slot: dindir_pointer_slot,
        indir_slot: inner_slot,
        data_slot: entry,
    };
    if dindir_block == 0 {
        return Ok(());
    }
    let dh = cache.get(dindir_block, MetaKind::Dindirect, GetFlags::default())?;
    ci.dindir = Some((dh, dindir_block));

    let mut indir_block = CachedInode::node_slot(cache.data(dh), inner_slot);
    if branch && indir_block != 0 {
        let new_block = branch_node_in_parent(cache, meta, dh, indir_block, inner_slot, true, reserved)?;
        indir_block = new_block;
    } else if branch && indir_block == 0 {
        let new_block = meta.alloc_block(cache, reserved)?;
        let h = cache.get(new_block, MetaKind::Indirect, GetFlags { new: true })?;
        {
            let data = cache.data_mut(h);
            NodeHeader::new(node::signature::INDI).write(data);
            data[node::NODE_HEADER_SIZE..node::NODE_HEADER_SIZE + 4]
                .copy_from_slice(&ci.number.to_le_bytes());
        }
        cache.put(h);
        CachedInode::set_node_slot(cache.data_mut(dh), inner_slot, new_block);
        cache.mark_dirty(dh);
        indir_block = new_block;
    }
    if indir_block != 0 {
        let h = cache.get(indir_block, MetaKind::Indirect, GetFlags::default())?;
        ci.indir = Some((h, indir_block));
        load_data_slot(cache, meta, ci, entry, branch, true, reserved)?;
    }
    Ok(())
}

fn branch_node<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    ci: &mut CachedInode,
    inode_slot: u32,
    block: u32,
    _is_data: bool,
    reserved: bool,
) -> Result<u32> {
    if meta.state(cache, block)? != BlockState::Used {
        return Ok(block);
    }
    let h = cache.get(block, MetaKind::Indirect, GetFlags::default())?;
    let new_block = branch_block(cache, meta, h, block, reserved)?;
    cache.put(h);
    CachedInode::set_slot(cache.data_mut(ci.handle), inode_slot, new_block);
    cache.mark_dirty(ci.handle);
    Ok(new_block)
}

fn branch_node_in_parent<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    parent_handle: BufHandle,
    block: u32,
    parent_slot: u32,
    _inner: bool,
    reserved: bool,
) -> Result<u32> {
    if meta.state(cache, block)? != BlockState::Used {
        return Ok(block);
    }
    let h = cache.get(block, MetaKind::Indirect, GetFlags::default())?;
    let new_block = branch_block(cache, meta, h, block, reserved)?;
    cache.put(h);
    CachedInode::set_node_slot(cache.data_mut(parent_handle), parent_slot, new_block);
    cache.mark_dirty(parent_handle);
    Ok(new_block)
}

fn alloc_node<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    ci: &mut CachedInode,
    inode_slot: u32,
    dindir: bool,
    _unused: u32,
    reserved: bool,
) -> Result<u32> {
    let new_block = meta.alloc_block(cache, reserved)?;
    let sig = if dindir {
        node::signature::DBLI
    } else {
        node::signature::INDI
    };
    let h = cache.get(new_block, MetaKind::Indirect, GetFlags { new: true })?;
    {
        let data = cache.data_mut(h);
        NodeHeader::new(sig).write(data);
        data[node::NODE_HEADER_SIZE..node::NODE_HEADER_SIZE + 4]
            .copy_from_slice(&ci.number.to_le_bytes());
    }
    cache.put(h);
    CachedInode::set_slot(cache.data_mut(ci.handle), inode_slot, new_block);
    cache.mark_dirty(ci.handle);
    Ok(new_block)
}

fn load_data_slot<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    ci: &mut CachedInode,
    entry: u32,
    branch: bool,
    _through_indir: bool,
    reserved: bool,
) -> Result<()> {
    let (ih, _) = ci.indir.expect("indir must be loaded");
    let mut data_block = CachedInode::node_slot(cache.data(ih), entry);
    if branch && data_block != 0 && meta.state(cache, data_block)? == BlockState::Used {
        let h = cache.get(data_block, MetaKind::Raw, GetFlags::default())?;
        let new_block = branch_block(cache, meta, h, data_block, reserved)?;
        cache.put(h);
        CachedInode::set_node_slot(cache.data_mut(ih), entry, new_block);
        cache.mark_dirty(ih);
        data_block = new_block;
    }
    ci.data = if data_block != 0 { Some(data_block) } else { None };
    Ok(())
}

/// True if `logical`'s data slot is allocated (non-sparse) after the last
/// `seek_and_read`.
pub fn is_sparse(ci: &CachedInode) -> bool {
    ci.data.map(|b| b == 0).unwrap_or(true)
}

/// Reads `len` bytes at `offset` into `buf`, splitting into leading
/// partial block, full middle blocks (bypass cache), and trailing partial
/// block; sparse ranges read as zero without touching the device.
pub fn data_read<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    geom: &Geometry,
    ci: &mut CachedInode,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let size = ci.fixed.size;
    if offset >= size {
        return Ok(0);
    }
    let len = (buf.len() as u64).min(size - offset) as usize;
    let bs = geom.block_size as u64;
    let mut done = 0usize;
    while done < len {
        let pos = offset + done as usize as u64;
        let logical = (pos / bs) as u32;
        let in_block = (pos % bs) as usize;
        let chunk = (bs as usize - in_block).min(len - done);
        seek_and_read(cache, meta, geom, ci, logical, false, false)?;
        match ci.data {
            None => {
                buf[done..done + chunk].fill(0);
            }
            Some(0) => {
                buf[done..done + chunk].fill(0);
            }
            Some(block) => {
                let h = cache.get(block, MetaKind::Raw, GetFlags::default())?;
                buf[done..done + chunk]
                    .copy_from_slice(&cache.data(h)[in_block..in_block + chunk]);
                cache.put(h);
            }
        }
        done += chunk;
    }
    Ok(len)
}

/// Writes `buf` at `offset`, branching or allocating blocks as needed.
pub fn data_write<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    geom: &Geometry,
    ci: &mut CachedInode,
    offset: u64,
    buf: &[u8],
) -> Result<usize> {
    let bs = geom.block_size as u64;
    let mut done = 0usize;
    while done < buf.len() {
        let pos = offset + done as u64;
        let logical = (pos / bs) as u32;
        let in_block = (pos % bs) as usize;
        let chunk = (bs as usize - in_block).min(buf.len() - done);
        seek_and_read(cache, meta, geom, ci, logical, true, false)?;
        let block = match ci.data {
            Some(b) if b != 0 => b,
            _ => return Err(fubar!("data slot still sparse after branching write path")),
        };
        let full_block = in_block == 0 && chunk as u64 == bs;
        let h = if full_block {
            cache.get(block, MetaKind::Raw, GetFlags { new: true })?
        } else {
            cache.get(block, MetaKind::Raw, GetFlags::default())?
        };
        cache.data_mut(h)[in_block..in_block + chunk].copy_from_slice(&buf[done..done + chunk]);
        cache.mark_dirty(h);
        cache.put(h);
        done += chunk;
    }
    let new_end = offset + buf.len() as u64;
    if new_end > ci.fixed.size {
        ci.fixed.size = new_end;
        ci.dirty = true;
    }
    Ok(done)
}

/// Frees every block beyond `size`, respecting the four-state model:
/// USED blocks go AFREE, NEW blocks go FREE outright. Once a leaf data
/// block frees an indirect or double-indirect node down to all-zero
/// slots, that node block is reclaimed too and its own parent slot
/// zeroed, all the way up to the inode.
///
/// `reserved` allows this truncate to dip into the metaroot's withheld
/// block pool: freeing an already-`Used` block still requires branching
/// it to a fresh block first before the free takes effect.
pub fn data_truncate<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    geom: &Geometry,
    ci: &mut CachedInode,
    size: u64,
    reserved: bool,
) -> Result<()> {
    if size >= ci.fixed.size {
        ci.fixed.size = size;
        ci.dirty = true;
        return Ok(());
    }
    let bs = geom.block_size as u64;
    let first_freed_logical = ((size + bs - 1) / bs) as u32;
    let last_logical = ((ci.fixed.size + bs - 1) / bs) as u32;
    let epi = geom.entries_per_indirect;
    let mut logical = first_freed_logical;
    while logical < last_logical {
        seek_and_read(cache, meta, geom, ci, logical, true, reserved)?;
        if let Some(block) = ci.data.take() {
            if block != 0 {
                free_logical_block(cache, meta, ci, block)?;
                reclaim_emptied_nodes(cache, meta, ci, epi)?;
            }
        }
        logical += 1;
    }
    ci.fixed.size = size;
    ci.dirty = true;
    Ok(())
}

fn free_logical_block<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    ci: &mut CachedInode,
    block: u32,
) -> Result<()> {
    match meta.state(cache, block)? {
        BlockState::New => meta.free_block(cache, block),
        BlockState::Used => meta.free_block(cache, block),
        _ => Ok(()),
    }?;
    if ci.coord.depth == 1 {
        CachedInode::set_slot(cache.data_mut(ci.handle), ci.coord.data_slot, 0);
        cache.mark_dirty(ci.handle);
    } else if let Some((ih, _)) = ci.indir {
        let slot = ci.coord.data_slot;
        CachedInode::set_node_slot(cache.data_mut(ih), slot, 0);
        cache.mark_dirty(ih);
    }
    Ok(())
}

/// After freeing a leaf data block, checks whether the indirect node (and,
/// at depth 3, the double-indirect node above it) it lived under is now
/// entirely zero, and if so frees the node block itself and zeroes the
/// slot in its own parent that pointed to it.
fn reclaim_emptied_nodes<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    ci: &mut CachedInode,
    epi: u32,
) -> Result<()> {
    if ci.coord.depth < 2 {
        return Ok(());
    }
    let Some((ih, indir_block)) = ci.indir else {
        return Ok(());
    };
    if !node_slots_all_zero(cache.data(ih), epi) {
        return Ok(());
    }
    free_tree_block(cache, meta, indir_block)?;
    if ci.coord.depth == 2 {
        CachedInode::set_slot(cache.data_mut(ci.handle), ci.coord.indir_slot, 0);
        cache.mark_dirty(ci.handle);
    } else if let Some((dh, dindir_block)) = ci.dindir {
        CachedInode::set_node_slot(cache.data_mut(dh), ci.coord.indir_slot, 0);
        cache.mark_dirty(dh);
        if node_slots_all_zero(cache.data(dh), epi) {
            free_tree_block(cache, meta, dindir_block)?;
            CachedInode::set_slot(cache.data_mut(ci.handle), ci.coord.dindir_slot, 0);
            cache.mark_dirty(ci.handle);
            cache.put(dh);
            cache.discard(dh)?;
            ci.dindir = None;
        }
    }
    cache.put(ih);
    cache.discard(ih)?;
    ci.indir = None;
    Ok(())
}

fn node_slots_all_zero(data: &[u8], count: u32) -> bool {
    (0..count).all(|i| CachedInode::node_slot(data, i) == 0)
}

/// Frees `block` through the metaroot if it is currently USED or NEW;
/// a block already FREE or AFREE is left alone.
fn free_tree_block<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    block: u32,
) -> Result<()> {
    match meta.state(cache, block)? {
        BlockState::New | BlockState::Used => meta.free_block(cache, block),
        _ => Ok(()),
    }
}

/// Drops the link count; frees the inode immediately, or splices it onto
/// the orphan list when delete-while-open applies.
pub fn link_dec<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    geom: &Geometry,
    ci: &mut CachedInode,
    as_orphan: bool,
    delete_open_enabled: bool,
) -> Result<()> {
    ci.fixed.link_count = ci.fixed.link_count.saturating_sub(1);
    ci.dirty = true;
    if ci.fixed.link_count > 0 {
        return Ok(());
    }
    if delete_open_enabled && as_orphan {
        ci.fixed.next_orphan = meta.working().fixed.orphan_head;
        meta.working_mut().fixed.orphan_head = ci.number;
        meta.branched = true;
        return Ok(());
    }
    data_truncate(cache, meta, geom, ci, 0, true)?;
    // The inode's own block is a permanent member of the fixed inode
    // table (see `branch_inode`), never a general-pool allocation, so
    // freeing it here would hand its fixed slot to `alloc_block` as if it
    // were ordinary free space. Clearing `mode` is what marks the slot
    // reusable: `Volume::alloc_inode` scans for `mode == 0`.
    ci.fixed.mode = 0;
    ci.dirty = true;
    Ok(())
}

/// Flushes `ci`'s in-memory fixed fields back into its pinned buffer.
pub fn sync<D: BlockDevice>(cache: &mut BufferCache<D>, ci: &mut CachedInode) {
    if !ci.dirty {
        return;
    }
    ci.write_back(cache.data_mut(ci.handle));
    cache.mark_dirty(ci.handle);
    ci.dirty = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    #[test]
    fn expected_type_matches_directory() {
        assert!(ExpectedType::DIR.matches(mode::DIR | 0o755));
        assert!(!ExpectedType::DIR.matches(mode::REG));
        assert!(ExpectedType::DIR.or(ExpectedType::REG).matches(mode::REG));
    }
}

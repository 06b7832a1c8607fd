//! Format routine: lays down the master block, both metaroots, the imap,
//! and the root inode (or FSE file-slot table) on a fresh device.

use alloc::vec;

use crate::buffer::{BufferCache, GetFlags, MetaKind};
use crate::config::{incompat, ro_compat, ApiFlavor, Config, Geometry, InodeCountCfg};
use crate::device::BlockDevice;
use crate::dir::ROOT_INODE;
use crate::error::{Error, Result};
use crate::imap::ImapLayout;
use crate::inode::{self, mode, InodeFixed, INODE_HEADER_SIZE};
use crate::io::BlockIo;
use crate::metaroot::{MetaRoot, MetaRootFixed, METAROOT_BLOCKS, METAROOT_HEADER_SIZE};
use crate::node::{self, MasterBlock, NodeHeader};

/// Minimum inode count regardless of the `auto` formula's result, so a
/// tiny volume still has somewhere to put a root directory and a few
/// files.
const MIN_INODE_COUNT: u32 = 16;

/// Preserves the original auto-sizing formula verbatim for on-disk image
/// compatibility: empirical, not load-bearing
/// for correctness.
pub fn auto_inode_count(block_count: u32) -> u32 {
    core::cmp::max(MIN_INODE_COUNT, block_count / 18)
}

struct Layout {
    inode_count: u32,
    inode_table_start: u32,
    imap_layout: ImapLayout,
    first_allocable_block: u32,
}

fn compute_layout(cfg: &Config, block_count: u32) -> Result<Layout> {
    let inode_count = match cfg.inode_count {
        InodeCountCfg::Auto => auto_inode_count(block_count),
        InodeCountCfg::Fixed(n) => n,
    };
    let inode_table_start = METAROOT_BLOCKS[1] + 1;
    let inode_table_blocks = inode_count;
    // The imap bitmap covers both the inode table and the general
    // allocable region (rednodes.h's METAROOT::abEntries comment: "which
    // inode blocks are used and which allocable blocks are used"), so its
    // bit count is measured from the start of the inode table, not from
    // the first block past it.
    let bitmap_area = cfg.block_size as usize - METAROOT_HEADER_SIZE;
    let total_bits = block_count.saturating_sub(inode_table_start);
    let inline_fits = (total_bits as usize + 7) / 8 <= bitmap_area;

    let imap_layout = if inline_fits && cfg.imap_inline_allowed {
        ImapLayout::Inline
    } else if cfg.imap_external_allowed {
        let bits_per_node = (cfg.block_size - node::NODE_HEADER_SIZE as u32 - 4) * 8;
        let node_count = (total_bits + bits_per_node - 1) / bits_per_node;
        ImapLayout::External {
            node_start_block: inode_table_start + inode_table_blocks,
            node_count,
            bits_per_node,
        }
    } else {
        return Err(Error::Inval);
    };

    let first_allocable_block = match imap_layout {
        ImapLayout::Inline => inode_table_start + inode_table_blocks,
        ImapLayout::External {
            node_start_block,
            node_count,
            ..
        } => node_start_block + node_count * 2,
    };

    Ok(Layout {
        inode_count,
        inode_table_start,
        imap_layout,
        first_allocable_block,
    })
}

/// Runs the format sequence on an already-opened, already-sized device,
/// returning it once every step has been flushed durably. Idempotent: a
/// second call against the same geometry reproduces the same on-disk
/// state.
pub fn format<D: BlockDevice>(dev: D, cfg: &Config) -> Result<D> {
    let geom = Geometry::from_config(cfg)?;
    let mut io = BlockIo::new(dev, cfg.block_size)?;
    let block_count = io.block_count() as u32;

    // Step 1: zero block 0 and flush. An interrupted format is therefore
    // unmountable (no valid master block signature survives a crash here).
    let zero = vec![0u8; cfg.block_size as usize];
    io.write_block(0, &zero)?;
    io.flush()?;

    let mut cache = BufferCache::new(io, 64);
    let layout = compute_layout(cfg, block_count)?;

    // Step 4: for external imap, zero both copies of every imap node.
    if let ImapLayout::External {
        node_start_block,
        node_count,
        ..
    } = layout.imap_layout
    {
        for n in 0..node_count {
            for copy in 0..2u32 {
                let block = node_start_block + n * 2 + copy;
                let h = cache.get(block, MetaKind::Imap, GetFlags { new: true })?;
                NodeHeader::new(node::signature::IMAP).write(cache.data_mut(h));
                cache.mark_dirty(h);
                cache.put(h);
            }
        }
    }

    // Step 5: write the first metaroot fully empty, forward-allocation
    // pointer at the first allocable block; mark branched; transact.
    let free_blocks = block_count - layout.first_allocable_block;
    let free_inodes = match cfg.api {
        ApiFlavor::Posix => layout.inode_count - 1,
        ApiFlavor::Fse => 0,
    };

    let mut meta = mount_empty_metaroots(&mut cache, &layout, free_blocks, free_inodes)?;
    // The inode table is permanently allocated and shares the same imap
    // bitmap as the general allocable region; mark its blocks used before
    // the first transaction so they never read as FREE.
    for slot in 0..layout.inode_count {
        meta.mark_preallocated(&mut cache, layout.inode_table_start + slot)?;
    }
    meta.branched = true;
    meta.transact(&mut cache)?;

    // Step 6: create the root directory (POSIX) or pre-create file slots
    // (FSE), then transact a second time.
    match cfg.api {
        ApiFlavor::Posix => create_root_directory(&mut cache, &mut meta, &layout, cfg)?,
        ApiFlavor::Fse => precreate_file_slots(&mut cache, &mut meta, &layout)?,
    }
    meta.transact(&mut cache)?;

    // Step 8: write the master block with feature flags reflecting the
    // compiled configuration, and flush.
    write_master_block(&mut cache, cfg, &layout, block_count)?;
    cache.flush_device()?;
    Ok(cache.into_io().into_device())
}

fn mount_empty_metaroots<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    layout: &Layout,
    free_blocks: u32,
    free_inodes: u32,
) -> Result<MetaRoot> {
    let mut views = [None, None];
    for (i, &block) in METAROOT_BLOCKS.iter().enumerate() {
        let h = cache.get(block, MetaKind::MetaRoot, GetFlags { new: true })?;
        NodeHeader::new(node::signature::META).write(cache.data_mut(h));
        let fixed = MetaRootFixed {
            sector_crc: 0,
            free_blocks,
            free_inodes,
            alloc_ptr: layout.first_allocable_block,
            orphan_head: 0,
            orphan_tail: 0,
            defunct_orphan_head: 0,
        };
        {
            let data = cache.data_mut(h);
            data[node::NODE_HEADER_SIZE..METAROOT_HEADER_SIZE]
                .copy_from_slice(bytemuck::bytes_of(&fixed.to_le()));
        }
        cache.mark_dirty(h);
        let bits_bytes = match layout.imap_layout {
            ImapLayout::Inline => cache.block_size() as usize - METAROOT_HEADER_SIZE,
            // One selector bit per external imap node, not one bit per block.
            ImapLayout::External { node_count, .. } => ((node_count as usize) + 7) / 8,
        };
        views[i] = Some(crate::metaroot::MetaRootView {
            handle: h,
            fixed,
            bits: crate::imap::ImapBits::zeroed(bits_bytes),
        });
    }
    Ok(MetaRoot {
        views,
        current: 0,
        branched: false,
        imap_layout: layout.imap_layout,
        imap_start_block: layout.inode_table_start,
        first_allocable_block: layout.first_allocable_block,
        block_count: layout.first_allocable_block + free_blocks,
        reserved_blocks: crate::metaroot::reserved_block_count(free_blocks),
    })
}

fn create_root_directory<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    meta: &mut MetaRoot,
    layout: &Layout,
    cfg: &Config,
) -> Result<()> {
    let block = inode::inode_block(layout.inode_table_start, ROOT_INODE);
    let h = cache.get(block, MetaKind::Inode, GetFlags { new: true })?;
    NodeHeader::new(node::signature::INODE).write(cache.data_mut(h));
    let link_count = if cfg.posix_link { 2 } else { 1 };
    let fixed = InodeFixed {
        size: 0,
        blocks: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        uid: 0,
        gid: 0,
        link_count,
        parent: ROOT_INODE,
        next_orphan: 0,
        mode: mode::DIR | 0o755,
    };
    cache.data_mut(h)[node::NODE_HEADER_SIZE..INODE_HEADER_SIZE]
        .copy_from_slice(bytemuck::bytes_of(&fixed.to_le()));
    cache.mark_dirty(h);
    cache.put(h);
    let _ = meta;
    Ok(())
}

fn precreate_file_slots<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    _meta: &mut MetaRoot,
    layout: &Layout,
) -> Result<()> {
    for slot in 0..layout.inode_count {
        let ino = 2 + slot;
        let block = inode::inode_block(layout.inode_table_start, ino);
        let h = cache.get(block, MetaKind::Inode, GetFlags { new: true })?;
        NodeHeader::new(node::signature::INODE).write(cache.data_mut(h));
        cache.mark_dirty(h);
        cache.put(h);
    }
    Ok(())
}

fn write_master_block<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    cfg: &Config,
    layout: &Layout,
    block_count: u32,
) -> Result<()> {
    let mut incompat_bits = 0u32;
    if cfg.api == ApiFlavor::Posix {
        incompat_bits |= incompat::POSIX_API;
    }
    if cfg.delete_open {
        incompat_bits |= incompat::DELETE_OPEN;
    }
    if matches!(layout.imap_layout, ImapLayout::External { .. }) {
        incompat_bits |= incompat::IMAP_EXTERNAL;
    }
    if cfg.endian_swap {
        incompat_bits |= incompat::ENDIAN_SWAP;
    }

    let mut ro_bits = 0u32;
    if cfg.posix_owner_perm {
        ro_bits |= ro_compat::POSIX_OWNER_PERM;
    }
    if cfg.posix_symlink {
        ro_bits |= ro_compat::POSIX_SYMLINK;
    }
    if cfg.inode_timestamps {
        ro_bits |= ro_compat::INODE_TIMESTAMPS;
    }
    if cfg.inode_blocks {
        ro_bits |= ro_compat::INODE_BLOCKS;
    }

    let mb = MasterBlock {
        signature: node::signature::MASTER,
        version: 1,
        format_time: 0,
        inode_count: layout.inode_count,
        block_count,
        name_max: cfg.name_max,
        direct_pointers: cfg.direct_pointers,
        indirect_pointers: cfg.indirect_pointers,
        block_size_log2: cfg.block_size.trailing_zeros() as u8,
        sector_size_log2: 0,
        legacy_flags: node::LEGACY_FLAGS,
        _pad: 0,
        incompat: incompat_bits,
        ro_compat: ro_bits,
    };
    let h = cache.get(0, MetaKind::Master, GetFlags { new: true })?;
    mb.write(cache.data_mut(h));
    cache.mark_dirty(h);
    cache.flush_one(h)?;
    cache.put(h);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    #[test]
    fn auto_inode_count_matches_formula() {
        assert_eq!(auto_inode_count(1024 * 18), 1024);
        assert_eq!(auto_inode_count(1), MIN_INODE_COUNT);
    }
}

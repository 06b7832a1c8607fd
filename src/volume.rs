//! Ties the layers together: mounting a device, and the file/directory
//! operations exposed at the core boundary.
//!
//! Replaces the original design's global "current volume" singleton with
//! an explicit, owned struct threaded through every call.

use alloc::vec;
use alloc::vec::Vec;

use crate::buffer::{BufferCache, GetFlags, MetaKind};
use crate::config::{Config, Geometry, SUPPORTED_INCOMPAT, SUPPORTED_RO_COMPAT};
use crate::device::BlockDevice;
use crate::dir::{self, ROOT_INODE};
use crate::error::{Error, Result};
use crate::imap::ImapLayout;
use crate::inode::{self, mode, CachedInode, ExpectedType};
use crate::io::BlockIo;
use crate::metaroot::{self, MetaRoot};
use crate::node::{self, MasterBlock};

/// Inodes freed on the last close of an orphan that mount could not free
/// outright (delete-while-open remained enabled across the remount), for
/// the embedding application to drain at its convenience.
pub struct DefunctOrphans {
    pub head: u32,
}

/// An open, mounted volume: geometry, metaroot/transaction state, buffer
/// cache, and the block device, all owned by one value.
pub struct Volume<D: BlockDevice> {
    pub cfg: Config,
    pub geom: Geometry,
    pub cache: BufferCache<D>,
    pub meta: MetaRoot,
    pub inode_table_start: u32,
    pub inode_count: u32,
    pub read_only: bool,
    pub defunct_orphans: DefunctOrphans,
    fubar: bool,
}

impl<D: BlockDevice> Volume<D> {
    /// Formats `dev` per `cfg`, returning it for an immediate `mount`.
    /// See [`crate::format::format`].
    pub fn format(dev: D, cfg: &Config) -> Result<D> {
        crate::format::format(dev, cfg)
    }

    /// Opens the device, validates the master block, selects the
    /// committed metaroot, and drains or hands off the orphan list.
    pub fn mount(dev: D, cfg: Config) -> Result<Self> {
        let geom = Geometry::from_config(&cfg)?;
        let mut io = BlockIo::new(dev, cfg.block_size)?;
        let block_count = io.block_count() as u32;
        let mut master_buf = vec![0u8; cfg.block_size as usize];
        io.read_block(0, &mut master_buf)?;
        let mb = MasterBlock::read(&master_buf).ok_or(Error::Io)?;

        if mb.incompat & !SUPPORTED_INCOMPAT != 0 {
            return Err(Error::NotSupp);
        }
        let read_only = cfg.read_only || mb.ro_compat & !SUPPORTED_RO_COMPAT != 0;
        if mb.block_size_log2 != cfg.block_size.trailing_zeros() as u8 {
            return Err(Error::Inval);
        }

        let mut cache = BufferCache::new(io, 64);
        let (current, handles) = metaroot::select_committed(&mut cache)?;

        let imap_external = mb.incompat & crate::config::incompat::IMAP_EXTERNAL != 0;
        let inode_table_start = metaroot::METAROOT_BLOCKS[1] + 1;
        let inode_table_blocks = mb.inode_count;
        // The imap bitmap covers the inode table as well as the general
        // allocable region (see DESIGN.md), so bit counts are measured from
        // the inode table's start, matching format.rs's compute_layout.
        let total_bits = block_count.saturating_sub(inode_table_start);
        let first_allocable_block;
        let imap_layout;
        if imap_external {
            let node_start_block = inode_table_start + inode_table_blocks;
            let bits_per_node = (cfg.block_size - node::NODE_HEADER_SIZE as u32 - 4) * 8;
            let node_count = (total_bits + bits_per_node - 1) / bits_per_node;
            first_allocable_block = node_start_block + node_count * 2;
            imap_layout = ImapLayout::External {
                node_start_block,
                node_count,
                bits_per_node,
            };
        } else {
            first_allocable_block = inode_table_start + inode_table_blocks;
            imap_layout = ImapLayout::Inline;
        }

        let views = build_metaroot_views(&mut cache, handles, imap_layout)?;
        let meta = MetaRoot {
            views,
            current,
            branched: false,
            imap_layout,
            imap_start_block: inode_table_start,
            first_allocable_block,
            block_count,
            reserved_blocks: metaroot::reserved_block_count(block_count.saturating_sub(first_allocable_block)),
        };

        let mut vol = Self {
            cfg,
            geom,
            cache,
            meta,
            inode_table_start,
            inode_count: mb.inode_count,
            read_only,
            defunct_orphans: DefunctOrphans { head: 0 },
            fubar: false,
        };
        vol.handle_orphans()?;
        Ok(vol)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fubar {
            return Err(Error::Fubar);
        }
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn poison_on_err<T>(&mut self, r: Result<T>) -> Result<T> {
        if let Err(Error::Fubar) = r {
            self.fubar = true;
        }
        r
    }

    /// Walks the committed orphan list at mount time: frees every orphan
    /// outright if delete-while-open is disabled for this mount, otherwise
    /// transfers the list into `defunct_orphans` for the application to
    /// drain.
    fn handle_orphans(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let head = self.meta.working().fixed.orphan_head;
        if head == 0 {
            return Ok(());
        }
        if !self.cfg.delete_open {
            crate::info!("volume", "reclaiming orphan chain starting at inode {}", head);
            let mut cur = head;
            while cur != 0 {
                let mut ci = inode::mount(
                    &mut self.cache,
                    &mut self.meta,
                    self.inode_table_start,
                    cur,
                    ExpectedType::ANY,
                    true,
                )?;
                let next = ci.fixed.next_orphan;
                inode::data_truncate(&mut self.cache, &mut self.meta, &self.geom, &mut ci, 0, true)?;
                // The inode's block is a permanent member of the fixed
                // inode table, not general-pool space to free; clearing
                // `mode` is what marks the slot reusable (see
                // `inode::link_dec`).
                ci.fixed.mode = 0;
                ci.dirty = true;
                inode::sync(&mut self.cache, &mut ci);
                ci.release(&mut self.cache);
                cur = next;
            }
            self.meta.working_mut().fixed.orphan_head = 0;
            self.meta.branched = true;
            self.meta.transact(&mut self.cache)?;
        } else {
            crate::info!("volume", "transferring orphan chain starting at inode {} to the embedder", head);
            self.defunct_orphans.head = head;
            self.meta.working_mut().fixed.orphan_head = 0;
            self.meta.branched = true;
            self.meta.transact(&mut self.cache)?;
        }
        Ok(())
    }

    /// Consumes the volume and returns the underlying block device,
    /// discarding all in-memory cache/transaction state. Used by tests to
    /// simulate a power-cycle against only the durably written bytes.
    pub fn into_device(self) -> D {
        self.cache.into_io().into_device()
    }

    pub fn stat_root(&mut self) -> Result<(u64, u32, u32)> {
        let mut ci = inode::mount(
            &mut self.cache,
            &mut self.meta,
            self.inode_table_start,
            ROOT_INODE,
            ExpectedType::DIR,
            false,
        )?;
        let result = (ci.fixed.size, ci.fixed.link_count, ci.number);
        ci.release(&mut self.cache);
        Ok(result)
    }

    fn mount_dir(&mut self, inode_num: u32, branch: bool) -> Result<CachedInode> {
        inode::mount(
            &mut self.cache,
            &mut self.meta,
            self.inode_table_start,
            inode_num,
            ExpectedType::DIR,
            branch,
        )
    }

    fn alloc_inode(&mut self) -> Result<u32> {
        for ino in 2..2 + self.inode_count {
            let block = inode::inode_block(self.inode_table_start, ino);
            let h = self.cache.get(block, MetaKind::Inode, GetFlags::default())?;
            let in_use = {
                let raw: crate::inode::InodeFixed = *bytemuck::from_bytes(
                    &self.cache.data(h)[node::NODE_HEADER_SIZE
                        ..node::NODE_HEADER_SIZE + crate::inode::INODE_FIXED_SIZE],
                );
                raw.from_le().mode != 0
            };
            self.cache.put(h);
            if !in_use {
                return Ok(ino);
            }
        }
        Err(Error::TooManyFiles)
    }

    /// Creates a regular file or directory `name` under `parent_inode`.
    pub fn create(&mut self, parent_inode: u32, name: &[u8], is_dir: bool) -> Result<u32> {
        self.check_writable()?;
        let r = self.create_inner(parent_inode, name, is_dir);
        self.poison_on_err(r)
    }

    fn create_inner(&mut self, parent_inode: u32, name: &[u8], is_dir: bool) -> Result<u32> {
        let mut parent = self.mount_dir(parent_inode, true)?;
        let new_ino = match self.alloc_inode() {
            Ok(n) => n,
            Err(e) => {
                parent.release(&mut self.cache);
                return Err(e);
            }
        };
        let res = (|| {
            let block = inode::inode_block(self.inode_table_start, new_ino);
            let h = self
                .cache
                .get(block, MetaKind::Inode, GetFlags { new: true })?;
            let fixed = crate::inode::InodeFixed {
                size: 0,
                blocks: 0,
                atime: 0,
                mtime: 0,
                ctime: 0,
                uid: 0,
                gid: 0,
                link_count: 1,
                parent: parent_inode,
                next_orphan: 0,
                mode: if is_dir {
                    mode::DIR | 0o755
                } else {
                    mode::REG | 0o644
                },
            };
            self.cache.data_mut(h)
                [node::NODE_HEADER_SIZE..crate::inode::INODE_HEADER_SIZE]
                .copy_from_slice(bytemuck::bytes_of(&fixed.to_le()));
            self.cache.mark_dirty(h);
            self.cache.put(h);
            dir::create(&mut self.cache, &mut self.meta, &self.geom, &mut parent, name, new_ino)?;
            self.meta.working_mut().fixed.free_inodes =
                self.meta.working().fixed.free_inodes.saturating_sub(1);
            self.meta.branched = true;
            self.meta.transact(&mut self.cache)
        })();
        parent.release(&mut self.cache);
        res?;
        Ok(new_ino)
    }

    /// Looks up `name` under `parent_inode`.
    pub fn lookup(&mut self, parent_inode: u32, name: &[u8]) -> Result<u32> {
        let mut parent = self.mount_dir(parent_inode, false)?;
        let r = dir::lookup(&mut self.cache, &mut self.meta, &self.geom, &mut parent, name);
        parent.release(&mut self.cache);
        Ok(r?.1)
    }

    /// Reads `buf.len()` bytes at `offset` from `inode_num`'s data.
    pub fn read(&mut self, inode_num: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut ci = inode::mount(
            &mut self.cache,
            &mut self.meta,
            self.inode_table_start,
            inode_num,
            ExpectedType::REG.or(ExpectedType::DIR),
            false,
        )?;
        let r = inode::data_read(&mut self.cache, &mut self.meta, &self.geom, &mut ci, offset, buf);
        ci.release(&mut self.cache);
        r
    }

    /// Writes `buf` at `offset` into `inode_num`'s data, committing the
    /// transaction before returning.
    pub fn write(&mut self, inode_num: u32, offset: u64, buf: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let r = self.write_inner(inode_num, offset, buf);
        self.poison_on_err(r)
    }

    fn write_inner(&mut self, inode_num: u32, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut ci = inode::mount(
            &mut self.cache,
            &mut self.meta,
            self.inode_table_start,
            inode_num,
            ExpectedType::REG,
            true,
        )?;
        let res = (|| {
            let n = inode::data_write(&mut self.cache, &mut self.meta, &self.geom, &mut ci, offset, buf)?;
            inode::sync(&mut self.cache, &mut ci);
            self.meta.transact(&mut self.cache)?;
            Ok(n)
        })();
        ci.release(&mut self.cache);
        res
    }

    /// Truncates `inode_num`'s data to `size`, committing the transaction.
    pub fn truncate(&mut self, inode_num: u32, size: u64) -> Result<()> {
        self.check_writable()?;
        let r = self.truncate_inner(inode_num, size);
        self.poison_on_err(r)
    }

    fn truncate_inner(&mut self, inode_num: u32, size: u64) -> Result<()> {
        let mut ci = inode::mount(
            &mut self.cache,
            &mut self.meta,
            self.inode_table_start,
            inode_num,
            ExpectedType::REG,
            true,
        )?;
        let res = (|| {
            inode::data_truncate(&mut self.cache, &mut self.meta, &self.geom, &mut ci, size, true)?;
            inode::sync(&mut self.cache, &mut ci);
            self.meta.transact(&mut self.cache)
        })();
        ci.release(&mut self.cache);
        res
    }

    /// Removes `name` from `parent_inode`, decrementing the target's link
    /// count.
    pub fn unlink(&mut self, parent_inode: u32, name: &[u8]) -> Result<()> {
        self.check_writable()?;
        let r = self.unlink_inner(parent_inode, name);
        self.poison_on_err(r)
    }

    fn unlink_inner(&mut self, parent_inode: u32, name: &[u8]) -> Result<()> {
        let mut parent = self.mount_dir(parent_inode, true)?;
        let res = (|| {
            let (offset, target_ino) =
                dir::lookup(&mut self.cache, &mut self.meta, &self.geom, &mut parent, name)?;
            let mut target = inode::mount(
                &mut self.cache,
                &mut self.meta,
                self.inode_table_start,
                target_ino,
                ExpectedType::ANY,
                true,
            )?;
            if target.fixed.mode & mode::TYPE_MASK == mode::DIR
                && !dir::is_empty(&mut self.cache, &mut self.meta, &self.geom, &mut target)?
            {
                target.release(&mut self.cache);
                return Err(Error::NotEmpty);
            }
            dir::delete(&mut self.cache, &mut self.meta, &self.geom, &mut parent, offset)?;
            inode::link_dec(
                &mut self.cache,
                &mut self.meta,
                &self.geom,
                &mut target,
                true,
                self.cfg.delete_open,
            )?;
            if target.fixed.mode == 0 {
                self.meta.working_mut().fixed.free_inodes += 1;
            }
            inode::sync(&mut self.cache, &mut target);
            target.release(&mut self.cache);
            self.meta.transact(&mut self.cache)
        })();
        parent.release(&mut self.cache);
        res
    }

    /// Renames `src_name` under `src_parent` to `dst_name` under
    /// `dst_parent`.
    pub fn rename(
        &mut self,
        src_parent: u32,
        src_name: &[u8],
        dst_parent: u32,
        dst_name: &[u8],
    ) -> Result<()> {
        self.check_writable()?;
        let r = self.rename_inner(src_parent, src_name, dst_parent, dst_name);
        self.poison_on_err(r)
    }

    fn rename_inner(
        &mut self,
        src_parent_ino: u32,
        src_name: &[u8],
        dst_parent_ino: u32,
        dst_name: &[u8],
    ) -> Result<()> {
        if src_parent_ino == dst_parent_ino && src_name == dst_name {
            return Ok(());
        }
        let mut src_parent = self.mount_dir(src_parent_ino, true)?;
        let lookup_src = dir::lookup(&mut self.cache, &mut self.meta, &self.geom, &mut src_parent, src_name);
        let (src_off, src_ino) = match lookup_src {
            Ok(v) => v,
            Err(e) => {
                src_parent.release(&mut self.cache);
                return Err(e);
            }
        };
        let mut dst_parent = if dst_parent_ino == src_parent_ino {
            None
        } else {
            Some(self.mount_dir(dst_parent_ino, true)?)
        };
        let dst_parent_ref: &mut CachedInode = dst_parent.as_mut().unwrap_or(&mut src_parent);

        let res = (|| {
            if let Ok((dst_off, dst_ino)) =
                dir::lookup(&mut self.cache, &mut self.meta, &self.geom, dst_parent_ref, dst_name)
            {
                let mut existing = inode::mount(
                    &mut self.cache,
                    &mut self.meta,
                    self.inode_table_start,
                    dst_ino,
                    ExpectedType::ANY,
                    true,
                )?;
                if existing.fixed.mode & mode::TYPE_MASK == mode::DIR
                    && !dir::is_empty(&mut self.cache, &mut self.meta, &self.geom, &mut existing)?
                {
                    existing.release(&mut self.cache);
                    return Err(Error::NotEmpty);
                }
                dir::delete(&mut self.cache, &mut self.meta, &self.geom, dst_parent_ref, dst_off)?;
                inode::link_dec(
                    &mut self.cache,
                    &mut self.meta,
                    &self.geom,
                    &mut existing,
                    true,
                    self.cfg.delete_open,
                )?;
                inode::sync(&mut self.cache, &mut existing);
                existing.release(&mut self.cache);
            }
            dir::delete(&mut self.cache, &mut self.meta, &self.geom, &mut src_parent, src_off)?;
            dir::create(&mut self.cache, &mut self.meta, &self.geom, dst_parent_ref, dst_name, src_ino)?;
            self.meta.transact(&mut self.cache)
        })();

        if let Some(mut d) = dst_parent {
            d.release(&mut self.cache);
        }
        src_parent.release(&mut self.cache);
        res
    }

    /// Reads the next directory entry after `cursor`.
    pub fn read_dir(
        &mut self,
        dir_inode: u32,
        cursor: u64,
    ) -> Result<Option<(u64, alloc::string::String, u32)>> {
        let mut ci = self.mount_dir(dir_inode, false)?;
        let r = dir::read_next(&mut self.cache, &mut self.meta, &self.geom, &mut ci, cursor);
        ci.release(&mut self.cache);
        r
    }
}

fn build_metaroot_views<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    handles: [crate::buffer::BufHandle; 2],
    imap_layout: ImapLayout,
) -> Result<[Option<crate::metaroot::MetaRootView>; 2]> {
    let bits_bytes = match imap_layout {
        ImapLayout::Inline => cache.block_size() as usize - crate::metaroot::METAROOT_HEADER_SIZE,
        ImapLayout::External { node_count, .. } => ((node_count as usize) + 7) / 8,
    };
    let mut views: [Option<crate::metaroot::MetaRootView>; 2] = [None, None];
    for (i, h) in handles.into_iter().enumerate() {
        let raw: crate::metaroot::MetaRootFixed = *bytemuck::from_bytes(
            &cache.data(h)[node::NODE_HEADER_SIZE..crate::metaroot::METAROOT_HEADER_SIZE],
        );
        let fixed = raw.from_le();
        let bits = crate::imap::ImapBits::from_bytes(
            &cache.data(h)[crate::metaroot::METAROOT_HEADER_SIZE
                ..crate::metaroot::METAROOT_HEADER_SIZE + bits_bytes],
        );
        views[i] = Some(crate::metaroot::MetaRootView { handle: h, fixed, bits });
    }
    Ok(views)
}

//! Inode/block allocation bitmap ("imap"), in its inline and external
//! variants.
//!
//! Grounded on the original driver's inline-imap bit arithmetic
//! (`offset = block - inode_table_start_block`) and its refusal to set a
//! bit to its current value, which is treated as a fatal bookkeeping bug
//! rather than a silent no-op.

use alloc::vec;
use alloc::vec::Vec;

use crate::buffer::{BufferCache, GetFlags, MetaKind};
use crate::device::BlockDevice;
use crate::error::{Error, Result};

/// Which of the two per-volume metaroot bitmap views a bit is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Committed,
    Working,
}

/// Layout-only description of the imap needed by its operations; owned by
/// [`crate::metaroot::MetaRoot`] and passed in by reference.
#[derive(Debug, Clone, Copy)]
pub enum ImapLayout {
    Inline,
    External {
        node_start_block: u32,
        node_count: u32,
        bits_per_node: u32,
    },
}

/// A single metaroot's view of the imap: either the inline bitmap bytes or
/// the per-node toggle bitmap selecting which physical copy is live.
pub struct ImapBits {
    bits: Vec<u8>,
}

impl ImapBits {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bits: bytes.to_vec(),
        }
    }

    pub fn zeroed(byte_len: usize) -> Self {
        Self {
            bits: vec![0u8; byte_len],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn get(&self, bit: u32) -> bool {
        let byte = bit as usize / 8;
        let mask = 1u8 << (bit % 8);
        self.bits.get(byte).map(|b| b & mask != 0).unwrap_or(false)
    }

    /// Refuses to set a bit to its current value: a driver should never
    /// observe that, and it indicates a bookkeeping bug upstream.
    pub fn set(&mut self, bit: u32, value: bool) -> Result<()> {
        if self.get(bit) == value {
            return Err(fubar!("imap bit {} already {}", bit, value));
        }
        let byte = bit as usize / 8;
        let mask = 1u8 << (bit % 8);
        if value {
            self.bits[byte] |= mask;
        } else {
            self.bits[byte] &= !mask;
        }
        Ok(())
    }

    /// True when the byte containing `bit` is entirely set, letting
    /// `find_free` skip a whole byte at a time.
    pub fn byte_full(&self, bit: u32) -> bool {
        self.bits
            .get(bit as usize / 8)
            .map(|&b| b == 0xFF)
            .unwrap_or(false)
    }

    pub fn bit_len(&self) -> u32 {
        self.bits.len() as u32 * 8
    }
}

/// Query/mutate allocation state across the committed and working
/// metaroot views. Implemented once for inline and once for external
/// imaps; both share the bit-level `ImapBits` primitive above.
///
/// For `ImapLayout::Inline`, `committed`/`working` hold the full per-block
/// bitmap directly. For `ImapLayout::External`, they instead hold one bit
/// *per imap node* selecting which of the node's two physical copies is
/// live for that view; the actual per-block bits live in
/// the external node blocks and are reached through `cache`.
pub struct Imap<'a> {
    pub layout: ImapLayout,
    pub committed: &'a ImapBits,
    pub working: &'a mut ImapBits,
}

impl<'a> Imap<'a> {
    pub fn get<D: BlockDevice>(
        &self,
        cache: &mut BufferCache<D>,
        view: View,
        block: u32,
        start_block: u32,
    ) -> Result<bool> {
        let bit = block - start_block;
        match self.layout {
            ImapLayout::Inline => Ok(match view {
                View::Committed => self.committed.get(bit),
                View::Working => self.working.get(bit),
            }),
            ImapLayout::External {
                node_start_block,
                bits_per_node,
                ..
            } => {
                let node_index = bit / bits_per_node;
                let inner = bit % bits_per_node;
                let selector = match view {
                    View::Committed => self.committed.get(node_index),
                    View::Working => self.working.get(node_index),
                };
                let (h, bits) = load_external_node(cache, node_start_block, node_index, selector)?;
                cache.put(h);
                Ok(bits.get(inner))
            }
        }
    }

    /// Mutates only the working metaroot's view. For an
    /// external imap this copies the affected node to its other physical
    /// copy with the bit flipped, then toggles the working selector bit to
    /// point at it, leaving the committed copy untouched until `transact`.
    pub fn set<D: BlockDevice>(
        &mut self,
        cache: &mut BufferCache<D>,
        block: u32,
        start_block: u32,
        allocated: bool,
    ) -> Result<()> {
        let bit = block - start_block;
        match self.layout {
            ImapLayout::Inline => self.working.set(bit, allocated),
            ImapLayout::External {
                node_start_block,
                bits_per_node,
                ..
            } => {
                let node_index = bit / bits_per_node;
                let inner = bit % bits_per_node;
                let live = self.working.get(node_index);
                let (h, mut bits) = load_external_node(cache, node_start_block, node_index, live)?;
                cache.put(h);
                bits.set(inner, allocated)?;
                let other = !live;
                let target = imap_node_block(node_start_block, node_index, other);
                let h2 = cache.get(target, MetaKind::Imap, GetFlags { new: true })?;
                {
                    let data = cache.data_mut(h2);
                    crate::node::NodeHeader::new(crate::node::signature::IMAP).write(data);
                    data[crate::node::NODE_HEADER_SIZE..].copy_from_slice(bits.as_bytes());
                }
                cache.mark_dirty(h2);
                cache.put(h2);
                self.working.set(node_index, other)
            }
        }
    }

    /// Scans forward from `start_block`, wrapping at end of volume, for
    /// the first block that is FREE (0 in both metaroot views).
    ///
    /// Inline: skips a whole byte at a time when the working-metaroot byte
    /// is saturated. External: scans node by node (coarser than the
    /// inline byte-skip scan, but an external imap only exists for
    /// volumes too large for an inline bitmap in the first place, so
    /// node-granular scanning is the one that matters there).
    pub fn find_free<D: BlockDevice>(
        &self,
        cache: &mut BufferCache<D>,
        start_block: u32,
        volume_start: u32,
        volume_len: u32,
    ) -> Result<u32> {
        match self.layout {
            ImapLayout::Inline => {
                let total_bits = volume_len;
                let start_bit = start_block - volume_start;
                let mut bit = start_bit;
                let mut scanned = 0u32;
                while scanned < total_bits {
                    if self.working.byte_full(bit) {
                        let skip = 8 - (bit % 8);
                        bit = (bit + skip) % total_bits;
                        scanned += skip;
                        continue;
                    }
                    if !self.working.get(bit) && !self.committed.get(bit) {
                        return Ok(volume_start + bit);
                    }
                    bit = (bit + 1) % total_bits;
                    scanned += 1;
                }
                Err(Error::NoSpace)
            }
            ImapLayout::External {
                node_start_block,
                bits_per_node,
                node_count,
            } => {
                let start_node = (start_block - volume_start) / bits_per_node;
                for offset in 0..node_count {
                    let node_index = (start_node + offset) % node_count;
                    let working_sel = self.working.get(node_index);
                    let committed_sel = self.committed.get(node_index);
                    let (hw, working_bits) =
                        load_external_node(cache, node_start_block, node_index, working_sel)?;
                    cache.put(hw);
                    let committed_bits = if committed_sel == working_sel {
                        None
                    } else {
                        let (hc, b) =
                            load_external_node(cache, node_start_block, node_index, committed_sel)?;
                        cache.put(hc);
                        Some(b)
                    };
                    let node_base_bit = node_index * bits_per_node;
                    let bits_here = bits_per_node.min(volume_len.saturating_sub(node_base_bit));
                    for inner in 0..bits_here {
                        let w = working_bits.get(inner);
                        let c = committed_bits.as_ref().map(|b| b.get(inner)).unwrap_or(w);
                        if !w && !c {
                            return Ok(volume_start + node_base_bit + inner);
                        }
                    }
                }
                Err(Error::NoSpace)
            }
        }
    }
}

/// Loads the physical block holding the live copy of external imap node
/// `node_index`, per the metaroot's per-node toggle bit: bit clear means
/// copy 0 is live, bit set means copy 1 is live. Writing toggles the
/// working metaroot's selector and always targets the *other* physical
/// copy, leaving the committed copy untouched.
pub fn imap_node_block(node_start_block: u32, node_index: u32, copy_selector: bool) -> u32 {
    let slot = node_start_block + node_index * 2;
    if copy_selector {
        slot + 1
    } else {
        slot
    }
}

/// Loads an external imap node's bitmap segment through the buffer cache.
pub fn load_external_node<D: BlockDevice>(
    cache: &mut BufferCache<D>,
    node_start_block: u32,
    node_index: u32,
    copy_selector: bool,
) -> Result<(crate::buffer::BufHandle, ImapBits)> {
    let block = imap_node_block(node_start_block, node_index, copy_selector);
    let h = cache.get(block, MetaKind::Imap, GetFlags::default())?;
    let bits = ImapBits::from_bytes(&cache.data(h)[crate::node::NODE_HEADER_SIZE..]);
    Ok((h, bits))
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
        let io = crate::io::BlockIo::new(dev, 4096).unwrap();
        BufferCache::new(io, 8)
    }

    #[test]
    fn set_same_value_is_fubar() {
        let mut bits = ImapBits::zeroed(4);
        assert!(bits.set(3, false).is_err());
        bits.set(3, true).unwrap();
        assert!(bits.get(3));
        assert!(bits.set(3, true).is_err());
    }

    #[test]
    fn find_free_wraps_around() {
        let mut c = cache();
        let committed = ImapBits::zeroed(1);
        let mut working = ImapBits::zeroed(1);
        working.set(0, true).unwrap();
        working.set(1, true).unwrap();
        let imap = Imap {
            layout: ImapLayout::Inline,
            committed: &committed,
            working: &mut working,
        };
        let free = imap.find_free(&mut c, 0, 0, 8).unwrap();
        assert_eq!(free, 2);
    }

    #[test]
    fn find_free_reports_no_space() {
        let mut c = cache();
        let committed = ImapBits::zeroed(1);
        let mut working = ImapBits::zeroed(1);
        for b in 0..8 {
            working.set(b, true).unwrap();
        }
        let imap = Imap {
            layout: ImapLayout::Inline,
            committed: &committed,
            working: &mut working,
        };
        assert_eq!(imap.find_free(&mut c, 0, 0, 8), Err(Error::NoSpace));
    }

    #[test]
    fn external_imap_set_toggles_physical_copy_and_get_round_trips() {
        let mut c = cache();
        // Mirrors format.rs's external-imap-node zeroing: both physical
        // copies of node 0 start resident, signed, and empty.
        for copy in 0..2u32 {
            let h = c.get(copy, MetaKind::Imap, GetFlags { new: true }).unwrap();
            crate::node::NodeHeader::new(crate::node::signature::IMAP).write(c.data_mut(h));
            c.mark_dirty(h);
            c.put(h);
        }
        let layout = ImapLayout::External {
            node_start_block: 0,
            node_count: 1,
            bits_per_node: 64,
        };
        let committed = ImapBits::zeroed(1);
        let mut working = ImapBits::zeroed(1);
        {
            let mut imap = Imap {
                layout,
                committed: &committed,
                working: &mut working,
            };
            imap.set(&mut c, 5, 0, true).unwrap();
        }
        // The set flipped the working selector bit for node 0.
        assert!(working.get(0));
        let imap = Imap {
            layout,
            committed: &committed,
            working: &mut working,
        };
        assert!(imap.get(&mut c, View::Working, 5, 0).unwrap());
        assert!(!imap.get(&mut c, View::Committed, 5, 0).unwrap());
    }
}

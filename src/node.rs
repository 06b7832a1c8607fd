//! On-disk node header, block signatures, the master block, and the
//! CRC-32 routine metadata blocks are stamped with.

use bytemuck::{Pod, Zeroable};

/// Prepended to every metadata block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct NodeHeader {
    pub signature: u32,
    pub crc: u32,
    pub sequence: u64,
}

pub const NODE_HEADER_SIZE: usize = core::mem::size_of::<NodeHeader>();

pub mod signature {
    pub const MASTER: u32 = 0x5453_414D;
    pub const META: u32 = 0x4154_454D;
    pub const IMAP: u32 = 0x5041_4D49;
    pub const INODE: u32 = 0x444F_4E49;
    pub const DBLI: u32 = 0x494C_4244;
    pub const INDI: u32 = 0x4944_4E49;
    pub const DIRD: u32 = 0x4452_4944;
}

impl NodeHeader {
    pub fn new(signature: u32) -> Self {
        Self {
            signature,
            crc: 0,
            sequence: 0,
        }
    }

    /// Byte-swaps every field from host order to little-endian; a no-op on
    /// little-endian hosts.
    fn to_le(self) -> Self {
        Self {
            signature: self.signature.to_le(),
            crc: self.crc.to_le(),
            sequence: self.sequence.to_le(),
        }
    }

    /// Inverse of [`Self::to_le`]; swapping twice is the identity, so the
    /// same per-field operation serves both directions.
    fn from_le(self) -> Self {
        Self {
            signature: u32::from_le(self.signature),
            crc: u32::from_le(self.crc),
            sequence: u64::from_le(self.sequence),
        }
    }

    pub fn read(buf: &[u8]) -> Self {
        let raw: Self = *bytemuck::from_bytes(&buf[..NODE_HEADER_SIZE]);
        raw.from_le()
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..NODE_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&self.to_le()));
    }
}

/// CRC-32 (IEEE 802.3, reflected polynomial 0xEDB88320) over `data`,
/// computed table-driven. Metadata blocks are checksummed from offset 8
/// (after signature and crc fields) to end-of-block.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    !crc
}

/// Recompute and verify the CRC stored in a node header against the bytes
/// from offset 8 to the end of `block`.
pub fn verify_crc(block: &[u8]) -> bool {
    if block.len() < NODE_HEADER_SIZE {
        return false;
    }
    let hdr = NodeHeader::read(block);
    hdr.crc == crc32(&block[8..])
}

/// Stamp `block`'s node header with a fresh CRC computed over bytes 8..end.
pub fn stamp_crc(block: &mut [u8]) {
    let crc = crc32(&block[8..]);
    block[4..8].copy_from_slice(&crc.to_le_bytes());
}

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                0xEDB8_8320 ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = build_crc32_table();

/// Legacy-feature flag byte reserved for images predating the feature
/// bitmaps; always 0 for volumes written by this implementation.
pub const LEGACY_FLAGS: u8 = 0;

/// Fixed fields of the master block. Stored at block 0,
/// without a node header (it is identified by an embedded signature field
/// instead, matching the original on-disk layout).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MasterBlock {
    pub signature: u32,
    pub version: u32,
    pub format_time: u64,
    pub inode_count: u32,
    pub block_count: u32,
    pub name_max: u32,
    pub direct_pointers: u32,
    pub indirect_pointers: u32,
    pub block_size_log2: u8,
    pub sector_size_log2: u8,
    pub legacy_flags: u8,
    pub _pad: u8,
    pub incompat: u32,
    pub ro_compat: u32,
}

pub const MASTER_BLOCK_SIZE: usize = core::mem::size_of::<MasterBlock>();

impl MasterBlock {
    /// The single-byte fields carry no endianness; only the multi-byte
    /// integers need swapping.
    fn to_le(self) -> Self {
        Self {
            signature: self.signature.to_le(),
            version: self.version.to_le(),
            format_time: self.format_time.to_le(),
            inode_count: self.inode_count.to_le(),
            block_count: self.block_count.to_le(),
            name_max: self.name_max.to_le(),
            direct_pointers: self.direct_pointers.to_le(),
            indirect_pointers: self.indirect_pointers.to_le(),
            incompat: self.incompat.to_le(),
            ro_compat: self.ro_compat.to_le(),
            ..self
        }
    }

    fn from_le(self) -> Self {
        Self {
            signature: u32::from_le(self.signature),
            version: u32::from_le(self.version),
            format_time: u64::from_le(self.format_time),
            inode_count: u32::from_le(self.inode_count),
            block_count: u32::from_le(self.block_count),
            name_max: u32::from_le(self.name_max),
            direct_pointers: u32::from_le(self.direct_pointers),
            indirect_pointers: u32::from_le(self.indirect_pointers),
            incompat: u32::from_le(self.incompat),
            ro_compat: u32::from_le(self.ro_compat),
            ..self
        }
    }

    pub fn read(buf: &[u8]) -> Option<Self> {
        if buf.len() < MASTER_BLOCK_SIZE {
            return None;
        }
        let raw: MasterBlock = *bytemuck::from_bytes(&buf[..MASTER_BLOCK_SIZE]);
        let mb = raw.from_le();
        if mb.signature != signature::MASTER {
            return None;
        }
        Some(mb)
    }

    pub fn write(&self, buf: &mut [u8]) {
        buf[..MASTER_BLOCK_SIZE].copy_from_slice(bytemuck::bytes_of(&self.to_le()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    extern crate std;

    #[test]
    fn crc32_of_known_vector() {
        // "123456789" has the well-known CRC-32/BZIP2... this build uses the
        // reflected IEEE variant, matching zlib's crc32("123456789").
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn header_round_trips_through_bytes() {
        let mut buf = [0u8; 32];
        let hdr = NodeHeader {
            signature: signature::INODE,
            crc: 0,
            sequence: 42,
        };
        hdr.write(&mut buf);
        let back = NodeHeader::read(&buf);
        assert_eq!(back.signature, signature::INODE);
        assert_eq!(back.sequence, 42);
    }
}

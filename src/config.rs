//! Configuration the core consumes from a collaborator.
//!
//! Compile-time `#if` feature gating in the original design becomes a
//! runtime-checked descriptor here. Fields that change on-disk layout are mirrored as bits in the
//! master block's incompat/read-only feature bitmaps by [`crate::node`].

use crate::error::{Error, Result};

/// Whether the inode-number API surface is POSIX-like (mutable directories,
/// links, unlink-while-open) or the simpler fixed-slot FSE flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    Posix,
    Fse,
}

/// Requested inode count at format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeCountCfg {
    /// `max(minimum_viable, block_count / 18)`, preserved verbatim for
    /// on-disk image compatibility across format implementations.
    Auto,
    Fixed(u32),
}

/// Runtime configuration descriptor. One instance per mounted or
/// about-to-be-formatted volume.
#[derive(Debug, Clone)]
pub struct Config {
    pub block_size: u32,
    pub volume_count: u32,
    pub direct_pointers: u32,
    pub indirect_pointers: u32,
    pub inode_count: InodeCountCfg,
    pub name_max: u32,
    pub read_only: bool,
    pub api: ApiFlavor,
    pub inode_timestamps: bool,
    pub inode_blocks: bool,
    pub posix_link: bool,
    pub posix_owner_perm: bool,
    pub delete_open: bool,
    pub posix_symlink: bool,
    pub imap_inline_allowed: bool,
    pub imap_external_allowed: bool,
    pub task_count: u32,
    /// Accepted for on-disk format compatibility; the on-disk layout is
    /// always little-endian regardless of host, so this driver never
    /// actually swaps bytes. Mounting an image with this bit set just
    /// confirms the image's own claim, it changes no code path.
    pub endian_swap: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4096,
            volume_count: 1,
            direct_pointers: 4,
            indirect_pointers: 32,
            inode_count: InodeCountCfg::Auto,
            name_max: 247,
            read_only: false,
            api: ApiFlavor::Posix,
            inode_timestamps: true,
            inode_blocks: true,
            posix_link: true,
            posix_owner_perm: true,
            delete_open: false,
            posix_symlink: true,
            imap_inline_allowed: true,
            imap_external_allowed: true,
            task_count: 1,
            endian_swap: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || !(128..=65536).contains(&self.block_size) {
            return Err(Error::Inval);
        }
        if self.volume_count == 0 || self.direct_pointers == 0 || self.indirect_pointers == 0 {
            return Err(Error::Inval);
        }
        if let InodeCountCfg::Fixed(n) = self.inode_count {
            if n == 0 {
                return Err(Error::Inval);
            }
        }
        if self.name_max == 0 {
            return Err(Error::Inval);
        }
        if !self.imap_inline_allowed && !self.imap_external_allowed {
            return Err(Error::Inval);
        }
        Ok(())
    }
}

/// Geometry derived from [`Config`] plus the on-disk fixed header sizes.
/// Computed once at format or mount time.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub block_size: u32,
    pub direct: u32,
    pub indirect: u32,
    /// Di: number of double-indirect pointer slots.
    pub dindirect: u32,
    /// E: total pointer slots in an inode.
    pub entries_per_inode: u32,
    pub entries_per_indirect: u32,
    pub name_max: u32,
}

/// Size in bytes of the inode's fixed (non-pointer-array) header fields.
/// Kept in sync with [`crate::inode::InodeHeader`].
pub const INODE_HEADER: u32 = crate::inode::INODE_HEADER_SIZE as u32;

impl Geometry {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        cfg.validate()?;
        let b = cfg.block_size;
        if b <= INODE_HEADER {
            return Err(Error::Inval);
        }
        let entries_per_inode = (b - INODE_HEADER) / 4;
        if cfg.direct_pointers + cfg.indirect_pointers > entries_per_inode {
            return Err(Error::Inval);
        }
        let dindirect = entries_per_inode - cfg.direct_pointers - cfg.indirect_pointers;
        // node header (16) + owning-inode number (4), remainder is 4-byte slots.
        let entries_per_indirect = (b - 16 - 4) / 4;
        Ok(Self {
            block_size: b,
            direct: cfg.direct_pointers,
            indirect: cfg.indirect_pointers,
            dindirect,
            entries_per_inode,
            entries_per_indirect,
            name_max: cfg.name_max,
        })
    }
}

/// Master block incompat feature bits.
pub mod incompat {
    pub const POSIX_API: u32 = 1 << 0;
    pub const DELETE_OPEN: u32 = 1 << 1;
    pub const IMAP_EXTERNAL: u32 = 1 << 2;
    pub const ENDIAN_SWAP: u32 = 1 << 3;
}

/// Master block read-only-compat feature bits: an unknown bit forces a
/// read-only mount rather than a mount failure.
pub mod ro_compat {
    pub const POSIX_OWNER_PERM: u32 = 1 << 0;
    pub const POSIX_SYMLINK: u32 = 1 << 1;
    pub const INODE_TIMESTAMPS: u32 = 1 << 2;
    pub const INODE_BLOCKS: u32 = 1 << 3;
}

/// Feature bits this build understands, used at mount to detect an
/// unsupported volume.
pub const SUPPORTED_INCOMPAT: u32 = incompat::POSIX_API
    | incompat::DELETE_OPEN
    | incompat::IMAP_EXTERNAL
    | incompat::ENDIAN_SWAP;

pub const SUPPORTED_RO_COMPAT: u32 = ro_compat::POSIX_OWNER_PERM
    | ro_compat::POSIX_SYMLINK
    | ro_compat::INODE_TIMESTAMPS
    | ro_compat::INODE_BLOCKS;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let mut cfg = Config::default();
        cfg.block_size = 4000;
        assert_eq!(cfg.validate(), Err(Error::Inval));
    }

    #[test]
    fn geometry_derives_dindirect_from_inode_entry_count() {
        let cfg = Config {
            direct_pointers: 4,
            indirect_pointers: 32,
            block_size: 4096,
            ..Config::default()
        };
        let geom = Geometry::from_config(&cfg).unwrap();
        assert_eq!(geom.direct, 4);
        assert_eq!(geom.indirect, 32);
        // E = (4096 - 128) / 4 = 992 with a 128-byte inode header.
        assert_eq!(geom.entries_per_inode, (4096 - INODE_HEADER) / 4);
        assert_eq!(geom.dindirect, geom.entries_per_inode - 4 - 32);
    }
}

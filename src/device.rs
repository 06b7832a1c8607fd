//! Block device port. The core never touches raw sector
//! offsets directly; all access goes through [`crate::io::BlockIo`], which
//! is the sole owner of a `BlockDevice`.

use crate::error::Result;

/// How a device was asked to be opened, mirrored into the master block at
/// format time so a later mount can refuse an incompatible reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Sector-addressed storage backing one volume.
///
/// Implementors need not be thread-safe; the core serializes all access
/// behind its own mutex.
pub trait BlockDevice {
    /// Size of one sector in bytes. Must be a power of two.
    fn sector_size(&self) -> u32;

    /// Number of sectors available to this volume.
    fn sector_count(&self) -> u64;

    /// Read `buf.len() / sector_size()` whole sectors starting at `sector`.
    fn read_sectors(&mut self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len() / sector_size()` whole sectors starting at `sector`.
    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()>;

    /// Flush any write cache below this interface so prior writes are
    /// durable before the caller proceeds with the commit protocol.
    fn flush(&mut self) -> Result<()>;
}

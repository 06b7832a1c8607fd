//! Block/sector translation layer between the volume's logical block size
//! and the underlying [`crate::device::BlockDevice`]'s physical sector size.

use alloc::vec;
use alloc::vec::Vec;

use crate::device::BlockDevice;
use crate::error::{Error, Result};

/// Wraps a `BlockDevice` and exposes whole-block reads/writes at the
/// volume's configured block size, which must be an integer multiple of
/// the device's sector size.
pub struct BlockIo<D: BlockDevice> {
    dev: D,
    block_size: u32,
    sectors_per_block: u32,
}

impl<D: BlockDevice> BlockIo<D> {
    pub fn new(dev: D, block_size: u32) -> Result<Self> {
        let sector_size = dev.sector_size();
        if sector_size == 0 || block_size == 0 || block_size % sector_size != 0 {
            return Err(Error::Inval);
        }
        Ok(Self {
            sectors_per_block: block_size / sector_size,
            block_size,
            dev,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Total number of whole blocks addressable on the device.
    pub fn block_count(&self) -> u64 {
        self.dev.sector_count() / self.sectors_per_block as u64
    }

    fn first_sector(&self, block: u32) -> u64 {
        block as u64 * self.sectors_per_block as u64
    }

    pub fn read_block(&mut self, block: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.block_size as usize {
            return Err(Error::Inval);
        }
        self.dev.read_sectors(self.first_sector(block), buf)
    }

    pub fn write_block(&mut self, block: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != self.block_size as usize {
            return Err(Error::Inval);
        }
        self.dev.write_sectors(self.first_sector(block), buf)
    }

    pub fn read_blocks(&mut self, start: u32, count: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size as usize * count as usize];
        self.dev.read_sectors(self.first_sector(start), &mut buf)?;
        Ok(buf)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.dev.flush()
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    pub fn into_device(self) -> D {
        self.dev
    }
}

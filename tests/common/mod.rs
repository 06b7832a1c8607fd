//! RAM-backed `BlockDevice` fixture for integration tests, per
//! SPEC_FULL.md's test-tooling section. Not a `mod` under `src/` because
//! it is only ever compiled into test binaries.

use txvol::device::BlockDevice;
use txvol::error::{Error, Result};

pub struct RamDisk {
    sectors: Vec<u8>,
    sector_size: u32,
}

impl RamDisk {
    pub fn new(sector_count: u64, sector_size: u32) -> Self {
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
        if off + buf.len() > self.sectors.len() {
            return Err(Error::Range);
        }
        buf.copy_from_slice(&self.sectors[off..off + buf.len()]);
        Ok(())
    }

    fn write_sectors(&mut self, sector: u64, buf: &[u8]) -> Result<()> {
        let off = sector as usize * self.sector_size as usize;
        if off + buf.len() > self.sectors.len() {
            return Err(Error::Range);
        }
        self.sectors[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Clones the raw sector bytes to simulate a power-cycle: a fresh
/// `RamDisk` with no cached state, only the bytes durable writes landed
/// on.
impl Clone for RamDisk {
    fn clone(&self) -> Self {
        Self {
            sectors: self.sectors.clone(),
            sector_size: self.sector_size,
        }
    }
}

//! Core traits for labelkit

use crate::{
    error::{Error, Result},
    types::{DeviceGeometry, Zone},
};
use rand::RngCore;
use std::io::{Read, Seek, Write};

/// Sector-addressed block device consumed by the partition-table engine
///
/// Implementations provide whole-sector I/O at the geometry's logical sector
/// size. All calls are blocking and failures propagate immediately.
pub trait BlockDevice: Send {
    /// Geometry and topology of the device
    fn geometry(&self) -> DeviceGeometry;

    /// Read one logical sector
    fn read_sector(&mut self, lba: u64) -> Result<Vec<u8>>;

    /// Write one logical sector; `data` must be exactly one sector long
    fn write_sector(&mut self, lba: u64, data: &[u8]) -> Result<()>;

    /// Fill `buf` with random bytes (GUIDs, disk signatures)
    fn random_bytes(&mut self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }

    /// Push buffered writes to stable storage
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Read `count` consecutive sectors starting at `lba`
    fn read_sectors(&mut self, lba: u64, count: u64) -> Result<Vec<u8>> {
        let sector_size = self.geometry().sector_size as usize;
        let mut out = Vec::with_capacity(sector_size.saturating_mul(count as usize));
        for i in 0..count {
            let sector = self.read_sector(lba + i)?;
            out.extend_from_slice(&sector);
        }
        Ok(out)
    }

    /// Write whole sectors starting at `lba`
    fn write_sectors(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        let sector_size = self.geometry().sector_size as usize;
        if sector_size == 0 || data.len() % sector_size != 0 {
            return Err(Error::invalid_argument(format!(
                "write of {} bytes is not a multiple of the {}-byte sector size",
                data.len(),
                sector_size
            )));
        }
        for (i, chunk) in data.chunks(sector_size).enumerate() {
            self.write_sector(lba + i as u64, chunk)?;
        }
        Ok(())
    }
}

/// Read-only view shared by every partition-table format
pub trait ZoneTable {
    /// Get a human-readable identifier for this zone table type
    fn identify(&self) -> &str;

    /// Get all used zones in this partition table
    fn zones(&self) -> Vec<Zone>;

    /// Get a specific zone by partition index
    fn zone(&self, index: usize) -> Option<Zone> {
        self.zones().into_iter().find(|z| z.index == index)
    }
}

/// Combined trait for Read + Write + Seek
pub trait ReadWriteSeek: Read + Write + Seek + Send {}

/// Blanket implementation for any type that implements Read + Write + Seek
impl<T: Read + Write + Seek + Send> ReadWriteSeek for T {}

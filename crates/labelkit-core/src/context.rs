//! Device context threaded through every table operation

use crate::{
    error::{Error, Result},
    security::{checked_multiply_u64, u64_to_usize, validate_sector_size, MAX_ENTRY_ARRAY_BYTES},
    traits::BlockDevice,
    types::DeviceGeometry,
};

/// Borrowed device plus the geometry the engine should use for it
///
/// The caller owns both the device and the context; tables never hold on to
/// either between calls.
pub struct DiskContext<'a> {
    device: &'a mut dyn BlockDevice,
    geometry: DeviceGeometry,
}

impl<'a> DiskContext<'a> {
    /// Wrap a device using the geometry it reports
    ///
    /// # Errors
    ///
    /// Returns an error if the reported sector size is unusable.
    pub fn new(device: &'a mut dyn BlockDevice) -> Result<Self> {
        let geometry = device.geometry();
        validate_sector_size(geometry.sector_size)?;
        Ok(Self { device, geometry })
    }

    /// Wrap a device with user-supplied geometry overrides
    ///
    /// The logical sector size must match the device; the override may shrink
    /// but never grow the addressable capacity.
    pub fn with_geometry(device: &'a mut dyn BlockDevice, geometry: DeviceGeometry) -> Result<Self> {
        let reported = device.geometry();
        validate_sector_size(geometry.sector_size)?;
        if geometry.sector_size != reported.sector_size {
            return Err(Error::invalid_argument(format!(
                "sector size override {} does not match device sector size {}",
                geometry.sector_size, reported.sector_size
            )));
        }
        if geometry.total_sectors > reported.total_sectors {
            return Err(Error::invalid_argument(format!(
                "capacity override of {} sectors exceeds device size of {} sectors",
                geometry.total_sectors, reported.total_sectors
            )));
        }
        tracing::debug!("Using geometry override: {}", geometry);
        Ok(Self { device, geometry })
    }

    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    /// Logical sector size in bytes
    pub fn sector_size(&self) -> u64 {
        self.geometry.sector_size as u64
    }

    pub fn total_sectors(&self) -> u64 {
        self.geometry.total_sectors
    }

    pub fn last_lba(&self) -> u64 {
        self.geometry.last_lba()
    }

    fn check_range(&self, lba: u64, count: u64) -> Result<()> {
        let end = lba.checked_add(count);
        match end {
            Some(end) if end <= self.geometry.total_sectors => Ok(()),
            _ => Err(Error::out_of_range(format!(
                "sectors {}+{} beyond device end ({} sectors)",
                lba, count, self.geometry.total_sectors
            ))),
        }
    }

    /// Read one sector
    pub fn read_sector(&mut self, lba: u64) -> Result<Vec<u8>> {
        self.check_range(lba, 1)?;
        self.device.read_sector(lba)
    }

    /// Read `len` bytes starting at the beginning of sector `lba`
    pub fn read_bytes(&mut self, lba: u64, len: u64) -> Result<Vec<u8>> {
        if len > MAX_ENTRY_ARRAY_BYTES {
            return Err(Error::capacity_exceeded(format!(
                "refusing to read {} bytes (limit {})",
                len, MAX_ENTRY_ARRAY_BYTES
            )));
        }
        let count = len.div_ceil(self.sector_size());
        self.check_range(lba, count)?;
        let mut data = self.device.read_sectors(lba, count)?;
        data.truncate(u64_to_usize(len, "read length")?);
        Ok(data)
    }

    /// Write one sector
    pub fn write_sector(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        self.check_range(lba, 1)?;
        if data.len() as u64 != self.sector_size() {
            return Err(Error::invalid_argument(format!(
                "sector buffer is {} bytes, expected {}",
                data.len(),
                self.sector_size()
            )));
        }
        self.device.write_sector(lba, data)
    }

    /// Write `data` starting at the beginning of sector `lba`
    ///
    /// A partial trailing sector is merged with its current content.
    pub fn write_bytes(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        let sector_size = u64_to_usize(self.sector_size(), "sector size")?;
        let full = data.len() / sector_size;
        let tail = data.len() % sector_size;
        let count = full as u64 + u64::from(tail != 0);
        checked_multiply_u64(count, self.sector_size(), "write length")?;
        self.check_range(lba, count)?;

        if full > 0 {
            self.device.write_sectors(lba, &data[..full * sector_size])?;
        }
        if tail != 0 {
            let tail_lba = lba + full as u64;
            let mut sector = self.device.read_sector(tail_lba)?;
            sector[..tail].copy_from_slice(&data[full * sector_size..]);
            self.device.write_sector(tail_lba, &sector)?;
        }
        Ok(())
    }

    /// Fill `buf` from the device's entropy source
    pub fn random_bytes(&mut self, buf: &mut [u8]) {
        self.device.random_bytes(buf);
    }

    pub fn flush(&mut self) -> Result<()> {
        self.device.flush()
    }
}

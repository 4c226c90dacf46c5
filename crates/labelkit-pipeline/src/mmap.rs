//! Memory-mapped read-only sector device

use labelkit_core::{BlockDevice, DeviceGeometry, Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

use crate::config::DeviceConfig;

/// Maximum file size for memory mapping (16 GB - practical limit for most systems)
pub const MAX_MMAP_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// A read-only device backed by a memory-mapped image file
///
/// Used for listing and verification, where no sector is ever written.
///
/// # Example
///
/// ```rust,no_run
/// use labelkit_pipeline::{DeviceConfig, MmapDevice};
/// use std::path::Path;
///
/// let device = MmapDevice::open(Path::new("disk.img"), &DeviceConfig::default()).unwrap();
/// ```
pub struct MmapDevice {
    mmap: Mmap,
    geometry: DeviceGeometry,
}

impl MmapDevice {
    /// Map an image file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped, is not a
    /// regular file, or exceeds [`MAX_MMAP_SIZE`].
    ///
    /// # Safety
    ///
    /// Uses `unsafe` for memory mapping because:
    /// - The OS guarantees memory safety for valid file descriptors
    /// - We validate the file is a regular file before mapping
    /// - The mapping is read-only
    /// - File must not be truncated during access (caller responsibility)
    pub fn open(path: &Path, config: &DeviceConfig) -> Result<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata()?;

        if !metadata.is_file() {
            return Err(Error::unsupported(format!(
                "only regular files can be memory-mapped: {}",
                path.display()
            )));
        }

        if metadata.len() > MAX_MMAP_SIZE {
            return Err(Error::capacity_exceeded(format!(
                "file size {} exceeds memory mapping limit {} (16 GB)",
                metadata.len(),
                MAX_MMAP_SIZE
            )));
        }

        let geometry = config.geometry_for(metadata.len())?;

        // SAFETY: regular file, bounded size, read-only mapping of a valid descriptor
        let mmap = unsafe { Mmap::map(&file)? };
        tracing::debug!("Mapped {} ({} bytes)", path.display(), mmap.len());

        Ok(Self { mmap, geometry })
    }

    /// Get the length of the mapped region
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Check if the mapped region is empty
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

impl BlockDevice for MmapDevice {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn read_sector(&mut self, lba: u64) -> Result<Vec<u8>> {
        if lba >= self.geometry.total_sectors {
            return Err(Error::out_of_range(format!(
                "sector {} beyond device end ({} sectors)",
                lba, self.geometry.total_sectors
            )));
        }
        let sector_size = self.geometry.sector_size as usize;
        let start = lba as usize * sector_size;
        Ok(self.mmap[start..start + sector_size].to_vec())
    }

    fn write_sector(&mut self, lba: u64, _data: &[u8]) -> Result<()> {
        Err(Error::read_only(format!(
            "memory-mapped device cannot write sector {}",
            lba
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image_file(sectors: usize) -> NamedTempFile {
        let mut tmpfile = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..sectors * 512).map(|i| (i / 512) as u8).collect();
        tmpfile.write_all(&data).unwrap();
        tmpfile.flush().unwrap();
        tmpfile
    }

    #[test]
    fn test_mmap_device_basic() {
        let tmpfile = image_file(10);
        let device = MmapDevice::open(tmpfile.path(), &DeviceConfig::default()).unwrap();

        assert_eq!(device.len(), 5120);
        assert!(!device.is_empty());
        assert_eq!(device.geometry().total_sectors, 10);
    }

    #[test]
    fn test_mmap_device_read_sector() {
        let tmpfile = image_file(10);
        let mut device = MmapDevice::open(tmpfile.path(), &DeviceConfig::default()).unwrap();

        let sector = device.read_sector(7).unwrap();
        assert_eq!(sector.len(), 512);
        assert!(sector.iter().all(|&b| b == 7));
        assert!(device.read_sector(10).is_err());
    }

    #[test]
    fn test_mmap_device_rejects_writes() {
        let tmpfile = image_file(2);
        let mut device = MmapDevice::open(tmpfile.path(), &DeviceConfig::default()).unwrap();
        assert!(matches!(
            device.write_sector(0, &[0u8; 512]),
            Err(Error::ReadOnly(_))
        ));
    }
}

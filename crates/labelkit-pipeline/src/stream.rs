//! Stream-backed sector device (files and in-memory images)

use labelkit_core::{
    checked_multiply_u64, validate_sector_size, BlockDevice, DeviceGeometry, Error,
    ReadWriteSeek, Result,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::config::DeviceConfig;

/// A block device over any `Read + Write + Seek` stream
///
/// # Example
///
/// ```rust
/// use labelkit_pipeline::StreamDevice;
/// use labelkit_core::BlockDevice;
///
/// // A blank 1 MiB image held in memory
/// let mut device = StreamDevice::in_memory(2048, 512).unwrap();
/// assert_eq!(device.geometry().total_sectors, 2048);
/// assert_eq!(device.read_sector(0).unwrap(), vec![0u8; 512]);
/// ```
pub struct StreamDevice<S: ReadWriteSeek> {
    stream: S,
    geometry: DeviceGeometry,
    writable: bool,
    rng: Option<StdRng>,
}

impl<S: ReadWriteSeek> StreamDevice<S> {
    /// Wrap a stream whose size and layout are described by `geometry`
    pub fn new(stream: S, geometry: DeviceGeometry) -> Result<Self> {
        validate_sector_size(geometry.sector_size)?;
        Ok(Self {
            stream,
            geometry,
            writable: true,
            rng: None,
        })
    }

    /// Use a seeded generator for `random_bytes` (reproducible GUIDs)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Refuse all writes
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Access the underlying stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Recover the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn seek_to(&mut self, lba: u64) -> Result<()> {
        if lba >= self.geometry.total_sectors {
            return Err(Error::out_of_range(format!(
                "sector {} beyond device end ({} sectors)",
                lba, self.geometry.total_sectors
            )));
        }
        let offset = checked_multiply_u64(lba, self.geometry.sector_size as u64, "sector offset")?;
        self.stream.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

impl StreamDevice<Cursor<Vec<u8>>> {
    /// Manufacture a zero-filled in-memory device
    pub fn in_memory(total_sectors: u64, sector_size: u32) -> Result<Self> {
        validate_sector_size(sector_size)?;
        let size = checked_multiply_u64(total_sectors, sector_size as u64, "image size")?;
        let buffer = vec![0u8; labelkit_core::u64_to_usize(size, "image size")?];
        Self::new(
            Cursor::new(buffer),
            DeviceGeometry::for_capacity(total_sectors, sector_size),
        )
    }

    /// Wrap an existing image held in memory
    pub fn from_image(image: Vec<u8>, config: &DeviceConfig) -> Result<Self> {
        let geometry = config.geometry_for(image.len() as u64)?;
        Self::new(Cursor::new(image), geometry)
    }

    /// Borrow the image bytes
    pub fn image(&self) -> &[u8] {
        self.stream.get_ref()
    }

    /// Mutably borrow the image bytes (test fixtures, corruption injection)
    pub fn image_mut(&mut self) -> &mut Vec<u8> {
        self.stream.get_mut()
    }
}

impl StreamDevice<File> {
    /// Open an image file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the image file
    /// * `config` - Sector size, topology and access mode
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the configuration is invalid
    pub fn open(path: &Path, config: &DeviceConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(config.writable)
            .open(path)?;
        let length = file.metadata()?.len();
        let geometry = config.geometry_for(length)?;
        tracing::debug!("Opened {}: {}", path.display(), geometry);

        let mut device = Self::new(file, geometry)?;
        device.writable = config.writable;
        Ok(device)
    }
}

impl<S: ReadWriteSeek> BlockDevice for StreamDevice<S> {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn read_sector(&mut self, lba: u64) -> Result<Vec<u8>> {
        self.seek_to(lba)?;
        let mut buf = vec![0u8; self.geometry.sector_size as usize];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_sector(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::read_only(format!("cannot write sector {}", lba)));
        }
        if data.len() != self.geometry.sector_size as usize {
            return Err(Error::invalid_argument(format!(
                "sector buffer is {} bytes, expected {}",
                data.len(),
                self.geometry.sector_size
            )));
        }
        self.seek_to(lba)?;
        self.stream.write_all(data)?;
        Ok(())
    }

    fn random_bytes(&mut self, buf: &mut [u8]) {
        match self.rng.as_mut() {
            Some(rng) => rng.fill_bytes(buf),
            None => rand::rng().fill_bytes(buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_in_memory_read_write() {
        let mut device = StreamDevice::in_memory(16, 512).unwrap();
        let sector = vec![0xA5u8; 512];
        device.write_sector(3, &sector).unwrap();

        assert_eq!(device.read_sector(3).unwrap(), sector);
        assert_eq!(device.read_sector(2).unwrap(), vec![0u8; 512]);
        assert_eq!(device.image()[3 * 512], 0xA5);
    }

    #[test]
    fn test_out_of_range_sector() {
        let mut device = StreamDevice::in_memory(4, 512).unwrap();
        assert!(matches!(device.read_sector(4), Err(Error::OutOfRange(_))));
        assert!(device.write_sector(4, &[0u8; 512]).is_err());
    }

    #[test]
    fn test_short_write_rejected() {
        let mut device = StreamDevice::in_memory(4, 512).unwrap();
        assert!(matches!(
            device.write_sector(0, &[0u8; 100]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_read_only_device() {
        let mut device = StreamDevice::in_memory(4, 512).unwrap().read_only();
        assert!(matches!(
            device.write_sector(0, &[0u8; 512]),
            Err(Error::ReadOnly(_))
        ));
    }

    #[test]
    fn test_seeded_random_bytes_are_reproducible() {
        let mut a = StreamDevice::in_memory(1, 512).unwrap().with_seed(42);
        let mut b = StreamDevice::in_memory(1, 512).unwrap().with_seed(42);
        let mut buf_a = [0u8; 16];
        let mut buf_b = [0u8; 16];
        a.random_bytes(&mut buf_a);
        b.random_bytes(&mut buf_b);
        assert_eq!(buf_a, buf_b);
        assert_ne!(buf_a, [0u8; 16]);
    }

    #[test]
    fn test_read_sectors_spans_multiple() {
        let mut image = vec![0u8; 4 * 512];
        image[512..1024].fill(1);
        image[1024..1536].fill(2);
        let mut device = StreamDevice::from_image(image, &DeviceConfig::default()).unwrap();

        let data = device.read_sectors(1, 2).unwrap();
        assert_eq!(data.len(), 1024);
        assert_eq!(data[0], 1);
        assert_eq!(data[1023], 2);
    }

    #[test]
    fn test_open_file_writable() {
        let mut tmpfile = NamedTempFile::new().unwrap();
        tmpfile.write_all(&vec![0u8; 8 * 512]).unwrap();
        tmpfile.flush().unwrap();

        {
            let mut device = StreamDevice::open(tmpfile.path(), &DeviceConfig::writable()).unwrap();
            assert_eq!(device.geometry().total_sectors, 8);
            device.write_sector(7, &[0x55u8; 512]).unwrap();
            device.flush().unwrap();
        }

        let mut device = StreamDevice::open(tmpfile.path(), &DeviceConfig::default()).unwrap();
        assert_eq!(device.read_sector(7).unwrap(), vec![0x55u8; 512]);
        assert!(matches!(
            device.write_sector(0, &[0u8; 512]),
            Err(Error::ReadOnly(_))
        ));
    }
}

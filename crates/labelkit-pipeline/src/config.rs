//! Device opening configuration

use labelkit_core::{validate_sector_size, DeviceGeometry, Error, Result};
use serde::{Deserialize, Serialize};

/// Configuration for opening a device image
///
/// Topology fields stand in for what a kernel would report for a real block
/// device; `None` and zero mean "not reported".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Logical sector size in bytes
    pub sector_size: u32,
    /// Physical sector size in bytes (defaults to the logical size)
    pub phys_sector_size: Option<u32>,
    /// Minimum I/O size in bytes (defaults to the physical size)
    pub min_io_size: Option<u32>,
    /// Optimal I/O size in bytes
    pub optimal_io_size: u32,
    /// Alignment offset in bytes
    pub alignment_offset: u32,
    /// Heads override for CHS translation
    pub heads: Option<u32>,
    /// Sectors-per-track override for CHS translation
    pub sectors: Option<u32>,
    /// Use memory mapping (read-only access only)
    pub use_mmap: bool,
    /// Open for writing
    pub writable: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sector_size: 512,
            phys_sector_size: None,
            min_io_size: None,
            optimal_io_size: 0,
            alignment_offset: 0,
            heads: None,
            sectors: None,
            use_mmap: false,
            writable: false,
        }
    }
}

impl DeviceConfig {
    /// Read-write configuration with default topology
    pub fn writable() -> Self {
        Self {
            writable: true,
            ..Self::default()
        }
    }

    /// Build the geometry of an image of `capacity` bytes
    ///
    /// # Errors
    ///
    /// Returns an error if a sector size is invalid or the topology is
    /// inconsistent (physical smaller than logical).
    pub fn geometry_for(&self, capacity: u64) -> Result<DeviceGeometry> {
        validate_sector_size(self.sector_size)?;
        let phys = self.phys_sector_size.unwrap_or(self.sector_size);
        if phys < self.sector_size || !phys.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "physical sector size {} is invalid for logical sector size {}",
                phys, self.sector_size
            )));
        }
        let min_io = self.min_io_size.unwrap_or(phys);
        if min_io == 0 {
            return Err(Error::invalid_argument("minimum I/O size must be non-zero"));
        }

        let total_sectors = capacity / self.sector_size as u64;
        let mut geometry = DeviceGeometry::for_capacity(total_sectors, self.sector_size);
        geometry.phys_sector_size = phys;
        geometry.min_io_size = min_io;
        geometry.optimal_io_size = self.optimal_io_size;
        geometry.alignment_offset = self.alignment_offset;

        if self.heads.is_some() || self.sectors.is_some() {
            let heads = self.heads.unwrap_or(geometry.heads);
            let sectors = self.sectors.unwrap_or(geometry.sectors);
            if heads == 0 || heads > 255 || sectors == 0 || sectors > 63 {
                return Err(Error::invalid_argument(format!(
                    "CHS override {} heads / {} sectors is out of range",
                    heads, sectors
                )));
            }
            geometry = geometry.with_chs(heads, sectors);
        }

        Ok(geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let geometry = DeviceConfig::default().geometry_for(100 * 1024 * 1024).unwrap();
        assert_eq!(geometry.total_sectors, 204800);
        assert_eq!(geometry.sector_size, 512);
        assert_eq!(geometry.phys_sector_size, 512);
        assert_eq!(geometry.min_io_size, 512);
        assert_eq!(geometry.heads, 255);
        assert_eq!(geometry.sectors, 63);
    }

    #[test]
    fn test_topology_and_chs_overrides() {
        let config = DeviceConfig {
            phys_sector_size: Some(4096),
            optimal_io_size: 65536,
            heads: Some(16),
            sectors: Some(32),
            ..DeviceConfig::default()
        };
        let geometry = config.geometry_for(512 * 10_000).unwrap();
        assert_eq!(geometry.phys_sector_size, 4096);
        assert_eq!(geometry.min_io_size, 4096);
        assert_eq!(geometry.optimal_io_size, 65536);
        assert_eq!(geometry.heads, 16);
        assert_eq!(geometry.cylinders, 10_000 / (16 * 32));
    }

    #[test]
    fn test_invalid_topology() {
        let config = DeviceConfig {
            sector_size: 4096,
            phys_sector_size: Some(512),
            ..DeviceConfig::default()
        };
        assert!(config.geometry_for(1 << 20).is_err());

        let config = DeviceConfig {
            sectors: Some(64),
            ..DeviceConfig::default()
        };
        assert!(config.geometry_for(1 << 20).is_err());
    }
}

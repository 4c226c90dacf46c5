//! Alignment and CHS geometry utilities
//!
//! Partition placement follows the device I/O topology: starts are rounded to
//! the *grain* (usually 1 MiB) and shifted by the device alignment offset.
//! CHS addressing is kept only for the legacy fields of DOS entries.

use labelkit_core::DeviceGeometry;
use serde::Serialize;
use std::fmt;

const ONE_MIB: u64 = 1024 * 1024;

/// Rounding direction for [`Alignment::align_lba`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignDirection {
    Up,
    Down,
    Nearest,
}

/// Alignment parameters in effect for one label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    sector_size: u64,
    phys_sector_size: u64,
    min_io_size: u64,
    alignment_offset: u64,
    /// Grain in bytes
    grain: u64,
    first_lba: u64,
}

impl Alignment {
    /// Topology-derived alignment: 1 MiB (or optimal I/O) grain, first
    /// partition one grain into the disk.
    pub fn for_geometry(geometry: &DeviceGeometry) -> Self {
        let sector_size = geometry.sector_size.max(1) as u64;
        let mut alignment_offset = geometry.alignment_offset as u64;
        if alignment_offset % sector_size != 0 {
            tracing::debug!(
                "ignoring alignment offset {} (not a multiple of the {}-byte sector)",
                alignment_offset,
                sector_size
            );
            alignment_offset = 0;
        }

        Self {
            sector_size,
            phys_sector_size: geometry.phys_sector_size as u64,
            min_io_size: geometry.min_io_size as u64,
            alignment_offset,
            grain: default_grain(geometry),
            first_lba: default_first_lba(geometry),
        }
    }

    /// DOS-compatible alignment: partitions start on track boundaries
    pub fn dos_compatible(geometry: &DeviceGeometry) -> Self {
        let mut alignment = Self::for_geometry(geometry);
        alignment.first_lba = geometry.sectors.max(1) as u64;
        alignment.grain = alignment.sector_size;
        alignment
    }

    /// Grain in bytes
    pub fn grain(&self) -> u64 {
        self.grain
    }

    /// Grain in logical sectors (at least one)
    pub fn grain_sectors(&self) -> u64 {
        (self.grain / self.sector_size).max(1)
    }

    /// Lowest LBA handed out by default
    pub fn first_lba(&self) -> u64 {
        self.first_lba
    }

    /// True when the grain is larger than one sector
    pub fn is_required(&self) -> bool {
        self.grain > self.sector_size
    }

    /// max(physical sector size, minimum I/O size) in bytes
    pub fn granularity(&self) -> u64 {
        self.phys_sector_size.max(self.min_io_size).max(self.sector_size)
    }

    /// Rounding unit in bytes: the grain, never finer than the granularity
    fn unit(&self) -> u64 {
        self.granularity().max(self.grain)
    }

    fn is_aligned_to(&self, lba: u64, granularity: u64) -> bool {
        let offset = (lba as u128 * self.sector_size as u128) % granularity as u128;
        offset as u64 == self.alignment_offset % granularity
    }

    /// Whether `lba` sits on a grain boundary, honoring the alignment offset
    pub fn lba_is_aligned(&self, lba: u64) -> bool {
        self.is_aligned_to(lba, self.unit())
    }

    /// Whether `lba` sits on a physical-sector/minimum-I/O boundary
    pub fn lba_is_phy_aligned(&self, lba: u64) -> bool {
        self.is_aligned_to(lba, self.granularity())
    }

    /// Round `lba` to the grain in the requested direction
    ///
    /// Values below the first usable LBA are raised to it. A non-zero device
    /// alignment offset shifts the rounded value back onto the offset grid;
    /// rounding up never returns less than `lba`, rounding down never more.
    pub fn align_lba(&self, lba: u64, direction: AlignDirection) -> u64 {
        if self.lba_is_aligned(lba) {
            return lba;
        }

        let (lba, direction) = if lba < self.first_lba {
            if self.lba_is_aligned(self.first_lba) {
                return self.first_lba;
            }
            (self.first_lba, AlignDirection::Up)
        } else {
            (lba, direction)
        };

        let sects = (self.unit() / self.sector_size).max(1);
        let mut res = match direction {
            AlignDirection::Up => (lba.saturating_add(sects) / sects) * sects,
            AlignDirection::Down => (lba / sects) * sects,
            AlignDirection::Nearest => (lba.saturating_add(sects / 2) / sects) * sects,
        };

        if self.alignment_offset != 0 && !self.lba_is_aligned(res) {
            let unit = self.unit();
            let shift = (unit - self.alignment_offset % unit) / self.sector_size;
            res = if res >= shift {
                res - shift
            } else {
                res + sects - shift
            };

            match direction {
                AlignDirection::Up => {
                    if res < lba {
                        res = res.saturating_add(sects);
                    }
                }
                AlignDirection::Down => {
                    if res.saturating_add(sects) <= lba {
                        res += sects;
                    }
                }
                AlignDirection::Nearest => {
                    if res.saturating_add(sects) <= lba {
                        res += sects;
                    }
                    if res < lba && lba - res > res + sects - lba {
                        res += sects;
                    }
                }
            }
        }

        res
    }

    /// Align `lba` to the nearest grain boundary inside an aligned `[start, stop]`
    pub fn align_lba_in_range(&self, lba: u64, start: u64, stop: u64) -> u64 {
        let start = self.align_lba(start, AlignDirection::Up);
        let stop = self.align_lba(stop, AlignDirection::Down);
        let lba = self.align_lba(lba, AlignDirection::Nearest);

        if lba < start {
            start
        } else if lba > stop {
            stop
        } else {
            lba
        }
    }
}

fn io_size(geometry: &DeviceGeometry) -> u64 {
    if geometry.optimal_io_size != 0 {
        geometry.optimal_io_size as u64
    } else {
        geometry.min_io_size as u64
    }
}

fn has_topology(geometry: &DeviceGeometry) -> bool {
    geometry.optimal_io_size != 0
        || geometry.alignment_offset != 0
        || !geometry.min_io_size.is_power_of_two()
}

/// Default offset of the first partition, in logical sectors
///
/// The alignment offset when the device reports one, else the optimal I/O
/// size when it exceeds 1 MiB, else 1 MiB. Halved on disks no larger than
/// four times that default.
pub fn default_first_lba(geometry: &DeviceGeometry) -> u64 {
    let sector_size = geometry.sector_size.max(1) as u64;
    let mut bytes = 0u64;

    if has_topology(geometry) {
        if geometry.alignment_offset != 0 {
            bytes = geometry.alignment_offset as u64;
        } else if io_size(geometry) > ONE_MIB {
            bytes = io_size(geometry);
        }
    }
    if bytes == 0 {
        bytes = ONE_MIB;
    }

    let mut res = bytes / sector_size;
    if geometry.total_sectors <= res.saturating_mul(4) {
        res = (res / 2).max(1);
    }
    res
}

/// Default grain in bytes: the I/O size, at least 1 MiB, falling back to one
/// physical sector on disks no larger than four grains
pub fn default_grain(geometry: &DeviceGeometry) -> u64 {
    let sector_size = geometry.sector_size.max(1) as u64;
    let mut res = io_size(geometry).max(ONE_MIB);

    if geometry.total_sectors <= res.saturating_mul(4) / sector_size {
        res = (geometry.phys_sector_size as u64).max(sector_size);
    }
    res
}

/// CHS (Cylinder-Head-Sector) address as stored in a DOS entry
///
/// Maximum values: 1023 cylinders, 255 heads, 63 sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChsAddress {
    pub cylinder: u16,
    pub head: u8,
    pub sector: u8,
}

impl ChsAddress {
    /// Highest cylinder a DOS entry can encode
    pub const MAX_CYLINDER: u16 = 1023;

    /// Parse CHS address from 3 bytes
    ///
    /// Format:
    /// - Byte 0: Head (0-255)
    /// - Byte 1: Sector (bits 0-5) + Cylinder high (bits 6-7)
    /// - Byte 2: Cylinder low (bits 0-7)
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let head = bytes[0];
        let sector = bytes[1] & 0x3F;
        let cylinder = (((bytes[1] & 0xC0) as u16) << 2) | bytes[2] as u16;

        Self {
            cylinder,
            head,
            sector,
        }
    }

    /// Convert CHS to bytes
    pub fn to_bytes(&self) -> [u8; 3] {
        let cyl_high = ((self.cylinder >> 8) & 0x03) as u8;
        let cyl_low = (self.cylinder & 0xFF) as u8;

        [self.head, (self.sector & 0x3F) | (cyl_high << 6), cyl_low]
    }

    /// Translate an LBA using `heads`/`sectors` per track
    ///
    /// LBAs past cylinder 1023 are clamped to the last representable address.
    /// A zero geometry yields the all-zero address.
    pub fn from_lba(lba: u64, heads: u32, sectors: u32) -> Self {
        if heads == 0 || sectors == 0 {
            return Self::default();
        }
        // head and sector fields hold at most 255 and 63
        let (heads, sectors) = (heads.min(256) as u64, sectors.min(63) as u64);
        let per_cylinder = heads * sectors;
        let lba = if lba / per_cylinder > Self::MAX_CYLINDER as u64 {
            per_cylinder * (Self::MAX_CYLINDER as u64 + 1) - 1
        } else {
            lba
        };

        let (cylinder, head, sector) = split_lba(lba, heads as u32, sectors as u32);
        Self {
            cylinder: cylinder as u16,
            head: head as u8,
            sector: sector as u8,
        }
    }

    /// Convert CHS to LBA, `None` for the invalid sector number 0
    pub fn to_lba(&self, heads: u32, sectors: u32) -> Option<u64> {
        if self.sector == 0 {
            return None;
        }
        let c = self.cylinder as u64;
        let h = self.head as u64;
        let s = (self.sector - 1) as u64;

        Some((c * heads as u64 + h) * sectors as u64 + s)
    }
}

impl fmt::Display for ChsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cylinder, self.head, self.sector)
    }
}

/// Unclamped (cylinder, head, sector) split of an LBA; sectors count from 1
pub fn split_lba(lba: u64, heads: u32, sectors: u32) -> (u64, u64, u64) {
    if heads == 0 || sectors == 0 {
        return (0, 0, 0);
    }
    let (heads, sectors) = (heads as u64, sectors as u64);
    let sector = lba % sectors + 1;
    let track = lba / sectors;
    (track / heads, track % heads, sector)
}

//! Core types for the partition-table engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Heads assumed when a device reports no geometry
pub const DEFAULT_HEADS: u32 = 255;

/// Sectors per track assumed when a device reports no geometry
pub const DEFAULT_SECTORS: u32 = 63;

/// Geometry and I/O topology of a block device
///
/// All sizes are in bytes except `heads`, `sectors`, `cylinders` and
/// `total_sectors`. A zero `optimal_io_size` or `alignment_offset` means the
/// device does not report one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    pub heads: u32,
    pub sectors: u32,
    pub cylinders: u64,
    pub sector_size: u32,
    pub phys_sector_size: u32,
    pub min_io_size: u32,
    pub optimal_io_size: u32,
    pub alignment_offset: u32,
    pub total_sectors: u64,
}

impl DeviceGeometry {
    /// Geometry for a device of `total_sectors` logical sectors with no
    /// reported topology, using the 255-head/63-sector translation.
    pub fn for_capacity(total_sectors: u64, sector_size: u32) -> Self {
        let mut geom = Self {
            heads: DEFAULT_HEADS,
            sectors: DEFAULT_SECTORS,
            cylinders: 0,
            sector_size,
            phys_sector_size: sector_size,
            min_io_size: sector_size,
            optimal_io_size: 0,
            alignment_offset: 0,
            total_sectors,
        };
        geom.recompute_cylinders();
        geom
    }

    /// Replace heads/sectors and derive the cylinder count from capacity
    pub fn with_chs(mut self, heads: u32, sectors: u32) -> Self {
        self.heads = heads;
        self.sectors = sectors;
        self.recompute_cylinders();
        self
    }

    /// Sectors in one cylinder (`heads * sectors`)
    pub fn cylinder_size(&self) -> u64 {
        self.heads as u64 * self.sectors as u64
    }

    /// Last addressable LBA, or 0 for an empty device
    pub fn last_lba(&self) -> u64 {
        self.total_sectors.saturating_sub(1)
    }

    /// Device capacity in bytes (saturating)
    pub fn capacity_bytes(&self) -> u64 {
        self.total_sectors.saturating_mul(self.sector_size as u64)
    }

    fn recompute_cylinders(&mut self) {
        let per_cylinder = self.cylinder_size();
        self.cylinders = if per_cylinder == 0 {
            0
        } else {
            self.total_sectors / per_cylinder
        };
    }
}

impl fmt::Display for DeviceGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {} sectors, {} heads, {} sectors/track, {} cylinders, sector size {}/{} bytes",
            format_size(self.capacity_bytes()),
            self.total_sectors,
            self.heads,
            self.sectors,
            self.cylinders,
            self.sector_size,
            self.phys_sector_size
        )
    }
}

/// Format size in human-readable format
pub fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = size as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// A zone (partition) as seen through either table format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Zero-based partition index within the table
    pub index: usize,

    /// First sector (absolute LBA)
    pub start: u64,

    /// Length in sectors
    pub size: u64,

    /// Human-readable type name (e.g., "Linux", "EFI System")
    pub zone_type: String,

    /// Raw type code: two hex digits for DOS, a GUID string for GPT
    pub type_code: String,

    /// DOS boot indicator or GPT legacy-BIOS-bootable attribute
    pub bootable: bool,

    /// GPT partition name
    pub name: Option<String>,

    /// True for DOS logical partitions
    pub logical: bool,
}

impl Zone {
    /// Create a new zone
    pub fn new(index: usize, start: u64, size: u64, zone_type: String, type_code: String) -> Self {
        Self {
            index,
            start,
            size,
            zone_type,
            type_code,
            bootable: false,
            name: None,
            logical: false,
        }
    }

    /// Last sector (inclusive)
    pub fn end(&self) -> u64 {
        (self.start + self.size).saturating_sub(1)
    }

    /// Mark the zone bootable
    pub fn with_bootable(mut self, bootable: bool) -> Self {
        self.bootable = bootable;
        self
    }

    /// Attach a partition name
    pub fn with_name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    /// Mark as a DOS logical partition
    pub fn with_logical(mut self, logical: bool) -> Self {
        self.logical = logical;
        self
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>3}{} {:>12} {:>12} {:>12}  {} ({})",
            self.index + 1,
            if self.bootable { '*' } else { ' ' },
            self.start,
            self.end(),
            self.size,
            self.zone_type,
            self.type_code
        )?;
        if let Some(ref name) = self.name {
            if !name.is_empty() {
                write!(f, " \"{}\"", name)?;
            }
        }
        Ok(())
    }
}

/// How serious a verification finding is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// Category of a verification finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Two used partitions share sectors
    Overlap,
    /// Partition outside usable or device bounds, or start after end
    Bounds,
    /// CHS fields disagree with the LBA fields or the declared geometry
    Geometry,
    /// Partition does not start on a physical-sector boundary
    Alignment,
    /// Table entries are not in ascending disk order
    Order,
    /// Table content looks like garbage
    Garbage,
    /// Header or entry-array checksum mismatch
    Checksum,
    /// Header fields are inconsistent or disagree with the mirror copy
    Header,
    /// A redundant copy is missing or was rebuilt from its mirror
    Redundancy,
    /// Extended-partition chain anomaly (loop, truncation, empty link)
    Chain,
    /// Sector accounting (allocated vs. device size)
    Usage,
    /// Anything else worth reporting
    Other,
}

/// One result of a table verification pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub kind: FindingKind,
    /// Zero-based partition index the finding refers to, if any
    pub partition: Option<usize>,
    pub message: String,
}

impl Finding {
    /// Create a finding
    pub fn new(severity: Severity, kind: FindingKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            partition: None,
            message: message.into(),
        }
    }

    /// Create an error finding
    pub fn error(kind: FindingKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, kind, message)
    }

    /// Create a warning finding
    pub fn warning(kind: FindingKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, kind, message)
    }

    /// Create an informational finding
    pub fn info(kind: FindingKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, kind, message)
    }

    /// Attach the partition index
    pub fn for_partition(mut self, index: usize) -> Self {
        self.partition = Some(index);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.partition {
            Some(index) => write!(
                f,
                "{}: partition {}: {}",
                self.severity,
                index + 1,
                self.message
            ),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// True if any finding has error severity
pub fn has_errors(findings: &[Finding]) -> bool {
    findings.iter().any(Finding::is_error)
}

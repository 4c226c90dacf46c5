//! DOS partition entries and type codes

use crate::geometry::ChsAddress;
use labelkit_core::endian::{read_u32_le, write_u32_le};
use std::fmt;

/// Offset of the disk signature in sector 0
pub const DISK_SIGNATURE_OFFSET: usize = 0x1B8;

/// Offset of the first partition entry
pub const PARTITION_TABLE_OFFSET: usize = 0x1BE;

/// Size of each partition entry
pub const PARTITION_ENTRY_SIZE: usize = 16;

/// Number of entries in sector 0 and in each EBR
pub const NUM_PARTITIONS: usize = 4;

/// Offset of the 0x55 0xAA magic
pub const BOOT_SIGNATURE_OFFSET: usize = 0x1FE;

/// Boot indicator value for an active partition
pub const ACTIVE_FLAG: u8 = 0x80;

/// DOS partition type code
///
/// Any byte is a valid code; the associated constants name the ones the
/// engine treats specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MbrPartitionType(pub u8);

impl MbrPartitionType {
    /// Empty/unused partition entry
    pub const EMPTY: Self = Self(0x00);
    /// FAT12, CHS
    pub const FAT12: Self = Self(0x01);
    /// Extended partition, CHS
    pub const EXTENDED: Self = Self(0x05);
    /// FAT16 >= 32MB, CHS
    pub const FAT16: Self = Self(0x06);
    /// NTFS/exFAT/HPFS
    pub const NTFS: Self = Self(0x07);
    /// FAT32, LBA
    pub const FAT32_LBA: Self = Self(0x0C);
    /// Extended partition, LBA
    pub const EXTENDED_LBA: Self = Self(0x0F);
    /// Linux swap
    pub const LINUX_SWAP: Self = Self(0x82);
    /// Linux native
    pub const LINUX: Self = Self(0x83);
    /// Linux extended
    pub const LINUX_EXTENDED: Self = Self(0x85);
    /// Linux LVM
    pub const LINUX_LVM: Self = Self(0x8E);
    /// GPT protective MBR
    pub const GPT_PROTECTIVE: Self = Self(0xEE);
    /// EFI system partition
    pub const EFI_SYSTEM: Self = Self(0xEF);
    /// Linux raid autodetect
    pub const LINUX_RAID: Self = Self(0xFD);

    /// Create a partition type from a byte value
    pub fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Get the byte value of this partition type
    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// Whether this code marks an extended (EBR chain) container
    pub fn is_extended(self) -> bool {
        matches!(self.0, 0x05 | 0x0F | 0x85)
    }

    /// Get a human-readable name for this partition type
    pub fn name(&self) -> &'static str {
        DOS_TYPE_NAMES
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }
}

impl fmt::Display for MbrPartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::LowerHex for MbrPartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

static DOS_TYPE_NAMES: &[(u8, &str)] = &[
    (0x00, "Empty"),
    (0x01, "FAT12"),
    (0x02, "XENIX root"),
    (0x03, "XENIX usr"),
    (0x04, "FAT16 <32M"),
    (0x05, "Extended"),
    (0x06, "FAT16"),
    (0x07, "HPFS/NTFS/exFAT"),
    (0x08, "AIX"),
    (0x09, "AIX bootable"),
    (0x0a, "OS/2 Boot Manager"),
    (0x0b, "W95 FAT32"),
    (0x0c, "W95 FAT32 (LBA)"),
    (0x0e, "W95 FAT16 (LBA)"),
    (0x0f, "W95 Ext'd (LBA)"),
    (0x10, "OPUS"),
    (0x11, "Hidden FAT12"),
    (0x12, "Compaq diagnostics"),
    (0x14, "Hidden FAT16 <32M"),
    (0x16, "Hidden FAT16"),
    (0x17, "Hidden HPFS/NTFS"),
    (0x18, "AST SmartSleep"),
    (0x1b, "Hidden W95 FAT32"),
    (0x1c, "Hidden W95 FAT32 (LBA)"),
    (0x1e, "Hidden W95 FAT16 (LBA)"),
    (0x24, "NEC DOS"),
    (0x27, "Hidden NTFS WinRE"),
    (0x39, "Plan 9"),
    (0x3c, "PartitionMagic recovery"),
    (0x40, "Venix 80286"),
    (0x41, "PPC PReP Boot"),
    (0x42, "SFS"),
    (0x4d, "QNX4.x"),
    (0x4e, "QNX4.x 2nd part"),
    (0x4f, "QNX4.x 3rd part"),
    (0x50, "OnTrack DM"),
    (0x51, "OnTrack DM6 Aux1"),
    (0x52, "CP/M"),
    (0x53, "OnTrack DM6 Aux3"),
    (0x54, "OnTrackDM6"),
    (0x55, "EZ-Drive"),
    (0x56, "Golden Bow"),
    (0x5c, "Priam Edisk"),
    (0x61, "SpeedStor"),
    (0x63, "GNU HURD or SysV"),
    (0x64, "Novell Netware 286"),
    (0x65, "Novell Netware 386"),
    (0x70, "DiskSecure Multi-Boot"),
    (0x75, "PC/IX"),
    (0x80, "Old Minix"),
    (0x81, "Minix / old Linux"),
    (0x82, "Linux swap / Solaris"),
    (0x83, "Linux"),
    (0x84, "OS/2 hidden or Intel hibernation"),
    (0x85, "Linux extended"),
    (0x86, "NTFS volume set"),
    (0x87, "NTFS volume set"),
    (0x88, "Linux plaintext"),
    (0x8e, "Linux LVM"),
    (0x93, "Amoeba"),
    (0x94, "Amoeba BBT"),
    (0x9f, "BSD/OS"),
    (0xa0, "IBM Thinkpad hibernation"),
    (0xa5, "FreeBSD"),
    (0xa6, "OpenBSD"),
    (0xa7, "NeXTSTEP"),
    (0xa8, "Darwin UFS"),
    (0xa9, "NetBSD"),
    (0xab, "Darwin boot"),
    (0xaf, "HFS / HFS+"),
    (0xb7, "BSDI fs"),
    (0xb8, "BSDI swap"),
    (0xbb, "Boot Wizard hidden"),
    (0xbc, "Acronis FAT32 LBA"),
    (0xbe, "Solaris boot"),
    (0xbf, "Solaris"),
    (0xc1, "DRDOS/sec (FAT-12)"),
    (0xc4, "DRDOS/sec (FAT-16 < 32M)"),
    (0xc6, "DRDOS/sec (FAT-16)"),
    (0xc7, "Syrinx"),
    (0xda, "Non-FS data"),
    (0xdb, "CP/M / CTOS / ..."),
    (0xde, "Dell Utility"),
    (0xdf, "BootIt"),
    (0xe1, "DOS access"),
    (0xe3, "DOS R/O"),
    (0xe4, "SpeedStor"),
    (0xea, "Linux extended boot"),
    (0xeb, "BeOS fs"),
    (0xee, "GPT"),
    (0xef, "EFI (FAT-12/16/32)"),
    (0xf0, "Linux/PA-RISC boot"),
    (0xf1, "SpeedStor"),
    (0xf2, "DOS secondary"),
    (0xf4, "SpeedStor"),
    (0xf8, "EBBR protective"),
    (0xfb, "VMware VMFS"),
    (0xfc, "VMware VMKCORE"),
    (0xfd, "Linux raid autodetect"),
    (0xfe, "LANstep"),
    (0xff, "BBT"),
];

/// Known DOS partition types as `(code, name)` pairs
pub fn known_types() -> &'static [(u8, &'static str)] {
    DOS_TYPE_NAMES
}

/// One 16-byte DOS partition entry
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0x00    1     Boot indicator (0x80 = active)
/// 0x01    3     Start CHS
/// 0x04    1     Partition type
/// 0x05    3     End CHS
/// 0x08    4     Start LBA (relative, little-endian)
/// 0x0C    4     Sector count (little-endian)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DosEntry {
    pub boot_ind: u8,
    pub start_chs: [u8; 3],
    pub sys_ind: MbrPartitionType,
    pub end_chs: [u8; 3],
    pub start: u32,
    pub size: u32,
}

impl DosEntry {
    /// Decode an entry from its 16 on-disk bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            boot_ind: bytes[0],
            start_chs: [bytes[1], bytes[2], bytes[3]],
            sys_ind: MbrPartitionType(bytes[4]),
            end_chs: [bytes[5], bytes[6], bytes[7]],
            start: read_u32_le(bytes, 8),
            size: read_u32_le(bytes, 12),
        }
    }

    /// Encode the entry into 16 bytes
    pub fn to_bytes(&self) -> [u8; PARTITION_ENTRY_SIZE] {
        let mut out = [0u8; PARTITION_ENTRY_SIZE];
        out[0] = self.boot_ind;
        out[1..4].copy_from_slice(&self.start_chs);
        out[4] = self.sys_ind.0;
        out[5..8].copy_from_slice(&self.end_chs);
        write_u32_le(&mut out, 8, self.start);
        write_u32_le(&mut out, 12, self.size);
        out
    }

    /// Decode entry `slot` (0..4) of a sector buffer
    pub fn read_slot(sector: &[u8], slot: usize) -> Self {
        let offset = PARTITION_TABLE_OFFSET + slot * PARTITION_ENTRY_SIZE;
        Self::from_bytes(&sector[offset..offset + PARTITION_ENTRY_SIZE])
    }

    /// Encode this entry into slot `slot` (0..4) of a sector buffer
    pub fn write_slot(&self, sector: &mut [u8], slot: usize) {
        let offset = PARTITION_TABLE_OFFSET + slot * PARTITION_ENTRY_SIZE;
        sector[offset..offset + PARTITION_ENTRY_SIZE].copy_from_slice(&self.to_bytes());
    }

    /// An entry is in use when it covers at least one sector; the type byte
    /// does not matter
    pub fn is_used(&self) -> bool {
        self.size != 0
    }

    pub fn is_extended(&self) -> bool {
        self.sys_ind.is_extended()
    }

    pub fn is_bootable(&self) -> bool {
        self.boot_ind == ACTIVE_FLAG
    }

    /// Whether the entry is all zeros
    pub fn is_cleared(&self) -> bool {
        *self == Self::default()
    }

    pub fn start_chs(&self) -> ChsAddress {
        ChsAddress::from_bytes(&self.start_chs)
    }

    pub fn end_chs(&self) -> ChsAddress {
        ChsAddress::from_bytes(&self.end_chs)
    }

    /// Fill all fields for a partition at relative `start` and absolute
    /// `abs_start`, clamping the CHS fields to cylinder 1023
    pub fn set(
        &mut self,
        start: u32,
        size: u32,
        abs_start: u64,
        sys_ind: MbrPartitionType,
        heads: u32,
        sectors: u32,
    ) {
        self.sys_ind = sys_ind;
        self.start = start;
        self.size = size;
        self.set_chs(abs_start, heads, sectors);
    }

    /// Recompute CHS fields from `abs_start` and the current size
    pub fn set_chs(&mut self, abs_start: u64, heads: u32, sectors: u32) {
        let abs_end = (abs_start + self.size as u64).saturating_sub(1);
        self.start_chs = ChsAddress::from_lba(abs_start, heads, sectors).to_bytes();
        self.end_chs = ChsAddress::from_lba(abs_end, heads, sectors).to_bytes();
    }

    /// Reset to an all-zero entry
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// True when bytes 510/511 hold 0x55 0xAA
pub fn has_boot_signature(sector: &[u8]) -> bool {
    sector.len() >= 512
        && sector[BOOT_SIGNATURE_OFFSET] == 0x55
        && sector[BOOT_SIGNATURE_OFFSET + 1] == 0xAA
}

/// Write 0x55 0xAA at bytes 510/511
pub fn set_boot_signature(sector: &mut [u8]) {
    sector[BOOT_SIGNATURE_OFFSET] = 0x55;
    sector[BOOT_SIGNATURE_OFFSET + 1] = 0xAA;
}

//! GPT identifiers, partition entries and type names

use labelkit_core::{
    endian::{read_u64_le, write_u64_le},
    DiskContext, Error, Result,
};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// GUID as used by GPT
///
/// On disk the first three fields are little-endian (mixed-endian layout);
/// the in-memory value is the canonical UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid(Uuid);

impl Default for Guid {
    fn default() -> Self {
        Self::NIL
    }
}

impl Guid {
    /// All-zero GUID, marks an unused entry
    pub const NIL: Self = Self(Uuid::nil());

    pub const EFI_SYSTEM: Self = Self::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
    pub const BIOS_BOOT: Self = Self::from_u128(0x21686148_6449_6E6F_744E_656564454649);
    pub const MICROSOFT_RESERVED: Self = Self::from_u128(0xE3C9E316_0B5C_4DB8_817D_F92DF00215AE);
    pub const MICROSOFT_BASIC_DATA: Self = Self::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);
    pub const LINUX_FILESYSTEM: Self = Self::from_u128(0x0FC63DAF_8483_4772_8E79_3D69D8477DE4);
    pub const LINUX_RAID: Self = Self::from_u128(0xA19D880F_05FC_4D3B_A006_743F0F84911E);
    pub const LINUX_SWAP: Self = Self::from_u128(0x0657FD6D_A4AB_43C4_84E5_0933C84B4F4F);
    pub const LINUX_LVM: Self = Self::from_u128(0xE6D6D379_F507_44C2_A23C_238F2A3DF928);

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Decode the 16 on-disk bytes
    pub fn from_disk_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&bytes[..16]);
        Self(Uuid::from_bytes_le(raw))
    }

    /// Encode into the 16 on-disk bytes
    pub fn to_disk_bytes(&self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    /// Fresh version-4 GUID from the device's entropy source
    pub fn random(ctx: &mut DiskContext<'_>) -> Self {
        let mut bytes = [0u8; 16];
        ctx.random_bytes(&mut bytes);
        Self(uuid::Builder::from_random_bytes(bytes).into_uuid())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Name from the type table, if this is a known partition type
    pub fn type_name(&self) -> Option<&'static str> {
        GPT_TYPES
            .iter()
            .find(|(guid, _)| guid == self)
            .map(|&(_, name)| name)
    }
}

impl From<Uuid> for Guid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::invalid_argument(format!("invalid GUID '{}': {}", s, e)))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.hyphenated().encode_upper(&mut Uuid::encode_buffer()))
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

static GPT_TYPES: &[(Guid, &str)] = &[
    // Generic
    (Guid::EFI_SYSTEM, "EFI System"),
    (Guid::from_u128(0x024DEE41_33E7_11D3_9D69_0008C781F39F), "MBR partition scheme"),
    (Guid::BIOS_BOOT, "BIOS boot partition"),
    // Windows
    (Guid::MICROSOFT_RESERVED, "Microsoft reserved"),
    (Guid::MICROSOFT_BASIC_DATA, "Microsoft basic data"),
    (Guid::from_u128(0x5808C8AA_7E8F_42E0_85D2_E1E90434CFB3), "Microsoft LDM metadata"),
    (Guid::from_u128(0xAF9B60A0_1431_4F62_BC68_3311714A69AD), "Microsoft LDM data"),
    (Guid::from_u128(0xDE94BBA4_06D1_4D40_A16A_BFD50179D6AC), "Windows recovery environment"),
    (Guid::from_u128(0x37AFFC90_EF7D_4E96_91C3_2D7AE055B174), "IBM General Parallel Fs"),
    // HP-UX
    (Guid::from_u128(0x75894C1E_3AEB_11D3_B7C1_7B03A0000000), "HP-UX data partition"),
    (Guid::from_u128(0xE2A1E728_32E3_11D6_A682_7B03A0000000), "HP-UX service partition"),
    // Linux
    (Guid::LINUX_FILESYSTEM, "Linux filesystem"),
    (Guid::LINUX_RAID, "Linux RAID"),
    (Guid::LINUX_SWAP, "Linux swap"),
    (Guid::LINUX_LVM, "Linux LVM"),
    (Guid::from_u128(0x8DA63339_0007_60C0_C436_083AC8230908), "Linux reserved"),
    // FreeBSD
    (Guid::from_u128(0x516E7CB4_6ECF_11D6_8FF8_00022D09712B), "FreeBSD data"),
    (Guid::from_u128(0x83BD6B9D_7F41_11DC_BE0B_001560B84F0F), "FreeBSD boot"),
    (Guid::from_u128(0x516E7CB5_6ECF_11D6_8FF8_00022D09712B), "FreeBSD swap"),
    (Guid::from_u128(0x516E7CB6_6ECF_11D6_8FF8_00022D09712B), "FreeBSD UFS"),
    (Guid::from_u128(0x516E7CBA_6ECF_11D6_8FF8_00022D09712B), "FreeBSD ZFS"),
    (Guid::from_u128(0x516E7CB8_6ECF_11D6_8FF8_00022D09712B), "FreeBSD Vinum"),
    // Apple
    (Guid::from_u128(0x48465300_0000_11AA_AA11_00306543ECAC), "Apple HFS/HFS+"),
    (Guid::from_u128(0x55465300_0000_11AA_AA11_00306543ECAC), "Apple UFS"),
    (Guid::from_u128(0x52414944_0000_11AA_AA11_00306543ECAC), "Apple RAID"),
    (Guid::from_u128(0x52414944_5F4F_11AA_AA11_00306543ECAC), "Apple RAID offline"),
    (Guid::from_u128(0x426F6F74_0000_11AA_AA11_00306543ECAC), "Apple boot"),
    (Guid::from_u128(0x4C616265_6C00_11AA_AA11_00306543ECAC), "Apple label"),
    (Guid::from_u128(0x5265636F_7665_11AA_AA11_00306543ECAC), "Apple TV recovery"),
    (Guid::from_u128(0x53746F72_6167_11AA_AA11_00306543ECAC), "Apple Core storage"),
    // Solaris
    (Guid::from_u128(0x6A82CB45_1DD2_11B2_99A6_080020736631), "Solaris boot"),
    (Guid::from_u128(0x6A85CF4D_1DD2_11B2_99A6_080020736631), "Solaris root"),
    (Guid::from_u128(0x6A898CC3_1DD2_11B2_99A6_080020736631), "Solaris /usr & Apple ZFS"),
    (Guid::from_u128(0x6A87C46F_1DD2_11B2_99A6_080020736631), "Solaris swap"),
    (Guid::from_u128(0x6A8B642B_1DD2_11B2_99A6_080020736631), "Solaris backup"),
    (Guid::from_u128(0x6A8EF2E9_1DD2_11B2_99A6_080020736631), "Solaris /var"),
    (Guid::from_u128(0x6A90BA39_1DD2_11B2_99A6_080020736631), "Solaris /home"),
    (Guid::from_u128(0x6A9283A5_1DD2_11B2_99A6_080020736631), "Solaris alternate sector"),
    (Guid::from_u128(0x6A945A3B_1DD2_11B2_99A6_080020736631), "Solaris reserved 1"),
    (Guid::from_u128(0x6A9630D1_1DD2_11B2_99A6_080020736631), "Solaris reserved 2"),
    (Guid::from_u128(0x6A980767_1DD2_11B2_99A6_080020736631), "Solaris reserved 3"),
    (Guid::from_u128(0x6A96237F_1DD2_11B2_99A6_080020736631), "Solaris reserved 4"),
    (Guid::from_u128(0x6A8D2AC7_1DD2_11B2_99A6_080020736631), "Solaris reserved 5"),
    // NetBSD
    (Guid::from_u128(0x49F48D32_B10E_11DC_B99B_0019D1879648), "NetBSD swap"),
    (Guid::from_u128(0x49F48D5A_B10E_11DC_B99B_0019D1879648), "NetBSD FFS"),
    (Guid::from_u128(0x49F48D82_B10E_11DC_B99B_0019D1879648), "NetBSD LFS"),
    (Guid::from_u128(0x2DB519C4_B10E_11DC_B99B_0019D1879648), "NetBSD concatenated"),
    (Guid::from_u128(0x2DB519EC_B10E_11DC_B99B_0019D1879648), "NetBSD encrypted"),
    (Guid::from_u128(0x49F48DAA_B10E_11DC_B99B_0019D1879648), "NetBSD RAID"),
    // ChromeOS
    (Guid::from_u128(0xFE3A2A5D_4F32_41A7_B725_ACCC3285A309), "ChromeOS kernel"),
    (Guid::from_u128(0x3CB8E202_3B7E_47DD_8A3C_7FF2A13CFCEC), "ChromeOS root fs"),
    (Guid::from_u128(0x2E0A753D_9E48_43B0_8337_B15192CB1B5E), "ChromeOS reserved"),
    // MidnightBSD
    (Guid::from_u128(0x85D5E45A_237C_11E1_B4B3_E89A8F7FC3A7), "MidnightBSD data"),
    (Guid::from_u128(0x85D5E45E_237C_11E1_B4B3_E89A8F7FC3A7), "MidnightBSD boot"),
    (Guid::from_u128(0x85D5E45B_237C_11E1_B4B3_E89A8F7FC3A7), "MidnightBSD swap"),
    (Guid::from_u128(0x0394EF8B_237C_11E1_B4B3_E89A8F7FC3A7), "MidnightBSD UFS"),
    (Guid::from_u128(0x85D5E45D_237C_11E1_B4B3_E89A8F7FC3A7), "MidnightBSD ZFS"),
    (Guid::from_u128(0x85D5E45C_237C_11E1_B4B3_E89A8F7FC3A7), "MidnightBSD Vinum"),
];

/// All known partition type GUIDs with their names
pub fn known_types() -> &'static [(Guid, &'static str)] {
    GPT_TYPES
}

/// Platform required (bit 0)
pub const ATTR_REQUIRED: u64 = 1 << 0;
/// EFI firmware should not provide block I/O for this partition (bit 1)
pub const ATTR_NO_BLOCK_IO: u64 = 1 << 1;
/// Legacy BIOS bootable (bit 2)
pub const ATTR_LEGACY_BIOS_BOOTABLE: u64 = 1 << 2;
/// First of the sixteen type-specific bits
pub const ATTR_GUID_SPECIFIC_SHIFT: u32 = 48;

/// Names of the attribute bits set in `attributes`
pub fn attribute_names(attributes: u64) -> Vec<String> {
    let mut names = Vec::new();
    if attributes & ATTR_REQUIRED != 0 {
        names.push("RequiredPartition".to_string());
    }
    if attributes & ATTR_NO_BLOCK_IO != 0 {
        names.push("NoBlockIOProtocol".to_string());
    }
    if attributes & ATTR_LEGACY_BIOS_BOOTABLE != 0 {
        names.push("LegacyBIOSBootable".to_string());
    }
    for bit in ATTR_GUID_SPECIFIC_SHIFT..64 {
        if attributes & (1u64 << bit) != 0 {
            names.push(format!("GUID:{}", bit));
        }
    }
    names
}

const NAME_OFFSET: usize = 56;
const NAME_BYTES: usize = 72;

/// One 128-byte partition entry
///
/// The name field is kept as raw UTF-16LE bytes so unmodified entries
/// encode back to the exact bytes they were read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Guid,
    pub unique_guid: Guid,
    /// First LBA (inclusive)
    pub first_lba: u64,
    /// Last LBA (inclusive)
    pub last_lba: u64,
    pub attributes: u64,
    name: [u8; NAME_BYTES],
}

impl Default for GptEntry {
    fn default() -> Self {
        Self {
            type_guid: Guid::NIL,
            unique_guid: Guid::NIL,
            first_lba: 0,
            last_lba: 0,
            attributes: 0,
            name: [0u8; NAME_BYTES],
        }
    }
}

impl GptEntry {
    /// Bytes of the defined entry fields
    pub const ENTRY_SIZE: usize = 128;
    /// Maximum name length in UTF-16 code units
    pub const NAME_UNITS: usize = NAME_BYTES / 2;

    /// Unnamed entry with no attributes
    pub fn new(type_guid: Guid, unique_guid: Guid, first_lba: u64, last_lba: u64) -> Self {
        Self {
            type_guid,
            unique_guid,
            first_lba,
            last_lba,
            ..Default::default()
        }
    }

    /// Decode the first 128 bytes of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut name = [0u8; NAME_BYTES];
        name.copy_from_slice(&bytes[NAME_OFFSET..Self::ENTRY_SIZE]);

        Self {
            type_guid: Guid::from_disk_bytes(&bytes[0..16]),
            unique_guid: Guid::from_disk_bytes(&bytes[16..32]),
            first_lba: read_u64_le(bytes, 32),
            last_lba: read_u64_le(bytes, 40),
            attributes: read_u64_le(bytes, 48),
            name,
        }
    }

    /// Encode into the first 128 bytes of `out`
    pub fn write_to(&self, out: &mut [u8]) {
        out[0..16].copy_from_slice(&self.type_guid.to_disk_bytes());
        out[16..32].copy_from_slice(&self.unique_guid.to_disk_bytes());
        write_u64_le(out, 32, self.first_lba);
        write_u64_le(out, 40, self.last_lba);
        write_u64_le(out, 48, self.attributes);
        out[NAME_OFFSET..Self::ENTRY_SIZE].copy_from_slice(&self.name);
    }

    /// An entry is unused iff its type GUID is all zero
    pub fn is_unused(&self) -> bool {
        self.type_guid.is_nil()
    }

    /// Length in sectors, 0 when the end precedes the start
    pub fn size(&self) -> u64 {
        if self.last_lba >= self.first_lba {
            self.last_lba - self.first_lba + 1
        } else {
            0
        }
    }

    pub fn contains(&self, lba: u64) -> bool {
        lba >= self.first_lba && lba <= self.last_lba
    }

    /// Whether the spans of two entries share a sector
    pub fn overlaps(&self, other: &GptEntry) -> bool {
        self.first_lba != 0
            && other.first_lba != 0
            && self.first_lba <= other.last_lba
            && other.first_lba <= self.last_lba
    }

    /// Partition name, decoded up to the first NUL
    pub fn name(&self) -> String {
        let units: Vec<u16> = self
            .name
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }

    /// Replace the name
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the name needs more than 36 UTF-16 units.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let units: Vec<u16> = name.encode_utf16().collect();
        if units.len() > Self::NAME_UNITS {
            return Err(Error::invalid_argument(format!(
                "partition name '{}' is longer than {} UTF-16 characters",
                name,
                Self::NAME_UNITS
            )));
        }
        self.name = [0u8; NAME_BYTES];
        for (i, unit) in units.iter().enumerate() {
            self.name[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
        Ok(())
    }

    /// Human-readable type name, "unknown" for unlisted GUIDs
    pub fn type_name(&self) -> &'static str {
        self.type_guid.type_name().unwrap_or("unknown")
    }

    pub fn is_legacy_bootable(&self) -> bool {
        self.attributes & ATTR_LEGACY_BIOS_BOOTABLE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_disk_layout_is_mixed_endian() {
        let bytes = Guid::LINUX_FILESYSTEM.to_disk_bytes();
        assert_eq!(
            bytes,
            [
                0xaf, 0x3d, 0xc6, 0x0f, 0x83, 0x84, 0x72, 0x47, 0x8e, 0x79, 0x3d, 0x69, 0xd8,
                0x47, 0x7d, 0xe4,
            ]
        );
        assert_eq!(Guid::from_disk_bytes(&bytes), Guid::LINUX_FILESYSTEM);
    }

    #[test]
    fn test_guid_display_and_parse() {
        assert_eq!(
            Guid::EFI_SYSTEM.to_string(),
            "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"
        );
        let parsed: Guid = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b".parse().unwrap();
        assert_eq!(parsed, Guid::EFI_SYSTEM);
        assert!("not-a-guid".parse::<Guid>().is_err());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Guid::EFI_SYSTEM.type_name(), Some("EFI System"));
        assert_eq!(Guid::LINUX_SWAP.type_name(), Some("Linux swap"));
        assert_eq!(Guid::from_u128(1).type_name(), None);
        assert!(known_types().len() > 50);
    }

    #[test]
    fn test_entry_decode() {
        let mut bytes = [0u8; 128];
        bytes[0..16].copy_from_slice(&Guid::LINUX_FILESYSTEM.to_disk_bytes());
        bytes[32..40].copy_from_slice(&100u64.to_le_bytes());
        bytes[40..48].copy_from_slice(&199u64.to_le_bytes());
        for (i, unit) in "Test".encode_utf16().enumerate() {
            bytes[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }

        let entry = GptEntry::from_bytes(&bytes);
        assert!(!entry.is_unused());
        assert_eq!(entry.size(), 100);
        assert_eq!(entry.name(), "Test");
        assert_eq!(entry.type_name(), "Linux filesystem");

        let mut out = [0u8; 128];
        entry.write_to(&mut out);
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_unused_entry() {
        let entry = GptEntry::from_bytes(&[0u8; 128]);
        assert!(entry.is_unused());
        assert_eq!(entry, GptEntry::default());
    }

    #[test]
    fn test_set_name_limits() {
        let mut entry = GptEntry::default();
        entry.set_name("root").unwrap();
        assert_eq!(entry.name(), "root");
        entry.set_name(&"x".repeat(36)).unwrap();
        assert!(entry.set_name(&"x".repeat(37)).is_err());
        assert_eq!(entry.name().len(), 36);
    }

    #[test]
    fn test_overlap() {
        let a = GptEntry {
            first_lba: 100,
            last_lba: 199,
            ..Default::default()
        };
        let b = GptEntry {
            first_lba: 199,
            last_lba: 300,
            ..Default::default()
        };
        let c = GptEntry {
            first_lba: 200,
            last_lba: 300,
            ..Default::default()
        };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_attribute_names() {
        let names = attribute_names(ATTR_REQUIRED | ATTR_LEGACY_BIOS_BOOTABLE | (1 << 60));
        assert_eq!(
            names,
            vec!["RequiredPartition", "LegacyBIOSBootable", "GUID:60"]
        );
    }
}

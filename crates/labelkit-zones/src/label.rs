//! Label detection and the format-independent front end
//!
//! [`DiskLabel`] is a closed enum over the two writable formats. Every other
//! label type is recognized by [`LabelKind::detect`] so it can be reported,
//! but probing one yields `Unsupported`.

use crate::gpt::{GptTable, Guid};
use crate::mbr::types::{has_boot_signature, DosEntry, MbrPartitionType, NUM_PARTITIONS};
use crate::mbr::MbrTable;
use crate::verify::{verify_gpt, verify_mbr};
use labelkit_core::{
    endian::{read_u16_be, read_u32_be, read_u32_le},
    DiskContext, Error, Finding, Result, Zone, ZoneTable,
};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

const SUN_MAGIC: u16 = 0xDABE;
const SUN_MAGIC_OFFSET: usize = 508;
const SGI_MAGIC: u32 = 0x0BE5_A941;
const AIX_MAGIC: u32 = 0xC9C2_D4C1;
/// BSD disklabel magic, little-endian at the start of sector 1
const BSD_MAGIC: u32 = 0x8256_4557;
const LABEL_BYTES: usize = 512;

/// On-disk label format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelKind {
    Mbr,
    Gpt,
    Bsd,
    Sgi,
    Sun,
    Aix,
}

impl LabelKind {
    /// Identify the label by its signatures
    ///
    /// Returns `None` for a device without any recognizable label.
    pub fn detect(ctx: &mut DiskContext<'_>) -> Result<Option<Self>> {
        let sector = ctx.read_sector(0)?;

        if is_sun(&sector) {
            return Ok(Some(Self::Sun));
        }
        if is_sgi(&sector) {
            return Ok(Some(Self::Sgi));
        }
        if read_u32_be(&sector, 0) == AIX_MAGIC {
            return Ok(Some(Self::Aix));
        }
        if has_boot_signature(&sector) {
            let protective = (0..NUM_PARTITIONS)
                .map(|slot| DosEntry::read_slot(&sector, slot))
                .any(|e| e.sys_ind == MbrPartitionType::GPT_PROTECTIVE);
            if protective {
                return Ok(Some(Self::Gpt));
            }
        }
        if ctx.total_sectors() > 1 {
            let next = ctx.read_sector(1)?;
            if read_u32_le(&next, 0) == BSD_MAGIC {
                return Ok(Some(Self::Bsd));
            }
        }
        if has_boot_signature(&sector) {
            return Ok(Some(Self::Mbr));
        }
        Ok(None)
    }

    pub fn is_supported(self) -> bool {
        matches!(self, Self::Mbr | Self::Gpt)
    }
}

impl fmt::Display for LabelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mbr => "dos",
            Self::Gpt => "gpt",
            Self::Bsd => "bsd",
            Self::Sgi => "sgi",
            Self::Sun => "sun",
            Self::Aix => "aix",
        };
        f.write_str(s)
    }
}

impl FromStr for LabelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dos" | "mbr" => Ok(Self::Mbr),
            "gpt" => Ok(Self::Gpt),
            "bsd" => Ok(Self::Bsd),
            "sgi" => Ok(Self::Sgi),
            "sun" => Ok(Self::Sun),
            "aix" => Ok(Self::Aix),
            other => Err(Error::invalid_argument(format!(
                "unknown label type '{}'",
                other
            ))),
        }
    }
}

/// XOR of all 16-bit big-endian words is zero
fn is_sun(sector: &[u8]) -> bool {
    if read_u16_be(sector, SUN_MAGIC_OFFSET) != SUN_MAGIC {
        return false;
    }
    let csum = (0..LABEL_BYTES)
        .step_by(2)
        .fold(0u16, |acc, off| acc ^ read_u16_be(sector, off));
    csum == 0
}

/// Two's-complement sum of all 32-bit big-endian words is zero
fn is_sgi(sector: &[u8]) -> bool {
    if read_u32_be(sector, 0) != SGI_MAGIC {
        return false;
    }
    let sum = (0..LABEL_BYTES)
        .step_by(4)
        .fold(0u32, |acc, off| acc.wrapping_add(read_u32_be(sector, off)));
    sum == 0
}

/// Partition type for either format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// One-byte DOS system indicator
    Dos(u8),
    /// GPT type GUID
    Gpt(Guid),
}

impl FromStr for PartitionType {
    type Err = Error;

    /// Hex byte ("83", "0x83") for DOS, anything GUID-shaped for GPT
    fn from_str(s: &str) -> Result<Self> {
        let hex = s.strip_prefix("0x").unwrap_or(s);
        if hex.len() <= 2 {
            return u8::from_str_radix(hex, 16)
                .map(PartitionType::Dos)
                .map_err(|_| Error::invalid_argument(format!("invalid DOS type '{}'", s)));
        }
        s.parse().map(PartitionType::Gpt)
    }
}

/// Parameters for adding a partition; unset fields take the table defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionRequest {
    /// Zero-based slot; the first free one when unset
    pub index: Option<usize>,
    /// First sector; the start of the free area when unset
    pub start: Option<u64>,
    /// Size in sectors; up to the end of the free area when unset
    pub size: Option<u64>,
    /// Round the end down so the next partition starts aligned
    pub align_end: bool,
    pub type_code: Option<PartitionType>,
    /// GPT partition name
    pub name: Option<String>,
    /// DOS only: create a logical partition inside the extended one
    pub logical: bool,
}

impl PartitionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_start(mut self, start: u64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_type(mut self, type_code: PartitionType) -> Self {
        self.type_code = Some(type_code);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn aligned_end(mut self) -> Self {
        self.align_end = true;
        self
    }

    pub fn logical(mut self) -> Self {
        self.logical = true;
        self
    }
}

/// A writable partition table of either format
#[derive(Debug, Clone)]
pub enum DiskLabel {
    Mbr(MbrTable),
    Gpt(GptTable),
}

impl DiskLabel {
    /// Detect and read the label on the device
    ///
    /// # Errors
    ///
    /// - `NoPartitionTable` when no label is found or a GPT has no valid header
    /// - `Unsupported` for BSD, SGI, Sun and AIX labels
    pub fn probe(ctx: &mut DiskContext<'_>) -> Result<Self> {
        match LabelKind::detect(ctx)? {
            Some(LabelKind::Gpt) => {
                tracing::debug!("Found protective MBR, probing GPT");
                GptTable::probe(ctx).map(Self::Gpt)
            }
            Some(LabelKind::Mbr) => MbrTable::probe(ctx).map(Self::Mbr),
            Some(kind) => Err(Error::unsupported(format!(
                "{} disklabel detected; only dos and gpt are supported",
                kind
            ))),
            None => Err(Error::no_partition_table(
                "Device does not contain a recognized partition table",
            )),
        }
    }

    /// Build a fresh, unwritten label of `kind`
    pub fn create(ctx: &mut DiskContext<'_>, kind: LabelKind) -> Result<Self> {
        match kind {
            LabelKind::Mbr => MbrTable::create(ctx).map(Self::Mbr),
            LabelKind::Gpt => GptTable::create(ctx).map(Self::Gpt),
            other => Err(Error::unsupported(format!(
                "creating a {} disklabel is not supported",
                other
            ))),
        }
    }

    pub fn kind(&self) -> LabelKind {
        match self {
            Self::Mbr(_) => LabelKind::Mbr,
            Self::Gpt(_) => LabelKind::Gpt,
        }
    }

    /// Add a partition and return its zero-based index
    pub fn add_partition(
        &mut self,
        ctx: &mut DiskContext<'_>,
        req: &PartitionRequest,
    ) -> Result<usize> {
        match self {
            Self::Mbr(table) => table.add_partition(req),
            Self::Gpt(table) => table.add_partition(ctx, req),
        }
    }

    pub fn delete_partition(&mut self, index: usize) -> Result<()> {
        match self {
            Self::Mbr(table) => table.delete_partition(index),
            Self::Gpt(table) => table.delete_partition(index),
        }
    }

    /// Change a partition's type; the type must match the label format
    pub fn set_partition_type(&mut self, index: usize, type_code: PartitionType) -> Result<()> {
        match (self, type_code) {
            (Self::Mbr(table), PartitionType::Dos(code)) => {
                table.set_partition_type(index, MbrPartitionType(code))
            }
            (Self::Gpt(table), PartitionType::Gpt(guid)) => table.set_partition_type(index, guid),
            (label, _) => Err(Error::invalid_argument(format!(
                "partition type does not apply to a {} label",
                label.kind()
            ))),
        }
    }

    /// Run the format's consistency checks
    pub fn verify(&self) -> Vec<Finding> {
        match self {
            Self::Mbr(table) => verify_mbr(table),
            Self::Gpt(table) => verify_gpt(table),
        }
    }

    pub fn write(&mut self, ctx: &mut DiskContext<'_>) -> Result<()> {
        match self {
            Self::Mbr(table) => table.write(ctx),
            Self::Gpt(table) => table.write(ctx),
        }
    }

    pub fn is_changed(&self) -> bool {
        match self {
            Self::Mbr(table) => table.is_changed(),
            Self::Gpt(table) => table.is_changed(),
        }
    }

    /// Conditions noticed while probing
    pub fn notes(&self) -> &[Finding] {
        match self {
            Self::Mbr(table) => table.notes(),
            Self::Gpt(table) => table.notes(),
        }
    }

    fn table(&self) -> &dyn ZoneTable {
        match self {
            Self::Mbr(table) => table as &dyn ZoneTable,
            Self::Gpt(table) => table as &dyn ZoneTable,
        }
    }
}

impl ZoneTable for DiskLabel {
    fn identify(&self) -> &str {
        self.table().identify()
    }

    fn zones(&self) -> Vec<Zone> {
        self.table().zones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbr::tests::{create_test_mbr, device};
    use labelkit_core::endian::{write_u32_le, write_u16_le};

    fn detect(image: Vec<u8>) -> Option<LabelKind> {
        let mut dev = device(image);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        LabelKind::detect(&mut ctx).unwrap()
    }

    fn sun_image() -> Vec<u8> {
        let mut image = vec![0u8; 64 * 512];
        image[0..8].copy_from_slice(b"SUNLABEL");
        image[SUN_MAGIC_OFFSET..SUN_MAGIC_OFFSET + 2].copy_from_slice(&SUN_MAGIC.to_be_bytes());
        let csum = (0..510)
            .step_by(2)
            .fold(0u16, |acc, off| acc ^ read_u16_be(&image, off));
        image[510..512].copy_from_slice(&csum.to_be_bytes());
        image
    }

    fn sgi_image() -> Vec<u8> {
        let mut image = vec![0u8; 64 * 512];
        image[0..4].copy_from_slice(&SGI_MAGIC.to_be_bytes());
        image[8..12].copy_from_slice(&0x1234_5678u32.to_be_bytes());
        let sum = (0..504)
            .step_by(4)
            .fold(0u32, |acc, off| acc.wrapping_add(read_u32_be(&image, off)));
        image[504..508].copy_from_slice(&sum.wrapping_neg().to_be_bytes());
        image
    }

    #[test]
    fn test_detect_kinds() {
        assert_eq!(detect(create_test_mbr()), Some(LabelKind::Mbr));
        assert_eq!(detect(vec![0u8; 64 * 512]), None);
        assert_eq!(detect(sun_image()), Some(LabelKind::Sun));
        assert_eq!(detect(sgi_image()), Some(LabelKind::Sgi));

        let mut aix = vec![0u8; 64 * 512];
        aix[0..4].copy_from_slice(&AIX_MAGIC.to_be_bytes());
        assert_eq!(detect(aix), Some(LabelKind::Aix));

        let mut bsd = vec![0u8; 64 * 512];
        write_u32_le(&mut bsd, 512, BSD_MAGIC);
        assert_eq!(detect(bsd), Some(LabelKind::Bsd));

        let mut gpt = vec![0u8; 64 * 512];
        let mut record = DosEntry::default();
        record.set(1, 63, 1, MbrPartitionType::GPT_PROTECTIVE, 255, 63);
        record.write_slot(&mut gpt[..512], 0);
        write_u16_le(&mut gpt, 510, 0xAA55);
        assert_eq!(detect(gpt), Some(LabelKind::Gpt));
    }

    #[test]
    fn test_bad_sun_checksum_is_not_sun() {
        let mut image = sun_image();
        image[100] ^= 0x01;
        assert_eq!(detect(image), None);
    }

    #[test]
    fn test_probe_unsupported() {
        let mut dev = device(sun_image());
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        assert!(matches!(
            DiskLabel::probe(&mut ctx),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            DiskLabel::create(&mut ctx, LabelKind::Bsd),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_probe_empty_device() {
        let mut dev = device(vec![0u8; 64 * 512]);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        assert!(matches!(
            DiskLabel::probe(&mut ctx),
            Err(Error::NoPartitionTable(_))
        ));
    }

    #[test]
    fn test_gpt_lifecycle_through_label() {
        let mut dev = device(vec![0u8; 65536 * 512]);
        let mut ctx = DiskContext::new(&mut dev).unwrap();

        let mut label = DiskLabel::create(&mut ctx, LabelKind::Gpt).unwrap();
        let req = PartitionRequest::new()
            .with_size(4096)
            .with_type(PartitionType::Gpt(Guid::EFI_SYSTEM))
            .with_name("esp");
        label.add_partition(&mut ctx, &req).unwrap();
        label.write(&mut ctx).unwrap();
        assert!(!label.is_changed());

        let mut label = DiskLabel::probe(&mut ctx).unwrap();
        assert_eq!(label.kind(), LabelKind::Gpt);
        assert_eq!(label.identify(), "gpt");
        assert_eq!(label.zones().len(), 1);
        assert_eq!(label.zone(0).map(|z| z.size), Some(4096));

        assert!(matches!(
            label.set_partition_type(0, PartitionType::Dos(0x83)),
            Err(Error::InvalidArgument(_))
        ));
        label
            .set_partition_type(0, PartitionType::Gpt(Guid::LINUX_FILESYSTEM))
            .unwrap();
        label.delete_partition(0).unwrap();
        assert!(label.zones().is_empty());
        assert!(label.is_changed());
    }

    #[test]
    fn test_mbr_through_label() {
        let mut dev = device(create_test_mbr());
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut label = DiskLabel::probe(&mut ctx).unwrap();
        assert_eq!(label.kind(), LabelKind::Mbr);
        assert_eq!(label.identify(), "dos");
        assert!(label.verify().iter().all(|f| !f.is_error()));

        label
            .set_partition_type(0, PartitionType::Dos(0x8E))
            .unwrap();
        assert_eq!(label.zone(0).map(|z| z.type_code), Some("8e".to_string()));
        assert!(matches!(
            label.set_partition_type(0, PartitionType::Gpt(Guid::LINUX_LVM)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_parse_types() {
        assert_eq!("83".parse::<PartitionType>().unwrap(), PartitionType::Dos(0x83));
        assert_eq!("0xef".parse::<PartitionType>().unwrap(), PartitionType::Dos(0xEF));
        assert_eq!(
            "c12a7328-f81f-11d2-ba4b-00a0c93ec93b"
                .parse::<PartitionType>()
                .unwrap(),
            PartitionType::Gpt(Guid::EFI_SYSTEM)
        );
        assert!("zz".parse::<PartitionType>().is_err());
        assert_eq!("DOS".parse::<LabelKind>().unwrap(), LabelKind::Mbr);
        assert!("hfs".parse::<LabelKind>().is_err());
    }
}

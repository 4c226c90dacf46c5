//! MBR (Master Boot Record) partition table implementation
//!
//! The four primary entries live in sector 0. An extended partition holds a
//! chain of Extended Boot Records (EBRs), each carrying one data entry (start
//! relative to the EBR itself) and one link entry (start relative to the
//! beginning of the extended partition) pointing at the next EBR.
//!
//! # Structure
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0x000   440   Bootstrap code
//! 0x1B8   4     Disk signature
//! 0x1BE   16    Partition entry 1
//! 0x1CE   16    Partition entry 2
//! 0x1DE   16    Partition entry 3
//! 0x1EE   16    Partition entry 4
//! 0x1FE   2     Boot signature (0x55 0xAA)
//! ```
//!
//! Partition indices 0-3 address the primaries, 4 and up the logical
//! partitions in chain order.

mod chain;
mod ops;
pub mod types;

use crate::geometry::{Alignment, ChsAddress};
use labelkit_core::{
    endian::{read_u32_le, write_u32_le},
    DeviceGeometry, DiskContext, Error, Finding, FindingKind, Result, Zone, ZoneTable,
};
use serde::Serialize;
use types::{
    has_boot_signature, set_boot_signature, DosEntry, MbrPartitionType, DISK_SIGNATURE_OFFSET,
    NUM_PARTITIONS,
};

/// First four bytes of an AIX boot sector
const AIX_MAGIC: [u8; 4] = [0xC9, 0xC2, 0xD4, 0xC1];

/// One logical partition and the EBR that describes it
#[derive(Debug, Clone)]
pub struct Logical {
    /// Disk sector of the EBR
    pub(crate) offset: u64,
    /// Data entry, start relative to `offset`
    pub(crate) data: DosEntry,
    /// Link to the next EBR, start relative to the extended partition
    pub(crate) link: DosEntry,
    sector: Vec<u8>,
    data_slot: usize,
    link_slot: usize,
    pub(crate) changed: bool,
}

impl Logical {
    /// Fresh EBR at `offset` with data in slot 0 and link in slot 1
    fn empty(offset: u64, sector_size: usize) -> Self {
        Self {
            offset,
            data: DosEntry::default(),
            link: DosEntry::default(),
            sector: vec![0u8; sector_size],
            data_slot: 0,
            link_slot: 1,
            changed: true,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn data(&self) -> &DosEntry {
        &self.data
    }

    pub fn link(&self) -> &DosEntry {
        &self.link
    }

    /// Absolute first sector of the data area
    pub fn abs_start(&self) -> u64 {
        self.offset + self.data.start as u64
    }

    fn encode(&mut self) -> &[u8] {
        let (data, link) = (self.data, self.link);
        data.write_slot(&mut self.sector, self.data_slot);
        link.write_slot(&mut self.sector, self.link_slot);
        set_boot_signature(&mut self.sector);
        &self.sector
    }
}

/// Listing view of one DOS partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MbrPartition {
    /// Zero-based partition index
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub type_code: u8,
    pub type_name: &'static str,
    pub bootable: bool,
    pub logical: bool,
    /// Disk sector of the EBR holding a logical partition
    pub ebr_offset: Option<u64>,
    pub start_chs: ChsAddress,
    pub end_chs: ChsAddress,
}

/// In-memory DOS partition table
#[derive(Debug, Clone)]
pub struct MbrTable {
    boot_sector: Vec<u8>,
    pub(crate) primaries: [DosEntry; NUM_PARTITIONS],
    pub(crate) primary_changed: [bool; NUM_PARTITIONS],
    pub(crate) logicals: Vec<Logical>,
    pub(crate) ext_index: Option<usize>,
    pub(crate) ext_offset: u64,
    pub(crate) geometry: DeviceGeometry,
    pub(crate) alignment: Alignment,
    pub(crate) compatible: bool,
    pub(crate) non_pt_changed: bool,
    pub(crate) notes: Vec<Finding>,
}

impl MbrTable {
    fn from_boot_sector(boot_sector: Vec<u8>, geometry: DeviceGeometry) -> Self {
        let mut primaries = [DosEntry::default(); NUM_PARTITIONS];
        for (slot, entry) in primaries.iter_mut().enumerate() {
            *entry = DosEntry::read_slot(&boot_sector, slot);
        }

        Self {
            boot_sector,
            primaries,
            primary_changed: [false; NUM_PARTITIONS],
            logicals: Vec::new(),
            ext_index: None,
            ext_offset: 0,
            alignment: Alignment::for_geometry(&geometry),
            geometry,
            compatible: false,
            non_pt_changed: false,
            notes: Vec::new(),
        }
    }

    /// Read sector 0 and walk the extended chain
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The boot signature is missing (`NoPartitionTable`)
    /// - Sector 0 carries the AIX magic (`Unsupported`)
    /// - The device cannot be read
    pub fn probe(ctx: &mut DiskContext<'_>) -> Result<Self> {
        let sector = ctx.read_sector(0)?;

        if sector[..AIX_MAGIC.len()] == AIX_MAGIC {
            return Err(Error::unsupported("sector 0 carries an AIX label"));
        }
        if !has_boot_signature(&sector) {
            return Err(Error::no_partition_table(format!(
                "invalid MBR boot signature 0x{:02X}{:02X}",
                sector[510], sector[511]
            )));
        }

        let mut geometry = *ctx.geometry();
        if let Some((heads, sectors)) = table_geometry(&sector) {
            tracing::debug!("DOS table geometry: heads={}, sectors={}", heads, sectors);
            geometry = geometry.with_chs(heads, sectors);
        }

        let mut table = Self::from_boot_sector(sector, geometry);

        for i in 0..NUM_PARTITIONS {
            if !table.primaries[i].is_extended() {
                continue;
            }
            if table.ext_index.is_some() {
                let msg = format!("Ignoring extra extended partition {}", i + 1);
                tracing::warn!("{}", msg);
                table
                    .notes
                    .push(Finding::warning(FindingKind::Chain, msg).for_partition(i));
            } else {
                table.read_extended(ctx, i)?;
            }
        }

        for k in 0..table.logicals.len() {
            let logical = &mut table.logicals[k];
            if !has_boot_signature(&logical.sector) {
                let msg = format!(
                    "Invalid flag 0x{:02x}{:02x} of EBR at sector {} will be corrected by write",
                    logical.sector[510], logical.sector[511], logical.offset
                );
                tracing::info!("{}", msg);
                logical.changed = true;
                table
                    .notes
                    .push(Finding::warning(FindingKind::Chain, msg).for_partition(4 + k));
            }
        }

        if table.geometry.total_sectors > u32::MAX as u64 {
            let msg = format!(
                "The device has {} sectors; a DOS table can address only the first {}",
                table.geometry.total_sectors,
                u32::MAX
            );
            tracing::warn!("{}", msg);
            table.notes.push(Finding::warning(FindingKind::Bounds, msg));
        }

        tracing::debug!(
            "DOS table: {} logical partitions, extended at {:?}",
            table.logicals.len(),
            table.ext_index
        );
        Ok(table)
    }

    /// Build an empty table with a random disk identifier
    ///
    /// Nothing is written until [`MbrTable::write`].
    pub fn create(ctx: &mut DiskContext<'_>) -> Result<Self> {
        let sector_size = ctx.sector_size() as usize;
        let mut sector = vec![0u8; sector_size];

        let mut id = [0u8; 4];
        ctx.random_bytes(&mut id);
        sector[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4].copy_from_slice(&id);
        set_boot_signature(&mut sector);

        let mut table = Self::from_boot_sector(sector, *ctx.geometry());
        table.non_pt_changed = true;

        tracing::info!(
            "Created a new DOS disklabel with disk identifier 0x{:08x}",
            table.disk_id()
        );
        Ok(table)
    }

    /// 32-bit disk signature at byte 440
    pub fn disk_id(&self) -> u32 {
        read_u32_le(&self.boot_sector, DISK_SIGNATURE_OFFSET)
    }

    pub fn set_disk_id(&mut self, id: u32) {
        let old = self.disk_id();
        write_u32_le(&mut self.boot_sector, DISK_SIGNATURE_OFFSET, id);
        self.non_pt_changed = true;
        tracing::info!("Disk identifier changed from 0x{:08x} to 0x{:08x}", old, id);
    }

    /// Toggle DOS-compatible mode (track-aligned placement, CHS checks)
    pub fn set_compatible(&mut self, enable: bool) {
        self.compatible = enable;
        self.alignment = if enable {
            Alignment::dos_compatible(&self.geometry)
        } else {
            Alignment::for_geometry(&self.geometry)
        };
    }

    pub fn is_compatible(&self) -> bool {
        self.compatible
    }

    /// Geometry used for CHS math (device geometry with any table hint applied)
    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    pub fn alignment(&self) -> &Alignment {
        &self.alignment
    }

    /// Conditions noticed while probing
    pub fn notes(&self) -> &[Finding] {
        &self.notes
    }

    /// Number of addressable partition slots: 4 primaries plus the logicals
    pub fn partition_count(&self) -> usize {
        NUM_PARTITIONS + self.logicals.len()
    }

    pub fn primary(&self, slot: usize) -> Option<&DosEntry> {
        self.primaries.get(slot)
    }

    pub fn logicals(&self) -> &[Logical] {
        &self.logicals
    }

    /// Index of the primary holding the extended partition
    pub fn extended_index(&self) -> Option<usize> {
        self.ext_index
    }

    /// First sector of the extended partition, 0 without one
    pub fn ext_offset(&self) -> u64 {
        self.ext_offset
    }

    /// Data entry of partition `index`
    pub fn entry(&self, index: usize) -> Option<&DosEntry> {
        if index < NUM_PARTITIONS {
            self.primaries.get(index)
        } else {
            self.logicals.get(index - NUM_PARTITIONS).map(|l| &l.data)
        }
    }

    pub(crate) fn entry_mut(&mut self, index: usize) -> Option<&mut DosEntry> {
        if index < NUM_PARTITIONS {
            self.primaries.get_mut(index)
        } else {
            self.logicals
                .get_mut(index - NUM_PARTITIONS)
                .map(|l| &mut l.data)
        }
    }

    /// Disk sector the entry's start is relative to
    pub(crate) fn entry_offset(&self, index: usize) -> u64 {
        if index < NUM_PARTITIONS {
            0
        } else {
            self.logicals
                .get(index - NUM_PARTITIONS)
                .map_or(0, |l| l.offset)
        }
    }

    /// Absolute first sector of partition `index`
    pub fn abs_start(&self, index: usize) -> Option<u64> {
        self.entry(index)
            .map(|e| self.entry_offset(index) + e.start as u64)
    }

    pub(crate) fn set_changed(&mut self, index: usize) {
        if index < NUM_PARTITIONS {
            self.primary_changed[index] = true;
        } else if let Some(logical) = self.logicals.get_mut(index - NUM_PARTITIONS) {
            logical.changed = true;
        }
    }

    /// Whether any in-memory change awaits [`MbrTable::write`]
    pub fn is_changed(&self) -> bool {
        self.non_pt_changed
            || self.primary_changed.iter().any(|&c| c)
            || self.logicals.iter().any(|l| l.changed)
    }

    /// Disk sectors holding the MBR and every EBR, in chain order
    pub fn ebr_offsets(&self) -> Vec<u64> {
        std::iter::once(0)
            .chain(self.logicals.iter().map(|l| l.offset))
            .collect()
    }

    /// Listing of all used partitions
    pub fn partitions(&self) -> Vec<MbrPartition> {
        (0..self.partition_count())
            .filter_map(|index| {
                let entry = self.entry(index)?;
                if !entry.is_used() {
                    return None;
                }
                let start = self.abs_start(index)?;
                let size = entry.size as u64;
                let logical = index >= NUM_PARTITIONS;
                Some(MbrPartition {
                    index,
                    start,
                    end: start + size - 1,
                    size,
                    type_code: entry.sys_ind.to_byte(),
                    type_name: entry.sys_ind.name(),
                    bootable: entry.is_bootable(),
                    logical,
                    ebr_offset: logical.then(|| self.entry_offset(index)),
                    start_chs: entry.start_chs(),
                    end_chs: entry.end_chs(),
                })
            })
            .collect()
    }

    /// Write sector 0 and every changed EBR
    ///
    /// Sector 0 is written when a primary entry or the disk identifier
    /// changed. Change flags are cleared only after every write succeeded.
    pub fn write(&mut self, ctx: &mut DiskContext<'_>) -> Result<()> {
        if self.non_pt_changed || self.primary_changed.iter().any(|&c| c) {
            let primaries = self.primaries;
            for (slot, entry) in primaries.iter().enumerate() {
                entry.write_slot(&mut self.boot_sector, slot);
            }
            set_boot_signature(&mut self.boot_sector);
            ctx.write_sector(0, &self.boot_sector)?;
            tracing::debug!("Wrote MBR");
        }

        for logical in self.logicals.iter_mut().filter(|l| l.changed) {
            let offset = logical.offset;
            ctx.write_sector(offset, logical.encode())?;
            tracing::debug!("Wrote EBR at sector {}", offset);
        }
        ctx.flush()?;

        self.non_pt_changed = false;
        self.primary_changed = [false; NUM_PARTITIONS];
        for logical in &mut self.logicals {
            logical.changed = false;
        }
        tracing::info!("DOS partition table written");
        Ok(())
    }

    pub(crate) fn sector_size(&self) -> usize {
        self.geometry.sector_size as usize
    }
}

impl ZoneTable for MbrTable {
    fn identify(&self) -> &str {
        "dos"
    }

    fn zones(&self) -> Vec<Zone> {
        self.partitions()
            .into_iter()
            .map(|p| {
                Zone::new(
                    p.index,
                    p.start,
                    p.size,
                    p.type_name.to_string(),
                    format!("{:02x}", p.type_code),
                )
                .with_bootable(p.bootable)
                .with_logical(p.logical)
            })
            .collect()
    }
}

/// Heads/sectors implied by the end-CHS of the primaries, if they agree
fn table_geometry(sector: &[u8]) -> Option<(u32, u32)> {
    let mut found: Option<(u32, u32)> = None;
    for slot in 0..NUM_PARTITIONS {
        let entry = DosEntry::read_slot(sector, slot);
        if entry.sys_ind == MbrPartitionType::EMPTY {
            continue;
        }
        let heads = entry.end_chs[0] as u32 + 1;
        let sectors = (entry.end_chs[1] & 0x3F) as u32;
        match found {
            None => found = Some((heads, sectors)),
            Some(prev) if prev != (heads, sectors) => return None,
            Some(_) => {}
        }
    }
    found.filter(|&(h, s)| h != 0 && s != 0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mbr::types::PARTITION_TABLE_OFFSET;
    use labelkit_pipeline::StreamDevice;

    /// Write a DOS entry into `image` at sector `lba`, slot `slot`
    ///
    /// CHS fields are computed from `lba + start`, which is the absolute
    /// position for primaries and logical data entries.
    pub(crate) fn put_entry(
        image: &mut [u8],
        lba: u64,
        slot: usize,
        sys_ind: u8,
        start: u32,
        size: u32,
    ) {
        let base = lba as usize * 512;
        let sector = &mut image[base..base + 512];
        let mut entry = DosEntry::default();
        entry.set(
            start,
            size,
            lba + start as u64,
            MbrPartitionType(sys_ind),
            255,
            63,
        );
        entry.write_slot(sector, slot);
        set_boot_signature(sector);
    }

    /// 64 MiB image: primary Linux, extended with three logicals
    pub(crate) fn create_test_mbr() -> Vec<u8> {
        let mut image = vec![0u8; 131072 * 512];
        put_entry(&mut image, 0, 0, 0x83, 2048, 8192);
        put_entry(&mut image, 0, 1, 0x05, 10240, 30720);
        // EBRs at 10240, 20480, 30720
        put_entry(&mut image, 10240, 0, 0x83, 2048, 4096);
        put_entry(&mut image, 10240, 1, 0x05, 10240, 10240);
        put_entry(&mut image, 20480, 0, 0x82, 2048, 4096);
        put_entry(&mut image, 20480, 1, 0x05, 20480, 10240);
        put_entry(&mut image, 30720, 0, 0x83, 2048, 4096);
        image[440..444].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        image
    }

    pub(crate) fn device(image: Vec<u8>) -> StreamDevice<std::io::Cursor<Vec<u8>>> {
        let total = (image.len() / 512) as u64;
        StreamDevice::new(
            std::io::Cursor::new(image),
            DeviceGeometry::for_capacity(total, 512),
        )
        .unwrap()
        .with_seed(7)
    }

    #[test]
    fn test_probe_primaries_and_chain() {
        let mut dev = device(create_test_mbr());
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let table = MbrTable::probe(&mut ctx).unwrap();

        assert_eq!(table.disk_id(), 0x1234_5678);
        assert_eq!(table.extended_index(), Some(1));
        assert_eq!(table.ext_offset(), 10240);
        assert_eq!(table.partition_count(), 7);
        assert_eq!(table.ebr_offsets(), vec![0, 10240, 20480, 30720]);
        assert_eq!(table.abs_start(4), Some(12288));
        assert_eq!(table.abs_start(5), Some(22528));
        assert_eq!(table.abs_start(6), Some(32768));
        assert!(table.notes().is_empty());
        assert!(!table.is_changed());
    }

    #[test]
    fn test_zones() {
        let mut dev = device(create_test_mbr());
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let table = MbrTable::probe(&mut ctx).unwrap();
        let zones = table.zones();

        assert_eq!(table.identify(), "dos");
        assert_eq!(zones.len(), 5);
        assert_eq!(zones[0].start, 2048);
        assert_eq!(zones[0].zone_type, "Linux");
        assert_eq!(zones[1].type_code, "05");
        assert!(zones[3].logical);
        assert_eq!(zones[3].zone_type, "Linux swap / Solaris");
        assert_eq!(table.zone(5).map(|z| z.start), Some(22528));
    }

    #[test]
    fn test_partitions_view() {
        let mut dev = device(create_test_mbr());
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let table = MbrTable::probe(&mut ctx).unwrap();
        let parts = table.partitions();

        assert_eq!(parts[0].end, 2048 + 8192 - 1);
        assert_eq!(parts[0].ebr_offset, None);
        assert_eq!(parts[2].ebr_offset, Some(10240));
        assert_eq!(parts[0].start_chs.to_lba(255, 63), Some(2048));
    }

    #[test]
    fn test_invalid_signature() {
        let mut image = create_test_mbr();
        image[511] = 0x00;
        let mut dev = device(image);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        assert!(matches!(
            MbrTable::probe(&mut ctx),
            Err(Error::NoPartitionTable(_))
        ));
    }

    #[test]
    fn test_aix_magic_refused() {
        let mut image = create_test_mbr();
        image[..4].copy_from_slice(&AIX_MAGIC);
        let mut dev = device(image);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        assert!(matches!(
            MbrTable::probe(&mut ctx),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_geometry_hint_from_table() {
        let mut image = vec![0u8; 4096 * 512];
        let mut entry = DosEntry::default();
        entry.set(32, 992, 32, MbrPartitionType::FAT16, 16, 32);
        entry.write_slot(&mut image[..512], 0);
        set_boot_signature(&mut image[..512]);

        let mut dev = device(image);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let table = MbrTable::probe(&mut ctx).unwrap();
        assert_eq!(table.geometry().heads, 16);
        assert_eq!(table.geometry().sectors, 32);
    }

    #[test]
    fn test_create_and_write() {
        let mut dev = device(vec![0u8; 8192 * 512]);
        {
            let mut ctx = DiskContext::new(&mut dev).unwrap();
            let mut table = MbrTable::create(&mut ctx).unwrap();
            assert!(table.is_changed());
            assert_eq!(table.partition_count(), 4);
            table.write(&mut ctx).unwrap();
            assert!(!table.is_changed());
        }
        let image = dev.image();
        assert_eq!(&image[510..512], &[0x55, 0xAA]);
        assert!(image[PARTITION_TABLE_OFFSET..510].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_set_disk_id() {
        let mut dev = device(create_test_mbr());
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = MbrTable::probe(&mut ctx).unwrap();
        table.set_disk_id(0xDEAD_BEEF);
        assert!(table.is_changed());
        table.write(&mut ctx).unwrap();

        let again = MbrTable::probe(&mut ctx).unwrap();
        assert_eq!(again.disk_id(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_unmodified_write_is_byte_identical() {
        let original = create_test_mbr();
        let mut dev = device(original.clone());
        {
            let mut ctx = DiskContext::new(&mut dev).unwrap();
            let mut table = MbrTable::probe(&mut ctx).unwrap();
            table.write(&mut ctx).unwrap();
        }
        assert!(dev.image() == &original[..]);
    }

    #[test]
    fn test_compatible_mode() {
        let mut dev = device(create_test_mbr());
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = MbrTable::probe(&mut ctx).unwrap();
        assert_eq!(table.alignment().first_lba(), 2048);
        table.set_compatible(true);
        assert!(table.is_compatible());
        assert_eq!(table.alignment().first_lba(), 63);
    }
}

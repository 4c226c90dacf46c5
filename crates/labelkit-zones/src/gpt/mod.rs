//! GPT (GUID Partition Table) implementation
//!
//! GPT keeps two copies of its metadata: the primary header at LBA 1 followed
//! by the entry array, and a backup header at the last LBA preceded by its own
//! copy of the array. Sector 0 holds a protective MBR so that DOS-only tools
//! see the disk as occupied.
//!
//! # Structure
//!
//! ```text
//! LBA 0:       Protective MBR
//! LBA 1:       Primary GPT header
//! LBA 2-33:    Partition entries (128 entries * 128 bytes)
//! LBA 34-N:    Usable space
//! LBA N+1-M-1: Backup partition entries
//! LBA M:       Backup GPT header
//! ```

mod free;
pub mod header;
mod ops;
pub mod types;
mod write;

pub use free::{FreeSegment, FreeSpace};
pub use header::GptHeader;
pub use types::{attribute_names, GptEntry, Guid};

use crate::geometry::Alignment;
use crate::mbr::types::{has_boot_signature, DosEntry, MbrPartitionType, NUM_PARTITIONS};
use header::{entries_crc, PRIMARY_HEADER_LBA};
use labelkit_core::{
    DeviceGeometry, DiskContext, Error, Finding, FindingKind, Result, Zone, ZoneTable,
};
use serde::Serialize;

/// How sector 0 protects the GPT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PmbrKind {
    /// A single 0xEE entry
    Protective,
    /// 0xEE entry next to real DOS partitions
    Hybrid,
}

/// Where the in-memory table came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GptState {
    /// Both headers were read and validated
    Valid,
    /// The primary header was rebuilt from the backup
    PrimaryRecovered,
    /// The backup header was rebuilt from the primary
    BackupRecovered,
    /// Built by [`GptTable::create`], nothing on disk yet
    Created,
}

/// Listing view of one GPT partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GptPartition {
    /// Zero-based entry index
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub type_guid: Guid,
    pub type_name: &'static str,
    pub unique_guid: Guid,
    pub name: String,
    pub attributes: u64,
    pub attribute_names: Vec<String>,
    /// Legacy BIOS bootable attribute set
    pub bootable: bool,
}

/// In-memory GPT label
#[derive(Debug, Clone)]
pub struct GptTable {
    pmbr: Vec<u8>,
    pmbr_kind: PmbrKind,
    pub(crate) pheader: GptHeader,
    pub(crate) bheader: GptHeader,
    pub(crate) entries: Vec<GptEntry>,
    /// Entry array as stored on disk, `npartition_entries * sizeof_partition_entry` bytes
    raw_entries: Vec<u8>,
    pub(crate) geometry: DeviceGeometry,
    pub(crate) alignment: Alignment,
    state: GptState,
    pub(crate) changed: bool,
    notes: Vec<Finding>,
}

/// One header copy that passed validation, with its entry array
struct HeaderCopy {
    header: GptHeader,
    raw_entries: Vec<u8>,
}

impl GptTable {
    /// Read and validate both header copies
    ///
    /// When exactly one copy is damaged it is rebuilt from the other and the
    /// table is marked changed, so the next [`GptTable::write`] repairs the
    /// disk. Nothing is written here.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Sector 0 holds no protective or hybrid MBR (`NoPartitionTable`)
    /// - Neither header copy is valid (`NoPartitionTable`)
    /// - The device cannot be read (`Io`)
    pub fn probe(ctx: &mut DiskContext<'_>) -> Result<Self> {
        let pmbr = ctx.read_sector(0)?;
        let pmbr_kind = pmbr_kind(&pmbr)
            .ok_or_else(|| Error::no_partition_table("no protective MBR in sector 0"))?;

        let mut notes = Vec::new();
        let total = ctx.total_sectors();
        let last_lba = ctx.last_lba();

        if pmbr_kind == PmbrKind::Protective {
            if let Some(record) = protective_record(&pmbr) {
                let expected = (total - 1).min(u32::MAX as u64);
                if record.size as u64 != expected && record.size != u32::MAX {
                    let msg = format!(
                        "GPT PMBR size mismatch ({} != {}). This will be corrected by write",
                        record.size, expected
                    );
                    tracing::warn!("{}", msg);
                    notes.push(Finding::warning(FindingKind::Header, msg));
                }
            }
        } else {
            tracing::debug!("Hybrid MBR detected in sector 0");
        }

        let primary = read_copy(ctx, PRIMARY_HEADER_LBA)?;
        let backup_lba = match &primary {
            Some(copy)
                if copy.header.alternative_lba > PRIMARY_HEADER_LBA
                    && copy.header.alternative_lba <= last_lba =>
            {
                copy.header.alternative_lba
            }
            _ => last_lba,
        };
        let backup = read_copy(ctx, backup_lba)?;
        let sector_size = ctx.sector_size();

        let (pheader, bheader, raw_entries, state) = match (primary, backup) {
            (Some(p), Some(b)) => (p.header, b.header, p.raw_entries, GptState::Valid),
            (Some(p), None) => {
                let mut bheader =
                    GptHeader::mirror_at(&p.header, p.header.alternative_lba, sector_size)?;
                bheader.recompute_crc(p.header.partition_entry_array_crc32, sector_size as usize);
                let msg = format!(
                    "The backup GPT table is corrupt, but the primary appears OK, so that will be used. \
                     A new backup will be written at LBA {}",
                    bheader.my_lba
                );
                tracing::warn!("{}", msg);
                notes.push(Finding::warning(FindingKind::Redundancy, msg));
                (p.header, bheader, p.raw_entries, GptState::BackupRecovered)
            }
            (None, Some(b)) => {
                let mut pheader = GptHeader::mirror_at(&b.header, PRIMARY_HEADER_LBA, sector_size)?;
                pheader.recompute_crc(b.header.partition_entry_array_crc32, sector_size as usize);
                let msg = "The primary GPT table is corrupt, but the backup appears OK, so that will be used";
                tracing::warn!("{}", msg);
                notes.push(Finding::warning(FindingKind::Redundancy, msg));
                (pheader, b.header, b.raw_entries, GptState::PrimaryRecovered)
            }
            (None, None) => {
                return Err(Error::no_partition_table(
                    "no valid GPT header found at either copy",
                ))
            }
        };

        let entry_size = pheader.sizeof_partition_entry as usize;
        let entries = raw_entries
            .chunks_exact(entry_size)
            .map(GptEntry::from_bytes)
            .collect();

        let geometry = *ctx.geometry();
        let table = Self {
            pmbr,
            pmbr_kind,
            pheader,
            bheader,
            entries,
            raw_entries,
            alignment: Alignment::for_geometry(&geometry),
            geometry,
            state,
            changed: state != GptState::Valid,
            notes,
        };

        tracing::debug!(
            "GPT: revision {}, {} of {} entries used, usable {}-{}",
            table.pheader.revision_str(),
            table.partitions_used(),
            table.max_partitions(),
            table.pheader.first_usable_lba,
            table.pheader.last_usable_lba
        );
        Ok(table)
    }

    /// Build an empty label with a random disk GUID and 128 entries
    ///
    /// Nothing is written until [`GptTable::write`].
    pub fn create(ctx: &mut DiskContext<'_>) -> Result<Self> {
        let geometry = *ctx.geometry();
        let sector_size = ctx.sector_size();
        let alignment = Alignment::for_geometry(&geometry);

        let disk_guid = Guid::random(ctx);
        let pheader = GptHeader::new_primary(
            geometry.total_sectors,
            sector_size,
            alignment.first_lba(),
            disk_guid,
        )?;
        let bheader = GptHeader::mirror_at(&pheader, pheader.alternative_lba, sector_size)?;

        let count = pheader.npartition_entries as usize;
        let mut table = Self {
            pmbr: vec![0u8; sector_size as usize],
            pmbr_kind: PmbrKind::Protective,
            pheader,
            bheader,
            entries: vec![GptEntry::default(); count],
            raw_entries: vec![0u8; count * GptEntry::ENTRY_SIZE],
            alignment,
            geometry,
            state: GptState::Created,
            changed: true,
            notes: Vec::new(),
        };
        table.update_crcs();

        tracing::info!(
            "Created a new GPT disklabel (GUID: {})",
            table.pheader.disk_guid
        );
        Ok(table)
    }

    pub fn primary_header(&self) -> &GptHeader {
        &self.pheader
    }

    pub fn backup_header(&self) -> &GptHeader {
        &self.bheader
    }

    pub fn disk_guid(&self) -> Guid {
        self.pheader.disk_guid
    }

    pub fn state(&self) -> GptState {
        self.state
    }

    pub fn pmbr_kind(&self) -> PmbrKind {
        self.pmbr_kind
    }

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

    pub fn first_usable_lba(&self) -> u64 {
        self.pheader.first_usable_lba
    }

    pub fn last_usable_lba(&self) -> u64 {
        self.pheader.last_usable_lba
    }

    /// Number of entry slots in the array
    pub fn max_partitions(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries with a non-nil type GUID
    pub fn partitions_used(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_unused()).count()
    }

    pub fn entry(&self, index: usize) -> Option<&GptEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[GptEntry] {
        &self.entries
    }

    /// Entry array bytes as they will be written
    pub fn raw_entries(&self) -> &[u8] {
        &self.raw_entries
    }

    /// Whether any in-memory change awaits [`GptTable::write`]
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub(crate) fn used_entries(&self) -> impl Iterator<Item = (usize, &GptEntry)> {
        self.entries.iter().enumerate().filter(|(_, e)| !e.is_unused())
    }

    /// Listing of all used entries
    pub fn partitions(&self) -> Vec<GptPartition> {
        self.used_entries()
            .map(|(index, e)| GptPartition {
                index,
                start: e.first_lba,
                end: e.last_lba,
                size: e.size(),
                type_guid: e.type_guid,
                type_name: e.type_name(),
                unique_guid: e.unique_guid,
                name: e.name(),
                attributes: e.attributes,
                attribute_names: attribute_names(e.attributes),
                bootable: e.is_legacy_bootable(),
            })
            .collect()
    }

    /// Sector 0 as read (or zeroed by `create`)
    pub(crate) fn pmbr_sector(&self) -> &[u8] {
        &self.pmbr
    }

    pub(crate) fn sector_size(&self) -> usize {
        self.geometry.sector_size as usize
    }

    /// Encode the entries into the raw array and refresh every CRC
    pub(crate) fn update_crcs(&mut self) {
        let entry_size = self.pheader.sizeof_partition_entry as usize;
        for (entry, chunk) in self
            .entries
            .iter()
            .zip(self.raw_entries.chunks_exact_mut(entry_size))
        {
            entry.write_to(chunk);
        }

        let crc = entries_crc(&self.raw_entries);
        let sector_size = self.sector_size();
        self.pheader.recompute_crc(crc, sector_size);
        self.bheader.recompute_crc(crc, sector_size);
    }

    /// Replace the entry array after a count change
    pub(crate) fn replace_entries(&mut self, entries: Vec<GptEntry>, raw_entries: Vec<u8>) {
        self.entries = entries;
        self.raw_entries = raw_entries;
    }

    pub(crate) fn set_pmbr(&mut self, sector: Vec<u8>, kind: PmbrKind) {
        self.pmbr = sector;
        self.pmbr_kind = kind;
    }

    pub(crate) fn push_note(&mut self, note: Finding) {
        self.notes.push(note);
    }

    /// Disk and memory agree again; probe-time notes no longer apply
    pub(crate) fn mark_written(&mut self) {
        self.changed = false;
        self.state = GptState::Valid;
        self.notes.clear();
    }
}

impl ZoneTable for GptTable {
    fn identify(&self) -> &str {
        "gpt"
    }

    fn zones(&self) -> Vec<Zone> {
        self.partitions()
            .into_iter()
            .map(|p| {
                let zone = Zone::new(
                    p.index,
                    p.start,
                    p.size,
                    p.type_name.to_string(),
                    p.type_guid.to_string(),
                )
                .with_bootable(p.bootable);
                if p.name.is_empty() {
                    zone
                } else {
                    zone.with_name(p.name)
                }
            })
            .collect()
    }
}

/// Classify sector 0: protective, hybrid, or not a GPT PMBR at all
fn pmbr_kind(sector: &[u8]) -> Option<PmbrKind> {
    if !has_boot_signature(sector) {
        return None;
    }
    let record = protective_record(sector)?;
    if record.start as u64 != PRIMARY_HEADER_LBA {
        return None;
    }

    let hybrid = (0..NUM_PARTITIONS)
        .map(|slot| DosEntry::read_slot(sector, slot))
        .any(|e| e.sys_ind != MbrPartitionType::GPT_PROTECTIVE && e.sys_ind != MbrPartitionType::EMPTY);
    Some(if hybrid {
        PmbrKind::Hybrid
    } else {
        PmbrKind::Protective
    })
}

/// First 0xEE record of sector 0
fn protective_record(sector: &[u8]) -> Option<DosEntry> {
    (0..NUM_PARTITIONS)
        .map(|slot| DosEntry::read_slot(sector, slot))
        .find(|e| e.sys_ind == MbrPartitionType::GPT_PROTECTIVE)
}

/// Read the header at `lba` and its entry array
///
/// Returns `None` for any validation failure; only I/O errors propagate.
fn read_copy(ctx: &mut DiskContext<'_>, lba: u64) -> Result<Option<HeaderCopy>> {
    match try_read_copy(ctx, lba) {
        Ok(copy) => Ok(Some(copy)),
        Err(Error::Io(e)) => Err(Error::Io(e)),
        Err(e) => {
            tracing::debug!("GPT header at LBA {} rejected: {}", lba, e);
            Ok(None)
        }
    }
}

fn try_read_copy(ctx: &mut DiskContext<'_>, lba: u64) -> Result<HeaderCopy> {
    let sector = ctx.read_sector(lba)?;
    let header = GptHeader::decode(&sector);
    header.validate(lba, ctx.sector_size(), ctx.last_lba())?;

    let len = header.entries_bytes()?;
    let raw_entries = ctx.read_bytes(header.partition_entry_lba, len)?;
    if entries_crc(&raw_entries) != header.partition_entry_array_crc32 {
        return Err(Error::corrupt_header(format!(
            "partition entry array CRC mismatch for header at LBA {}",
            lba
        )));
    }
    Ok(HeaderCopy {
        header,
        raw_entries,
    })
}

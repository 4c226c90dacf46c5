//! GPT header encoding and validation

use super::types::{Guid, GptEntry};
use labelkit_core::{
    checked_multiply_u64,
    endian::{read_u32_le, read_u64_le, write_u32_le, write_u64_le},
    Error, Result, MAX_ENTRY_ARRAY_BYTES,
};

/// "EFI PART"
pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
pub const REVISION_V1_02: u32 = 0x0001_0200;
pub const REVISION_V1_00: u32 = 0x0001_0000;
pub const REVISION_V0_99: u32 = 0x0000_9900;
/// Smallest valid header size in bytes
pub const HEADER_MIN_SIZE: u32 = 92;
/// LBA of the primary header
pub const PRIMARY_HEADER_LBA: u64 = 1;
/// Entry count written by `create`
pub const DEFAULT_ENTRIES: u32 = 128;

const CRC_OFFSET: usize = 16;

/// One copy of the GPT header
///
/// Bytes past the 92 defined ones are carried in `tail` so a header encodes
/// back to the sector it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    /// Header size in bytes covered by `crc32`
    pub size: u32,
    pub crc32: u32,
    pub reserved: u32,
    pub my_lba: u64,
    pub alternative_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub partition_entry_lba: u64,
    pub npartition_entries: u32,
    pub sizeof_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
    tail: Vec<u8>,
}

impl GptHeader {
    /// Decode a header sector without validating it
    pub fn decode(sector: &[u8]) -> Self {
        let mut signature = [0u8; 8];
        signature.copy_from_slice(&sector[0..8]);

        Self {
            signature,
            revision: read_u32_le(sector, 8),
            size: read_u32_le(sector, 12),
            crc32: read_u32_le(sector, CRC_OFFSET),
            reserved: read_u32_le(sector, 20),
            my_lba: read_u64_le(sector, 24),
            alternative_lba: read_u64_le(sector, 32),
            first_usable_lba: read_u64_le(sector, 40),
            last_usable_lba: read_u64_le(sector, 48),
            disk_guid: Guid::from_disk_bytes(&sector[56..72]),
            partition_entry_lba: read_u64_le(sector, 72),
            npartition_entries: read_u32_le(sector, 80),
            sizeof_partition_entry: read_u32_le(sector, 84),
            partition_entry_array_crc32: read_u32_le(sector, 88),
            tail: sector[HEADER_MIN_SIZE as usize..].to_vec(),
        }
    }

    /// Encode into a full sector of `sector_size` bytes
    pub fn encode(&self, sector_size: usize) -> Vec<u8> {
        let mut sector = vec![0u8; sector_size];
        sector[0..8].copy_from_slice(&self.signature);
        write_u32_le(&mut sector, 8, self.revision);
        write_u32_le(&mut sector, 12, self.size);
        write_u32_le(&mut sector, CRC_OFFSET, self.crc32);
        write_u32_le(&mut sector, 20, self.reserved);
        write_u64_le(&mut sector, 24, self.my_lba);
        write_u64_le(&mut sector, 32, self.alternative_lba);
        write_u64_le(&mut sector, 40, self.first_usable_lba);
        write_u64_le(&mut sector, 48, self.last_usable_lba);
        sector[56..72].copy_from_slice(&self.disk_guid.to_disk_bytes());
        write_u64_le(&mut sector, 72, self.partition_entry_lba);
        write_u32_le(&mut sector, 80, self.npartition_entries);
        write_u32_le(&mut sector, 84, self.sizeof_partition_entry);
        write_u32_le(&mut sector, 88, self.partition_entry_array_crc32);

        let tail_len = self.tail.len().min(sector_size - HEADER_MIN_SIZE as usize);
        sector[HEADER_MIN_SIZE as usize..HEADER_MIN_SIZE as usize + tail_len]
            .copy_from_slice(&self.tail[..tail_len]);
        sector
    }

    /// Fresh revision 1.0 header for a device of `total_sectors`
    ///
    /// The usable range starts after the entry array, or at `first_lba` when
    /// that fits, and ends before the backup entry array.
    pub fn new_primary(
        total_sectors: u64,
        sector_size: u64,
        first_lba: u64,
        disk_guid: Guid,
    ) -> Result<Self> {
        let mut header = Self {
            signature: GPT_SIGNATURE,
            revision: REVISION_V1_00,
            size: HEADER_MIN_SIZE,
            crc32: 0,
            reserved: 0,
            my_lba: PRIMARY_HEADER_LBA,
            alternative_lba: total_sectors.saturating_sub(1),
            first_usable_lba: 0,
            last_usable_lba: 0,
            disk_guid,
            partition_entry_lba: PRIMARY_HEADER_LBA + 1,
            npartition_entries: DEFAULT_ENTRIES,
            sizeof_partition_entry: GptEntry::ENTRY_SIZE as u32,
            partition_entry_array_crc32: 0,
            tail: vec![0u8; sector_size as usize - HEADER_MIN_SIZE as usize],
        };

        let esects = header.entry_sectors(sector_size)?;
        let (first, last) = usable_range(total_sectors, esects).ok_or_else(|| {
            Error::capacity_exceeded(format!(
                "device of {} sectors is too small for a GPT",
                total_sectors
            ))
        })?;

        header.first_usable_lba = if first < first_lba && first_lba < last {
            first_lba
        } else {
            first
        };
        header.last_usable_lba = last;
        Ok(header)
    }

    /// Build the mirror of `other` located at `lba`
    ///
    /// Everything is copied except `my_lba`, `alternative_lba` (swapped) and
    /// `partition_entry_lba`, which follows the header: right after it for the
    /// primary, right before it for the backup.
    pub fn mirror_at(other: &GptHeader, lba: u64, sector_size: u64) -> Result<Self> {
        let mut header = other.clone();
        header.my_lba = lba;
        header.alternative_lba = other.my_lba;
        header.partition_entry_lba = if lba == PRIMARY_HEADER_LBA {
            PRIMARY_HEADER_LBA + 1
        } else {
            let esects = header.entry_sectors(sector_size)?;
            lba.checked_sub(esects).ok_or_else(|| {
                Error::out_of_range(format!(
                    "backup header at {} leaves no room for {} entry sectors",
                    lba, esects
                ))
            })?
        };
        Ok(header)
    }

    pub fn has_signature(&self) -> bool {
        self.signature == GPT_SIGNATURE
    }

    pub fn is_primary(&self) -> bool {
        self.my_lba == PRIMARY_HEADER_LBA
    }

    /// Byte length of the entry array
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` on overflow or past the array size limit,
    /// `CorruptHeader` when entries are smaller than 128 bytes.
    pub fn entries_bytes(&self) -> Result<u64> {
        if (self.sizeof_partition_entry as usize) < GptEntry::ENTRY_SIZE {
            return Err(Error::corrupt_header(format!(
                "partition entry size {} is below {}",
                self.sizeof_partition_entry,
                GptEntry::ENTRY_SIZE
            )));
        }
        let bytes = checked_multiply_u64(
            self.npartition_entries as u64,
            self.sizeof_partition_entry as u64,
            "entry array size",
        )?;
        if bytes > MAX_ENTRY_ARRAY_BYTES {
            return Err(Error::capacity_exceeded(format!(
                "entry array of {} bytes exceeds the {} byte limit",
                bytes, MAX_ENTRY_ARRAY_BYTES
            )));
        }
        Ok(bytes)
    }

    /// Sectors occupied by the entry array
    pub fn entry_sectors(&self, sector_size: u64) -> Result<u64> {
        Ok(self.entries_bytes()?.div_ceil(sector_size))
    }

    /// CRC32 over `size` header bytes with the CRC field zeroed
    pub fn compute_crc(&self, sector_size: usize) -> u32 {
        let mut sector = self.encode(sector_size);
        sector[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
        let len = (self.size as usize).clamp(HEADER_MIN_SIZE as usize, sector_size);
        crc32fast::hash(&sector[..len])
    }

    pub fn crc_is_valid(&self, sector_size: usize) -> bool {
        self.compute_crc(sector_size) == self.crc32
    }

    /// Store the entry-array CRC, then the header CRC
    pub fn recompute_crc(&mut self, entries_crc: u32, sector_size: usize) {
        self.partition_entry_array_crc32 = entries_crc;
        self.crc32 = self.compute_crc(sector_size);
    }

    /// Usable range ordered, inside the device and clear of LBA 1
    pub fn lba_sanity(&self, last_lba: u64) -> std::result::Result<(), &'static str> {
        let (fu, lu) = (self.first_usable_lba, self.last_usable_lba);
        if lu < fu {
            return Err("last usable LBA is before the first usable LBA");
        }
        if fu > last_lba || lu > last_lba {
            return Err("usable LBAs are beyond the device end");
        }
        if fu < PRIMARY_HEADER_LBA && PRIMARY_HEADER_LBA < lu {
            return Err("primary header lies inside the usable range");
        }
        Ok(())
    }

    /// "1.2", "1.0", "0.99" or "unknown"
    pub fn revision_str(&self) -> &'static str {
        match self.revision {
            REVISION_V1_02 => "1.2",
            REVISION_V1_00 => "1.0",
            REVISION_V0_99 => "0.99",
            _ => "unknown",
        }
    }

    /// Structural validation of a header read from `lba`
    ///
    /// Covers signature, size, header CRC, LBA sanity and location. The entry
    /// array CRC is checked by the caller once the array is read.
    pub fn validate(&self, lba: u64, sector_size: u64, last_lba: u64) -> Result<()> {
        if !self.has_signature() {
            return Err(Error::corrupt_header("missing EFI PART signature"));
        }
        if self.size < HEADER_MIN_SIZE || self.size as u64 > sector_size {
            return Err(Error::corrupt_header(format!(
                "header size {} outside {}-{}",
                self.size, HEADER_MIN_SIZE, sector_size
            )));
        }
        if !self.crc_is_valid(sector_size as usize) {
            return Err(Error::corrupt_header("header CRC mismatch"));
        }
        self.lba_sanity(last_lba).map_err(Error::corrupt_header)?;
        if self.my_lba != lba {
            return Err(Error::corrupt_header(format!(
                "header at LBA {} claims to be at LBA {}",
                lba, self.my_lba
            )));
        }
        self.entries_bytes()?;
        Ok(())
    }

    /// Field-by-field comparison with the other copy, ignoring the fields
    /// that legitimately differ between mirrors
    pub fn mirror_mismatches(&self, other: &GptHeader) -> Vec<&'static str> {
        let mut diffs = Vec::new();
        if self.disk_guid != other.disk_guid {
            diffs.push("disk GUID");
        }
        if self.first_usable_lba != other.first_usable_lba {
            diffs.push("first usable LBA");
        }
        if self.last_usable_lba != other.last_usable_lba {
            diffs.push("last usable LBA");
        }
        if self.npartition_entries != other.npartition_entries {
            diffs.push("number of partition entries");
        }
        if self.sizeof_partition_entry != other.sizeof_partition_entry {
            diffs.push("partition entry size");
        }
        if self.partition_entry_array_crc32 != other.partition_entry_array_crc32 {
            diffs.push("partition entry array CRC");
        }
        if self.my_lba != other.alternative_lba || self.alternative_lba != other.my_lba {
            diffs.push("header locations");
        }
        diffs
    }
}

/// First and last usable LBA for `esects` entry sectors on each side
pub fn usable_range(total_sectors: u64, esects: u64) -> Option<(u64, u64)> {
    let first = esects.checked_add(2)?;
    let last = total_sectors.checked_sub(2)?.checked_sub(esects)?;
    (first <= last).then_some((first, last))
}

/// CRC32 of an entry array
pub fn entries_crc(raw: &[u8]) -> u32 {
    crc32fast::hash(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary() -> GptHeader {
        let mut header = GptHeader::new_primary(204800, 512, 2048, Guid::from_u128(42)).unwrap();
        header.recompute_crc(entries_crc(&[0u8; 128 * 128]), 512);
        header
    }

    #[test]
    fn test_new_primary_layout() {
        let header = primary();
        assert_eq!(header.my_lba, 1);
        assert_eq!(header.alternative_lba, 204799);
        assert_eq!(header.partition_entry_lba, 2);
        assert_eq!(header.first_usable_lba, 2048);
        assert_eq!(header.last_usable_lba, 204800 - 2 - 32);
        assert_eq!(header.revision_str(), "1.0");
        assert!(header.validate(1, 512, 204799).is_ok());
    }

    #[test]
    fn test_first_usable_without_room_for_alignment() {
        let header = GptHeader::new_primary(100, 512, 2048, Guid::NIL).unwrap();
        assert_eq!(header.first_usable_lba, 34);
        assert_eq!(header.last_usable_lba, 66);
        assert!(GptHeader::new_primary(60, 512, 2048, Guid::NIL).is_err());
    }

    #[test]
    fn test_encode_decode_preserves_sector() {
        let header = primary();
        let sector = header.encode(512);
        assert_eq!(&sector[0..8], b"EFI PART");
        assert_eq!(GptHeader::decode(&sector), header);
        assert_eq!(GptHeader::decode(&sector).encode(512), sector);
    }

    #[test]
    fn test_crc_covers_header_fields() {
        let mut header = primary();
        assert!(header.crc_is_valid(512));
        header.last_usable_lba -= 1;
        assert!(!header.crc_is_valid(512));
        assert!(matches!(
            header.validate(1, 512, 204799),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_mirror_differs_only_in_location_fields() {
        let header = primary();
        let mut backup = GptHeader::mirror_at(&header, 204799, 512).unwrap();
        backup.recompute_crc(header.partition_entry_array_crc32, 512);

        assert_eq!(backup.my_lba, 204799);
        assert_eq!(backup.alternative_lba, 1);
        assert_eq!(backup.partition_entry_lba, 204799 - 32);
        assert!(backup.validate(204799, 512, 204799).is_ok());
        assert!(header.mirror_mismatches(&backup).is_empty());

        let mut normalized = backup.clone();
        normalized.my_lba = header.my_lba;
        normalized.alternative_lba = header.alternative_lba;
        normalized.partition_entry_lba = header.partition_entry_lba;
        normalized.crc32 = header.crc32;
        assert_eq!(normalized, header);
    }

    #[test]
    fn test_validate_rejects_wrong_location() {
        let header = primary();
        assert!(header.validate(5, 512, 204799).is_err());
    }

    #[test]
    fn test_lba_sanity() {
        let mut header = primary();
        assert!(header.lba_sanity(204799).is_ok());
        assert!(header.lba_sanity(100000).is_err());
        header.first_usable_lba = 0;
        assert!(header.lba_sanity(204799).is_err());
    }

    #[test]
    fn test_entry_array_limits() {
        let mut header = primary();
        assert_eq!(header.entries_bytes().unwrap(), 16384);
        assert_eq!(header.entry_sectors(4096).unwrap(), 4);

        header.sizeof_partition_entry = 64;
        assert!(matches!(header.entries_bytes(), Err(Error::CorruptHeader(_))));

        header.sizeof_partition_entry = u32::MAX;
        header.npartition_entries = u32::MAX;
        assert!(matches!(
            header.entries_bytes(),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_revision_strings() {
        let mut header = primary();
        header.revision = REVISION_V1_02;
        assert_eq!(header.revision_str(), "1.2");
        header.revision = 7;
        assert_eq!(header.revision_str(), "unknown");
    }
}

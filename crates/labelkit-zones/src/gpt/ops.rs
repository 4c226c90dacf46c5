//! Mutating GPT operations
//!
//! Validation always happens before the first field is touched, so a failed
//! call leaves the table as it was. Successful calls refresh both header CRCs
//! and mark the table changed.

use super::header::{usable_range, GptHeader};
use super::{GptEntry, GptTable, Guid};
use crate::label::{PartitionRequest, PartitionType};
use labelkit_core::{
    checked_add_u64, checked_multiply_u64, u64_to_usize, DiskContext, Error, Result,
    MAX_ENTRY_ARRAY_BYTES,
};

impl GptTable {
    /// Add a partition and return its zero-based entry index
    ///
    /// Defaults: the first unused entry, the aligned start of the largest free
    /// segment, the end of that segment, type "Linux filesystem". The unique
    /// GUID is drawn from the device's entropy source.
    ///
    /// # Errors
    ///
    /// - `OutOfRange` when an explicit start is outside the usable range or
    ///   inside a used entry, or the requested size does not fit
    /// - `CapacityExceeded` when no entry slot or free sector is left, or the
    ///   end sector does not fit in 64 bits
    /// - `InvalidArgument` for a DOS or nil type, a used index or a bad name
    pub fn add_partition(
        &mut self,
        ctx: &mut DiskContext<'_>,
        req: &PartitionRequest,
    ) -> Result<usize> {
        let type_guid = match req.type_code {
            None => Guid::LINUX_FILESYSTEM,
            Some(PartitionType::Gpt(guid)) if !guid.is_nil() => guid,
            Some(PartitionType::Gpt(_)) => {
                return Err(Error::invalid_argument(
                    "the nil GUID marks unused entries and cannot be a partition type",
                ))
            }
            Some(PartitionType::Dos(code)) => {
                return Err(Error::invalid_argument(format!(
                    "DOS type 0x{:02x} cannot be used on a GPT",
                    code
                )))
            }
        };
        if req.logical {
            return Err(Error::invalid_argument("GPT has no logical partitions"));
        }

        let index = self.free_index(req.index)?;
        let mut entry = GptEntry::new(type_guid, Guid::NIL, 0, 0);
        if let Some(name) = &req.name {
            entry.set_name(name)?;
        }
        let (start, stop) = self.place(req)?;

        entry.first_lba = start;
        entry.last_lba = stop;
        entry.unique_guid = Guid::random(ctx);
        self.entries[index] = entry;
        self.update_crcs();
        self.changed = true;

        tracing::info!(
            "Created a new partition {} of type '{}' from sector {} to {}",
            index + 1,
            entry.type_name(),
            start,
            stop
        );
        Ok(index)
    }

    fn free_index(&self, requested: Option<usize>) -> Result<usize> {
        match requested {
            Some(index) => {
                let entry = self.entries.get(index).ok_or_else(|| {
                    Error::out_of_range(format!(
                        "partition {} is beyond the {} table entries",
                        index + 1,
                        self.entries.len()
                    ))
                })?;
                if !entry.is_unused() {
                    return Err(Error::invalid_argument(format!(
                        "Partition {} is already defined. Delete it before re-adding it",
                        index + 1
                    )));
                }
                Ok(index)
            }
            None => self
                .entries
                .iter()
                .position(GptEntry::is_unused)
                .ok_or_else(|| {
                    Error::capacity_exceeded("All partition entries are in use")
                }),
        }
    }

    /// Resolve the requested span against the free space
    fn place(&self, req: &PartitionRequest) -> Result<(u64, u64)> {
        let (fu, lu) = (self.pheader.first_usable_lba, self.pheader.last_usable_lba);
        let largest = self
            .find_first_in_largest()
            .ok_or_else(|| Error::capacity_exceeded("No free sectors available"))?;

        let start = match req.start {
            Some(start) => {
                if start < fu || start > lu {
                    return Err(Error::out_of_range(format!(
                        "start sector {} is outside the usable range {}-{}",
                        start, fu, lu
                    )));
                }
                if self.find_first_available(start) != Some(start) {
                    return Err(Error::out_of_range(format!(
                        "Sector {} already used",
                        start
                    )));
                }
                start
            }
            None => {
                let last = self.find_last_free(largest);
                let aligned = self.alignment.align_lba_in_range(largest, largest, last);
                if aligned <= last && self.find_first_available(aligned) == Some(aligned) {
                    aligned
                } else {
                    largest
                }
            }
        };

        let limit = self.find_last_free(start);
        let mut stop = match req.size {
            Some(0) => return Err(Error::invalid_argument("partition size must not be zero")),
            Some(size) => {
                let stop = checked_add_u64(start, size - 1, "partition end")?;
                if stop > limit {
                    return Err(Error::out_of_range(format!(
                        "partition end {} is beyond the last free sector {}",
                        stop, limit
                    )));
                }
                stop
            }
            None => limit,
        };

        if req.align_end && self.alignment.is_required() {
            let next = self.alignment.align_lba_in_range(stop + 1, start, limit);
            if next > start {
                stop = (next - 1).min(limit);
            }
        }
        Ok((start, stop))
    }

    fn used_entry_mut(&mut self, index: usize) -> Result<&mut GptEntry> {
        let count = self.entries.len();
        match self.entries.get_mut(index) {
            None => Err(Error::out_of_range(format!(
                "partition {} is beyond the {} table entries",
                index + 1,
                count
            ))),
            Some(entry) if entry.is_unused() => Err(Error::invalid_argument(format!(
                "Partition {} is not in use",
                index + 1
            ))),
            Some(entry) => Ok(entry),
        }
    }

    fn commit(&mut self) {
        self.update_crcs();
        self.changed = true;
    }

    /// Zero the entry at `index`
    pub fn delete_partition(&mut self, index: usize) -> Result<()> {
        let entry = self.used_entry_mut(index)?;
        *entry = GptEntry::default();
        self.commit();
        tracing::info!("Partition {} has been deleted", index + 1);
        Ok(())
    }

    /// Change the type GUID of a used entry
    pub fn set_partition_type(&mut self, index: usize, type_guid: Guid) -> Result<()> {
        if type_guid.is_nil() {
            return Err(Error::invalid_argument(
                "the nil GUID marks unused entries and cannot be a partition type",
            ));
        }
        let entry = self.used_entry_mut(index)?;
        let old = entry.type_name();
        entry.type_guid = type_guid;
        let new = entry.type_name();
        self.commit();
        tracing::info!(
            "Changed type of partition '{}' to '{}'",
            old,
            new
        );
        Ok(())
    }

    pub fn set_partition_name(&mut self, index: usize, name: &str) -> Result<()> {
        let entry = self.used_entry_mut(index)?;
        entry.set_name(name)?;
        self.commit();
        tracing::info!("Partition name changed to '{}'", name);
        Ok(())
    }

    /// Replace the 64-bit attribute mask of a used entry
    pub fn set_partition_attrs(&mut self, index: usize, attributes: u64) -> Result<()> {
        let entry = self.used_entry_mut(index)?;
        entry.attributes = attributes;
        self.commit();
        tracing::debug!(
            "Partition {} attributes set to 0x{:016x}",
            index + 1,
            attributes
        );
        Ok(())
    }

    pub fn set_partition_uuid(&mut self, index: usize, uuid: Guid) -> Result<()> {
        let entry = self.used_entry_mut(index)?;
        let old = entry.unique_guid;
        entry.unique_guid = uuid;
        self.commit();
        tracing::info!(
            "Partition UUID changed from {} to {}",
            old,
            uuid
        );
        Ok(())
    }

    /// Set the disk GUID in both headers
    pub fn set_disk_guid(&mut self, guid: Guid) {
        let old = self.pheader.disk_guid;
        self.pheader.disk_guid = guid;
        self.bheader.disk_guid = guid;
        self.commit();
        tracing::info!("Disk identifier changed from {} to {}", old, guid);
    }

    /// Change the number of entries in the array
    ///
    /// The usable range is recomputed from the new array size on both sides
    /// of the disk.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for zero entries
    /// - `CapacityExceeded` when the array would overflow or exceed the size limit
    /// - `OutOfRange` when a used entry would be dropped or would fall outside
    ///   the new usable range
    pub fn resize_entries(&mut self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(Error::invalid_argument(
                "the partition entry array needs at least one entry",
            ));
        }
        let old_count = self.pheader.npartition_entries;
        if count == old_count {
            return Ok(());
        }

        let entry_size = self.pheader.sizeof_partition_entry as u64;
        let bytes = checked_multiply_u64(count as u64, entry_size, "entry array size")?;
        if bytes > MAX_ENTRY_ARRAY_BYTES {
            return Err(Error::capacity_exceeded(format!(
                "{} entries of {} bytes exceed the {} byte array limit",
                count, entry_size, MAX_ENTRY_ARRAY_BYTES
            )));
        }
        let sector_size = self.sector_size() as u64;
        let esects = bytes.div_ceil(sector_size);

        if let Some((index, _)) = self.used_entries().find(|(i, _)| *i >= count as usize) {
            return Err(Error::out_of_range(format!(
                "partition {} is in use and would be dropped by shrinking to {} entries",
                index + 1,
                count
            )));
        }

        let (first, last) = usable_range(self.bheader.my_lba + 1, esects).ok_or_else(|| {
            Error::capacity_exceeded(format!(
                "{} entries do not fit on a device of {} sectors",
                count,
                self.bheader.my_lba + 1
            ))
        })?;
        for (index, entry) in self.used_entries() {
            if entry.first_lba < first || entry.last_lba > last {
                return Err(Error::out_of_range(format!(
                    "Partition #{} out of range (usable range would be {}-{})",
                    index + 1,
                    first,
                    last
                )));
            }
        }

        let backup_entry_lba = self.bheader.my_lba - esects;
        for header in [&mut self.pheader, &mut self.bheader] {
            header.npartition_entries = count;
            header.first_usable_lba = first;
            header.last_usable_lba = last;
        }
        self.bheader.partition_entry_lba = backup_entry_lba;

        let new_len = u64_to_usize(bytes, "entry array size")?;
        let mut raw = vec![0u8; new_len];
        let keep = new_len.min(self.raw_entries().len());
        raw[..keep].copy_from_slice(&self.raw_entries()[..keep]);
        let mut entries = self.entries.clone();
        entries.resize(count as usize, GptEntry::default());
        self.replace_entries(entries, raw);
        self.commit();

        tracing::info!(
            "Partition table length changed from {} to {}",
            old_count,
            count
        );
        Ok(())
    }

    /// Move the backup header and entries to the last LBA of the device
    ///
    /// Needed after the device grew (or an image was enlarged); the last
    /// usable LBA follows the backup. Returns `false` when the backup is
    /// already in place.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` when a used entry would end past the new last
    /// usable LBA.
    pub fn relocate_backup(&mut self) -> Result<bool> {
        let last_lba = self.geometry.last_lba();
        if self.bheader.my_lba == last_lba && self.pheader.alternative_lba == last_lba {
            return Ok(false);
        }

        let sector_size = self.sector_size() as u64;
        let esects = self.pheader.entry_sectors(sector_size)?;
        let last_usable = last_lba
            .checked_sub(esects + 1)
            .filter(|&l| l >= self.pheader.first_usable_lba)
            .ok_or_else(|| {
                Error::capacity_exceeded(format!(
                    "device of {} sectors is too small for the backup GPT",
                    last_lba + 1
                ))
            })?;
        if let Some((index, entry)) = self
            .used_entries()
            .find(|(_, e)| e.last_lba > last_usable)
        {
            return Err(Error::out_of_range(format!(
                "partition {} ends at {}, past the new last usable LBA {}",
                index + 1,
                entry.last_lba,
                last_usable
            )));
        }

        let old = self.bheader.my_lba;
        self.pheader.alternative_lba = last_lba;
        self.pheader.last_usable_lba = last_usable;
        self.bheader = GptHeader::mirror_at(&self.pheader, last_lba, sector_size)?;
        self.commit();

        tracing::info!("Backup GPT header moved from LBA {} to {}", old, last_lba);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::tests::{device, gpt_image, DISK_SECTORS};
    use crate::gpt::types::ATTR_LEGACY_BIOS_BOOTABLE;
    use labelkit_core::ZoneTable;
    use labelkit_pipeline::StreamDevice;
    use std::io::Cursor;

    fn probed(dev: &mut StreamDevice<Cursor<Vec<u8>>>) -> GptTable {
        let mut ctx = DiskContext::new(dev).unwrap();
        GptTable::probe(&mut ctx).unwrap()
    }

    #[test]
    fn test_add_defaults() {
        let mut dev = device(DISK_SECTORS);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = GptTable::create(&mut ctx).unwrap();

        let index = table
            .add_partition(&mut ctx, &PartitionRequest::default())
            .unwrap();
        let e = table.entry(index).unwrap();
        assert_eq!(index, 0);
        assert_eq!(e.first_lba, 2048);
        assert_eq!(e.last_lba, DISK_SECTORS - 34);
        assert_eq!(e.type_guid, Guid::LINUX_FILESYSTEM);
        assert!(!e.unique_guid.is_nil());
        assert!(table.primary_header().crc_is_valid(512));
    }

    #[test]
    fn test_add_start_inside_used_entry() {
        let mut dev = gpt_image();
        let mut table = probed(&mut dev);
        let before = table.entries().to_vec();
        let raw = table.raw_entries().to_vec();

        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let req = PartitionRequest {
            start: Some(4096),
            size: Some(100),
            ..Default::default()
        };
        assert!(matches!(
            table.add_partition(&mut ctx, &req),
            Err(Error::OutOfRange(_))
        ));
        assert_eq!(table.entries(), &before[..]);
        assert_eq!(table.raw_entries(), &raw[..]);
        assert!(!table.is_changed());
    }

    #[test]
    fn test_add_explicit_start_and_size() {
        let mut dev = device(DISK_SECTORS);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = GptTable::create(&mut ctx).unwrap();

        let req = PartitionRequest {
            start: Some(10000),
            size: Some(5000),
            name: Some("data".into()),
            ..Default::default()
        };
        let index = table.add_partition(&mut ctx, &req).unwrap();
        let e = table.entry(index).unwrap();
        assert_eq!((e.first_lba, e.last_lba), (10000, 14999));
        assert_eq!(e.name(), "data");

        let below = PartitionRequest {
            start: Some(100),
            ..Default::default()
        };
        assert!(matches!(
            table.add_partition(&mut ctx, &below),
            Err(Error::OutOfRange(_))
        ));

        let too_big = PartitionRequest {
            start: Some(2048),
            size: Some(8000),
            ..Default::default()
        };
        assert!(matches!(
            table.add_partition(&mut ctx, &too_big),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_add_rejects_bad_requests() {
        let mut dev = device(DISK_SECTORS);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = GptTable::create(&mut ctx).unwrap();

        let dos = PartitionRequest {
            type_code: Some(PartitionType::Dos(0x83)),
            ..Default::default()
        };
        let nil = PartitionRequest {
            type_code: Some(PartitionType::Gpt(Guid::NIL)),
            ..Default::default()
        };
        let long_name = PartitionRequest {
            name: Some("x".repeat(37)),
            ..Default::default()
        };
        let zero = PartitionRequest {
            size: Some(0),
            ..Default::default()
        };
        for req in [dos, nil, long_name, zero] {
            assert!(matches!(
                table.add_partition(&mut ctx, &req),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert_eq!(table.partitions_used(), 0);

        let huge = PartitionRequest {
            start: Some(4096),
            size: Some(u64::MAX),
            ..Default::default()
        };
        assert!(matches!(
            table.add_partition(&mut ctx, &huge),
            Err(Error::CapacityExceeded(_))
        ));
        assert_eq!(table.partitions_used(), 0);

        table
            .add_partition(&mut ctx, &PartitionRequest::default())
            .unwrap();
        let full = table.add_partition(&mut ctx, &PartitionRequest::default());
        assert!(matches!(full, Err(Error::CapacityExceeded(_))));

        let used = PartitionRequest {
            index: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            table.add_partition(&mut ctx, &used),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_add_into_largest_gap() {
        let mut dev = device(DISK_SECTORS);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = GptTable::create(&mut ctx).unwrap();

        for (start, size) in [(2048, 2048), (8192, 2048), (150000, 2048)] {
            let req = PartitionRequest {
                start: Some(start),
                size: Some(size),
                ..Default::default()
            };
            table.add_partition(&mut ctx, &req).unwrap();
        }
        let index = table
            .add_partition(&mut ctx, &PartitionRequest::default())
            .unwrap();
        let e = table.entry(index).unwrap();
        // gap 10240..149999 is the largest; its start is already aligned
        assert_eq!(e.first_lba, 10240);
        assert_eq!(e.last_lba, 149999);
    }

    #[test]
    fn test_align_end() {
        let mut dev = device(DISK_SECTORS);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = GptTable::create(&mut ctx).unwrap();
        let req = PartitionRequest {
            size: Some(3000),
            align_end: true,
            ..Default::default()
        };
        let index = table.add_partition(&mut ctx, &req).unwrap();
        let e = table.entry(index).unwrap();
        assert_eq!((e.last_lba + 1) % 2048, 0);
    }

    #[test]
    fn test_delete_and_setters() {
        let mut dev = gpt_image();
        let mut table = probed(&mut dev);

        table.set_partition_name(0, "boot").unwrap();
        table
            .set_partition_attrs(0, ATTR_LEGACY_BIOS_BOOTABLE)
            .unwrap();
        table.set_partition_type(1, Guid::LINUX_SWAP).unwrap();
        table
            .set_partition_uuid(1, Guid::from_u128(0x1234))
            .unwrap();
        assert!(table.is_changed());

        let parts = table.partitions();
        assert_eq!(parts[0].name, "boot");
        assert_eq!(parts[0].attribute_names, vec!["LegacyBIOSBootable"]);
        assert!(parts[0].bootable);
        assert!(!parts[1].bootable);
        assert_eq!(table.zone(0).map(|z| z.bootable), Some(true));
        assert_eq!(parts[1].type_name, "Linux swap");
        assert_eq!(parts[1].unique_guid, Guid::from_u128(0x1234));

        assert!(matches!(
            table.set_partition_type(1, Guid::NIL),
            Err(Error::InvalidArgument(_))
        ));
        table.delete_partition(0).unwrap();
        assert_eq!(table.partitions_used(), 1);
        assert!(matches!(
            table.delete_partition(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.delete_partition(500),
            Err(Error::OutOfRange(_))
        ));
        assert!(table.primary_header().crc_is_valid(512));
        assert!(table.backup_header().crc_is_valid(512));
    }

    #[test]
    fn test_set_disk_guid_updates_both_headers() {
        let mut dev = gpt_image();
        let mut table = probed(&mut dev);
        table.set_disk_guid(Guid::from_u128(99));
        assert_eq!(table.primary_header().disk_guid, Guid::from_u128(99));
        assert_eq!(table.backup_header().disk_guid, Guid::from_u128(99));
        assert!(table.backup_header().crc_is_valid(512));
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let mut dev = device(DISK_SECTORS);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = GptTable::create(&mut ctx).unwrap();
        let req = PartitionRequest {
            start: Some(4096),
            size: Some(4096),
            ..Default::default()
        };
        table.add_partition(&mut ctx, &req).unwrap();

        table.resize_entries(256).unwrap();
        assert_eq!(table.max_partitions(), 256);
        assert_eq!(table.raw_entries().len(), 256 * 128);
        assert_eq!(table.first_usable_lba(), 2 + 64);
        assert_eq!(table.last_usable_lba(), DISK_SECTORS - 2 - 64);
        assert_eq!(table.backup_header().partition_entry_lba, DISK_SECTORS - 1 - 64);
        assert_eq!(table.entry(0).unwrap().first_lba, 4096);

        table.resize_entries(4).unwrap();
        assert_eq!(table.first_usable_lba(), 3);
        assert_eq!(table.raw_entries().len(), 512);
    }

    #[test]
    fn test_resize_refusals() {
        let mut dev = device(DISK_SECTORS);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = GptTable::create(&mut ctx).unwrap();
        let req = PartitionRequest {
            index: Some(10),
            start: Some(2048),
            size: Some(1000),
            ..Default::default()
        };
        table.add_partition(&mut ctx, &req).unwrap();

        assert!(matches!(
            table.resize_entries(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.resize_entries(8),
            Err(Error::OutOfRange(_))
        ));
        // 8192 entries need 2048 sectors, pushing the first usable LBA past 2048
        assert!(matches!(
            table.resize_entries(8192),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            table.resize_entries(u32::MAX),
            Err(Error::CapacityExceeded(_))
        ));
        assert_eq!(table.max_partitions(), 128);
    }

    #[test]
    fn test_relocate_backup_after_growth() {
        let mut image = gpt_image().into_inner().into_inner();
        image.resize(2 * DISK_SECTORS as usize * 512, 0);
        let mut dev = StreamDevice::new(
            Cursor::new(image),
            labelkit_core::DeviceGeometry::for_capacity(2 * DISK_SECTORS, 512),
        )
        .unwrap();
        let mut table = probed(&mut dev);

        assert_eq!(table.backup_header().my_lba, DISK_SECTORS - 1);
        assert!(table.relocate_backup().unwrap());
        assert_eq!(table.backup_header().my_lba, 2 * DISK_SECTORS - 1);
        assert_eq!(table.primary_header().alternative_lba, 2 * DISK_SECTORS - 1);
        assert_eq!(table.last_usable_lba(), 2 * DISK_SECTORS - 34);
        assert!(!table.relocate_backup().unwrap());
    }
}

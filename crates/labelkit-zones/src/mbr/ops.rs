//! Mutating DOS table operations
//!
//! Every operation validates completely before touching the table, so an
//! error leaves the in-memory model exactly as it was.

use super::types::{DosEntry, MbrPartitionType, ACTIVE_FLAG, NUM_PARTITIONS};
use super::{Logical, MbrTable};
use crate::label::{PartitionRequest, PartitionType};
use labelkit_core::{
    checked_add_u64, u64_to_u32, validate_partition_index, Error, Result, MAX_DOS_PARTITIONS,
};

/// Where a new partition goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Primary(usize),
    /// First logical, reusing the empty EBR at the start of the extended partition
    FirstLogical,
    /// Logical appended to the chain with a new EBR
    NextLogical,
}

/// Fully validated placement, applied without further checks
#[derive(Debug)]
struct Placement {
    slot: Slot,
    index: usize,
    /// EBR sector for logicals, 0 for primaries
    offset: u64,
    start: u64,
    stop: u64,
}

impl MbrTable {
    /// Add a partition and return its zero-based index
    ///
    /// Without an explicit index or `logical` flag the first free primary slot
    /// is used, falling back to a new logical partition when all primaries are
    /// taken and an extended partition exists. The default start is the first
    /// unused, aligned sector; the default end is the end of the free region.
    pub fn add_partition(&mut self, req: &PartitionRequest) -> Result<usize> {
        let sys = match req.type_code {
            None => MbrPartitionType::LINUX,
            Some(PartitionType::Dos(code)) => MbrPartitionType(code),
            Some(PartitionType::Gpt(_)) => {
                return Err(Error::invalid_argument(
                    "a GPT type GUID cannot be used on a DOS table",
                ))
            }
        };

        let slot = self.choose_slot(req, sys)?;
        let placement = self.place(slot, req)?;
        self.apply(&placement, sys)?;

        tracing::info!(
            "Created a new partition {} of type '{}' from sector {} to {}",
            placement.index + 1,
            sys.name(),
            placement.start,
            placement.stop
        );
        Ok(placement.index)
    }

    fn choose_slot(&self, req: &PartitionRequest, sys: MbrPartitionType) -> Result<Slot> {
        let want_logical = req.logical || req.index.is_some_and(|i| i >= NUM_PARTITIONS);

        if sys.is_extended() {
            if self.primaries.iter().any(DosEntry::is_extended) {
                return Err(Error::invalid_argument(
                    "an extended partition already exists",
                ));
            }
            if want_logical {
                return Err(Error::invalid_argument(
                    "a logical partition cannot be extended",
                ));
            }
        }

        if want_logical {
            if self.ext_index.is_none() {
                return Err(Error::invalid_argument(
                    "logical partitions require an extended partition",
                ));
            }
            return self.logical_slot(req.index);
        }

        if let Some(index) = req.index {
            if self.primaries[index].is_used() {
                return Err(Error::invalid_argument(format!(
                    "Partition {} is already defined. Delete it before re-adding it",
                    index + 1
                )));
            }
            return Ok(Slot::Primary(index));
        }

        if let Some(free) = self.primaries.iter().position(|p| !p.is_used()) {
            return Ok(Slot::Primary(free));
        }
        if self.ext_index.is_some() {
            tracing::info!("All primary partitions are in use");
            return self.logical_slot(None);
        }
        Err(Error::capacity_exceeded(
            "All primary partitions are in use; replace one with an extended partition to add more",
        ))
    }

    fn logical_slot(&self, index: Option<usize>) -> Result<Slot> {
        let reuse = match self.logicals.as_slice() {
            [] => true,
            [only] => only.data.is_cleared(),
            _ => false,
        };
        let (slot, next) = if reuse {
            (Slot::FirstLogical, NUM_PARTITIONS)
        } else {
            (Slot::NextLogical, NUM_PARTITIONS + self.logicals.len())
        };

        if next >= MAX_DOS_PARTITIONS {
            return Err(Error::capacity_exceeded(
                "The maximum number of partitions has been created",
            ));
        }
        if let Some(index) = index {
            if index != next {
                return Err(Error::invalid_argument(format!(
                    "the next logical partition is {}, not {}",
                    next + 1,
                    index + 1
                )));
            }
        }
        Ok(slot)
    }

    /// First and last used sector of every partition; extended and cleared
    /// entries have none
    fn bounds(&self) -> Vec<Option<(u64, u64)>> {
        (0..self.partition_count())
            .map(|i| {
                let entry = self.entry(i)?;
                if entry.is_cleared() || entry.is_extended() || !entry.is_used() {
                    return None;
                }
                let first = self.abs_start(i)?;
                Some((first, first + entry.size as u64 - 1))
            })
            .collect()
    }

    /// Advance `start` past every partition (and EBR) it falls into
    fn unused_start(&self, logical: bool, mut start: u64, bounds: &[Option<(u64, u64)>]) -> u64 {
        let first_lba = self.alignment.first_lba();
        for (i, bound) in bounds.iter().enumerate() {
            if start == self.entry_offset(i) {
                start += first_lba;
            }
            if let Some((first, last)) = *bound {
                let last_plus_off = last + if logical { first_lba } else { 0 };
                if start >= first && start <= last_plus_off {
                    start = last_plus_off + 1;
                }
            }
        }
        start
    }

    fn place(&self, slot: Slot, req: &PartitionRequest) -> Result<Placement> {
        let logical = !matches!(slot, Slot::Primary(_));
        let first_lba = self.alignment.first_lba();
        let mut bounds = self.bounds();

        let (initial, mut limit) = if logical {
            let ext = self.primaries[self.ext_index.unwrap_or_default()];
            (
                self.ext_offset + first_lba,
                (ext.start as u64 + ext.size as u64).saturating_sub(1),
            )
        } else {
            if let Some(ext) = self.ext_index {
                let entry = self.primaries[ext];
                bounds[ext] = Some((
                    self.ext_offset,
                    (entry.start as u64 + entry.size as u64).saturating_sub(1),
                ));
            }
            (first_lba, self.geometry.last_lba().min(u32::MAX as u64))
        };

        let low = self.unused_start(logical, initial, &bounds);
        if low > limit {
            return Err(Error::capacity_exceeded("No free sectors available"));
        }

        let mut start = match req.start {
            Some(start) => {
                if start < low || start > limit {
                    return Err(Error::out_of_range(format!(
                        "start sector {} is outside the free range {}-{}",
                        start, low, limit
                    )));
                }
                if self.unused_start(logical, start, &bounds) != start {
                    return Err(Error::out_of_range(format!(
                        "Sector {} is already allocated",
                        start
                    )));
                }
                start
            }
            None => {
                let mut dflt = low;
                loop {
                    let aligned = self.alignment.align_lba_in_range(dflt, dflt, limit);
                    dflt = self.unused_start(logical, aligned, &bounds);
                    if !(dflt != aligned && dflt > aligned && dflt < limit) {
                        break;
                    }
                }
                if dflt >= limit {
                    low
                } else {
                    dflt
                }
            }
        };

        let (index, offset) = match slot {
            Slot::Primary(n) => (n, 0),
            Slot::FirstLogical => (NUM_PARTITIONS, self.ext_offset),
            Slot::NextLogical => {
                let mut offset = start - first_lba;
                if offset == self.ext_offset {
                    offset += 1;
                    if first_lba == 1 {
                        start += 1;
                    }
                }
                (NUM_PARTITIONS + self.logicals.len(), offset)
            }
        };

        for (i, bound) in bounds.iter().enumerate() {
            let ebr = self.entry_offset(i);
            if start < ebr && limit >= ebr {
                limit = ebr - 1;
            }
            if let Some((first, _)) = *bound {
                if start < first && limit >= first {
                    limit = first - 1;
                }
            }
        }
        if start > limit {
            return Err(Error::capacity_exceeded("No free sectors available"));
        }

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

        u64_to_u32(stop - start + 1, "partition size")?;
        u64_to_u32(start - offset, "partition start")?;

        Ok(Placement {
            slot,
            index,
            offset,
            start,
            stop,
        })
    }

    fn apply(&mut self, placement: &Placement, sys: MbrPartitionType) -> Result<()> {
        let (heads, sectors) = (self.geometry.heads, self.geometry.sectors);
        let size = u64_to_u32(placement.stop - placement.start + 1, "partition size")?;
        let relative = u64_to_u32(placement.start - placement.offset, "partition start")?;
        let sector_size = self.sector_size();

        match placement.slot {
            Slot::Primary(n) => {
                let entry = &mut self.primaries[n];
                entry.boot_ind = 0;
                entry.set(relative, size, placement.start, sys, heads, sectors);
                self.primary_changed[n] = true;

                if sys.is_extended() {
                    self.ext_index = Some(n);
                    self.ext_offset = placement.start;
                    self.logicals = vec![Logical::empty(placement.start, sector_size)];
                }
            }
            Slot::FirstLogical => {
                if self.logicals.is_empty() {
                    self.logicals
                        .push(Logical::empty(self.ext_offset, sector_size));
                }
                let first = &mut self.logicals[0];
                first.data.boot_ind = 0;
                first.data.set(relative, size, placement.start, sys, heads, sectors);
                first.changed = true;
            }
            Slot::NextLogical => {
                let link_start = u64_to_u32(placement.offset - self.ext_offset, "EBR link")?;
                let link_size = u64_to_u32(placement.stop - placement.offset + 1, "EBR link")?;

                let mut logical = Logical::empty(placement.offset, sector_size);
                logical
                    .data
                    .set(relative, size, placement.start, sys, heads, sectors);
                if let Some(prev) = self.logicals.last_mut() {
                    prev.link.set(
                        link_start,
                        link_size,
                        placement.offset,
                        MbrPartitionType::EXTENDED,
                        heads,
                        sectors,
                    );
                    prev.changed = true;
                }
                self.logicals.push(logical);
            }
        }
        Ok(())
    }

    /// Copy of the entry at `index`, which must name a partition the table holds
    fn existing_entry(&self, index: usize) -> Result<DosEntry> {
        validate_partition_index(index, self.partition_count())?;
        self.entry(index).copied().ok_or_else(|| {
            Error::inconsistent_state(format!("partition {} has no entry", index + 1))
        })
    }

    /// Delete partition `index`
    ///
    /// Deleting the extended partition drops the whole chain. Deleting a
    /// logical relinks its neighbours; later logicals shift down by one.
    pub fn delete_partition(&mut self, index: usize) -> Result<()> {
        let entry = self.existing_entry(index)?;
        if !entry.is_used() {
            return Err(Error::invalid_argument(format!(
                "Partition {} is not in use",
                index + 1
            )));
        }

        if index < NUM_PARTITIONS {
            if entry.is_extended() && self.ext_index == Some(index) {
                self.logicals.clear();
                self.ext_index = None;
                self.ext_offset = 0;
            }
            self.primaries[index].clear();
            self.primary_changed[index] = true;
        } else {
            self.unlink_logical(index - NUM_PARTITIONS)?;
        }

        tracing::info!("Partition {} has been deleted", index + 1);
        Ok(())
    }

    /// First partition found out of disk order, with the partition it should
    /// precede; primaries and logicals are checked separately
    pub fn wrong_order(&self) -> Option<(usize, usize)> {
        let mut last_start = 0;
        let mut last_i = 0;

        for i in 0..self.partition_count() {
            if i == NUM_PARTITIONS {
                last_i = NUM_PARTITIONS;
                last_start = 0;
            }
            let used = self.entry(i).is_some_and(DosEntry::is_used);
            if !used {
                continue;
            }
            let start = self.abs_start(i).unwrap_or_default();
            if last_start > start {
                return Some((i, last_i));
            }
            last_start = start;
            last_i = i;
        }
        None
    }

    /// Renumber partitions into ascending disk order
    ///
    /// Returns `false` when the order was already correct.
    pub fn fix_order(&mut self) -> Result<bool> {
        if self.wrong_order().is_none() {
            tracing::info!("Nothing to do. Ordering is correct already");
            return Ok(false);
        }

        let mut work = self.clone();
        let mut remaining = work.wrong_order();
        while let Some((i, k)) = remaining {
            if i >= NUM_PARTITIONS {
                break;
            }
            work.primaries.swap(i, k);
            work.ext_index = match work.ext_index {
                Some(e) if e == i => Some(k),
                Some(e) if e == k => Some(i),
                other => other,
            };
            work.primary_changed[i] = true;
            work.primary_changed[k] = true;
            remaining = work.wrong_order();
        }

        if remaining.is_some() {
            work.fix_chain_of_logicals()?;
        }

        *self = work;
        tracing::info!("Partition order fixed");
        Ok(true)
    }

    /// Flip the active flag and return the new state
    pub fn toggle_bootable(&mut self, index: usize) -> Result<bool> {
        validate_partition_index(index, self.partition_count())?;
        let entry = self.entry_mut(index).ok_or_else(|| {
            Error::inconsistent_state(format!("partition {} has no entry", index + 1))
        })?;

        if entry.is_extended() && entry.boot_ind == 0 {
            tracing::warn!("Partition {}: is an extended partition", index + 1);
        }
        entry.boot_ind = if entry.boot_ind != 0 { 0 } else { ACTIVE_FLAG };
        let bootable = entry.boot_ind != 0;
        self.set_changed(index);

        tracing::info!(
            "The bootable flag on partition {} is {} now",
            index + 1,
            if bootable { "enabled" } else { "disabled" }
        );
        Ok(bootable)
    }

    /// Change the one-byte type of a used partition
    ///
    /// Converting to or from an extended type is refused; the chain layout
    /// would not match.
    pub fn set_partition_type(&mut self, index: usize, sys: MbrPartitionType) -> Result<()> {
        let entry = self.existing_entry(index)?;
        if !entry.is_used() {
            return Err(Error::invalid_argument(format!(
                "Partition {} is not in use",
                index + 1
            )));
        }
        if entry.sys_ind == sys {
            return Ok(());
        }
        if entry.is_extended() || sys.is_extended() {
            return Err(Error::invalid_argument(
                "You cannot change a partition into an extended one or vice versa. Delete it first",
            ));
        }
        if sys == MbrPartitionType::EMPTY {
            tracing::warn!(
                "Type 0 means free space to many systems. Having partitions of type 0 is probably unwise"
            );
        }

        if let Some(entry) = self.entry_mut(index) {
            entry.sys_ind = sys;
        }
        self.set_changed(index);
        tracing::info!(
            "Changed type of partition {} to '{}'",
            index + 1,
            sys.name()
        );
        Ok(())
    }

    /// Move the first sector of a partition's data, keeping its last sector
    ///
    /// `new_start` must lie between the end of the preceding used area and
    /// the partition's current last sector.
    pub fn move_begin(&mut self, index: usize, new_start: u64) -> Result<()> {
        let entry = self.existing_entry(index)?;
        if !entry.is_used() || entry.is_extended() {
            return Err(Error::invalid_argument(format!(
                "Partition {}: no data area",
                index + 1
            )));
        }

        let offset = self.entry_offset(index);
        let current = offset + entry.start as u64;
        let last = current + entry.size as u64 - 1;

        let mut free_start = if offset != 0 { offset + 1 } else { 1 };
        for x in 0..self.partition_count() {
            let Some(other) = self.entry(x) else { continue };
            if !other.is_used() {
                continue;
            }
            let end = self.abs_start(x).unwrap_or_default() + other.size as u64;
            if end > free_start && end <= current {
                free_start = end;
            }
        }

        if new_start < free_start || new_start > last {
            return Err(Error::out_of_range(format!(
                "new beginning {} is outside {}-{}",
                new_start, free_start, last
            )));
        }

        let relative = u64_to_u32(new_start - offset, "partition start")?;
        if relative != entry.start {
            let size = u64_to_u32(last - new_start + 1, "partition size")?;
            let (heads, sectors) = (self.geometry.heads, self.geometry.sectors);
            if let Some(e) = self.entry_mut(index) {
                e.start = relative;
                e.size = size;
                e.set_chs(new_start, heads, sectors);
            }
            self.set_changed(index);
        }
        Ok(())
    }
}

//! Extended-partition chain walk and relinking

use super::types::{DosEntry, MbrPartitionType, NUM_PARTITIONS};
use super::{Logical, MbrTable};
use labelkit_core::{DiskContext, Error, Finding, FindingKind, Result, MAX_DOS_PARTITIONS};
use std::collections::HashSet;

impl MbrTable {
    /// Walk the EBR chain of the extended partition in primary slot `ext`
    ///
    /// The walk stops at the first non-extended link, at a link that revisits
    /// an EBR, at a link beyond the device end, or once the partition cap is
    /// reached. Each stop clears the offending link in memory and is recorded
    /// as a note, so a later write truncates the chain on disk.
    pub(super) fn read_extended(&mut self, ctx: &mut DiskContext<'_>, ext: usize) -> Result<()> {
        let mut link = self.primaries[ext];
        if link.start == 0 {
            let msg = "Bad offset in primary extended partition";
            tracing::warn!("{}", msg);
            self.notes
                .push(Finding::warning(FindingKind::Chain, msg).for_partition(ext));
            return Ok(());
        }

        self.ext_index = Some(ext);
        let mut visited = HashSet::new();

        while link.is_extended() {
            let count = NUM_PARTITIONS + self.logicals.len();
            if count >= MAX_DOS_PARTITIONS {
                self.truncate_chain(format!(
                    "Omitting partitions after #{}. They will be deleted if you save this partition table",
                    count
                ));
                break;
            }

            let offset = self.ext_offset + link.start as u64;
            if self.ext_offset == 0 {
                self.ext_offset = link.start as u64;
            }

            if offset >= ctx.total_sectors() {
                self.truncate_chain(format!(
                    "EBR link to sector {} points beyond the end of the device",
                    offset
                ));
                break;
            }
            if !visited.insert(offset) {
                self.truncate_chain(format!(
                    "EBR chain loops back to sector {}; chain truncated",
                    offset
                ));
                break;
            }

            let sector = ctx.read_sector(offset)?;
            let number = count + 1;
            let mut data_slot = None;
            let mut link_slot = None;

            for slot in 0..NUM_PARTITIONS {
                let entry = DosEntry::read_slot(&sector, slot);
                if !entry.is_used() {
                    continue;
                }
                if entry.is_extended() {
                    if link_slot.is_some() {
                        self.note_chain(number, format!("Extra link pointer in partition table {}", number));
                    } else {
                        link_slot = Some(slot);
                    }
                } else if entry.sys_ind.to_byte() != 0 {
                    if data_slot.is_some() {
                        self.note_chain(number, format!("Ignoring extra data in partition table {}", number));
                    } else {
                        data_slot = Some(slot);
                    }
                }
            }

            let data_slot = data_slot.unwrap_or(if link_slot == Some(0) { 1 } else { 0 });
            let link_slot = link_slot.unwrap_or(if data_slot == 0 { 1 } else { 0 });

            let logical = Logical {
                offset,
                data: DosEntry::read_slot(&sector, data_slot),
                link: DosEntry::read_slot(&sector, link_slot),
                sector,
                data_slot,
                link_slot,
                changed: false,
            };
            tracing::debug!(
                "EBR at sector {}: data start {} size {}",
                offset,
                logical.data.start,
                logical.data.size
            );
            link = logical.link;
            self.logicals.push(logical);
        }

        self.remove_empty_links();
        Ok(())
    }

    fn note_chain(&mut self, number: usize, msg: String) {
        tracing::warn!("{}", msg);
        self.notes
            .push(Finding::warning(FindingKind::Chain, msg).for_partition(number - 1));
    }

    /// Clear the link of the last logical read so far
    fn truncate_chain(&mut self, msg: String) {
        tracing::warn!("{}", msg);
        let index = NUM_PARTITIONS + self.logicals.len();
        if let Some(last) = self.logicals.last_mut() {
            last.link.clear();
            last.changed = true;
        }
        self.notes.push(
            Finding::warning(FindingKind::Chain, msg).for_partition(index.saturating_sub(1)),
        );
    }

    /// Unlink logicals whose data entry is empty
    fn remove_empty_links(&mut self) {
        loop {
            let multiple = self.logicals.len() > 1
                || self
                    .logicals
                    .first()
                    .is_some_and(|l| l.data.sys_ind.to_byte() != 0);
            let empty = self.logicals.iter().position(|l| !l.data.is_used());

            match empty {
                Some(k) if multiple => {
                    let msg = format!("omitting empty partition ({})", NUM_PARTITIONS + k + 1);
                    tracing::info!("{}", msg);
                    self.notes
                        .push(Finding::info(FindingKind::Chain, msg).for_partition(NUM_PARTITIONS + k));
                    if let Err(e) = self.unlink_logical(k) {
                        tracing::warn!("cannot unlink empty partition: {}", e);
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    /// Remove logical `k` from the chain, relinking its neighbours
    ///
    /// The EBR of the first logical always stays at the start of the extended
    /// partition; removing it moves the second EBR there. An only logical is
    /// cleared instead of removed.
    pub(crate) fn unlink_logical(&mut self, k: usize) -> Result<()> {
        let len = self.logicals.len();
        if k >= len {
            return Err(Error::invalid_argument(format!(
                "no logical partition {}",
                NUM_PARTITIONS + k + 1
            )));
        }

        if k > 0 && !self.logicals[k].link.is_extended() {
            // last in the chain
            let prev = &mut self.logicals[k - 1];
            prev.link.clear();
            prev.changed = true;
            self.logicals.truncate(k);
            return Ok(());
        }

        if k > 0 {
            let link = self.logicals[k].link;
            let prev = &mut self.logicals[k - 1];
            prev.link = link;
            prev.changed = true;
        } else if len > 1 {
            // the first logical in a longer chain: the next EBR takes its place
            let ext_offset = self.ext_offset;
            let next = &mut self.logicals[1];
            let abs_start = next.abs_start();
            let rebased = abs_start.checked_sub(ext_offset).ok_or_else(|| {
                Error::inconsistent_state(format!(
                    "logical partition at sector {} starts before the extended partition",
                    abs_start
                ))
            })?;
            next.data.start = labelkit_core::u64_to_u32(rebased, "logical start")?;
            next.offset = ext_offset;
            next.changed = true;
        }

        if len > 1 {
            self.logicals.remove(k);
        } else {
            let only = &mut self.logicals[k];
            only.data.clear();
            only.changed = true;
        }
        Ok(())
    }

    /// Sort the chain so EBR offsets and data starts both ascend
    ///
    /// Stage one reorders EBR sectors (the first EBR stays at the start of the
    /// extended partition) while every data area keeps its absolute position;
    /// stage two reorders data entries by absolute start. Works on a copy; the
    /// table is only replaced when every relative start still fits its field.
    pub(crate) fn fix_chain_of_logicals(&mut self) -> Result<()> {
        let mut logicals = self.logicals.clone();
        let mut abs: Vec<u64> = logicals.iter().map(Logical::abs_start).collect();
        let ext_offset = self.ext_offset;
        let (heads, sectors) = (self.geometry.heads, self.geometry.sectors);
        let len = logicals.len();

        let mut sorted = false;
        while !sorted {
            sorted = true;
            for j in 1..len.saturating_sub(1) {
                if logicals[j].offset > logicals[j + 1].offset {
                    let oj = logicals[j].offset;
                    logicals[j].offset = logicals[j + 1].offset;
                    logicals[j + 1].offset = oj;
                    sorted = false;
                }
            }
        }

        sorted = false;
        while !sorted {
            sorted = true;
            for j in 0..len.saturating_sub(1) {
                if abs[j] > abs[j + 1] {
                    let data = logicals[j].data;
                    logicals[j].data = logicals[j + 1].data;
                    logicals[j + 1].data = data;
                    abs.swap(j, j + 1);
                    sorted = false;
                }
            }
        }

        for j in 0..len {
            let relative = abs[j].checked_sub(logicals[j].offset).ok_or_else(|| {
                Error::inconsistent_state(format!(
                    "logical partition data at sector {} would precede its EBR at sector {}",
                    abs[j], logicals[j].offset
                ))
            })?;
            logicals[j].data.start = labelkit_core::u64_to_u32(relative, "logical start")?;

            if j > 0 {
                let offset = logicals[j].offset;
                let link = offset.checked_sub(ext_offset).ok_or_else(|| {
                    Error::inconsistent_state("EBR precedes the extended partition")
                })?;
                let end = abs[j] + logicals[j].data.size as u64;
                let link_start = labelkit_core::u64_to_u32(link, "EBR link")?;
                let link_size = labelkit_core::u64_to_u32(end - offset, "EBR link")?;
                logicals[j - 1].link.set(
                    link_start,
                    link_size,
                    offset,
                    MbrPartitionType::EXTENDED,
                    heads,
                    sectors,
                );
            }
        }
        if let Some(last) = logicals.last_mut() {
            last.link.clear();
        }

        for logical in &mut logicals {
            logical.changed = true;
        }
        self.logicals = logicals;
        Ok(())
    }
}

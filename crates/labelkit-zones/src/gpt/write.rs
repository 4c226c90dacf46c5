//! Writing a GPT back to the device
//!
//! The backup copy goes first and the primary second, so a crash mid-write
//! always leaves one self-consistent copy for the next probe to recover from.

use super::header::PRIMARY_HEADER_LBA;
use super::{protective_record, GptTable, PmbrKind};
use crate::mbr::types::{set_boot_signature, DosEntry, MbrPartitionType, NUM_PARTITIONS};
use labelkit_core::{DiskContext, Error, Finding, FindingKind, Result};

impl GptTable {
    /// Write both copies and the protective MBR
    ///
    /// Order: backup entries, backup header, primary entries, primary header,
    /// protective MBR. The first failing step aborts the rest. A hybrid MBR
    /// in sector 0 is left untouched.
    ///
    /// # Errors
    ///
    /// - `OutOfRange` when the backup header lies beyond the device end
    /// - `InconsistentState` when the backup header is not on the last LBA
    ///   (see [`GptTable::relocate_backup`]) or two partitions overlap
    pub fn write(&mut self, ctx: &mut DiskContext<'_>) -> Result<()> {
        let last_lba = ctx.last_lba();
        let backup_lba = self.pheader.alternative_lba;
        if backup_lba > last_lba {
            return Err(Error::out_of_range(format!(
                "backup GPT header at LBA {} is beyond the device end (last LBA {})",
                backup_lba, last_lba
            )));
        }
        if backup_lba < last_lba {
            return Err(Error::inconsistent_state(format!(
                "backup GPT header at LBA {} is not at the end of the device (LBA {}); relocate it before writing",
                backup_lba, last_lba
            )));
        }
        if let Some((a, b)) = self.first_overlap() {
            return Err(Error::inconsistent_state(format!(
                "partitions {} and {} overlap",
                a + 1,
                b + 1
            )));
        }

        self.update_crcs();
        let sector_size = self.sector_size();
        let raw = self.raw_entries().to_vec();

        ctx.write_bytes(self.bheader.partition_entry_lba, &raw)?;
        ctx.write_sector(self.bheader.my_lba, &self.bheader.encode(sector_size))?;
        tracing::debug!("Wrote backup GPT at LBA {}", self.bheader.my_lba);

        ctx.write_bytes(self.pheader.partition_entry_lba, &raw)?;
        ctx.write_sector(PRIMARY_HEADER_LBA, &self.pheader.encode(sector_size))?;
        tracing::debug!("Wrote primary GPT");

        let hybrid = self.pmbr_kind() == PmbrKind::Hybrid;
        if !hybrid {
            let pmbr = self.protective_sector(ctx.total_sectors());
            ctx.write_sector(0, &pmbr)?;
            self.set_pmbr(pmbr, PmbrKind::Protective);
        }
        ctx.flush()?;

        self.mark_written();
        if hybrid {
            let msg = "Hybrid MBR detected; sector 0 was not rewritten";
            tracing::warn!("{}", msg);
            self.push_note(Finding::warning(FindingKind::Redundancy, msg));
        }
        tracing::info!("GPT partition table written");
        Ok(())
    }

    /// First pair of used entries sharing a sector
    pub fn first_overlap(&self) -> Option<(usize, usize)> {
        let used: Vec<_> = self.used_entries().collect();
        for (n, (i, a)) in used.iter().enumerate() {
            for (j, b) in &used[n + 1..] {
                if a.overlaps(b) {
                    return Some((*i, *j));
                }
            }
        }
        None
    }

    /// Sector 0 to write: the current one when it already protects the
    /// whole disk, else the boot code with a single fresh 0xEE record
    fn protective_sector(&self, total_sectors: u64) -> Vec<u8> {
        let size = (total_sectors - 1).min(u32::MAX as u64) as u32;
        let current = self.pmbr_sector();

        if self.pmbr_kind() == PmbrKind::Protective {
            if let Some(record) = protective_record(current) {
                if record.start as u64 == PRIMARY_HEADER_LBA
                    && (record.size == size || record.size == u32::MAX)
                {
                    return current.to_vec();
                }
            }
        }

        let mut sector = current.to_vec();
        let record = DosEntry {
            boot_ind: 0,
            start_chs: [0x00, 0x02, 0x00],
            sys_ind: MbrPartitionType::GPT_PROTECTIVE,
            end_chs: [0xFF, 0xFF, 0xFF],
            start: PRIMARY_HEADER_LBA as u32,
            size,
        };
        record.write_slot(&mut sector, 0);
        for slot in 1..NUM_PARTITIONS {
            DosEntry::default().write_slot(&mut sector, slot);
        }
        set_boot_signature(&mut sector);
        sector
    }
}

//! Free-space search over the GPT usable range
//!
//! Entries are not required to be sorted, so every search rescans the whole
//! array until the candidate sector stops moving.

use super::GptTable;
use serde::Serialize;

/// One maximal run of unused sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeSegment {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

/// Free-space report for the usable range
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FreeSpace {
    pub segments: Vec<FreeSegment>,
    /// Size of the largest segment in sectors
    pub largest: u64,
    /// Sum of all segment sizes in sectors
    pub total: u64,
}

impl GptTable {
    /// First sector at or after `start` that no used entry covers
    ///
    /// Returns `None` when no such sector exists before the last usable LBA.
    pub fn find_first_available(&self, start: u64) -> Option<u64> {
        let mut first = start.max(self.pheader.first_usable_lba);
        loop {
            let mut moved = false;
            for (_, entry) in self.used_entries() {
                if entry.contains(first) {
                    first = entry.last_lba.checked_add(1)?;
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
        (first <= self.pheader.last_usable_lba).then_some(first)
    }

    /// Last sector of the free run beginning at `start`: one before the
    /// nearest following used entry, else the last usable LBA
    pub fn find_last_free(&self, start: u64) -> u64 {
        let mut nearest = self.pheader.last_usable_lba;
        for (_, entry) in self.used_entries() {
            if entry.first_lba > start && entry.first_lba <= nearest {
                nearest = entry.first_lba - 1;
            }
        }
        nearest
    }

    /// Highest sector no used entry covers
    pub fn find_last_free_sector(&self) -> Option<u64> {
        let first_usable = self.pheader.first_usable_lba;
        let mut last = self.pheader.last_usable_lba;
        loop {
            let mut moved = false;
            for (_, entry) in self.used_entries() {
                if entry.contains(last) {
                    last = entry.first_lba.checked_sub(1)?;
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
        (last >= first_usable).then_some(last)
    }

    /// Start of the largest free segment; the earliest wins a tie
    pub fn find_first_in_largest(&self) -> Option<u64> {
        let mut selected: Option<FreeSegment> = None;
        for segment in self.free_segments() {
            if selected.map_or(true, |s| segment.size > s.size) {
                selected = Some(segment);
            }
        }
        selected.map(|s| s.start)
    }

    /// Every maximal free run in ascending order
    pub fn free_segments(&self) -> Vec<FreeSegment> {
        let mut segments = Vec::new();
        let mut next = self.find_first_available(0);
        while let Some(start) = next {
            let end = self.find_last_free(start);
            segments.push(FreeSegment {
                start,
                end,
                size: end - start + 1,
            });
            next = end
                .checked_add(1)
                .and_then(|n| self.find_first_available(n));
        }
        segments
    }

    pub fn free_space(&self) -> FreeSpace {
        let segments = self.free_segments();
        FreeSpace {
            largest: segments.iter().map(|s| s.size).max().unwrap_or(0),
            total: segments.iter().map(|s| s.size).sum(),
            segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::tests::{device, DISK_SECTORS};
    use crate::gpt::{GptEntry, Guid};
    use labelkit_core::DiskContext;

    fn table_with(spans: &[(u64, u64)]) -> GptTable {
        let mut dev = device(DISK_SECTORS);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = GptTable::create(&mut ctx).unwrap();
        for (i, &(first, last)) in spans.iter().enumerate() {
            table.entries[i] = GptEntry::new(Guid::LINUX_FILESYSTEM, Guid::NIL, first, last);
        }
        table
    }

    #[test]
    fn test_empty_table_is_one_segment() {
        let table = table_with(&[]);
        let free = table.free_space();
        assert_eq!(free.segments.len(), 1);
        assert_eq!(free.segments[0].start, 2048);
        assert_eq!(free.segments[0].end, DISK_SECTORS - 34);
        assert_eq!(free.largest, free.total);
        assert_eq!(table.find_first_in_largest(), Some(2048));
        assert_eq!(table.find_last_free_sector(), Some(DISK_SECTORS - 34));
    }

    #[test]
    fn test_first_available_skips_unsorted_entries() {
        // second entry listed first; both must be skipped from 2048
        let table = table_with(&[(4096, 8191), (2048, 4095)]);
        assert_eq!(table.find_first_available(0), Some(8192));
        assert_eq!(table.find_first_available(3000), Some(8192));
        assert_eq!(table.find_first_available(9000), Some(9000));
    }

    #[test]
    fn test_first_available_never_inside_a_partition() {
        let spans = [(2048, 10000), (10001, 20000), (30000, 40000)];
        let table = table_with(&spans);
        for start in (0..50000).step_by(997) {
            if let Some(lba) = table.find_first_available(start) {
                assert!(lba >= start);
                assert!(spans.iter().all(|&(f, l)| lba < f || lba > l));
            }
        }
    }

    #[test]
    fn test_last_free_stops_before_next_entry() {
        let table = table_with(&[(30000, 40000), (10000, 20000)]);
        assert_eq!(table.find_last_free(2048), 9999);
        assert_eq!(table.find_last_free(20001), 29999);
        assert_eq!(table.find_last_free(40001), DISK_SECTORS - 34);
    }

    #[test]
    fn test_largest_segment_selected() {
        let table = table_with(&[(2048, 100000), (110000, 120000)]);
        let free = table.free_space();
        assert_eq!(free.segments.len(), 2);
        assert_eq!(free.segments[0].start, 100001);
        assert_eq!(free.segments[0].size, 9999);
        assert_eq!(free.segments[1].start, 120001);
        assert_eq!(table.find_first_in_largest(), Some(120001));
    }

    #[test]
    fn test_full_disk_has_no_free_space() {
        let table = table_with(&[(2048, DISK_SECTORS - 34)]);
        assert_eq!(table.find_first_available(0), None);
        assert_eq!(table.find_first_in_largest(), None);
        assert_eq!(table.find_last_free_sector(), None);
        assert_eq!(table.free_space(), FreeSpace::default());
    }
}

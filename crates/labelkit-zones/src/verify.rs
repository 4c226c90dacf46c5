//! Table consistency checks
//!
//! Verification is read-only: it inspects an in-memory table and returns
//! findings. Whether an error blocks the caller's next step is up to the
//! caller. Probe-time notes are included first so one list tells the whole
//! story.

use crate::geometry::ChsAddress;
use crate::gpt::header::{entries_crc, GptHeader, PRIMARY_HEADER_LBA};
use crate::gpt::GptTable;
use crate::mbr::types::{DosEntry, ACTIVE_FLAG, NUM_PARTITIONS};
use crate::mbr::MbrTable;
use labelkit_core::{has_errors, DeviceGeometry, Finding, FindingKind};

/// Check a DOS table
///
/// CHS checks only run in DOS-compatible mode; LBA-only tables routinely
/// carry clamped or zero CHS fields.
pub fn verify_mbr(table: &MbrTable) -> Vec<Finding> {
    let mut findings = table.notes().to_vec();
    let geometry = table.geometry();
    let count = table.partition_count();

    if looks_like_garbage(table) {
        findings.push(Finding::warning(
            FindingKind::Garbage,
            "The partition table looks like garbage: invalid boot indicator",
        ));
    }
    if let Some((i, k)) = table.wrong_order() {
        findings.push(
            Finding::warning(
                FindingKind::Order,
                format!(
                    "Partition table entries are not in disk order (partition {} should precede {})",
                    i + 1,
                    k + 1
                ),
            )
            .for_partition(i),
        );
    }

    // first and last absolute sector of every used data partition
    let bounds: Vec<Option<(u64, u64)>> = (0..count)
        .map(|i| {
            let entry = table.entry(i)?;
            if !entry.is_used() || entry.is_extended() || entry.sys_ind.0 == 0 {
                return None;
            }
            let first = table.abs_start(i)?;
            Some((first, first + entry.size as u64 - 1))
        })
        .collect();

    let mut total: u64 = 0;
    for i in 0..count {
        let (Some(entry), Some((first, last))) = (table.entry(i), bounds[i]) else {
            continue;
        };

        if table.is_compatible() {
            check_consistency(&mut findings, geometry, i, entry, first, last);
        }
        check_end_chs(&mut findings, geometry, i, entry, last);
        if last > geometry.last_lba() {
            findings.push(
                Finding::error(
                    FindingKind::Bounds,
                    format!(
                        "Partition ends at sector {}, beyond the last sector {} of the device",
                        last,
                        geometry.last_lba()
                    ),
                )
                .for_partition(i),
            );
        }
        if !table.alignment().lba_is_phy_aligned(first) {
            findings.push(
                Finding::warning(
                    FindingKind::Alignment,
                    "Partition does not start on physical sector boundary",
                )
                .for_partition(i),
            );
        }

        total += last + 1 - first;
        if i == 0 {
            total += first.saturating_sub(1);
        }
        for (j, other) in bounds.iter().enumerate().take(i) {
            let Some((ofirst, olast)) = *other else {
                continue;
            };
            if first <= olast && ofirst <= last {
                findings.push(
                    Finding::error(
                        FindingKind::Overlap,
                        format!("Partition overlaps partition {}", j + 1),
                    )
                    .for_partition(i),
                );
                total += first.max(ofirst);
                total = total.saturating_sub(last.min(olast));
            }
        }
    }

    if let Some(ext) = table.extended_index().and_then(|e| table.primary(e)) {
        let ext_start = table.ext_offset();
        let ext_last = (ext.start as u64 + ext.size as u64).saturating_sub(1);
        let logicals = table.logicals();
        for (k, logical) in logicals.iter().enumerate() {
            let index = NUM_PARTITIONS + k;
            total += 1;
            if logical.data().sys_ind.0 == 0 {
                if k != 0 || logicals.len() > 1 {
                    findings.push(
                        Finding::warning(FindingKind::Chain, "Partition is empty")
                            .for_partition(index),
                    );
                }
            } else if let Some((first, last)) = bounds[index] {
                if first < ext_start || last > ext_last {
                    findings.push(
                        Finding::error(
                            FindingKind::Bounds,
                            format!(
                                "Logical partition is not entirely in partition {}",
                                table.extended_index().map_or(0, |e| e + 1)
                            ),
                        )
                        .for_partition(index),
                    );
                }
            }
        }
    }

    let n_sectors = geometry.total_sectors;
    if total > n_sectors {
        findings.push(Finding::error(
            FindingKind::Usage,
            format!(
                "Total allocated sectors {} greater than the maximum {}",
                total, n_sectors
            ),
        ));
    } else if total < n_sectors {
        findings.push(Finding::info(
            FindingKind::Usage,
            format!(
                "Remaining {} unallocated {}-byte sectors",
                n_sectors - total,
                geometry.sector_size
            ),
        ));
    }
    findings
}

fn looks_like_garbage(table: &MbrTable) -> bool {
    (0..NUM_PARTITIONS)
        .filter_map(|i| table.primary(i))
        .any(|e| e.boot_ind != 0 && e.boot_ind != ACTIVE_FLAG)
}

/// Begin/end CHS fields against the LBA fields
fn check_consistency(
    findings: &mut Vec<Finding>,
    geometry: &DeviceGeometry,
    index: usize,
    entry: &DosEntry,
    first: u64,
    last: u64,
) {
    let (heads, sectors) = (geometry.heads, geometry.sectors);
    if geometry.cylinders > 1024 {
        return;
    }

    let physical_begin = entry.start_chs();
    let logical_begin = ChsAddress::from_lba(first, heads, sectors);
    if physical_begin != logical_begin {
        findings.push(
            Finding::warning(
                FindingKind::Geometry,
                format!(
                    "Partition has different physical/logical beginnings: phys={}, logical={}",
                    physical_begin, logical_begin
                ),
            )
            .for_partition(index),
        );
    }

    let physical_end = entry.end_chs();
    let logical_end = ChsAddress::from_lba(last, heads, sectors);
    if physical_end != logical_end {
        findings.push(
            Finding::warning(
                FindingKind::Geometry,
                format!(
                    "Partition has different physical/logical endings: phys={}, logical={}",
                    physical_end, logical_end
                ),
            )
            .for_partition(index),
        );
    }

    if physical_end.head as u32 != heads.saturating_sub(1) || physical_end.sector as u32 != sectors {
        findings.push(
            Finding::info(FindingKind::Geometry, "Partition does not end on cylinder boundary")
                .for_partition(index),
        );
    }
}

/// End CHS fields against the declared geometry
fn check_end_chs(
    findings: &mut Vec<Finding>,
    geometry: &DeviceGeometry,
    index: usize,
    entry: &DosEntry,
    last: u64,
) {
    let end = entry.end_chs();
    let total = end.to_lba(geometry.heads, geometry.sectors);
    let mut error = |msg: String| {
        findings.push(Finding::error(FindingKind::Geometry, msg).for_partition(index));
    };

    if total == Some(0) {
        error("Partition contains sector 0".to_string());
    }
    if end.head as u32 >= geometry.heads {
        error(format!(
            "Partition: head {} greater than maximum {}",
            end.head,
            geometry.heads.saturating_sub(1)
        ));
    }
    if end.sector == 0 || end.sector as u32 > geometry.sectors {
        error(format!(
            "Partition: sector {} outside 1-{}",
            end.sector, geometry.sectors
        ));
    }
    if end.cylinder as u64 >= geometry.cylinders {
        error(format!(
            "Partition: cylinder {} greater than maximum {}",
            end.cylinder,
            geometry.cylinders.saturating_sub(1)
        ));
    }
    if geometry.cylinders <= 1024 && total != Some(last) {
        findings.push(
            Finding::warning(
                FindingKind::Geometry,
                format!(
                    "Partition: previous sectors {} disagrees with total {}",
                    last,
                    total.unwrap_or_default()
                ),
            )
            .for_partition(index),
        );
    }
}

/// Check a GPT label
///
/// When nothing is wrong the result holds only informational findings: the
/// header revision, entry usage and the free-space summary.
pub fn verify_gpt(table: &GptTable) -> Vec<Finding> {
    let mut findings = table.notes().to_vec();
    let primary = table.primary_header();
    let backup = table.backup_header();
    let geometry = table.geometry();
    let sector_size = geometry.sector_size as usize;
    let last_lba = geometry.last_lba();
    let crc = entries_crc(table.raw_entries());

    for (label, header) in [("primary", primary), ("backup", backup)] {
        check_header(&mut findings, label, header, sector_size, last_lba, crc);
    }
    if primary.my_lba != PRIMARY_HEADER_LBA {
        findings.push(Finding::error(
            FindingKind::Header,
            "MyLBA mismatch with real position at primary header",
        ));
    }
    if backup.my_lba != last_lba {
        findings.push(Finding::error(
            FindingKind::Header,
            "MyLBA mismatch with real position at backup header",
        ));
    }
    if primary.alternative_lba >= geometry.total_sectors {
        findings.push(Finding::error(
            FindingKind::Usage,
            "Disk is too small to hold all data",
        ));
    }
    for field in primary.mirror_mismatches(backup) {
        findings.push(Finding::error(
            FindingKind::Header,
            format!("Primary and backup header mismatch: {}", field),
        ));
    }

    let (fu, lu) = (table.first_usable_lba(), table.last_usable_lba());
    let used: Vec<_> = table
        .entries()
        .iter()
        .enumerate()
        .filter(|(_, e)| !e.is_unused())
        .collect();

    for (n, &(i, e)) in used.iter().enumerate() {
        for &(j, other) in &used[..n] {
            if e.overlaps(other) {
                findings.push(
                    Finding::error(
                        FindingKind::Overlap,
                        format!("Partitions {} and {} overlap", j + 1, i + 1),
                    )
                    .for_partition(i),
                );
            }
        }
        if e.first_lba > e.last_lba {
            findings.push(
                Finding::error(FindingKind::Bounds, "Partition ends before it starts")
                    .for_partition(i),
            );
        }
        if e.last_lba > last_lba {
            findings.push(
                Finding::error(FindingKind::Bounds, "Partition is too big for the disk")
                    .for_partition(i),
            );
        } else if e.first_lba < fu || e.last_lba > lu {
            findings.push(
                Finding::error(
                    FindingKind::Bounds,
                    format!("Partition is outside the usable range {}-{}", fu, lu),
                )
                .for_partition(i),
            );
        }
        if !table.alignment().lba_is_phy_aligned(e.first_lba) {
            findings.push(
                Finding::warning(
                    FindingKind::Alignment,
                    "Partition does not start on physical sector boundary",
                )
                .for_partition(i),
            );
        }
    }

    if !has_errors(&findings) {
        let free = table.free_space();
        findings.push(Finding::info(FindingKind::Other, "No errors detected"));
        findings.push(Finding::info(
            FindingKind::Header,
            format!("Header version: {}", primary.revision_str()),
        ));
        findings.push(Finding::info(
            FindingKind::Usage,
            format!(
                "Using {} out of {} partitions",
                table.partitions_used(),
                table.max_partitions()
            ),
        ));
        findings.push(Finding::info(
            FindingKind::Usage,
            format!(
                "A total of {} free sectors is available in {} segment(s) (the largest is {})",
                free.total,
                free.segments.len(),
                free.largest
            ),
        ));
    }
    findings
}

fn check_header(
    findings: &mut Vec<Finding>,
    label: &str,
    header: &GptHeader,
    sector_size: usize,
    last_lba: u64,
    entries_crc: u32,
) {
    if !header.crc_is_valid(sector_size) {
        findings.push(Finding::error(
            FindingKind::Checksum,
            format!("Invalid {} header CRC checksum", label),
        ));
    }
    if header.partition_entry_array_crc32 != entries_crc {
        findings.push(Finding::error(
            FindingKind::Checksum,
            format!("Invalid partition entry checksum in {} header", label),
        ));
    }
    if let Err(msg) = header.lba_sanity(last_lba) {
        findings.push(Finding::error(
            FindingKind::Header,
            format!("Invalid {} header LBA sanity checks: {}", label, msg),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::tests::gpt_image;
    use crate::gpt::{GptEntry, Guid};
    use crate::label::PartitionRequest;
    use crate::mbr::tests::{create_test_mbr, device, put_entry};
    use labelkit_core::{DiskContext, Severity};

    fn mbr(image: Vec<u8>) -> MbrTable {
        let mut dev = device(image);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        MbrTable::probe(&mut ctx).unwrap()
    }

    fn kinds(findings: &[Finding], severity: Severity) -> Vec<FindingKind> {
        findings
            .iter()
            .filter(|f| f.severity == severity)
            .map(|f| f.kind)
            .collect()
    }

    #[test]
    fn test_clean_mbr() {
        let findings = verify_mbr(&mbr(create_test_mbr()));
        assert!(!has_errors(&findings));
        assert!(kinds(&findings, Severity::Warning).is_empty());
        assert_eq!(kinds(&findings, Severity::Info), vec![FindingKind::Usage]);
    }

    #[test]
    fn test_mbr_overlap() {
        let mut image = create_test_mbr();
        put_entry(&mut image, 0, 2, 0x83, 8000, 1000);
        let findings = verify_mbr(&mbr(image));
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::Overlap && f.partition == Some(2)));
    }

    #[test]
    fn test_mbr_partition_inside_another() {
        let mut image = vec![0u8; 131072 * 512];
        put_entry(&mut image, 0, 0, 0x83, 10000, 1000);
        put_entry(&mut image, 0, 1, 0x83, 5000, 15001);
        let findings = verify_mbr(&mbr(image));
        assert!(findings.iter().any(|f| f.is_error()
            && f.kind == FindingKind::Overlap
            && f.partition == Some(1)
            && f.message == "Partition overlaps partition 1"));
    }

    #[test]
    fn test_mbr_garbage_and_order() {
        let mut image = create_test_mbr();
        put_entry(&mut image, 0, 2, 0x83, 50000, 1000);
        put_entry(&mut image, 0, 3, 0x83, 45000, 1000);
        image[0x1BE + 3 * 16] = 0x12;
        let findings = verify_mbr(&mbr(image));
        let warnings = kinds(&findings, Severity::Warning);
        assert!(warnings.contains(&FindingKind::Garbage));
        assert!(warnings.contains(&FindingKind::Order));
        assert!(!has_errors(&findings));
    }

    #[test]
    fn test_mbr_beyond_device_and_outside_extended() {
        let mut image = create_test_mbr();
        put_entry(&mut image, 0, 2, 0x83, 131000, 1000);
        // third logical runs past the extended partition end at 40959
        put_entry(&mut image, 30720, 0, 0x83, 2048, 9000);
        let findings = verify_mbr(&mbr(image));
        assert!(findings
            .iter()
            .any(|f| f.is_error() && f.kind == FindingKind::Bounds && f.partition == Some(2)));
        assert!(findings
            .iter()
            .any(|f| f.is_error() && f.kind == FindingKind::Bounds && f.partition == Some(6)));
    }

    #[test]
    fn test_mbr_compatible_chs_checks() {
        // eight full cylinders
        let mut dev = device(vec![0u8; 128520 * 512]);
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = MbrTable::create(&mut ctx).unwrap();
        table.set_compatible(true);
        table.add_partition(&PartitionRequest::default()).unwrap();
        assert_eq!(table.abs_start(0), Some(63));

        let findings = verify_mbr(&table);
        assert!(!has_errors(&findings));
        assert!(kinds(&findings, Severity::Warning).is_empty());

        table.primaries[0].end_chs = ChsAddress {
            cylinder: 7,
            head: 255,
            sector: 63,
        }
        .to_bytes();
        let findings = verify_mbr(&table);
        assert!(findings
            .iter()
            .any(|f| f.is_error() && f.kind == FindingKind::Geometry));
    }

    #[test]
    fn test_mbr_end_chs_checked_without_compat() {
        // eight full cylinders
        let mut image = vec![0u8; 128520 * 512];
        put_entry(&mut image, 0, 0, 0x83, 2048, 8192);
        let table = mbr(image.clone());
        assert!(!table.is_compatible());
        assert!(!has_errors(&verify_mbr(&table)));

        // end CHS sector number zeroed, cylinder bits kept
        image[0x1BE + 6] &= 0xC0;
        let findings = verify_mbr(&mbr(image));
        assert!(findings.iter().any(|f| f.is_error()
            && f.kind == FindingKind::Geometry
            && f.partition == Some(0)));
    }

    #[test]
    fn test_clean_gpt_reports_only_info() {
        let mut dev = gpt_image();
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let table = GptTable::probe(&mut ctx).unwrap();
        let findings = verify_gpt(&table);

        assert!(findings.iter().all(|f| f.severity == Severity::Info));
        assert_eq!(findings[0].message, "No errors detected");
        assert!(findings.iter().any(|f| f.message == "Using 2 out of 128 partitions"));
    }

    #[test]
    fn test_gpt_partition_errors() {
        let mut dev = gpt_image();
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = GptTable::probe(&mut ctx).unwrap();
        table.entries[3] = GptEntry::new(Guid::LINUX_SWAP, Guid::NIL, 60000, 70000);
        table.entries[4] = GptEntry::new(Guid::LINUX_SWAP, Guid::NIL, 9, 8);
        table.entries[5] = GptEntry::new(Guid::LINUX_SWAP, Guid::NIL, 204700, 300000);

        let findings = verify_gpt(&table);
        let errors: Vec<_> = findings.iter().filter(|f| f.is_error()).collect();
        assert!(errors
            .iter()
            .any(|f| f.kind == FindingKind::Overlap && f.partition == Some(3)));
        assert!(errors
            .iter()
            .any(|f| f.message == "Partition ends before it starts" && f.partition == Some(4)));
        assert!(errors
            .iter()
            .any(|f| f.message == "Partition is too big for the disk" && f.partition == Some(5)));
        assert!(!findings.iter().any(|f| f.message == "No errors detected"));
    }

    #[test]
    fn test_gpt_partition_inside_another() {
        let mut dev = gpt_image();
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let mut table = GptTable::probe(&mut ctx).unwrap();

        // inside partition 1, listed after it
        table.entries[3] = GptEntry::new(Guid::LINUX_SWAP, Guid::NIL, 4096, 8191);
        let findings = verify_gpt(&table);
        assert!(findings.iter().any(|f| f.is_error()
            && f.kind == FindingKind::Overlap
            && f.partition == Some(3)
            && f.message == "Partitions 1 and 4 overlap"));

        // inside partition 2, listed before it
        table.entries[3] = GptEntry::default();
        table.entries[0] = GptEntry::new(Guid::LINUX_SWAP, Guid::NIL, 60000, 61000);
        let findings = verify_gpt(&table);
        assert!(findings.iter().any(|f| f.is_error()
            && f.kind == FindingKind::Overlap
            && f.partition == Some(1)
            && f.message == "Partitions 1 and 2 overlap"));
    }

    #[test]
    fn test_gpt_recovery_note_is_a_warning() {
        let mut dev = gpt_image();
        dev.image_mut()[512 + 16] ^= 0xFF;
        let mut ctx = DiskContext::new(&mut dev).unwrap();
        let table = GptTable::probe(&mut ctx).unwrap();
        let findings = verify_gpt(&table);

        assert!(!has_errors(&findings));
        assert_eq!(
            kinds(&findings, Severity::Warning),
            vec![FindingKind::Redundancy]
        );
    }
}

//! Security validation constants and helpers
//!
//! Limits and checked arithmetic that keep hostile partition tables from
//! driving the engine into huge allocations, integer wraparound or endless
//! chain walks.

use crate::Error;

/// Smallest logical sector size we'll accept
pub const MIN_SECTOR_SIZE: u32 = 512;

/// Maximum sector size we'll accept (4KB - common for advanced format)
pub const MAX_SECTOR_SIZE: u32 = 4096;

/// Hard cap on DOS partitions (4 primaries plus logicals) walked from one chain
pub const MAX_DOS_PARTITIONS: usize = 60;

/// Maximum GPT entry-array size we'll read or build (16 MB)
pub const MAX_ENTRY_ARRAY_BYTES: u64 = 16 * 1024 * 1024;

/// Safely multiply two u64 values with overflow checking
///
/// # Security
/// Prevents integer overflow in size calculations
pub fn checked_multiply_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| Error::capacity_exceeded(format!("{}: multiplication overflow", context)))
}

/// Safely add two u64 values with overflow checking
pub fn checked_add_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| Error::capacity_exceeded(format!("{}: addition overflow", context)))
}

/// Safely convert u64 to usize with platform checking
///
/// # Security
/// Prevents truncation on 32-bit platforms
pub fn u64_to_usize(value: u64, context: &str) -> crate::Result<usize> {
    value.try_into().map_err(|_| {
        Error::capacity_exceeded(format!(
            "{}: value {} exceeds platform usize limit",
            context, value
        ))
    })
}

/// Convert an LBA or sector count to the 32-bit field width of a DOS entry
pub fn u64_to_u32(value: u64, context: &str) -> crate::Result<u32> {
    value.try_into().map_err(|_| {
        Error::out_of_range(format!(
            "{}: value {} does not fit in 32 bits",
            context, value
        ))
    })
}

/// Validate sector size is reasonable
pub fn validate_sector_size(sector_size: u32) -> crate::Result<()> {
    if !(MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&sector_size) {
        return Err(Error::invalid_argument(format!(
            "Invalid sector size: {} (must be {}-{})",
            sector_size, MIN_SECTOR_SIZE, MAX_SECTOR_SIZE
        )));
    }

    if !sector_size.is_power_of_two() {
        return Err(Error::invalid_argument(format!(
            "Sector size {} is not a power of 2",
            sector_size
        )));
    }

    Ok(())
}

/// Validate partition index is within bounds
pub fn validate_partition_index(index: usize, max: usize) -> crate::Result<()> {
    if index >= max {
        return Err(Error::invalid_argument(format!(
            "Partition index {} out of range (0-{})",
            index,
            max.saturating_sub(1)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_multiply_u64() {
        assert_eq!(checked_multiply_u64(1000, 512, "test").unwrap(), 512_000);
        assert!(matches!(
            checked_multiply_u64(u64::MAX, 2, "test"),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_validate_sector_size() {
        assert!(validate_sector_size(512).is_ok());
        assert!(validate_sector_size(4096).is_ok());

        assert!(validate_sector_size(0).is_err());
        assert!(validate_sector_size(256).is_err());
        assert!(validate_sector_size(8192).is_err());
        assert!(validate_sector_size(1000).is_err()); // Not power of 2
    }

    #[test]
    fn test_u64_to_u32() {
        assert_eq!(u64_to_u32(2048, "start").unwrap(), 2048);
        assert!(matches!(
            u64_to_u32(u32::MAX as u64 + 1, "start"),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_validate_partition_index() {
        assert!(validate_partition_index(3, 4).is_ok());
        assert!(validate_partition_index(4, 4).is_err());
        assert!(validate_partition_index(0, 0).is_err());
    }
}

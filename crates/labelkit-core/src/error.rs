//! Partition-table engine error types

use thiserror::Error;

/// The main error type for labelkit operations
#[derive(Error, Debug)]
pub enum Error {
    /// Read, write or seek failure on the underlying device
    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Signature, checksum or LBA sanity failure in an on-disk header
    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    /// No recognizable partition table on the device
    #[error("No partition table: {0}")]
    NoPartitionTable(String),

    /// Requested start/size lies outside usable bounds or inside a used region
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Table is full or an entry-count limit was exceeded
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// In-memory or on-disk structures disagree with each other
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    /// Caller passed an argument the table cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Format or feature recognized but not handled
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Write attempted on a read-only device
    #[error("Read-only device: {0}")]
    ReadOnly(String),
}

/// Result type alias for labelkit operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a corrupt header error
    pub fn corrupt_header(msg: impl Into<String>) -> Self {
        Error::CorruptHeader(msg.into())
    }

    /// Create a "no partition table" error
    pub fn no_partition_table(msg: impl Into<String>) -> Self {
        Error::NoPartitionTable(msg.into())
    }

    /// Create an out of range error
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Error::OutOfRange(msg.into())
    }

    /// Create a capacity exceeded error
    pub fn capacity_exceeded(msg: impl Into<String>) -> Self {
        Error::CapacityExceeded(msg.into())
    }

    /// Create an inconsistent state error
    pub fn inconsistent_state(msg: impl Into<String>) -> Self {
        Error::InconsistentState(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Create a read-only error
    pub fn read_only(msg: impl Into<String>) -> Self {
        Error::ReadOnly(msg.into())
    }

    /// Whether the caller may retry the operation with different input.
    ///
    /// These errors are raised before any mutation, so the table is unchanged.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::OutOfRange(_) | Error::CapacityExceeded(_) | Error::InvalidArgument(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::out_of_range("sector 10 already allocated");
        assert_eq!(err.to_string(), "Out of range: sector 10 already allocated");

        let err = Error::no_partition_table("no GPT found");
        assert_eq!(err.to_string(), "No partition table: no GPT found");
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(Error::out_of_range("x").is_recoverable());
        assert!(Error::capacity_exceeded("x").is_recoverable());
        assert!(Error::invalid_argument("x").is_recoverable());
        assert!(!Error::corrupt_header("x").is_recoverable());
        assert!(!Error::from(std::io::Error::other("boom")).is_recoverable());
    }
}

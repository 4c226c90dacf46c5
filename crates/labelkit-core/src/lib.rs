//! # labelkit core
//!
//! Core traits, types, and error handling for the labelkit partition-table engine.
//!
//! This crate provides the foundational abstractions shared by every table format:
//! - **BlockDevice**: sector I/O, geometry and entropy supplied by the caller
//! - **DiskContext**: the borrowed device plus effective geometry, passed to each operation
//! - **ZoneTable**: read-only enumeration of partitions (zones)
//! - **Finding**: one result of a verification pass
//!
//! ## Example
//!
//! ```rust,no_run
//! use labelkit_core::{BlockDevice, DiskContext, Result};
//!
//! fn show_geometry(device: &mut dyn BlockDevice) -> Result<()> {
//!     let ctx = DiskContext::new(device)?;
//!     println!("Device: {}", ctx.geometry());
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod endian;
pub mod error;
pub mod security;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use context::DiskContext;
pub use error::{Error, Result};
pub use security::*;
pub use traits::{BlockDevice, ReadWriteSeek, ZoneTable};
pub use types::{
    format_size, has_errors, DeviceGeometry, Finding, FindingKind, Severity, Zone,
    DEFAULT_HEADS, DEFAULT_SECTORS,
};

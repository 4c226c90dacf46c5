//! # labelkit zones
//!
//! Partition table engines for the labelkit project.
//!
//! This crate reads, edits, verifies and writes two label formats:
//! - **DOS**: Master Boot Record with the extended (EBR) chain of logical partitions
//! - **GPT**: GUID Partition Table with redundant headers and entry arrays
//!
//! Tables live in memory between [`DiskLabel::probe`] (or [`DiskLabel::create`])
//! and [`DiskLabel::write`]; nothing touches the device in between.
//!
//! ## Example
//!
//! ```rust,no_run
//! use labelkit_zones::{DiskLabel, PartitionRequest};
//! use labelkit_pipeline::{open_device, DeviceConfig};
//! use labelkit_core::{DiskContext, ZoneTable};
//! use std::path::Path;
//!
//! let mut device = open_device(Path::new("disk.img"), &DeviceConfig::writable()).unwrap();
//! let mut ctx = DiskContext::new(device.as_mut()).unwrap();
//! let mut label = DiskLabel::probe(&mut ctx).unwrap();
//!
//! label.add_partition(&mut ctx, &PartitionRequest::new().with_size(2048)).unwrap();
//! label.write(&mut ctx).unwrap();
//!
//! for zone in label.zones() {
//!     println!("  {}", zone);
//! }
//! ```

pub mod geometry;
pub mod gpt;
pub mod label;
pub mod mbr;
pub mod verify;

pub use geometry::{Alignment, ChsAddress};
pub use gpt::{GptTable, Guid};
pub use label::{DiskLabel, LabelKind, PartitionRequest, PartitionType};
pub use mbr::types::MbrPartitionType;
pub use mbr::MbrTable;
pub use verify::{verify_gpt, verify_mbr};

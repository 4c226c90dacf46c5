//! # labelkit pipeline
//!
//! Concrete sector devices for the labelkit partition-table engine.
//!
//! - **StreamDevice**: any `Read + Write + Seek` stream (image files, in-memory buffers)
//! - **MmapDevice**: memory-mapped, read-only access for listing and verification
//!
//! ## Example
//!
//! ```rust,no_run
//! use labelkit_pipeline::{open_device, DeviceConfig};
//! use labelkit_core::DiskContext;
//! use std::path::Path;
//!
//! let mut device = open_device(Path::new("disk.img"), &DeviceConfig::default()).unwrap();
//! let ctx = DiskContext::new(device.as_mut()).unwrap();
//! println!("{}", ctx.geometry());
//! ```

pub mod config;
pub mod mmap;
pub mod stream;

pub use config::DeviceConfig;
pub use mmap::MmapDevice;
pub use stream::StreamDevice;

use labelkit_core::{BlockDevice, Result};
use std::path::Path;

/// Open an image file as a block device according to `config`
///
/// Memory mapping is only used for read-only access; a writable config always
/// opens the file as a stream.
pub fn open_device(path: &Path, config: &DeviceConfig) -> Result<Box<dyn BlockDevice>> {
    if config.use_mmap && !config.writable {
        Ok(Box::new(MmapDevice::open(path, config)?))
    } else {
        if config.use_mmap {
            tracing::debug!("Ignoring mmap for writable device {}", path.display());
        }
        Ok(Box::new(StreamDevice::open(path, config)?))
    }
}

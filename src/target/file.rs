//! Disk image target
//!
//! A regular file standing in for a block device. The image is never created,
//! grown or truncated here: its length at open time is the device extent.
//!
//! # Example
//!
//! ```no_run
//! use diskbroker::target::{Target, OpenFlags};
//! use diskbroker::target::file::FileTarget;
//! use std::path::PathBuf;
//!
//! let mut target = FileTarget::new(PathBuf::from("/var/lib/db/disk0.img"), None);
//! target.open(OpenFlags::default()).unwrap();
//!
//! let blocks = target.size() / target.logical_block_size();
//! println!("{} blocks", blocks);
//!
//! target.close().unwrap();
//! ```

use super::{DeviceIdentity, OpenFlags, Target, SECTOR_SIZE};
use crate::Result;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Regular file used as a disk
pub struct FileTarget {
    /// Path to the image
    path: PathBuf,

    /// Open file (Some when open)
    file: Option<File>,

    /// Image length at open time
    actual_size: u64,

    /// Filesystem device and inode, for identity
    dev: u64,
    ino: u64,

    /// Logical block size; images have no hardware geometry
    block_size: u64,
}

impl FileTarget {
    /// Create a new, unopened image target
    pub fn new(path: PathBuf, block_size_override: Option<u64>) -> Self {
        Self {
            path,
            file: None,
            actual_size: 0,
            dev: 0,
            ino: 0,
            block_size: block_size_override.unwrap_or(SECTOR_SIZE),
        }
    }
}

impl Target for FileTarget {
    fn open(&mut self, flags: OpenFlags) -> Result<()> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);

        let mut custom_flags = 0;
        if flags.direct {
            custom_flags |= libc::O_DIRECT;
        }
        if flags.sync {
            custom_flags |= libc::O_SYNC;
        }
        if custom_flags != 0 {
            options.custom_flags(custom_flags);
        }

        let file = options
            .open(&self.path)
            .with_context(|| format!("Failed to open disk image: {}", self.path.display()))?;
        let metadata = file
            .metadata()
            .with_context(|| format!("Failed to get image metadata: {}", self.path.display()))?;

        self.actual_size = metadata.len();
        self.dev = metadata.dev();
        self.ino = metadata.ino();
        self.file = Some(file);

        if self.actual_size % self.block_size != 0 {
            tracing::warn!(
                path = %self.path.display(),
                size = self.actual_size,
                block_size = self.block_size,
                "image size is not a whole number of blocks, trailing bytes are unreachable"
            );
        }

        Ok(())
    }

    fn fd(&self) -> Result<RawFd> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| anyhow::anyhow!("Image not open: {}", self.path.display()))
    }

    fn size(&self) -> u64 {
        self.actual_size
    }

    fn logical_block_size(&self) -> u64 {
        self.block_size
    }

    fn max_transfer_bytes(&self) -> Option<u64> {
        None
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::File {
            dev: self.dev,
            ino: self.ino,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}

//! Device targets
//!
//! A target is one openable device the broker can register as a Disk Entry: a
//! raw block device, or a regular file standing in as a disk image. Opening a
//! target probes its geometry (size, logical block size, per-request transfer
//! limit) so the Submission Engine can validate transfers without touching the
//! device again.
//!
//! # Identity
//!
//! Two paths naming the same physical device (e.g. `/dev/sdb` and a udev
//! symlink) must converge on one Disk Entry. [`identify`] resolves a path to a
//! [`DeviceIdentity`] with a single `stat`, cheap enough to run before the
//! registry lock is taken.

use crate::config::DeviceConfig;
use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::fmt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::RawFd;
use std::path::Path;

/// Broker addressing unit: descriptors count blocks of this many bytes
pub const SECTOR_SIZE: u64 = 512;

/// Target trait for devices the broker can open
///
/// # Lifecycle
///
/// 1. Create target instance (via `new()` on concrete type)
/// 2. Call `open()` with flags; geometry is probed here
/// 3. Use `fd()` for transfers
/// 4. Call `close()` (or drop) when the last user is gone
pub trait Target: Send + Sync {
    /// Open the device and probe its geometry
    fn open(&mut self, flags: OpenFlags) -> Result<()>;

    /// Descriptor for transfers
    ///
    /// # Errors
    ///
    /// Fails if the target is not open.
    fn fd(&self) -> Result<RawFd>;

    /// Device size in bytes
    fn size(&self) -> u64;

    /// Logical block size: the minimum transfer granularity and alignment
    fn logical_block_size(&self) -> u64;

    /// Largest single transfer the device accepts, if it reports one
    fn max_transfer_bytes(&self) -> Option<u64>;

    /// Stable identity used for deduplication
    fn identity(&self) -> DeviceIdentity;

    /// Path the target was opened from
    fn path(&self) -> &Path;

    /// Close the device
    fn close(&mut self) -> Result<()>;
}

/// Open flags for targets
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Use direct IO (O_DIRECT) - bypass page cache
    pub direct: bool,

    /// Use synchronous IO (O_SYNC) - writes are durable on completion
    pub sync: bool,
}

impl From<&DeviceConfig> for OpenFlags {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            direct: config.direct,
            sync: false,
        }
    }
}

/// Stable device identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceIdentity {
    /// Block device, identified by its device number
    Block { rdev: u64 },
    /// Regular file disk image, identified by filesystem and inode
    File { dev: u64, ino: u64 },
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdentity::Block { rdev } => {
                write!(f, "block {}:{}", libc::major(*rdev as libc::dev_t), libc::minor(*rdev as libc::dev_t))
            }
            DeviceIdentity::File { dev, ino } => write!(f, "image {}/{}", dev, ino),
        }
    }
}

/// Kind of device found at a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Block,
    Image,
}

/// Resolve `path` to its identity and kind
///
/// # Errors
///
/// Fails with the underlying `io::Error` if the path cannot be stat'ed, or if
/// it is neither a block device nor (when allowed) a regular file.
pub fn identify(path: &Path, config: &DeviceConfig) -> Result<(DeviceIdentity, DeviceKind)> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat device: {}", path.display()))?;
    let file_type = metadata.file_type();

    if file_type.is_block_device() {
        Ok((DeviceIdentity::Block { rdev: metadata.rdev() }, DeviceKind::Block))
    } else if file_type.is_file() && config.allow_regular_files {
        Ok((
            DeviceIdentity::File {
                dev: metadata.dev(),
                ino: metadata.ino(),
            },
            DeviceKind::Image,
        ))
    } else {
        Err(anyhow::Error::new(std::io::Error::from_raw_os_error(libc::ENODEV))
            .context(format!("Not a usable block device: {}", path.display())))
    }
}

/// Open and probe the device at `path`
///
/// Block devices become a [`block::BlockTarget`], regular files a
/// [`file::FileTarget`] when `allow_regular_files` is set.
pub fn open_target(path: &Path, config: &DeviceConfig) -> Result<Box<dyn Target>> {
    let (_, kind) = identify(path, config)?;
    open_kind(path, kind, config)
}

/// Open `path` as an already identified kind of device
pub fn open_kind(path: &Path, kind: DeviceKind, config: &DeviceConfig) -> Result<Box<dyn Target>> {
    let flags = OpenFlags::from(config);
    let mut target: Box<dyn Target> = match kind {
        DeviceKind::Block => Box::new(block::BlockTarget::new(path.to_path_buf(), config.block_size_override)),
        DeviceKind::Image => Box::new(file::FileTarget::new(path.to_path_buf(), config.block_size_override)),
    };
    target.open(flags)?;
    Ok(target)
}

pub mod block;
pub mod file;
pub mod label;

pub use label::DiskLabel;

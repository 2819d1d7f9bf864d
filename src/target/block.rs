//! Block device target
//!
//! Raw block devices (e.g. /dev/sdb, /dev/nvme0n1). Geometry comes from the
//! block-layer ioctls:
//!
//! - `BLKGETSIZE64`: device size in bytes
//! - `BLKSSZGET`: logical block size
//! - `BLKSECTGET`: maximum sectors per request (the transfer limit)
//!
//! # Requirements
//!
//! - Root or disk-group permissions
//! - Buffers aligned to the logical block size when opened with O_DIRECT

use super::{DeviceIdentity, OpenFlags, Target, SECTOR_SIZE};
use crate::Result;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

const BLKGETSIZE64: libc::c_ulong = 0x80081272;
const BLKSSZGET: libc::c_ulong = 0x1268;
const BLKSECTGET: libc::c_ulong = 0x1267;

/// Block device target
pub struct BlockTarget {
    path: PathBuf,
    file: Option<File>,
    rdev: u64,
    device_size: u64,
    logical_block_size: u64,
    max_sectors: Option<u64>,
    block_size_override: Option<u64>,
}

impl BlockTarget {
    /// Create a new, unopened block device target
    pub fn new(path: PathBuf, block_size_override: Option<u64>) -> Self {
        Self {
            path,
            file: None,
            rdev: 0,
            device_size: 0,
            logical_block_size: SECTOR_SIZE,
            max_sectors: None,
            block_size_override,
        }
    }

    fn ioctl_u64(&self, fd: RawFd, request: libc::c_ulong, name: &str) -> Result<u64> {
        let mut value: u64 = 0;
        // SAFETY: request writes a u64 into `value`
        let result = unsafe { libc::ioctl(fd, request as _, &mut value) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("ioctl({}) failed: path={}", name, self.path.display()));
        }
        Ok(value)
    }

    fn ioctl_int(&self, fd: RawFd, request: libc::c_ulong, name: &str) -> Result<libc::c_int> {
        let mut value: libc::c_int = 0;
        // SAFETY: request writes a c_int into `value`
        let result = unsafe { libc::ioctl(fd, request as _, &mut value) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("ioctl({}) failed: path={}", name, self.path.display()));
        }
        Ok(value)
    }

    fn ioctl_ushort(&self, fd: RawFd, request: libc::c_ulong, name: &str) -> Result<libc::c_ushort> {
        let mut value: libc::c_ushort = 0;
        // SAFETY: request writes a c_ushort into `value`
        let result = unsafe { libc::ioctl(fd, request as _, &mut value) };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!("ioctl({}) failed: path={}", name, self.path.display()));
        }
        Ok(value)
    }

    fn probe(&mut self, fd: RawFd) -> Result<()> {
        self.device_size = self.ioctl_u64(fd, BLKGETSIZE64, "BLKGETSIZE64")?;

        let probed = self.ioctl_int(fd, BLKSSZGET, "BLKSSZGET")?;
        let probed = u64::try_from(probed).unwrap_or(SECTOR_SIZE).max(SECTOR_SIZE);
        self.logical_block_size = match self.block_size_override {
            Some(size) if size >= probed => size,
            Some(size) => {
                tracing::warn!(
                    path = %self.path.display(),
                    requested = size,
                    device = probed,
                    "block size override below device block size, using device value"
                );
                probed
            }
            None => probed,
        };

        // Not every driver implements BLKSECTGET; absence just means no device limit
        self.max_sectors = match self.ioctl_ushort(fd, BLKSECTGET, "BLKSECTGET") {
            Ok(0) => None,
            Ok(sectors) => Some(u64::from(sectors)),
            Err(err) => {
                tracing::debug!(path = %self.path.display(), error = %err, "no transfer limit reported");
                None
            }
        };

        Ok(())
    }
}

impl Target for BlockTarget {
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
            .with_context(|| format!("Failed to open block device: {}", self.path.display()))?;
        let metadata = file
            .metadata()
            .with_context(|| format!("Failed to stat block device: {}", self.path.display()))?;
        self.rdev = metadata.rdev();

        self.probe(file.as_raw_fd())?;
        self.file = Some(file);
        Ok(())
    }

    fn fd(&self) -> Result<RawFd> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| anyhow::anyhow!("Device not open: {}", self.path.display()))
    }

    fn size(&self) -> u64 {
        self.device_size
    }

    fn logical_block_size(&self) -> u64 {
        self.logical_block_size
    }

    fn max_transfer_bytes(&self) -> Option<u64> {
        self.max_sectors.map(|sectors| sectors * SECTOR_SIZE)
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::Block { rdev: self.rdev }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}

//! On-disk label
//!
//! A labelled disk carries an 8-byte magic and a 24-byte identifier at byte
//! offset 32 of the device. Clearing a label replaces the magic with a distinct
//! cleared marker so a wiped disk can be told apart from one that was never
//! labelled. The broker itself never reads the label; it is produced and
//! consumed by the `label`/`query`/`clear` commands.
//!
//! ```text
//!   0        32         40                        64       512
//!   | ...... | magic(8) | identifier(24, padded)  | ...... |
//! ```

use super::{open_target, Target, SECTOR_SIZE};
use crate::config::DeviceConfig;
use crate::util::buffer::{AlignedBuffer, DEFAULT_ALIGNMENT};
use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Byte offset of the label within the device
pub const LABEL_OFFSET: usize = 32;

/// Magic of a labelled disk
pub const LABEL_MAGIC: &[u8; 8] = b"DBRKDISK";

/// Magic of an explicitly cleared disk
pub const CLEARED_MAGIC: &[u8; 8] = b"DBRKCLR\0";

/// Identifier field width
pub const LABEL_NAME_LEN: usize = 24;

/// Label state of a disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "name", rename_all = "lowercase")]
pub enum DiskLabel {
    Labeled(String),
    Cleared,
    Unlabeled,
}

impl fmt::Display for DiskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskLabel::Labeled(name) => write!(f, "labeled {}", name),
            DiskLabel::Cleared => write!(f, "cleared"),
            DiskLabel::Unlabeled => write!(f, "unlabeled"),
        }
    }
}

/// Upper-case and check a label name
///
/// Names are 1 to 24 characters of `A-Z`, `0-9` and `_`.
pub fn normalize_name(name: &str) -> Result<String> {
    let upper = name.to_ascii_uppercase();
    if upper.is_empty() {
        anyhow::bail!("Label name must not be empty");
    }
    if upper.len() > LABEL_NAME_LEN {
        anyhow::bail!(
            "Label name '{}' is {} bytes, maximum is {}",
            name,
            upper.len(),
            LABEL_NAME_LEN
        );
    }
    if let Some(bad) = upper.chars().find(|c| !(c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_')) {
        anyhow::bail!("Label name '{}' contains invalid character '{}'", name, bad);
    }
    Ok(upper)
}

/// Decode the label area of a device's first block
pub fn decode(block: &[u8]) -> DiskLabel {
    if block.len() < LABEL_OFFSET + 8 + LABEL_NAME_LEN {
        return DiskLabel::Unlabeled;
    }
    let magic = &block[LABEL_OFFSET..LABEL_OFFSET + 8];
    if magic == LABEL_MAGIC {
        let raw = &block[LABEL_OFFSET + 8..LABEL_OFFSET + 8 + LABEL_NAME_LEN];
        let name = String::from_utf8_lossy(raw)
            .trim_end_matches(|c| c == ' ' || c == '\0')
            .to_string();
        DiskLabel::Labeled(name)
    } else if magic == CLEARED_MAGIC {
        DiskLabel::Cleared
    } else {
        DiskLabel::Unlabeled
    }
}

fn encode(block: &mut [u8], label: &DiskLabel) {
    let area = &mut block[LABEL_OFFSET..LABEL_OFFSET + 8 + LABEL_NAME_LEN];
    match label {
        DiskLabel::Labeled(name) => {
            area[..8].copy_from_slice(LABEL_MAGIC);
            area[8..].fill(b' ');
            area[8..8 + name.len()].copy_from_slice(name.as_bytes());
        }
        DiskLabel::Cleared => {
            area[..8].copy_from_slice(CLEARED_MAGIC);
            area[8..].fill(0);
        }
        DiskLabel::Unlabeled => area.fill(0),
    }
}

fn first_block_len(target: &dyn Target) -> usize {
    target.logical_block_size().max(SECTOR_SIZE) as usize
}

fn read_first_block(target: &dyn Target) -> Result<AlignedBuffer> {
    let fd = target.fd()?;
    let mut buffer = AlignedBuffer::new(first_block_len(target), DEFAULT_ALIGNMENT)?;

    // SAFETY: buffer is valid for its full length
    let n = unsafe { libc::pread(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len(), 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error())
            .context(format!("Failed to read label block: {}", target.path().display()));
    }
    if (n as usize) < LABEL_OFFSET + 8 + LABEL_NAME_LEN {
        anyhow::bail!("Device too small to hold a label: {}", target.path().display());
    }
    Ok(buffer)
}

fn write_first_block(target: &dyn Target, buffer: &AlignedBuffer) -> Result<()> {
    let fd = target.fd()?;

    // SAFETY: buffer is valid for its full length
    let n = unsafe { libc::pwrite(fd, buffer.as_ptr() as *const libc::c_void, buffer.len(), 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error())
            .context(format!("Failed to write label block: {}", target.path().display()));
    }
    if n as usize != buffer.len() {
        anyhow::bail!(
            "Short label write on {}: {} of {} bytes",
            target.path().display(),
            n,
            buffer.len()
        );
    }
    // SAFETY: fd is open for the lifetime of target
    if unsafe { libc::fsync(fd) } < 0 {
        return Err(std::io::Error::last_os_error())
            .context(format!("Failed to sync label: {}", target.path().display()));
    }
    Ok(())
}

/// Read the label of the device at `path`
pub fn read_label(path: &Path, config: &DeviceConfig) -> Result<DiskLabel> {
    let target = open_target(path, config)?;
    let block = read_first_block(target.as_ref())?;
    Ok(decode(block.as_slice()))
}

/// Label the device at `path` with `name`
///
/// A disk already carrying a different label is only relabelled with `force`.
/// Returns the normalized name written.
pub fn write_label(path: &Path, name: &str, force: bool, config: &DeviceConfig) -> Result<String> {
    let name = normalize_name(name)?;
    let target = open_target(path, config)?;
    let mut block = read_first_block(target.as_ref())?;

    if let DiskLabel::Labeled(existing) = decode(block.as_slice()) {
        if existing != name && !force {
            anyhow::bail!(
                "{} is already labeled {}; use --force to relabel",
                path.display(),
                existing
            );
        }
    }

    encode(block.as_mut_slice(), &DiskLabel::Labeled(name.clone()));
    write_first_block(target.as_ref(), &block)?;
    tracing::info!(device = %path.display(), label = %name, "disk labeled");
    Ok(name)
}

/// Mark the device at `path` as cleared
pub fn clear_label(path: &Path, config: &DeviceConfig) -> Result<()> {
    let target = open_target(path, config)?;
    let mut block = read_first_block(target.as_ref())?;
    encode(block.as_mut_slice(), &DiskLabel::Cleared);
    write_first_block(target.as_ref(), &block)?;
    tracing::info!(device = %path.display(), "disk label cleared");
    Ok(())
}

//! Disk registry
//!
//! Maps a device identity to the one shared [`DiskEntry`] for it. The registry
//! lock covers lookup and insertion only: devices are probed before it is
//! taken, and in-flight drains on close happen after it is dropped.
//!
//! An entry is in the registry exactly while it is live. The last close
//! removes it and marks it dead in one step under both locks, so a new open of
//! the same device after that point builds a fresh entry.
//!
//! Lock order: registry, then entry.

use super::request::{ContextId, DiskHandle, SECTOR_SIZE};
use crate::config::DeviceConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::target::{self, DeviceIdentity, Target};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Open handle: one context's reference to a disk
pub(crate) type OpenHandle = (ContextId, DiskHandle);

#[derive(Debug)]
struct DiskState {
    live: bool,
    inflight: usize,
    handles: HashSet<OpenHandle>,
}

/// Shared record for one opened device
pub struct DiskEntry {
    id: u64,
    identity: DeviceIdentity,
    path: PathBuf,
    fd: RawFd,
    block_size: u64,
    size_bytes: u64,
    max_transfer: u64,
    target: Mutex<Option<Box<dyn Target>>>,
    state: Mutex<DiskState>,
    drained: Condvar,
}

impl fmt::Debug for DiskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskEntry")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("max_transfer", &self.max_transfer)
            .finish()
    }
}

/// Introspection view of a disk entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    pub id: u64,
    pub path: PathBuf,
    pub identity: DeviceIdentity,
    pub block_size: u64,
    pub size_bytes: u64,
    /// Device extent in units of the broker's 512-byte addressing block
    pub sectors: u64,
    pub max_transfer_bytes: u64,
    pub live: bool,
    pub in_flight: usize,
    pub open_count: usize,
}

impl DiskEntry {
    fn new(
        id: u64,
        identity: DeviceIdentity,
        target: Box<dyn Target>,
        transfer_cap: u64,
        owner: OpenHandle,
    ) -> anyhow::Result<Self> {
        let block_size = target.logical_block_size().max(SECTOR_SIZE);
        let device_limit = target.max_transfer_bytes().unwrap_or(u64::MAX);
        let max_transfer = (device_limit.min(transfer_cap) / block_size * block_size).max(block_size);

        Ok(Self {
            id,
            identity,
            path: target.path().to_path_buf(),
            fd: target.fd()?,
            block_size,
            size_bytes: target.size(),
            max_transfer,
            target: Mutex::new(Some(target)),
            state: Mutex::new(DiskState {
                live: true,
                inflight: 0,
                handles: HashSet::from([owner]),
            }),
            drained: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn max_transfer(&self) -> u64 {
        self.max_transfer
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().live
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().inflight
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn info(&self) -> DiskInfo {
        let state = self.state.lock();
        DiskInfo {
            id: self.id,
            path: self.path.clone(),
            identity: self.identity,
            block_size: self.block_size,
            size_bytes: self.size_bytes,
            sectors: self.size_bytes / SECTOR_SIZE,
            max_transfer_bytes: self.max_transfer,
            live: state.live,
            in_flight: state.inflight,
            open_count: state.handles.len(),
        }
    }

    /// Count a new transfer against a live disk
    ///
    /// False once the disk is no longer live; the count is then untouched.
    pub(crate) fn begin_io(&self) -> bool {
        let mut state = self.state.lock();
        if !state.live {
            return false;
        }
        state.inflight += 1;
        true
    }

    /// Count a transfer as finished
    pub(crate) fn finish_io(&self) {
        let mut state = self.state.lock();
        match state.inflight.checked_sub(1) {
            Some(n) => state.inflight = n,
            None => tracing::error!(disk = self.id, "in-flight count underflow"),
        }
        if state.inflight == 0 {
            self.drained.notify_all();
        }
    }

    /// Block until no transfer is in flight
    ///
    /// With `drive`, the caller polls the transport itself between checks;
    /// otherwise completions are expected from the completion thread.
    pub(crate) fn wait_drained(&self, poll: Duration, drive: Option<&dyn Fn() -> usize>) {
        let mut state = self.state.lock();
        while state.inflight > 0 {
            if let Some(drive) = drive {
                let progressed = MutexGuard::unlocked(&mut state, drive);
                if progressed > 0 || state.inflight == 0 {
                    continue;
                }
            }
            self.drained.wait_for(&mut state, poll);
        }
    }

    fn teardown(&self) {
        if let Some(mut target) = self.target.lock().take() {
            if let Err(err) = target.close() {
                tracing::warn!(disk = self.id, error = %err, "device close failed");
            }
        }
    }
}

/// Process-wide device registry
pub(crate) struct Registry {
    entries: Mutex<HashMap<DeviceIdentity, Arc<DiskEntry>>>,
    next_id: AtomicU64,
    device: DeviceConfig,
    transfer_cap: u64,
}

impl Registry {
    pub fn new(device: DeviceConfig, transfer_cap: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            device,
            transfer_cap,
        }
    }

    /// Open `path` for `owner`, sharing the entry if the device is already open
    ///
    /// Returns the entry and whether this call created it.
    pub fn open(&self, path: &Path, owner: OpenHandle) -> BrokerResult<(Arc<DiskEntry>, bool)> {
        let device = path.display().to_string();
        let (identity, kind) = target::identify(path, &self.device)
            .map_err(|err| BrokerError::from_device_error(&device, &err))?;

        if let Some(entry) = self.attach_existing(&identity, owner) {
            return Ok((entry, false));
        }

        // Probe without the registry lock; another opener may win meanwhile
        let target = target::open_kind(path, kind, &self.device)
            .map_err(|err| BrokerError::from_device_error(&device, &err))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fresh = DiskEntry::new(id, identity, target, self.transfer_cap, owner)
            .map_err(|err| BrokerError::from_device_error(&device, &err))?;

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&identity).cloned() {
            existing.state.lock().handles.insert(owner);
            drop(entries);
            tracing::debug!(device = %device, disk = existing.id, "open race lost, sharing existing entry");
            fresh.teardown();
            return Ok((existing, false));
        }

        let entry = Arc::new(fresh);
        entries.insert(identity, entry.clone());
        drop(entries);

        tracing::info!(
            device = %device,
            disk = entry.id,
            identity = %identity,
            block_size = entry.block_size,
            max_transfer = entry.max_transfer,
            size = entry.size_bytes,
            "disk entry created"
        );
        Ok((entry, true))
    }

    fn attach_existing(&self, identity: &DeviceIdentity, owner: OpenHandle) -> Option<Arc<DiskEntry>> {
        let entries = self.entries.lock();
        let entry = entries.get(identity)?;
        entry.state.lock().handles.insert(owner);
        Some(entry.clone())
    }

    /// Drop `owner`'s reference to `entry`
    ///
    /// Returns true when this was the last reference: the entry is then dead,
    /// out of the registry, and must be drained and torn down by the caller.
    pub fn release(&self, entry: &Arc<DiskEntry>, owner: OpenHandle) -> BrokerResult<bool> {
        let mut entries = self.entries.lock();
        let mut state = entry.state.lock();

        if !state.handles.remove(&owner) {
            return Err(BrokerError::InvalidHandle);
        }
        if !state.handles.is_empty() {
            return Ok(false);
        }

        state.live = false;
        if entries.get(&entry.identity).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            entries.remove(&entry.identity);
        }
        Ok(true)
    }

    /// Close the device of a dead, drained entry
    pub fn teardown(&self, entry: &DiskEntry) {
        entry.teardown();
        tracing::info!(disk = entry.id, device = %entry.path.display(), "disk entry torn down");
    }

    pub fn disks(&self) -> Vec<DiskInfo> {
        let entries: Vec<Arc<DiskEntry>> = self.entries.lock().values().cloned().collect();
        let mut infos: Vec<DiskInfo> = entries.iter().map(|e| e.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

//! Client context
//!
//! Per-thread broker state: open disk handles, in-flight request keys and
//! completed-but-unreaped request keys, with a condition variable that is
//! signalled whenever any of them changes.
//!
//! Every resource the broker hands out belongs to a context, and detaching is
//! the one path that reclaims them: it closes every handle, waits for the
//! context's in-flight requests and frees whatever is left unreaped. A
//! [`ContextGuard`] detaches on drop, so a thread that unwinds still gives
//! everything back.
//!
//! Lock order: a request slot may be held while taking a context lock, never
//! the reverse.

use super::registry::{DiskEntry, DiskInfo};
use super::request::{ContextId, DiskHandle, RequestKey};
use super::Shared;
use crate::error::{BrokerError, BrokerResult};
use crate::util::time::Deadline;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Upper bound on one condvar sleep while the completion thread delivers
const RECHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub(crate) struct ContextState {
    pub detached: bool,
    pub handles: HashMap<DiskHandle, Arc<DiskEntry>>,
    pub inflight: HashSet<RequestKey>,
    /// Reaped from the back: most recently completed first
    pub completed: Vec<RequestKey>,
}

impl ContextState {
    /// True if `key` names a request this context still owns
    pub fn owns(&self, key: &RequestKey) -> bool {
        self.inflight.contains(key) || self.completed.contains(key)
    }

    /// Take `key` off the completed list
    pub fn take_completed(&mut self, key: &RequestKey) -> bool {
        match self.completed.iter().position(|k| k == key) {
            Some(pos) => {
                self.completed.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Per-thread broker context
pub struct ClientContext {
    pub(super) id: ContextId,
    pub(super) me: Weak<ClientContext>,
    pub(super) shared: Arc<Shared>,
    pub(super) state: Mutex<ContextState>,
    pub(super) changed: Condvar,
    interrupted: AtomicBool,
    next_handle: AtomicU64,
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext").field("id", &self.id).finish()
    }
}

impl ClientContext {
    pub(crate) fn new(id: ContextId, shared: Arc<Shared>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            shared,
            state: Mutex::new(ContextState::default()),
            changed: Condvar::new(),
            interrupted: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Open the device at `path`
    ///
    /// Opens of the same device from any context share one disk entry.
    #[tracing::instrument(level = "debug", skip(self), fields(ctx = %self.id))]
    pub fn open(&self, path: &Path) -> BrokerResult<DiskHandle> {
        if self.state.lock().detached {
            return Err(BrokerError::Shutdown);
        }

        let handle = DiskHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let owner = (self.id, handle);
        let (entry, created) = self.shared.registry.open(path, owner)?;
        if created {
            self.shared.stats.disks_opened.incr();
        }

        let mut state = self.state.lock();
        if state.detached {
            drop(state);
            self.shared.release_disk(&entry, owner)?;
            return Err(BrokerError::Shutdown);
        }
        state.handles.insert(handle, entry.clone());
        drop(state);

        tracing::debug!(handle = %handle, disk = entry.id(), open_count = entry.open_count(), "disk opened");
        Ok(handle)
    }

    /// Close a handle
    ///
    /// Closing the last handle to a disk blocks until every transfer in flight
    /// against it has finished.
    #[tracing::instrument(level = "debug", skip(self), fields(ctx = %self.id))]
    pub fn close(&self, handle: DiskHandle) -> BrokerResult<()> {
        let entry = self
            .state
            .lock()
            .handles
            .remove(&handle)
            .ok_or(BrokerError::InvalidHandle)?;
        self.shared.release_disk(&entry, (self.id, handle))
    }

    pub fn disk_info(&self, handle: DiskHandle) -> BrokerResult<DiskInfo> {
        self.state
            .lock()
            .handles
            .get(&handle)
            .map(|entry| entry.info())
            .ok_or(BrokerError::InvalidHandle)
    }

    pub fn handles(&self) -> Vec<DiskHandle> {
        let mut handles: Vec<_> = self.state.lock().handles.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Requests submitted and not yet completed
    pub fn in_flight(&self) -> usize {
        self.state.lock().inflight.len()
    }

    /// Requests completed and not yet reaped
    pub fn completed(&self) -> usize {
        self.state.lock().completed.len()
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    /// Handle for waking this context's blocking calls from elsewhere
    pub fn interrupter(&self) -> Interrupter {
        Interrupter { ctx: self.me.clone() }
    }

    pub(super) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Move `key` from in-flight to completed and wake waiters
    pub(crate) fn mark_completed(&self, key: RequestKey) {
        let mut state = self.state.lock();
        if state.inflight.remove(&key) {
            state.completed.push(key);
        } else {
            tracing::warn!(ctx = %self.id, key = %key, "completion for request not in flight");
        }
        self.changed.notify_all();
    }

    /// Sleep until something changes or `deadline` passes
    ///
    /// Drives the transport itself when no completion thread is delivering.
    pub(super) fn block(&self, state: &mut MutexGuard<'_, ContextState>, deadline: &Deadline) {
        let poll = self.shared.transport.poll_interval();
        if self.shared.must_drive() {
            let progressed = MutexGuard::unlocked(state, || self.shared.drive());
            if progressed > 0 {
                return;
            }
            let wait = deadline.remaining().map_or(poll, |left| left.min(poll));
            self.changed.wait_for(state, wait);
        } else {
            let wait = deadline
                .remaining()
                .map_or(RECHECK_INTERVAL, |left| left.min(RECHECK_INTERVAL));
            self.changed.wait_for(state, wait);
        }
    }

    /// Release everything this context holds
    ///
    /// Idempotent; only the first call does the work.
    #[tracing::instrument(level = "debug", skip(self), fields(ctx = %self.id))]
    pub(crate) fn detach(&self) {
        let handles = {
            let mut state = self.state.lock();
            if state.detached {
                return;
            }
            state.detached = true;
            std::mem::take(&mut state.handles)
        };

        for (handle, entry) in handles {
            if let Err(err) = self.shared.release_disk(&entry, (self.id, handle)) {
                tracing::warn!(handle = %handle, error = %err, "release on detach failed");
            }
        }

        {
            let mut state = self.state.lock();
            let deadline = Deadline::never();
            while !state.inflight.is_empty() {
                self.block(&mut state, &deadline);
            }
        }

        let leftovers = std::mem::take(&mut self.state.lock().completed);
        let reclaimed = leftovers
            .into_iter()
            .filter_map(|key| self.shared.reap(key))
            .count();

        self.shared.forget_context(self.id);
        self.changed.notify_all();
        if reclaimed > 0 {
            tracing::info!(ctx = %self.id, reclaimed, "context detached, unreaped requests freed");
        } else {
            tracing::debug!(ctx = %self.id, "context detached");
        }
    }
}

/// Wakes a context's blocking calls
///
/// Cloneable and `Send`, for signal handlers, watchdogs or other threads.
#[derive(Debug, Clone)]
pub struct Interrupter {
    ctx: Weak<ClientContext>,
}

impl Interrupter {
    /// Interrupt the context's current or next interruptible wait
    ///
    /// Returns false if the context is gone.
    pub fn interrupt(&self) -> bool {
        let Some(ctx) = self.ctx.upgrade() else {
            return false;
        };
        ctx.interrupted.store(true, Ordering::Release);
        let _state = ctx.state.lock();
        ctx.changed.notify_all();
        true
    }
}

/// Attached context; detaches on drop
#[derive(Debug)]
pub struct ContextGuard {
    ctx: Arc<ClientContext>,
}

impl ContextGuard {
    pub(crate) fn new(ctx: Arc<ClientContext>) -> Self {
        Self { ctx }
    }

    /// Detach now, blocking until the context's transfers have finished
    pub fn detach(self) {
        self.ctx.detach();
    }
}

impl Deref for ContextGuard {
    type Target = ClientContext;

    fn deref(&self) -> &ClientContext {
        &self.ctx
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.ctx.detach();
    }
}

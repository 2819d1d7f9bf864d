//! Asynchronous disk I/O broker
//!
//! One [`Broker`] per process owns the disk registry, the request pool and the
//! transport. Threads [`attach`](Broker::attach) to get a client context, open
//! disks through it, submit transfers and reap their completions.
//!
//! # Architecture
//!
//! ```text
//!  ClientContext ──open/close──► Registry ──► DiskEntry (shared per device)
//!       │
//!       ├─submit──► RequestPool ──► Transport ──► IOEngine
//!       │                                            │
//!       └◄─wait/drain── completed list ◄── complete ◄┘ (completion thread)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use diskbroker::broker::{Broker, IoDescriptor, Timeout};
//! use diskbroker::config::BrokerConfig;
//! use diskbroker::util::buffer::AlignedBuffer;
//! use std::path::Path;
//!
//! let broker = Broker::start(BrokerConfig::default())?;
//! let ctx = broker.attach()?;
//! let disk = ctx.open(Path::new("/dev/sdb"))?;
//!
//! let mut desc = IoDescriptor::read(disk, 0, AlignedBuffer::new(4096, 4096)?);
//! let key = ctx.submit(&mut desc)?;
//! let outcome = ctx.wait_for_set(&[key], Timeout::Infinite)?;
//! assert!(outcome.completions[0].is_success());
//!
//! ctx.close(disk)?;
//! ctx.detach();
//! broker.stop()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod context;
pub(crate) mod pool;
pub mod registry;
pub mod request;
pub mod submit;
pub(crate) mod transport;
pub mod wait;

pub use context::{ClientContext, ContextGuard, Interrupter};
pub use registry::{DiskEntry, DiskInfo};
pub use request::{
    Completion, ContextId, DiskHandle, IoDescriptor, IoResultFlags, RequestKey, StatusFlags, Timeout,
    MAX_PRIORITY, SECTOR_SIZE,
};
pub use wait::{IoOutcome, WaitOutcome};

use crate::config::validator::validate_config;
use crate::config::BrokerConfig;
use crate::engine::{create_engine, EngineCapabilities, IOCompletion, IOEngine};
use crate::error::{BrokerError, BrokerResult};
use crate::stats::{BrokerStats, StatsSnapshot};
use crate::Result;
use anyhow::Context;
use parking_lot::Mutex;
use pool::RequestPool;
use registry::{OpenHandle, Registry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use transport::Transport;

/// Name of the background completion thread
pub const COMPLETION_THREAD_NAME: &str = "diskbroker-completion";

/// State shared by the broker, its contexts and the completion thread
pub(crate) struct Shared {
    pub config: BrokerConfig,
    pub pool: RequestPool,
    pub transport: Transport,
    pub registry: Registry,
    pub stats: BrokerStats,
    contexts: Mutex<HashMap<ContextId, Arc<ClientContext>>>,
    next_context: AtomicU64,
    running: AtomicBool,
    completion_thread: bool,
}

impl Shared {
    /// True when blocked callers must poll the transport themselves
    pub fn must_drive(&self) -> bool {
        !self.completion_thread || !self.running.load(Ordering::Acquire)
    }

    /// Run deferred transfers, then collect; returns completions applied
    pub fn drive(&self) -> usize {
        self.transport.run_deferred();
        self.collect()
    }

    /// Apply completions the engine already has, without running transfers
    pub fn collect(&self) -> usize {
        let completions = self.transport.reap();
        let count = completions.len();
        for completion in completions {
            self.complete(completion);
        }
        count
    }

    /// Apply one transport completion to its request
    fn complete(&self, completion: IOCompletion) {
        let key = RequestKey(completion.user_data);
        let os_error = completion.os_error();

        let Some(mut request) = self.pool.get(key) else {
            tracing::warn!(key = %key, "completion for unknown request ignored");
            return;
        };
        if !request.status.contains(StatusFlags::SUBMITTED) || request.status.is_terminal() {
            tracing::warn!(key = %key, status = ?request.status, "duplicate completion ignored");
            return;
        }

        request.elapsed_us = request.submitted_at.elapsed_micros();
        let success = match completion.result {
            Ok(bytes) if bytes >= request.length => {
                request.transferred_bytes = request.length as u64;
                request.error = 0;
                request.set(StatusFlags::COMPLETED);
                true
            }
            Ok(bytes) => {
                request.transferred_bytes = bytes as u64;
                request.error = libc::EIO;
                request.set(StatusFlags::ERROR | StatusFlags::PARTIAL);
                self.stats.partial.incr();
                tracing::debug!(key = %key, bytes, requested = request.length, "partial transfer");
                false
            }
            Err(err) => {
                request.transferred_bytes = 0;
                request.error = os_error.filter(|errno| *errno > 0).unwrap_or(libc::EIO);
                request.set(StatusFlags::ERROR);
                tracing::debug!(key = %key, error = %err, "transfer failed");
                false
            }
        };
        self.stats.record_completion(request.elapsed_us, success);

        // Visible to the owner before a close draining the disk can return
        match request.context.upgrade() {
            Some(ctx) => ctx.mark_completed(key),
            None => tracing::warn!(key = %key, owner = %request.owner, "owner of completed request is gone"),
        }
        if let Some(disk) = request.disk.take() {
            disk.finish_io();
        }
        tracing::trace!(key = %key, status = ?request.status, elapsed_us = request.elapsed_us, "request completed");
    }

    /// Free a terminal request and hand back its outcome
    pub fn reap(&self, key: RequestKey) -> Option<Completion> {
        let request = self.pool.remove(key)?;
        self.stats.reaped.incr();
        let completion = request.into_completion();
        tracing::trace!(key = %key, status = ?completion.status, "request reaped");
        Some(completion)
    }

    /// Drop a context's reference to a disk, tearing it down if it was the last
    pub fn release_disk(&self, entry: &Arc<DiskEntry>, owner: OpenHandle) -> BrokerResult<()> {
        if !self.registry.release(entry, owner)? {
            return Ok(());
        }

        tracing::debug!(disk = entry.id(), in_flight = entry.in_flight(), "last close, draining");
        let poll = self.transport.poll_interval();
        if self.must_drive() {
            let drive = || self.drive();
            entry.wait_drained(poll, Some(&drive as &dyn Fn() -> usize));
        } else {
            entry.wait_drained(poll, None);
        }
        self.registry.teardown(entry);
        self.stats.disks_closed.incr();
        Ok(())
    }

    fn attach(self: &Arc<Self>) -> BrokerResult<Arc<ClientContext>> {
        let mut contexts = self.contexts.lock();
        if !self.running.load(Ordering::Acquire) {
            return Err(BrokerError::Shutdown);
        }
        let id = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        let ctx = ClientContext::new(id, self.clone());
        contexts.insert(id, ctx.clone());
        Ok(ctx)
    }

    /// Refuse further attaches and hand back every context still attached
    fn stop_attaching(&self) -> Vec<Arc<ClientContext>> {
        let mut contexts = self.contexts.lock();
        self.running.store(false, Ordering::Release);
        contexts.drain().map(|(_, ctx)| ctx).collect()
    }

    pub fn forget_context(&self, id: ContextId) {
        self.contexts.lock().remove(&id);
    }
}

fn run_completion_thread(shared: Arc<Shared>) {
    tracing::debug!("completion thread started");
    while shared.running.load(Ordering::Acquire) {
        if shared.drive() == 0 {
            shared.transport.idle_wait();
        }
    }
    tracing::debug!("completion thread stopped");
}

/// The broker service
pub struct Broker {
    shared: Arc<Shared>,
    driver: Option<JoinHandle<()>>,
    stopped: bool,
}

impl Broker {
    /// Start a broker with the engine named by `transport.engine`
    pub fn start(config: BrokerConfig) -> Result<Self> {
        validate_config(&config)?;
        let engine = create_engine(config.transport.engine)?;
        Self::with_engine(config, engine)
    }

    /// Start a broker on a caller-supplied engine
    pub fn with_engine(config: BrokerConfig, mut engine: Box<dyn IOEngine>) -> Result<Self> {
        validate_config(&config)?;
        engine
            .init(&config.transport.engine_config())
            .with_context(|| format!("Failed to initialize {} engine", config.transport.engine))?;

        let completion_thread = config.transport.completion_thread;
        let shared = Arc::new(Shared {
            pool: RequestPool::new(config.pool.max_requests),
            transport: Transport::new(engine, config.transport.queue_depth, config.transport.poll_interval()),
            registry: Registry::new(config.device.clone(), config.transport.max_transfer_bytes),
            stats: BrokerStats::new()?,
            contexts: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(1),
            running: AtomicBool::new(true),
            completion_thread,
            config,
        });

        let driver = if completion_thread {
            let thread_shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(COMPLETION_THREAD_NAME.to_string())
                .spawn(move || run_completion_thread(thread_shared))
                .context("Failed to spawn completion thread")?;
            Some(handle)
        } else {
            None
        };

        tracing::info!(
            engine = %shared.config.transport.engine,
            queue_depth = shared.config.transport.queue_depth,
            pool = shared.config.pool.max_requests,
            completion_thread,
            "broker started"
        );

        Ok(Self {
            shared,
            driver,
            stopped: false,
        })
    }

    /// Attach a new client context
    pub fn attach(&self) -> BrokerResult<ContextGuard> {
        let ctx = self.shared.attach()?;
        tracing::debug!(ctx = %ctx.id(), "context attached");
        Ok(ContextGuard::new(ctx))
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Live disk entries
    pub fn disks(&self) -> Vec<DiskInfo> {
        self.shared.registry.disks()
    }

    pub fn attached_contexts(&self) -> usize {
        self.shared.contexts.lock().len()
    }

    /// Pool slots currently holding a request
    pub fn requests_in_use(&self) -> usize {
        self.shared.pool.in_use()
    }

    pub fn pool_capacity(&self) -> usize {
        self.shared.pool.capacity()
    }

    pub fn engine_capabilities(&self) -> EngineCapabilities {
        self.shared.transport.capabilities().clone()
    }

    /// Transfers handed to the engine and not yet completed
    pub fn outstanding_transfers(&self) -> usize {
        self.shared.transport.outstanding()
    }

    /// Stop the broker
    ///
    /// Contexts still attached are detached first (waiting for their
    /// transfers), then the completion thread is joined and the engine
    /// released.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        // Blocked detaches below drive the transport themselves from here on
        for ctx in self.shared.stop_attaching() {
            tracing::warn!(ctx = %ctx.id(), "reclaiming context still attached at shutdown");
            ctx.detach();
        }

        self.shared.transport.kick();
        if let Some(handle) = self.driver.take() {
            if handle.join().is_err() {
                tracing::error!("completion thread panicked");
            }
        }

        self.shared
            .transport
            .shutdown()
            .context("Failed to release IO engine")?;

        let stats = self.shared.stats.snapshot();
        tracing::info!(
            submitted = stats.submitted,
            completed = stats.completed,
            errored = stats.errored,
            busy = stats.busy,
            rejected = stats.rejected,
            "broker stopped"
        );
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(error = %err, "broker shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests;

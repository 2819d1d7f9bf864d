//! Transport
//!
//! Wraps the IO engine for concurrent use by the broker. Submitters reserve
//! queue space before building a request, so a full queue is reported as
//! `BUSY` without ever touching the engine. Completions are collected by
//! whoever drives the transport: the completion thread, or a waiter when the
//! broker runs without one.
//!
//! Transfers an engine defers (the sync engine) run through its
//! [`TransferRunner`] with the engine lock released, so a submitter only ever
//! waits for another thread's queue push or completion poll.

use crate::engine::{EngineCapabilities, IOCompletion, IOEngine, IOOperation, TransferRunner};
use crate::Result;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct Transport {
    engine: Mutex<Box<dyn IOEngine>>,
    runner: Option<Arc<dyn TransferRunner>>,
    capabilities: EngineCapabilities,
    /// Transfers reserved or accepted and not yet completed
    outstanding: AtomicUsize,
    queue_depth: usize,
    poll_interval: Duration,
    kick_tx: Sender<()>,
    kick_rx: Receiver<()>,
}

impl Transport {
    pub fn new(engine: Box<dyn IOEngine>, queue_depth: usize, poll_interval: Duration) -> Self {
        let capabilities = engine.capabilities();
        let runner = engine.runner();
        let (kick_tx, kick_rx) = bounded(1);
        Self {
            engine: Mutex::new(engine),
            runner,
            capabilities,
            outstanding: AtomicUsize::new(0),
            queue_depth,
            poll_interval,
            kick_tx,
            kick_rx,
        }
    }

    /// Claim one queue slot; false when the queue is full
    pub fn try_reserve(&self) -> bool {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.queue_depth).then_some(n + 1)
            })
            .is_ok()
    }

    /// Give back a slot claimed by `try_reserve` that was never submitted
    pub fn unreserve(&self) {
        self.release(1);
    }

    fn release(&self, n: usize) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| Some(cur.saturating_sub(n)));
    }

    /// Hand a reserved transfer to the engine and wake the driver
    pub fn submit(&self, op: IOOperation) -> Result<()> {
        self.engine.lock().submit(op)?;
        self.kick();
        Ok(())
    }

    /// Execute transfers the engine deferred; blocks on the device
    pub fn run_deferred(&self) -> usize {
        self.runner.as_ref().map_or(0, |runner| runner.run_queued())
    }

    /// Collect finished transfers without blocking or running any
    pub fn reap(&self) -> Vec<IOCompletion> {
        let completions = match self.engine.lock().poll_completions() {
            Ok(completions) => completions,
            Err(err) => {
                tracing::error!(error = %err, "engine poll failed");
                Vec::new()
            }
        };
        if !completions.is_empty() {
            self.release(completions.len());
        }
        completions
    }

    /// Wake the driver if it is idle
    pub fn kick(&self) {
        let _ = self.kick_tx.try_send(());
    }

    /// Park the driver until kicked or one poll interval passes
    pub fn idle_wait(&self) {
        match self.kick_rx.recv_timeout(self.poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(self.poll_interval),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn capabilities(&self) -> &EngineCapabilities {
        &self.capabilities
    }

    /// Let outstanding transfers finish and release engine resources
    pub fn shutdown(&self) -> Result<()> {
        self.engine.lock().cleanup()
    }
}

//! Synchronous IO engine
//!
//! Uses blocking pread/pwrite, but defers them: `submit` only queues the
//! operation, and the transfer runs when the driving thread calls the engine's
//! [`TransferRunner`] (normally the broker's completion thread). The runner
//! works outside the engine, so neither `submit` nor `poll_completions` ever
//! waits on the device.
//!
//! # Features
//!
//! - Positioned IO without changing the file offset
//! - Short transfers are retried until complete; EOF yields a partial result
//! - Always available as a fallback

use super::{
    EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation, OperationType, TransferRunner,
};
use crate::Result;
use anyhow::Context;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

/// Read `length` bytes at `offset`, retrying short reads until EOF
fn do_read(fd: i32, buffer: *mut u8, length: usize, offset: u64) -> Result<usize> {
    let mut total_read = 0;
    let mut current_offset = offset;

    while total_read < length {
        let remaining = length - total_read;
        // SAFETY: the broker keeps `buffer` valid for `length` bytes until completion
        let buf_ptr = unsafe { buffer.add(total_read) };

        let result = unsafe {
            libc::pread(
                fd,
                buf_ptr as *mut libc::c_void,
                remaining,
                current_offset as libc::off_t,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context(format!(
                "pread failed: fd={}, offset={}, length={}",
                fd, current_offset, remaining
            ));
        }

        if result == 0 {
            break;
        }

        total_read += result as usize;
        current_offset += result as u64;
    }

    Ok(total_read)
}

/// Write `length` bytes at `offset`, retrying short writes
fn do_write(fd: i32, buffer: *const u8, length: usize, offset: u64) -> Result<usize> {
    let mut total_written = 0;
    let mut current_offset = offset;

    while total_written < length {
        let remaining = length - total_written;
        // SAFETY: the broker keeps `buffer` valid for `length` bytes until completion
        let buf_ptr = unsafe { buffer.add(total_written) };

        let result = unsafe {
            libc::pwrite(
                fd,
                buf_ptr as *const libc::c_void,
                remaining,
                current_offset as libc::off_t,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context(format!(
                "pwrite failed: fd={}, offset={}, length={}",
                fd, current_offset, remaining
            ));
        }

        if result == 0 {
            break;
        }

        total_written += result as usize;
        current_offset += result as u64;
    }

    Ok(total_written)
}

fn execute(op: &IOOperation) -> Result<usize> {
    match op.op_type {
        OperationType::NoOp => Ok(0),
        OperationType::Read => do_read(op.target_fd, op.buffer, op.length, op.offset),
        OperationType::Write => do_write(op.target_fd, op.buffer as *const u8, op.length, op.offset),
    }
}

/// Accepted operations and their results, shared with the runner
struct SyncQueue {
    queued_tx: Sender<IOOperation>,
    queued_rx: Receiver<IOOperation>,
    finished: Mutex<Vec<IOCompletion>>,
}

impl TransferRunner for SyncQueue {
    fn run_queued(&self) -> usize {
        let mut ran = 0;
        while let Ok(op) = self.queued_rx.try_recv() {
            let result = execute(&op);
            self.finished.lock().push(IOCompletion {
                user_data: op.user_data,
                result,
                op_type: op.op_type,
            });
            ran += 1;
        }
        ran
    }
}

/// Deferred pread/pwrite engine
pub struct SyncEngine {
    /// Configuration (queue depth bounds accepted operations)
    config: EngineConfig,

    queue: Arc<SyncQueue>,

    /// Accepted operations whose completion has not been polled
    outstanding: usize,
}

impl SyncEngine {
    /// Create a new synchronous IO engine
    pub fn new() -> Self {
        let (queued_tx, queued_rx) = unbounded();
        Self {
            config: EngineConfig::default(),
            queue: Arc::new(SyncQueue {
                queued_tx,
                queued_rx,
                finished: Mutex::new(Vec::new()),
            }),
            outstanding: 0,
        }
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEngine for SyncEngine {
    fn init(&mut self, config: &EngineConfig) -> Result<()> {
        if config.queue_depth == 0 {
            anyhow::bail!("sync engine queue_depth must be at least 1");
        }
        self.config = config.clone();
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        if self.outstanding >= self.config.queue_depth {
            anyhow::bail!(
                "sync engine queue full ({} operations outstanding)",
                self.outstanding
            );
        }
        self.queue
            .queued_tx
            .send(op)
            .map_err(|_| anyhow::anyhow!("sync engine queue closed"))?;
        self.outstanding += 1;
        Ok(())
    }

    fn poll_completions(&mut self) -> Result<Vec<IOCompletion>> {
        let completions = std::mem::take(&mut *self.queue.finished.lock());
        self.outstanding = self.outstanding.saturating_sub(completions.len());
        Ok(completions)
    }

    fn pending(&self) -> usize {
        self.outstanding
    }

    fn cleanup(&mut self) -> Result<()> {
        // Let queued transfers finish so no buffer is abandoned mid-flight
        self.queue.run_queued();
        let _ = self.poll_completions()?;
        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            async_io: false,
            priorities: false,
            max_queue_depth: self.config.queue_depth,
        }
    }

    fn runner(&self) -> Option<Arc<dyn TransferRunner>> {
        Some(self.queue.clone())
    }
}

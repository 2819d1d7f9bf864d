//! Mock IO engine for testing
//!
//! Simulates transfers without touching any device. All control state is shared
//! between clones, so a test keeps one clone to steer the engine while the
//! broker owns another.
//!
//! # Features
//!
//! - Hold/release gate: while held, accepted operations stay in flight
//! - Failure injection with a chosen errno
//! - Partial transfer simulation
//! - Synchronous submit rejection
//! - Records every submitted operation for verification
//!
//! # Example
//!
//! ```
//! use diskbroker::engine::{IOEngine, EngineConfig, IOOperation, OperationType};
//! use diskbroker::engine::mock::MockEngine;
//!
//! let mut engine = MockEngine::new();
//! engine.init(&EngineConfig::default()).unwrap();
//!
//! let control = engine.clone();
//! control.hold();
//!
//! engine.submit(IOOperation {
//!     op_type: OperationType::Read,
//!     target_fd: 1,
//!     offset: 0,
//!     buffer: std::ptr::null_mut(),
//!     length: 4096,
//!     priority: 0,
//!     user_data: 42,
//! }).unwrap();
//!
//! assert!(engine.poll_completions().unwrap().is_empty());
//! control.release();
//! let completions = engine.poll_completions().unwrap();
//! assert_eq!(completions[0].user_data, 42);
//! ```

use super::{EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation, OperationType};
use crate::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Record of a submitted operation
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub op_type: OperationType,
    pub target_fd: i32,
    pub offset: u64,
    pub length: usize,
    pub priority: u8,
    pub user_data: u64,
}

#[derive(Debug)]
struct MockState {
    queue_depth: usize,
    pending: VecDeque<IOOperation>,
    held: bool,
    fail_errno: Option<i32>,
    bytes_per_op: usize,
    reject_submissions: bool,
    submitted: Vec<OperationRecord>,
}

/// Mock IO engine
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    capabilities: EngineCapabilities,
}

impl MockEngine {
    /// Create a mock engine that completes everything successfully on the next poll
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                queue_depth: EngineConfig::default().queue_depth,
                pending: VecDeque::new(),
                held: false,
                fail_errno: None,
                bytes_per_op: 0,
                reject_submissions: false,
                submitted: Vec::new(),
            })),
            capabilities: EngineCapabilities {
                async_io: true,
                priorities: true,
                max_queue_depth: EngineConfig::default().queue_depth,
            },
        }
    }

    /// Keep accepted operations in flight until `release` is called
    pub fn hold(&self) {
        self.state.lock().held = true;
    }

    /// Let held operations complete on the next poll
    pub fn release(&self) {
        self.state.lock().held = false;
    }

    /// Complete every operation with `errno` (None restores success)
    pub fn set_fail_errno(&self, errno: Option<i32>) {
        self.state.lock().fail_errno = errno;
    }

    /// Report this many bytes per operation (0 = the requested length)
    pub fn set_bytes_per_op(&self, bytes: usize) {
        self.state.lock().bytes_per_op = bytes;
    }

    /// Make `submit` fail synchronously
    pub fn set_reject_submissions(&self, reject: bool) {
        self.state.lock().reject_submissions = reject;
    }

    /// Number of operations accepted and not yet completed
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Copy of every operation submitted so far
    pub fn submitted_operations(&self) -> Vec<OperationRecord> {
        self.state.lock().submitted.clone()
    }

    /// Number of operations submitted so far
    pub fn submitted_count(&self) -> usize {
        self.state.lock().submitted.len()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEngine for MockEngine {
    fn init(&mut self, config: &EngineConfig) -> Result<()> {
        self.state.lock().queue_depth = config.queue_depth;
        self.capabilities.max_queue_depth = config.queue_depth;
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let mut state = self.state.lock();

        if state.reject_submissions {
            return Err(anyhow::Error::new(std::io::Error::from_raw_os_error(libc::EIO))
                .context("mock engine rejected submission"));
        }
        if state.pending.len() >= state.queue_depth {
            anyhow::bail!("mock engine queue full");
        }

        state.submitted.push(OperationRecord {
            op_type: op.op_type,
            target_fd: op.target_fd,
            offset: op.offset,
            length: op.length,
            priority: op.priority,
            user_data: op.user_data,
        });
        state.pending.push_back(op);
        Ok(())
    }

    fn poll_completions(&mut self) -> Result<Vec<IOCompletion>> {
        let mut state = self.state.lock();
        if state.held {
            return Ok(Vec::new());
        }

        let fail_errno = state.fail_errno;
        let bytes_per_op = state.bytes_per_op;
        let completions = state
            .pending
            .drain(..)
            .map(|op| {
                let result = match fail_errno {
                    Some(errno) => Err(anyhow::Error::new(std::io::Error::from_raw_os_error(errno))
                        .context(format!("mock {} failed", op.op_type))),
                    None if op.op_type == OperationType::NoOp => Ok(0),
                    None if bytes_per_op == 0 => Ok(op.length),
                    None => Ok(bytes_per_op.min(op.length)),
                };
                IOCompletion {
                    user_data: op.user_data,
                    result,
                    op_type: op.op_type,
                }
            })
            .collect();

        Ok(completions)
    }

    fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn cleanup(&mut self) -> Result<()> {
        self.state.lock().pending.clear();
        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities.clone()
    }
}

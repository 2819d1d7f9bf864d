//! IO engine abstraction
//!
//! An IO engine is the transfer layer underneath the broker: it accepts raw
//! positioned reads and writes against an open device descriptor and later
//! reports their completions. The broker never performs I/O itself; it validates,
//! accounts and tracks requests, and hands accepted transfers to an engine.
//!
//! # Engine Types
//!
//! - **Synchronous**: pread/pwrite executed on the broker's completion thread
//!   (baseline, always available)
//! - **libaio**: Linux native async IO
//! - **mock**: in-process engine with controllable completion timing, for tests
//!
//! # Contract
//!
//! - `submit` never blocks on the transfer itself. It may fail synchronously,
//!   in which case no completion will ever be reported for that operation.
//! - `poll_completions` never blocks. It returns whatever has finished since the
//!   last call; the caller decides how to pace polling.
//! - Every accepted operation produces exactly one `IOCompletion` carrying the
//!   operation's `user_data`.
//! - An engine that cannot hand transfers to the kernel exposes a
//!   [`TransferRunner`]. The thread driving the broker runs it without holding
//!   the engine, so submitters never wait behind device IO.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// IO engine trait for all transfer backends
///
/// Engines are `Send` but not `Sync`; the broker's transport serializes access
/// to a single engine instance behind a lock.
pub trait IOEngine: Send {
    /// Initialize the engine with the given configuration
    ///
    /// Called once before any operation is submitted.
    fn init(&mut self, config: &EngineConfig) -> Result<()>;

    /// Submit an IO operation
    ///
    /// # Safety contract
    ///
    /// The caller guarantees that `op.buffer` points to at least `op.length`
    /// bytes that stay valid until the matching completion has been returned by
    /// `poll_completions`, and that `op.target_fd` stays open until then.
    fn submit(&mut self, op: IOOperation) -> Result<()>;

    /// Collect completed operations without blocking
    fn poll_completions(&mut self) -> Result<Vec<IOCompletion>>;

    /// Number of accepted operations whose completion has not been returned yet
    fn pending(&self) -> usize;

    /// Release engine resources
    ///
    /// Outstanding operations are allowed to finish first; their completions
    /// are discarded.
    fn cleanup(&mut self) -> Result<()>;

    /// Describe what this engine supports
    fn capabilities(&self) -> EngineCapabilities;

    /// Runner for transfers this engine leaves to the driving thread
    ///
    /// Taken once after `init`. Engines whose transfers progress on their own
    /// return None.
    fn runner(&self) -> Option<Arc<dyn TransferRunner>> {
        None
    }
}

/// Executes transfers an engine accepted but did not start
pub trait TransferRunner: Send + Sync {
    /// Run every queued transfer; returns how many ran
    ///
    /// Blocks on the device. Finished transfers show up in the engine's next
    /// `poll_completions`.
    fn run_queued(&self) -> usize;
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of outstanding operations
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { queue_depth: 128 }
    }
}

/// Which engine backs the broker's transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    /// Deferred pread/pwrite
    #[default]
    Sync,
    /// Linux native AIO
    Libaio,
    /// In-process mock (tests and dry runs)
    Mock,
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineType::Sync => write!(f, "sync"),
            EngineType::Libaio => write!(f, "libaio"),
            EngineType::Mock => write!(f, "mock"),
        }
    }
}

/// Build an engine instance for `engine_type`
pub fn create_engine(engine_type: EngineType) -> Result<Box<dyn IOEngine>> {
    match engine_type {
        EngineType::Sync => Ok(Box::new(sync::SyncEngine::new())),
        EngineType::Mock => Ok(Box::new(mock::MockEngine::new())),
        #[cfg(target_os = "linux")]
        EngineType::Libaio => Ok(Box::new(libaio::LibaioEngine::new())),
        #[cfg(not(target_os = "linux"))]
        EngineType::Libaio => anyhow::bail!("libaio engine is only available on Linux"),
    }
}

/// IO operation handed to an engine
#[derive(Debug)]
pub struct IOOperation {
    /// Type of operation
    pub op_type: OperationType,

    /// Descriptor of the open device
    pub target_fd: RawFd,

    /// Byte offset on the device
    pub offset: u64,

    /// Transfer buffer (ignored for `NoOp`)
    pub buffer: *mut u8,

    /// Transfer length in bytes (zero for `NoOp`)
    pub length: usize,

    /// Scheduling priority, 0 (highest) to 7
    pub priority: u8,

    /// Value echoed back in the completion
    pub user_data: u64,
}

// Safety: the pointer is only dereferenced by the engine while the broker keeps
// the owning buffer alive (see the `submit` contract)
unsafe impl Send for IOOperation {}

/// Operation code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Flows through the transport without touching the device
    NoOp,
    /// Read from the device into the buffer
    Read,
    /// Write the buffer to the device
    Write,
}

impl OperationType {
    /// Raw wire code of this operation
    pub fn code(self) -> u16 {
        match self {
            OperationType::NoOp => 0,
            OperationType::Read => 1,
            OperationType::Write => 2,
        }
    }

    /// True for operations that move data
    pub fn transfers_data(self) -> bool {
        match self {
            OperationType::NoOp => false,
            OperationType::Read | OperationType::Write => true,
        }
    }
}

impl TryFrom<u16> for OperationType {
    type Error = u16;

    fn try_from(code: u16) -> std::result::Result<Self, u16> {
        match code {
            0 => Ok(OperationType::NoOp),
            1 => Ok(OperationType::Read),
            2 => Ok(OperationType::Write),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::NoOp => write!(f, "noop"),
            OperationType::Read => write!(f, "read"),
            OperationType::Write => write!(f, "write"),
        }
    }
}

/// Completed IO operation
#[derive(Debug)]
pub struct IOCompletion {
    /// `user_data` from the original operation
    pub user_data: u64,

    /// Bytes transferred, or the failure
    ///
    /// A byte count smaller than the requested length is a partial transfer.
    pub result: Result<usize>,

    /// Type of operation that completed
    pub op_type: OperationType,
}

impl IOCompletion {
    /// OS error code carried by a failed completion, if any
    pub fn os_error(&self) -> Option<i32> {
        self.result.as_ref().err().and_then(|err| {
            err.chain()
                .find_map(|cause| cause.downcast_ref::<std::io::Error>())
                .and_then(|io_err| io_err.raw_os_error())
        })
    }
}

/// Engine capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Transfers overlap with each other
    pub async_io: bool,

    /// Priority hints reach the device queue
    pub priorities: bool,

    /// Maximum number of outstanding operations
    pub max_queue_depth: usize,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            async_io: false,
            priorities: false,
            max_queue_depth: 1,
        }
    }
}

pub mod mock;
pub mod sync;

#[cfg(target_os = "linux")]
pub mod libaio;

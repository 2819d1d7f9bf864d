//! Request types
//!
//! A caller describes a transfer with an [`IoDescriptor`], the broker tracks it
//! as a request in the pool while it is in flight, and hands the outcome
//! back as a [`Completion`] when it is reaped.
//!
//! # Status bits
//!
//! ```text
//! submit ──► SUBMITTED ──► COMPLETED | ERROR [| PARTIAL] ──► FREE
//!    │             └─ CANCELLED (any time before FREE, advisory)
//!    ├─► BUSY | ERROR | FREE              (pool or queue exhausted)
//!    └─► ERROR | LOCAL_ERROR | FREE       (validation, dead disk)
//! ```
//!
//! Bits are only ever added.

use super::context::ClientContext;
use super::registry::DiskEntry;
use crate::engine::OperationType;
use crate::util::buffer::AlignedBuffer;
use crate::util::time::{Deadline, Timestamp};
use bitflags::bitflags;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

pub use crate::target::SECTOR_SIZE;

/// Highest (least urgent) priority class
pub const MAX_PRIORITY: u8 = 7;

bitflags! {
    /// Per-request status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusFlags: u32 {
        const BUSY = 0x1;
        const SUBMITTED = 0x2;
        const COMPLETED = 0x4;
        const FREE = 0x8;
        const CANCELLED = 0x10;
        const ERROR = 0x20;
        /// Reserved for integrity warnings
        const WARN = 0x40;
        const PARTIAL = 0x80;
        /// Reserved for disk-key mismatches
        const BADKEY = 0x100;
        /// Reserved for data integrity failures
        const BAD_DATA = 0x200;
        /// Failure detected by the broker, not the device
        const LOCAL_ERROR = 0x400;
    }
}

impl StatusFlags {
    /// True once the request can no longer change outcome
    pub fn is_terminal(self) -> bool {
        self.intersects(StatusFlags::COMPLETED | StatusFlags::ERROR | StatusFlags::BUSY)
    }
}

impl Serialize for StatusFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

bitflags! {
    /// Why a multiplexed call returned
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IoResultFlags: u32 {
        const INTERRUPTED = 0x1;
        const TIMED_OUT = 0x2;
        const WAIT_SATISFIED = 0x4;
        const DRAIN_FULL = 0x8;
        /// Nothing in flight and nothing left to reap
        const IDLE = 0x10;
    }
}

/// Correlation key naming a request
///
/// Low 32 bits are the pool slot, high 32 bits the slot generation, so a key
/// for a reaped request never resolves to the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestKey(pub u64);

impl RequestKey {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        RequestKey((u64::from(generation) << 32) | u64::from(index))
    }

    pub(crate) fn index(self) -> u32 {
        self.0 as u32
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Per-context open disk handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DiskHandle(pub u64);

impl fmt::Display for DiskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "disk#{}", self.0)
    }
}

/// Client context id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// How long a blocking call may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Return with whatever is already true
    Immediate,
    After(Duration),
    /// Never expire on time alone
    Infinite,
}

impl Timeout {
    /// Decode a wire timeout: 0 is immediate, `u64::MAX` is infinite
    pub fn from_micros(micros: u64) -> Self {
        match micros {
            0 => Timeout::Immediate,
            u64::MAX => Timeout::Infinite,
            us => Timeout::After(Duration::from_micros(us)),
        }
    }

    pub(crate) fn deadline(self) -> Deadline {
        match self {
            Timeout::Immediate => Deadline::after(Some(Duration::ZERO)),
            Timeout::After(d) => Deadline::after(Some(d)),
            Timeout::Infinite => Deadline::never(),
        }
    }
}

/// Caller's description of one transfer
///
/// `status`, `error` and `key` are written by the broker on submission.
#[derive(Debug)]
pub struct IoDescriptor {
    pub disk: DiskHandle,
    /// Raw operation code (0 = noop, 1 = read, 2 = write)
    pub op: u16,
    /// 0 (highest) to 7
    pub priority: u8,
    /// First block, in units of [`SECTOR_SIZE`]
    pub first_block: u64,
    /// Block count, in units of [`SECTOR_SIZE`]
    pub block_count: u64,
    pub buffer: Option<AlignedBuffer>,
    /// Caller's own back-reference, returned on reap
    pub tag: u64,

    pub status: StatusFlags,
    pub error: i32,
    pub key: Option<RequestKey>,
}

impl IoDescriptor {
    pub fn new(
        disk: DiskHandle,
        op: OperationType,
        first_block: u64,
        block_count: u64,
        buffer: Option<AlignedBuffer>,
    ) -> Self {
        Self {
            disk,
            op: op.code(),
            priority: 0,
            first_block,
            block_count,
            buffer,
            tag: 0,
            status: StatusFlags::empty(),
            error: 0,
            key: None,
        }
    }

    /// Read enough blocks at `first_block` to fill `buffer`
    pub fn read(disk: DiskHandle, first_block: u64, buffer: AlignedBuffer) -> Self {
        let blocks = buffer.len() as u64 / SECTOR_SIZE;
        Self::new(disk, OperationType::Read, first_block, blocks, Some(buffer))
    }

    /// Write all of `buffer` at `first_block`
    pub fn write(disk: DiskHandle, first_block: u64, buffer: AlignedBuffer) -> Self {
        let blocks = buffer.len() as u64 / SECTOR_SIZE;
        Self::new(disk, OperationType::Write, first_block, blocks, Some(buffer))
    }

    pub fn noop(disk: DiskHandle) -> Self {
        Self::new(disk, OperationType::NoOp, 0, 0, None)
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Decoded operation, if the raw code is known
    pub fn operation(&self) -> Option<OperationType> {
        OperationType::try_from(self.op).ok()
    }

    pub(crate) fn reset_outputs(&mut self) {
        self.status = StatusFlags::empty();
        self.error = 0;
        self.key = None;
    }
}

/// Outcome of a reaped request
#[derive(Debug)]
pub struct Completion {
    pub key: RequestKey,
    pub tag: u64,
    pub op: OperationType,
    pub status: StatusFlags,
    /// Signed error code (0 on success)
    pub error: i32,
    /// Submission to completion, in microseconds
    pub elapsed_us: u64,
    /// Blocks moved, in units of [`SECTOR_SIZE`]
    pub transferred_blocks: u64,
    /// The caller's buffer, handed back
    pub buffer: Option<AlignedBuffer>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.status.contains(StatusFlags::COMPLETED) && !self.status.contains(StatusFlags::ERROR)
    }
}

/// In-flight request, owned by the pool
#[derive(Debug)]
pub(crate) struct Request {
    pub key: RequestKey,
    pub owner: ContextId,
    pub context: Weak<ClientContext>,
    /// Cleared when the transfer finishes
    pub disk: Option<Arc<DiskEntry>>,
    pub op: OperationType,
    pub priority: u8,
    pub offset: u64,
    pub length: usize,
    pub tag: u64,
    pub buffer: Option<AlignedBuffer>,
    pub status: StatusFlags,
    pub error: i32,
    pub submitted_at: Timestamp,
    pub elapsed_us: u64,
    pub transferred_bytes: u64,
}

impl Request {
    /// Add status bits; existing bits are never cleared
    pub fn set(&mut self, flags: StatusFlags) {
        self.status |= flags;
    }

    pub fn into_completion(mut self) -> Completion {
        self.set(StatusFlags::FREE);
        Completion {
            key: self.key,
            tag: self.tag,
            op: self.op,
            status: self.status,
            error: self.error,
            elapsed_us: self.elapsed_us,
            transferred_blocks: self.transferred_bytes / SECTOR_SIZE,
            buffer: self.buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_packing() {
        let key = RequestKey::new(17, 3);
        assert_eq!(key.index(), 17);
        assert_eq!(key.generation(), 3);
        assert_eq!(key.0, (3u64 << 32) | 17);
        assert_ne!(RequestKey::new(17, 4), key);
    }

    #[test]
    fn test_status_flag_values() {
        assert_eq!(StatusFlags::BUSY.bits(), 0x1);
        assert_eq!(StatusFlags::SUBMITTED.bits(), 0x2);
        assert_eq!(StatusFlags::COMPLETED.bits(), 0x4);
        assert_eq!(StatusFlags::FREE.bits(), 0x8);
        assert_eq!(StatusFlags::CANCELLED.bits(), 0x10);
        assert_eq!(StatusFlags::ERROR.bits(), 0x20);
        assert_eq!(StatusFlags::PARTIAL.bits(), 0x80);
        assert_eq!(StatusFlags::LOCAL_ERROR.bits(), 0x400);
    }

    #[test]
    fn test_terminal_status() {
        assert!(!StatusFlags::SUBMITTED.is_terminal());
        assert!(!(StatusFlags::SUBMITTED | StatusFlags::CANCELLED).is_terminal());
        assert!((StatusFlags::SUBMITTED | StatusFlags::COMPLETED).is_terminal());
        assert!((StatusFlags::BUSY | StatusFlags::ERROR | StatusFlags::FREE).is_terminal());
    }

    #[test]
    fn test_timeout_from_micros() {
        assert_eq!(Timeout::from_micros(0), Timeout::Immediate);
        assert_eq!(Timeout::from_micros(u64::MAX), Timeout::Infinite);
        assert_eq!(Timeout::from_micros(1500), Timeout::After(Duration::from_micros(1500)));
        assert!(Timeout::Immediate.deadline().expired());
        assert!(!Timeout::Infinite.deadline().expired());
    }

    #[test]
    fn test_descriptor_builders() {
        let buffer = AlignedBuffer::new(4096, 4096).unwrap();
        let desc = IoDescriptor::write(DiskHandle(1), 8, buffer).with_priority(3).with_tag(99);
        assert_eq!(desc.op, 2);
        assert_eq!(desc.operation(), Some(OperationType::Write));
        assert_eq!(desc.block_count, 8);
        assert_eq!(desc.priority, 3);
        assert_eq!(desc.tag, 99);
        assert!(desc.key.is_none());

        let mut raw = IoDescriptor::noop(DiskHandle(1));
        raw.op = 9;
        assert_eq!(raw.operation(), None);
    }

    #[test]
    fn test_status_serializes_as_bits() {
        let json = serde_json::to_string(&(StatusFlags::SUBMITTED | StatusFlags::COMPLETED)).unwrap();
        assert_eq!(json, "6");
    }
}

//! Submission engine
//!
//! Turns an [`IoDescriptor`] into an in-flight request, or into an immediately
//! terminal outcome written back to the descriptor. Nothing here blocks on the
//! device.
//!
//! The request's slot lock is held from attachment until the engine has
//! accepted the transfer, so a completion racing ahead of `submit` waits for
//! `SUBMITTED` to be set before it is applied.

use super::context::ClientContext;
use super::registry::DiskEntry;
use super::request::{IoDescriptor, Request, RequestKey, StatusFlags, MAX_PRIORITY, SECTOR_SIZE};
use crate::engine::{IOOperation, OperationType};
use crate::error::{BrokerError, BrokerResult};
use crate::util::time::Timestamp;
use std::sync::Arc;

/// A descriptor that passed validation
struct Validated {
    op: OperationType,
    entry: Arc<DiskEntry>,
    offset: u64,
    length: u64,
}

impl ClientContext {
    /// Submit one transfer
    ///
    /// The descriptor's `status`, `error` and `key` always reflect the outcome.
    /// On success the buffer moves into the broker and comes back in the
    /// request's [`Completion`](super::request::Completion); on failure it
    /// stays in the descriptor.
    pub fn submit(&self, desc: &mut IoDescriptor) -> BrokerResult<RequestKey> {
        desc.reset_outputs();

        let valid = match self.validate(desc) {
            Ok(valid) => valid,
            Err(err) => return Err(self.reject(desc, err)),
        };

        let transport = &self.shared.transport;
        if !transport.try_reserve() {
            return Err(self.busy(desc, BrokerError::QueueFull));
        }

        let priority = desc.priority;
        let tag = desc.tag;
        let mut buffer = desc.buffer.take();
        let inserted = self.shared.pool.insert(|key| Request {
            key,
            owner: self.id,
            context: self.me.clone(),
            disk: Some(valid.entry.clone()),
            op: valid.op,
            priority,
            offset: valid.offset,
            length: valid.length as usize,
            tag,
            buffer: buffer.take(),
            status: StatusFlags::empty(),
            error: 0,
            submitted_at: Timestamp::now(),
            elapsed_us: 0,
            transferred_bytes: 0,
        });
        let Some((key, mut request)) = inserted else {
            desc.buffer = buffer;
            transport.unreserve();
            return Err(self.busy(desc, BrokerError::OutOfMemory));
        };

        if !valid.entry.begin_io() {
            drop(request);
            self.undo(key, desc, false, false);
            return Err(self.reject(desc, BrokerError::NoDevice(valid.entry.path().display().to_string())));
        }

        {
            let mut state = self.state.lock();
            if state.detached {
                drop(state);
                drop(request);
                self.undo(key, desc, true, false);
                return Err(self.reject(desc, BrokerError::Shutdown));
            }
            state.inflight.insert(key);
        }

        let op = IOOperation {
            op_type: valid.op,
            target_fd: valid.entry.fd(),
            offset: valid.offset,
            buffer: request
                .buffer
                .as_mut()
                .map_or(std::ptr::null_mut(), |b| b.as_mut_ptr()),
            length: valid.length as usize,
            priority,
            user_data: key.0,
        };
        request.submitted_at = Timestamp::now();

        if let Err(err) = transport.submit(op) {
            drop(request);
            self.undo(key, desc, true, true);
            tracing::error!(ctx = %self.id, key = %key, error = %err, "engine refused transfer");
            self.shared.stats.errored.incr();
            desc.status = StatusFlags::ERROR | StatusFlags::FREE;
            desc.error = libc::EIO;
            return Err(BrokerError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
        }

        request.set(StatusFlags::SUBMITTED);
        drop(request);

        self.shared.stats.submitted.incr();
        desc.status = StatusFlags::SUBMITTED;
        desc.key = Some(key);
        tracing::debug!(
            ctx = %self.id,
            key = %key,
            op = %valid.op,
            disk = valid.entry.id(),
            offset = valid.offset,
            length = valid.length,
            priority,
            "request submitted"
        );
        Ok(key)
    }

    /// Run the checks in order; the first failure wins
    fn validate(&self, desc: &IoDescriptor) -> BrokerResult<Validated> {
        let op = OperationType::try_from(desc.op)
            .map_err(|code| BrokerError::InvalidArgument(format!("unknown operation code {}", code)))?;

        if desc.priority > MAX_PRIORITY {
            return Err(BrokerError::InvalidArgument(format!(
                "priority {} out of range 0..={}",
                desc.priority, MAX_PRIORITY
            )));
        }

        let entry = {
            let state = self.state.lock();
            if state.detached {
                return Err(BrokerError::Shutdown);
            }
            state.handles.get(&desc.disk).cloned().ok_or(BrokerError::InvalidHandle)?
        };

        if !entry.is_live() {
            return Err(BrokerError::NoDevice(entry.path().display().to_string()));
        }

        if !op.transfers_data() {
            return Ok(Validated {
                op,
                entry,
                offset: 0,
                length: 0,
            });
        }

        let buffer = desc.buffer.as_ref().ok_or(BrokerError::InvalidBuffer)?;

        let block_size = entry.block_size();
        let length = desc
            .block_count
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| BrokerError::InvalidArgument("block count overflows".into()))?;
        let offset = desc
            .first_block
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| BrokerError::InvalidArgument("first block overflows".into()))?;
        if length == 0 || length % block_size != 0 || offset % block_size != 0 {
            return Err(BrokerError::InvalidArgument(format!(
                "transfer of {} bytes at {} is not aligned to the {} byte block size",
                length, offset, block_size
            )));
        }

        if length > entry.max_transfer() {
            return Err(BrokerError::InvalidArgument(format!(
                "transfer of {} bytes exceeds the {} byte limit",
                length,
                entry.max_transfer()
            )));
        }

        if (buffer.len() as u64) < length {
            return Err(BrokerError::InvalidBuffer);
        }

        let end = desc
            .first_block
            .checked_add(desc.block_count)
            .and_then(|end| end.checked_mul(SECTOR_SIZE));
        if end.map_or(true, |end| end > entry.size_bytes()) {
            return Err(BrokerError::InvalidArgument(format!(
                "blocks {}..+{} beyond end of device",
                desc.first_block, desc.block_count
            )));
        }

        Ok(Validated {
            op,
            entry,
            offset,
            length,
        })
    }

    /// Unwind a partly attached request and give the buffer back
    fn undo(&self, key: RequestKey, desc: &mut IoDescriptor, counted: bool, listed: bool) {
        if listed {
            self.state.lock().inflight.remove(&key);
        }
        if let Some(mut request) = self.shared.pool.remove(key) {
            if counted {
                if let Some(disk) = request.disk.take() {
                    disk.finish_io();
                }
            }
            desc.buffer = request.buffer.take();
        }
        self.shared.transport.unreserve();
    }

    fn reject(&self, desc: &mut IoDescriptor, err: BrokerError) -> BrokerError {
        desc.status = StatusFlags::ERROR | StatusFlags::LOCAL_ERROR | StatusFlags::FREE;
        desc.error = err.code();
        self.shared.stats.rejected.incr();
        tracing::debug!(ctx = %self.id, error = %err, code = desc.error, "request rejected");
        err
    }

    fn busy(&self, desc: &mut IoDescriptor, err: BrokerError) -> BrokerError {
        desc.status = StatusFlags::BUSY | StatusFlags::ERROR | StatusFlags::FREE;
        desc.error = err.code();
        self.shared.stats.busy.incr();
        tracing::debug!(ctx = %self.id, error = %err, "request busy");
        err
    }

    /// Mark a request cancelled
    ///
    /// Advisory: the transfer is not stopped and the request still has to be
    /// reaped. A request with no outcome yet gets `ECANCELED` as its error,
    /// which its natural outcome will overwrite.
    pub fn cancel(&self, key: RequestKey) -> BrokerResult<()> {
        if !self.state.lock().owns(&key) {
            return Err(BrokerError::InvalidKey);
        }

        let mut request = self.shared.pool.get(key).ok_or(BrokerError::InvalidKey)?;
        if request.owner != self.id || !request.status.contains(StatusFlags::SUBMITTED) {
            return Err(BrokerError::InvalidKey);
        }

        if !request.status.contains(StatusFlags::CANCELLED) {
            request.set(StatusFlags::CANCELLED);
            if !request.status.is_terminal() && request.error == 0 {
                request.error = libc::ECANCELED;
            }
            self.shared.stats.cancelled.incr();
            tracing::debug!(ctx = %self.id, key = %key, "request cancelled");
        }
        Ok(())
    }

    /// Current status bits of a request this context owns
    pub fn status(&self, key: RequestKey) -> BrokerResult<StatusFlags> {
        if !self.state.lock().owns(&key) {
            return Err(BrokerError::InvalidKey);
        }
        let request = self.shared.pool.get(key).ok_or(BrokerError::InvalidKey)?;
        if request.owner != self.id {
            return Err(BrokerError::InvalidKey);
        }
        Ok(request.status)
    }
}

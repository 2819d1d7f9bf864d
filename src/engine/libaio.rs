//! libaio IO engine
//!
//! Asynchronous transfers through Linux native AIO (`io_submit`/`io_getevents`).
//!
//! # Implementation
//!
//! Direct syscalls via libc rather than a binding crate, so the LGPL libaio
//! library is not linked. Control blocks live in a fixed vector allocated at
//! `init` and are never reallocated while the kernel may hold pointers to them.
//! Completions are reaped with a zero timeout so `poll_completions` never
//! blocks; the broker's transport decides how often to poll.
//!
//! `NoOp` has no kernel counterpart and completes on the next poll without
//! entering the kernel.
//!
//! # Requirements
//!
//! - Linux kernel with AIO support
//! - O_DIRECT for truly asynchronous block-device IO

use super::{EngineCapabilities, EngineConfig, IOCompletion, IOEngine, IOOperation, OperationType};
use crate::Result;
use anyhow::Context;
use std::collections::HashMap;
use std::ptr;

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

const IOCB_FLAG_IOPRIO: u32 = 1 << 1;
const IOPRIO_CLASS_BE: i16 = 2;
const IOPRIO_CLASS_SHIFT: i16 = 13;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoControlBlock {
    data: u64,
    key: u32,
    aio_rw_flags: u32,
    lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    buf: u64,
    nbytes: u64,
    offset: i64,
    aio_reserved2: u64,
    flags: u32,
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

unsafe fn io_setup(maxevents: libc::c_int, ctxp: *mut AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_setup, maxevents as libc::c_long, ctxp)
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_destroy, ctx)
}

unsafe fn io_submit(ctx: AioContext, nr: libc::c_long, iocbpp: *mut *mut IoControlBlock) -> libc::c_long {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp)
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout)
}

/// Kernel priority value for a broker priority (0 highest .. 7 lowest)
fn ioprio_value(priority: u8) -> i16 {
    (IOPRIO_CLASS_BE << IOPRIO_CLASS_SHIFT) | i16::from(priority.min(7))
}

/// libaio IO engine
pub struct LibaioEngine {
    ctx: Option<AioContext>,

    queue_depth: usize,

    /// Control blocks handed to the kernel (fixed after init)
    iocbs: Vec<IoControlBlock>,

    /// Free control block indices
    available_iocbs: Vec<usize>,

    /// In-kernel operations: user_data -> (iocb index, op type, requested length)
    in_kernel: HashMap<u64, (usize, OperationType, usize)>,

    /// NoOp completions waiting for the next poll
    ready: Vec<IOCompletion>,

    events: Vec<IoEvent>,
}

impl LibaioEngine {
    /// Create a new libaio engine
    pub fn new() -> Self {
        Self {
            ctx: None,
            queue_depth: 0,
            iocbs: Vec::new(),
            available_iocbs: Vec::new(),
            in_kernel: HashMap::new(),
            ready: Vec::new(),
            events: Vec::new(),
        }
    }

    fn context(&self) -> Result<AioContext> {
        self.ctx.ok_or_else(|| anyhow::anyhow!("libaio engine not initialized"))
    }

    fn reap(&mut self, ctx: AioContext, completions: &mut Vec<IOCompletion>) -> Result<()> {
        if self.in_kernel.is_empty() {
            return Ok(());
        }

        let mut timeout = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let result = unsafe {
            io_getevents(
                ctx,
                0,
                self.events.len() as libc::c_long,
                self.events.as_mut_ptr(),
                &mut timeout,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err).context("io_getevents failed");
        }

        for i in 0..result as usize {
            let event = self.events[i];
            let Some((iocb_idx, op_type, _length)) = self.in_kernel.remove(&event.data) else {
                continue;
            };
            self.available_iocbs.push(iocb_idx);

            let result = if event.res >= 0 {
                Ok(event.res as usize)
            } else {
                let errno = (-event.res) as i32;
                Err(anyhow::Error::new(std::io::Error::from_raw_os_error(errno))
                    .context(format!("{} operation failed: errno={}", op_type, errno)))
            };

            completions.push(IOCompletion {
                user_data: event.data,
                result,
                op_type,
            });
        }

        Ok(())
    }
}

impl Default for LibaioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IOEngine for LibaioEngine {
    fn init(&mut self, config: &EngineConfig) -> Result<()> {
        let mut ctx: AioContext = 0;
        let result = unsafe { io_setup(config.queue_depth as libc::c_int, &mut ctx) };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!(
                "io_setup failed with queue_depth={}",
                config.queue_depth
            ));
        }

        self.ctx = Some(ctx);
        self.queue_depth = config.queue_depth;
        self.iocbs = vec![IoControlBlock::default(); config.queue_depth];
        self.available_iocbs = (0..config.queue_depth).rev().collect();
        self.events = vec![IoEvent::default(); config.queue_depth];
        self.ready = Vec::new();

        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let ctx = self.context()?;

        let lio_opcode = match op.op_type {
            OperationType::NoOp => {
                if self.pending() >= self.queue_depth {
                    anyhow::bail!("No available iocbs (queue full)");
                }
                self.ready.push(IOCompletion {
                    user_data: op.user_data,
                    result: Ok(0),
                    op_type: op.op_type,
                });
                return Ok(());
            }
            OperationType::Read => IOCB_CMD_PREAD,
            OperationType::Write => IOCB_CMD_PWRITE,
        };

        if self.ready.len() + self.in_kernel.len() >= self.queue_depth {
            anyhow::bail!("No available iocbs (queue full)");
        }
        let iocb_idx = self
            .available_iocbs
            .pop()
            .ok_or_else(|| anyhow::anyhow!("No available iocbs (queue full)"))?;

        let iocb = &mut self.iocbs[iocb_idx];
        *iocb = IoControlBlock {
            data: op.user_data,
            lio_opcode,
            aio_reqprio: ioprio_value(op.priority),
            aio_fildes: op.target_fd as u32,
            buf: op.buffer as u64,
            nbytes: op.length as u64,
            offset: op.offset as i64,
            flags: IOCB_FLAG_IOPRIO,
            ..IoControlBlock::default()
        };

        let mut iocb_ptr = iocb as *mut IoControlBlock;
        let result = unsafe { io_submit(ctx, 1, &mut iocb_ptr) };

        if result != 1 {
            self.available_iocbs.push(iocb_idx);
            let err = if result < 0 {
                std::io::Error::last_os_error()
            } else {
                std::io::Error::from_raw_os_error(libc::EAGAIN)
            };
            return Err(err).context(format!("io_submit failed for {} operation", op.op_type));
        }

        self.in_kernel
            .insert(op.user_data, (iocb_idx, op.op_type, op.length));
        Ok(())
    }

    fn poll_completions(&mut self) -> Result<Vec<IOCompletion>> {
        let ctx = self.context()?;
        let mut completions = std::mem::take(&mut self.ready);
        if let Err(err) = self.reap(ctx, &mut completions) {
            if completions.is_empty() {
                return Err(err);
            }
            // NoOps already finished; the kernel side is retried on the next poll
            tracing::warn!(error = %err, ready = completions.len(), "io_getevents failed");
        }
        Ok(completions)
    }

    fn pending(&self) -> usize {
        self.ready.len() + self.in_kernel.len()
    }

    fn cleanup(&mut self) -> Result<()> {
        if let Some(ctx) = self.ctx {
            let mut discarded = Vec::new();
            while !self.in_kernel.is_empty() {
                self.reap(ctx, &mut discarded)?;
                if !self.in_kernel.is_empty() {
                    std::thread::yield_now();
                }
            }

            let result = unsafe { io_destroy(ctx) };
            if result < 0 {
                let err = std::io::Error::last_os_error();
                return Err(err).context("io_destroy failed");
            }

            self.ctx = None;
        }

        self.ready.clear();
        self.available_iocbs.clear();

        Ok(())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            async_io: true,
            priorities: true,
            max_queue_depth: self.queue_depth,
        }
    }
}

impl Drop for LibaioEngine {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn poll_until(engine: &mut LibaioEngine, count: usize) -> Vec<IOCompletion> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut completions = Vec::new();
        while completions.len() < count && Instant::now() < deadline {
            completions.extend(engine.poll_completions().unwrap());
            if completions.len() < count {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        completions
    }

    #[test]
    fn test_libaio_engine_init() {
        let mut engine = LibaioEngine::new();
        assert!(engine.init(&EngineConfig { queue_depth: 32 }).is_ok());
        assert_eq!(engine.capabilities().max_queue_depth, 32);
        assert!(engine.cleanup().is_ok());
    }

    #[test]
    fn test_libaio_engine_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("aio.dat");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&file_path)
            .unwrap();
        let fd = file.as_raw_fd();

        let mut engine = LibaioEngine::new();
        engine.init(&EngineConfig::default()).unwrap();

        let mut data = vec![0u8; 4096];
        data[..13].copy_from_slice(b"libaio broker");
        engine
            .submit(IOOperation {
                op_type: OperationType::Write,
                target_fd: fd,
                offset: 0,
                buffer: data.as_mut_ptr(),
                length: data.len(),
                priority: 0,
                user_data: 1,
            })
            .unwrap();
        let completions = poll_until(&mut engine, 1);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].result.as_ref().unwrap(), &4096);

        let mut buffer = vec![0u8; 4096];
        engine
            .submit(IOOperation {
                op_type: OperationType::Read,
                target_fd: fd,
                offset: 0,
                buffer: buffer.as_mut_ptr(),
                length: buffer.len(),
                priority: 7,
                user_data: 2,
            })
            .unwrap();
        let completions = poll_until(&mut engine, 1);
        assert_eq!(completions[0].user_data, 2);
        assert_eq!(&buffer[..13], b"libaio broker");

        engine.cleanup().unwrap();
    }

    #[test]
    fn test_libaio_engine_noop_completes_without_kernel() {
        let mut engine = LibaioEngine::new();
        engine.init(&EngineConfig::default()).unwrap();

        engine
            .submit(IOOperation {
                op_type: OperationType::NoOp,
                target_fd: -1,
                offset: 0,
                buffer: ptr::null_mut(),
                length: 0,
                priority: 0,
                user_data: 9,
            })
            .unwrap();
        assert_eq!(engine.pending(), 1);

        let completions = engine.poll_completions().unwrap();
        assert_eq!(completions[0].user_data, 9);
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_libaio_engine_bad_fd_rejected_at_submit() {
        let mut engine = LibaioEngine::new();
        engine.init(&EngineConfig::default()).unwrap();

        let mut buffer = vec![0u8; 4096];
        let result = engine.submit(IOOperation {
            op_type: OperationType::Read,
            target_fd: -1,
            offset: 0,
            buffer: buffer.as_mut_ptr(),
            length: buffer.len(),
            priority: 0,
            user_data: 1,
        });
        assert!(result.is_err());
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_libaio_engine_queue_full() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("queue.dat");
        std::fs::write(&file_path, vec![0u8; 8192]).unwrap();
        let file = File::open(&file_path).unwrap();
        let fd = file.as_raw_fd();

        let mut engine = LibaioEngine::new();
        engine.init(&EngineConfig { queue_depth: 2 }).unwrap();

        let mut buffers = vec![vec![0u8; 4096]; 3];
        let mut results = Vec::new();
        for (i, buffer) in buffers.iter_mut().enumerate() {
            results.push(engine.submit(IOOperation {
                op_type: OperationType::Read,
                target_fd: fd,
                offset: 0,
                buffer: buffer.as_mut_ptr(),
                length: 4096,
                priority: 0,
                user_data: i as u64,
            }));
        }
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(results[2].is_err());

        assert_eq!(poll_until(&mut engine, 2).len(), 2);
        engine.cleanup().unwrap();
    }

    #[test]
    fn test_libaio_engine_keeps_noops_when_reap_fails() {
        let mut engine = LibaioEngine::new();
        engine.init(&EngineConfig::default()).unwrap();
        let real_ctx = engine.ctx.unwrap();

        engine
            .submit(IOOperation {
                op_type: OperationType::NoOp,
                target_fd: -1,
                offset: 0,
                buffer: ptr::null_mut(),
                length: 0,
                priority: 0,
                user_data: 5,
            })
            .unwrap();

        // Pretend a transfer is in the kernel and make io_getevents fail
        let iocb_idx = engine.available_iocbs.pop().unwrap();
        engine.in_kernel.insert(77, (iocb_idx, OperationType::Read, 4096));
        engine.ctx = Some(0);

        let completions = engine.poll_completions().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].user_data, 5);
        assert!(engine.poll_completions().is_err());

        engine.in_kernel.remove(&77);
        engine.available_iocbs.push(iocb_idx);
        engine.ctx = Some(real_ctx);
        engine.cleanup().unwrap();
    }
}

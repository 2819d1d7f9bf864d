use super::*;
use crate::engine::mock::MockEngine;
use crate::engine::{EngineType, OperationType};
use crate::error::ErrorClass;
use crate::util::buffer::{AlignedBuffer, FillPattern};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const IMAGE_BYTES: usize = 256 * 1024;

fn image(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, vec![0u8; IMAGE_BYTES]).unwrap();
    path
}

fn mock_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.transport.engine = EngineType::Mock;
    config
}

fn mock_broker(config: BrokerConfig) -> (Broker, MockEngine) {
    let engine = MockEngine::new();
    let broker = Broker::with_engine(config, Box::new(engine.clone())).unwrap();
    (broker, engine)
}

fn buffer(blocks: u64) -> AlignedBuffer {
    AlignedBuffer::new((blocks * SECTOR_SIZE) as usize, 4096).unwrap()
}

fn release_after(control: &MockEngine, delay: Duration) -> std::thread::JoinHandle<()> {
    let control = control.clone();
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        control.release();
    })
}

#[test]
fn test_writes_at_transfer_limit_complete() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let mut config = mock_config();
    config.transport.max_transfer_bytes = 512;
    let (broker, _control) = mock_broker(config);

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    assert_eq!(ctx.disk_info(disk).unwrap().max_transfer_bytes, 512);

    let mut keys = Vec::new();
    for block in 0..3 {
        let mut desc = IoDescriptor::write(disk, block, buffer(1)).with_tag(block);
        keys.push(ctx.submit(&mut desc).unwrap());
        assert_eq!(desc.status, StatusFlags::SUBMITTED);
        assert!(desc.buffer.is_none());
    }

    let outcome = ctx.wait_for_set(&keys, Timeout::Infinite).unwrap();
    assert!(outcome.satisfied());
    assert_eq!(outcome.completions.len(), 3);
    for completion in &outcome.completions {
        assert!(completion.is_success(), "{:?}", completion);
        assert!(completion.status.contains(StatusFlags::FREE));
        assert_eq!(completion.transferred_blocks, 1);
        assert!(completion.buffer.is_some());
    }
    let mut tags: Vec<u64> = outcome.completions.iter().map(|c| c.tag).collect();
    tags.sort();
    assert_eq!(tags, vec![0, 1, 2]);

    // One block over the limit is refused before it reaches the transport
    let mut big = IoDescriptor::write(disk, 0, buffer(2));
    assert!(matches!(ctx.submit(&mut big), Err(BrokerError::InvalidArgument(_))));
    assert!(big.buffer.is_some());
    assert_eq!(broker.requests_in_use(), 0);
}

#[test]
fn test_misaligned_read_is_software_error() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk4k.img");
    let mut config = mock_config();
    config.device.block_size_override = Some(4096);
    let (broker, control) = mock_broker(config);

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    assert_eq!(ctx.disk_info(disk).unwrap().block_size, 4096);

    let mut desc = IoDescriptor::read(disk, 1, buffer(8));
    let err = ctx.submit(&mut desc).unwrap_err();
    assert!(matches!(err, BrokerError::InvalidArgument(_)));
    assert!(desc.error < 0);
    assert_eq!(desc.error, -libc::EINVAL);
    assert_eq!(ErrorClass::of(desc.error), ErrorClass::Software);
    assert!(desc
        .status
        .contains(StatusFlags::ERROR | StatusFlags::LOCAL_ERROR | StatusFlags::FREE));
    assert!(desc.key.is_none());
    assert!(desc.buffer.is_some());

    // Short of a whole device block
    let mut short = IoDescriptor::read(disk, 0, buffer(1));
    assert!(ctx.submit(&mut short).is_err());

    assert_eq!(control.submitted_count(), 0);
    assert_eq!(broker.stats().rejected, 2);
}

#[test]
fn test_validation_order_and_codes() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, _control) = mock_broker(mock_config());
    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();

    let mut bad_op = IoDescriptor::read(disk, 0, buffer(1));
    bad_op.op = 9;
    bad_op.disk = DiskHandle(999);
    // Unknown operation is reported ahead of the bad handle
    assert!(matches!(ctx.submit(&mut bad_op), Err(BrokerError::InvalidArgument(_))));

    let mut bad_priority = IoDescriptor::noop(disk).with_priority(MAX_PRIORITY + 1);
    assert!(matches!(ctx.submit(&mut bad_priority), Err(BrokerError::InvalidArgument(_))));

    let mut bad_handle = IoDescriptor::noop(DiskHandle(999));
    assert!(matches!(ctx.submit(&mut bad_handle), Err(BrokerError::InvalidHandle)));
    assert_eq!(bad_handle.error, -libc::EBADF);

    let mut no_buffer = IoDescriptor::new(disk, OperationType::Read, 0, 1, None);
    assert!(matches!(ctx.submit(&mut no_buffer), Err(BrokerError::InvalidBuffer)));

    let mut small_buffer = IoDescriptor::new(disk, OperationType::Write, 0, 8, Some(buffer(1)));
    assert!(matches!(ctx.submit(&mut small_buffer), Err(BrokerError::InvalidBuffer)));

    let sectors = ctx.disk_info(disk).unwrap().sectors;
    let mut past_end = IoDescriptor::read(disk, sectors, buffer(1));
    assert!(matches!(ctx.submit(&mut past_end), Err(BrokerError::InvalidArgument(_))));
    let mut last = IoDescriptor::read(disk, sectors - 1, buffer(1));
    assert!(ctx.submit(&mut last).is_ok());
}

#[test]
fn test_pool_exhaustion_reports_busy() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let mut config = mock_config();
    config.pool.max_requests = 2;
    let (broker, control) = mock_broker(config);
    control.hold();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();

    let mut keys = Vec::new();
    for _ in 0..2 {
        keys.push(ctx.submit(&mut IoDescriptor::noop(disk)).unwrap());
    }

    let mut third = IoDescriptor::write(disk, 0, buffer(1));
    let err = ctx.submit(&mut third).unwrap_err();
    assert!(matches!(err, BrokerError::OutOfMemory));
    assert!(third.status.contains(StatusFlags::BUSY | StatusFlags::ERROR));
    assert!(!third.status.contains(StatusFlags::LOCAL_ERROR));
    assert_eq!(ErrorClass::of(third.error), ErrorClass::Environment);
    assert!(third.buffer.is_some());
    // The refused request never took queue space
    assert_eq!(broker.outstanding_transfers(), 2);

    control.release();
    let outcome = ctx.wait_for_set(&keys, Timeout::Infinite).unwrap();
    assert!(outcome.satisfied());
    assert_eq!(broker.requests_in_use(), 0);

    assert!(ctx.submit(&mut third).is_ok());
    assert_eq!(broker.stats().busy, 1);
}

#[test]
fn test_queue_full_reports_busy() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let mut config = mock_config();
    config.transport.queue_depth = 1;
    let (broker, control) = mock_broker(config);
    control.hold();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();

    let first = ctx.submit(&mut IoDescriptor::noop(disk)).unwrap();
    let mut second = IoDescriptor::noop(disk);
    assert!(matches!(ctx.submit(&mut second), Err(BrokerError::QueueFull)));
    assert!(second.status.contains(StatusFlags::BUSY));
    assert_eq!(second.error, libc::EAGAIN);
    assert_eq!(broker.requests_in_use(), 1);

    control.release();
    ctx.wait_for_set(&[first], Timeout::Infinite).unwrap();
    assert!(ctx.submit(&mut second).is_ok());
}

#[test]
fn test_detach_waits_for_in_flight_and_frees_everything() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.hold();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    ctx.submit(&mut IoDescriptor::read(disk, 0, buffer(1))).unwrap();
    ctx.submit(&mut IoDescriptor::read(disk, 8, buffer(1))).unwrap();
    assert_eq!(ctx.in_flight(), 2);

    let releaser = release_after(&control, Duration::from_millis(50));
    ctx.detach();
    releaser.join().unwrap();

    assert_eq!(broker.requests_in_use(), 0);
    assert_eq!(broker.attached_contexts(), 0);
    assert!(broker.disks().is_empty());

    let stats = broker.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.reaped, 2);
    assert_eq!(stats.disks_closed, 1);
}

#[test]
fn test_close_waits_for_in_flight() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.hold();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let key = ctx.submit(&mut IoDescriptor::write(disk, 0, buffer(8))).unwrap();

    let releaser = release_after(&control, Duration::from_millis(50));
    ctx.close(disk).unwrap();
    releaser.join().unwrap();

    assert_eq!(ctx.in_flight(), 0);
    assert!(broker.disks().is_empty());
    assert!(matches!(ctx.close(disk), Err(BrokerError::InvalidHandle)));

    // The finished request is still the caller's to reap
    let completion = ctx.drain_one().unwrap();
    assert_eq!(completion.key, key);
    assert!(completion.is_success());
    assert!(ctx.drain_one().is_none());
}

#[test]
fn test_submit_after_close_is_invalid_handle() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, _control) = mock_broker(mock_config());
    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    ctx.close(disk).unwrap();

    let mut desc = IoDescriptor::noop(disk);
    assert!(matches!(ctx.submit(&mut desc), Err(BrokerError::InvalidHandle)));
}

#[test]
fn test_contexts_share_disk_entry() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let link = dir.path().join("alias.img");
    std::os::unix::fs::symlink(&path, &link).unwrap();
    let (broker, _control) = mock_broker(mock_config());

    let a = broker.attach().unwrap();
    let b = broker.attach().unwrap();
    assert_ne!(a.id(), b.id());

    let da = a.open(&path).unwrap();
    let db = b.open(&link).unwrap();
    let disks = broker.disks();
    assert_eq!(disks.len(), 1);
    assert_eq!(disks[0].open_count, 2);
    assert_eq!(a.disk_info(da).unwrap().id, b.disk_info(db).unwrap().id);

    // Handles are per context
    assert!(matches!(b.close(DiskHandle(999)), Err(BrokerError::InvalidHandle)));

    a.close(da).unwrap();
    let disks = broker.disks();
    assert_eq!(disks.len(), 1);
    assert_eq!(disks[0].open_count, 1);
    assert!(b.submit(&mut IoDescriptor::noop(db)).is_ok());

    b.detach();
    assert!(broker.disks().is_empty());
    assert_eq!(broker.stats().disks_opened, 1);
}

#[test]
fn test_open_missing_device() {
    let (broker, _control) = mock_broker(mock_config());
    let ctx = broker.attach().unwrap();
    let err = ctx.open(Path::new("/nonexistent/disk.img")).unwrap_err();
    assert!(matches!(err, BrokerError::NoDevice(_)));
    assert!(ctx.handles().is_empty());
}

#[test]
fn test_strict_keys_reject_foreign_and_unknown() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.hold();

    let a = broker.attach().unwrap();
    let b = broker.attach().unwrap();
    let disk = a.open(&path).unwrap();
    let key = a.submit(&mut IoDescriptor::noop(disk)).unwrap();

    assert!(matches!(
        b.wait_for_set(&[key], Timeout::Immediate),
        Err(BrokerError::InvalidKey)
    ));
    assert!(matches!(b.cancel(key), Err(BrokerError::InvalidKey)));
    assert!(matches!(b.status(key), Err(BrokerError::InvalidKey)));
    assert!(matches!(
        a.wait_for_set(&[key, RequestKey::new(77, 3)], Timeout::Immediate),
        Err(BrokerError::InvalidKey)
    ));

    control.release();
    let outcome = a.wait_for_set(&[key], Timeout::Infinite).unwrap();
    assert!(outcome.satisfied());

    // Reaped keys are no longer the context's
    assert!(matches!(
        a.wait_for_set(&[key], Timeout::Immediate),
        Err(BrokerError::InvalidKey)
    ));
}

#[test]
fn test_lenient_keys_count_as_satisfied() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let mut config = mock_config();
    config.wait.strict_keys = false;
    let (broker, _control) = mock_broker(config);

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let key = ctx.submit(&mut IoDescriptor::noop(disk)).unwrap();

    let outcome = ctx
        .wait_for_set(&[RequestKey::new(500, 1), key, key], Timeout::Infinite)
        .unwrap();
    assert!(outcome.satisfied());
    assert_eq!(outcome.completions.len(), 1);
    assert_eq!(outcome.completions[0].key, key);

    let outcome = ctx.wait_for_set(&[key], Timeout::Immediate).unwrap();
    assert!(outcome.satisfied());
    assert!(outcome.completions.is_empty());
}

#[test]
fn test_wait_times_out() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.hold();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let key = ctx.submit(&mut IoDescriptor::noop(disk)).unwrap();

    let outcome = ctx.wait_for_set(&[key], Timeout::Immediate).unwrap();
    assert!(outcome.flags.contains(IoResultFlags::TIMED_OUT));
    assert!(!outcome.satisfied());

    let start = Instant::now();
    let outcome = ctx
        .wait_for_set(&[key], Timeout::After(Duration::from_millis(50)))
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(outcome.flags.contains(IoResultFlags::TIMED_OUT));
    assert!(outcome.completions.is_empty());
    assert_eq!(ctx.status(key).unwrap(), StatusFlags::SUBMITTED);

    control.release();
    assert!(ctx.wait_for_set(&[key], Timeout::Infinite).unwrap().satisfied());
}

#[test]
fn test_interrupt_wakes_waiter() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.hold();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let key = ctx.submit(&mut IoDescriptor::noop(disk)).unwrap();

    let interrupter = ctx.interrupter();
    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        assert!(interrupter.interrupt());
    });
    let outcome = ctx.io(&mut [], &[key], 0, Timeout::Infinite, true).unwrap();
    waker.join().unwrap();
    assert!(outcome.flags.contains(IoResultFlags::INTERRUPTED));
    assert!(outcome.waited.is_empty());

    // The interrupt was consumed; the next wait runs to completion
    control.release();
    let outcome = ctx.wait_for_set(&[key], Timeout::Infinite).unwrap();
    assert!(outcome.satisfied());

    let interrupter = ctx.interrupter();
    drop(ctx);
    assert!(!interrupter.interrupt());
}

#[test]
fn test_uninterruptible_wait_ignores_interrupt() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.hold();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let key = ctx.submit(&mut IoDescriptor::noop(disk)).unwrap();

    assert!(ctx.interrupter().interrupt());
    let releaser = release_after(&control, Duration::from_millis(50));
    let outcome = ctx.io(&mut [], &[key], 0, Timeout::Infinite, false).unwrap();
    releaser.join().unwrap();
    assert!(outcome.flags.contains(IoResultFlags::WAIT_SATISFIED));
    assert!(!outcome.flags.contains(IoResultFlags::INTERRUPTED));
    assert_eq!(outcome.waited.len(), 1);
}

#[test]
fn test_drain_reaps_each_completion_once() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let mut config = mock_config();
    config.transport.completion_thread = false;
    let (broker, _control) = mock_broker(config);

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    for tag in 1..=3 {
        ctx.submit(&mut IoDescriptor::noop(disk).with_tag(tag)).unwrap();
    }

    let mut tags: Vec<u64> = std::iter::from_fn(|| ctx.drain_one()).map(|c| c.tag).collect();
    tags.sort();
    assert_eq!(tags, vec![1, 2, 3]);
    assert_eq!(broker.stats().reaped, 3);
    assert_eq!(broker.requests_in_use(), 0);
}

#[test]
fn test_io_multiplexes_submit_and_drain() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let mut config = mock_config();
    config.transport.completion_thread = false;
    let (broker, _control) = mock_broker(config);

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();

    let mut batch: Vec<IoDescriptor> = (0..4)
        .map(|i| IoDescriptor::write(disk, i * 8, buffer(8)).with_tag(i))
        .collect();
    let outcome = ctx.io(&mut batch, &[], 2, Timeout::Infinite, false).unwrap();
    assert!(batch.iter().all(|d| d.status == StatusFlags::SUBMITTED));
    assert!(outcome.flags.contains(IoResultFlags::WAIT_SATISFIED | IoResultFlags::DRAIN_FULL));
    assert!(!outcome.flags.contains(IoResultFlags::IDLE));
    assert_eq!(outcome.drained.len(), 2);

    let outcome = ctx.io(&mut [], &[], 8, Timeout::Immediate, false).unwrap();
    assert_eq!(outcome.drained.len(), 2);
    assert!(!outcome.flags.contains(IoResultFlags::DRAIN_FULL));
    assert!(outcome.flags.contains(IoResultFlags::IDLE));

    // Nothing in flight and nothing to drain
    let outcome = ctx.io(&mut [], &[], 8, Timeout::Infinite, false).unwrap();
    assert!(outcome.flags.contains(IoResultFlags::IDLE));
    assert!(outcome.drained.is_empty());
}

#[test]
fn test_io_reports_per_descriptor_failures() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, _control) = mock_broker(mock_config());

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();

    let mut batch = vec![
        IoDescriptor::noop(disk),
        IoDescriptor::noop(DiskHandle(42)),
        IoDescriptor::read(disk, 0, buffer(1)),
    ];
    let outcome = ctx.io(&mut batch, &[], 0, Timeout::Immediate, false).unwrap();
    assert!(outcome.flags.contains(IoResultFlags::WAIT_SATISFIED));
    assert!(outcome.drained.is_empty());

    assert_eq!(batch[0].status, StatusFlags::SUBMITTED);
    assert!(batch[1].status.contains(StatusFlags::LOCAL_ERROR));
    assert_eq!(batch[2].status, StatusFlags::SUBMITTED);

    let keys: Vec<RequestKey> = batch.iter().filter_map(|d| d.key).collect();
    assert_eq!(keys.len(), 2);
    let outcome = ctx.io(&mut [], &keys, 0, Timeout::Infinite, false).unwrap();
    assert_eq!(outcome.waited.len(), 2);
    assert!(outcome.flags.contains(IoResultFlags::IDLE));
}

#[test]
fn test_cancel_is_advisory() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.hold();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let key = ctx.submit(&mut IoDescriptor::read(disk, 0, buffer(1))).unwrap();

    ctx.cancel(key).unwrap();
    ctx.cancel(key).unwrap();
    let status = ctx.status(key).unwrap();
    assert!(status.contains(StatusFlags::SUBMITTED | StatusFlags::CANCELLED));
    assert!(!status.is_terminal());

    control.release();
    let outcome = ctx.wait_for_set(&[key], Timeout::Infinite).unwrap();
    let completion = &outcome.completions[0];
    assert!(completion.status.contains(StatusFlags::COMPLETED | StatusFlags::CANCELLED));
    assert_eq!(completion.error, 0);
    assert_eq!(broker.stats().cancelled, 1);

    assert!(matches!(ctx.cancel(key), Err(BrokerError::InvalidKey)));
}

#[test]
fn test_partial_transfer() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.set_bytes_per_op(512);

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let key = ctx.submit(&mut IoDescriptor::read(disk, 0, buffer(8))).unwrap();

    let outcome = ctx.wait_for_set(&[key], Timeout::Infinite).unwrap();
    let completion = &outcome.completions[0];
    assert!(completion.status.contains(StatusFlags::ERROR | StatusFlags::PARTIAL));
    assert!(!completion.status.contains(StatusFlags::COMPLETED));
    assert_eq!(completion.error, libc::EIO);
    assert_eq!(completion.transferred_blocks, 1);

    let stats = broker.stats();
    assert_eq!(stats.partial, 1);
    assert_eq!(stats.errored, 1);
}

#[test]
fn test_device_error_is_passed_through() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.set_fail_errno(Some(libc::ENOSPC));

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let key = ctx.submit(&mut IoDescriptor::write(disk, 0, buffer(1))).unwrap();

    let completion = ctx.wait_for_set(&[key], Timeout::Infinite).unwrap().completions.remove(0);
    assert!(completion.status.contains(StatusFlags::ERROR));
    assert!(!completion.is_success());
    assert_eq!(completion.error, libc::ENOSPC);
    assert_eq!(ErrorClass::of(completion.error), ErrorClass::Environment);
    assert!(completion.buffer.is_some());
}

#[test]
fn test_engine_refusal_unwinds_request() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.set_reject_submissions(true);

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let mut desc = IoDescriptor::write(disk, 0, buffer(1));

    assert!(matches!(ctx.submit(&mut desc), Err(BrokerError::Io(_))));
    assert!(desc.status.contains(StatusFlags::ERROR | StatusFlags::FREE));
    assert_eq!(desc.error, libc::EIO);
    assert!(desc.buffer.is_some());
    assert_eq!(broker.requests_in_use(), 0);
    assert_eq!(broker.outstanding_transfers(), 0);
    assert_eq!(ctx.in_flight(), 0);
    assert_eq!(ctx.disk_info(disk).unwrap().in_flight, 0);
}

#[test]
fn test_priority_reaches_engine() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let key = ctx
        .submit(&mut IoDescriptor::read(disk, 16, buffer(2)).with_priority(5))
        .unwrap();
    ctx.wait_for_set(&[key], Timeout::Infinite).unwrap();

    let ops = control.submitted_operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].priority, 5);
    assert_eq!(ops[0].offset, 16 * SECTOR_SIZE);
    assert_eq!(ops[0].length, 1024);
    assert_eq!(ops[0].user_data, key.0);
}

#[test]
fn test_stop_reclaims_attached_contexts() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, control) = mock_broker(mock_config());
    control.hold();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    ctx.submit(&mut IoDescriptor::noop(disk)).unwrap();

    let releaser = release_after(&control, Duration::from_millis(50));
    broker.stop().unwrap();
    releaser.join().unwrap();

    assert!(ctx.is_detached());
    assert!(matches!(ctx.open(&path), Err(BrokerError::Shutdown)));
    let mut desc = IoDescriptor::noop(disk);
    assert!(matches!(ctx.submit(&mut desc), Err(BrokerError::Shutdown)));
    assert!(matches!(
        ctx.io(&mut [IoDescriptor::noop(disk)], &[], 0, Timeout::Immediate, false),
        Err(BrokerError::Shutdown)
    ));
}

#[test]
fn test_concurrent_contexts() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let (broker, _control) = mock_broker(mock_config());

    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let broker = &broker;
            let path = &path;
            scope.spawn(move || {
                let ctx = broker.attach().unwrap();
                let disk = ctx.open(path).unwrap();
                let keys: Vec<RequestKey> = (0..16)
                    .map(|i| {
                        let block = worker * 64 + i * 4;
                        ctx.submit(&mut IoDescriptor::write(disk, block, buffer(4))).unwrap()
                    })
                    .collect();
                let outcome = ctx.wait_for_set(&keys, Timeout::Infinite).unwrap();
                assert!(outcome.satisfied());
                assert!(outcome.completions.iter().all(|c| c.is_success()));
            });
        }
    });

    assert_eq!(broker.attached_contexts(), 0);
    assert!(broker.disks().is_empty());
    let stats = broker.stats();
    assert_eq!(stats.submitted, 64);
    assert_eq!(stats.completed, 64);
    assert_eq!(stats.in_flight(), 0);
    assert_eq!(stats.latency_samples, 64);
}

#[test]
fn test_sync_engine_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let broker = Broker::start(BrokerConfig::default()).unwrap();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();

    let mut data = buffer(8);
    data.fill(FillPattern::Random(7));
    let key = ctx.submit(&mut IoDescriptor::write(disk, 16, data)).unwrap();
    assert!(ctx.wait_for_set(&[key], Timeout::Infinite).unwrap().satisfied());

    let key = ctx.submit(&mut IoDescriptor::read(disk, 16, buffer(8))).unwrap();
    let mut outcome = ctx.wait_for_set(&[key], Timeout::Infinite).unwrap();
    let completion = outcome.completions.remove(0);
    assert!(completion.is_success());
    let read_back = completion.buffer.unwrap();
    assert!(read_back.verify(FillPattern::Random(7)).is_ok());

    ctx.close(disk).unwrap();
    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[16 * 512..24 * 512], read_back.as_slice());
    assert!(raw[..16 * 512].iter().all(|&b| b == 0));

    drop(ctx);
    broker.stop().unwrap();
}

#[test]
fn test_sync_engine_without_completion_thread() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let mut config = BrokerConfig::default();
    config.transport.completion_thread = false;
    let broker = Broker::start(config).unwrap();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let mut data = buffer(1);
    data.fill(FillPattern::Sequential);
    let key = ctx.submit(&mut IoDescriptor::write(disk, 0, data)).unwrap();

    let outcome = ctx
        .wait_for_set(&[key], Timeout::After(Duration::from_secs(5)))
        .unwrap();
    assert!(outcome.satisfied());
    assert!(outcome.completions[0].elapsed_us < 5_000_000);
}

#[test]
fn test_drain_one_never_runs_transfers() {
    let dir = TempDir::new().unwrap();
    let path = image(&dir, "disk.img");
    let mut config = BrokerConfig::default();
    config.transport.completion_thread = false;
    let broker = Broker::start(config).unwrap();

    let ctx = broker.attach().unwrap();
    let disk = ctx.open(&path).unwrap();
    let mut data = buffer(1);
    data.fill(FillPattern::Ones);
    let key = ctx.submit(&mut IoDescriptor::write(disk, 4, data)).unwrap();

    assert!(ctx.drain_one().is_none());
    assert_eq!(ctx.in_flight(), 1);
    let raw = std::fs::read(&path).unwrap();
    assert!(raw[4 * 512..5 * 512].iter().all(|&b| b == 0));

    // A blocking wait drives the transfer
    let outcome = ctx
        .wait_for_set(&[key], Timeout::After(Duration::from_secs(5)))
        .unwrap();
    assert!(outcome.satisfied());
    let raw = std::fs::read(&path).unwrap();
    assert!(raw[4 * 512..5 * 512].iter().all(|&b| b == 0xff));
}

#[test]
fn test_attach_racing_stop_is_reclaimed() {
    let (broker, _control) = mock_broker(mock_config());
    let shared = broker.shared.clone();

    let (attached, reclaimed) = std::thread::scope(|s| {
        let attachers: Vec<_> = (0..4)
            .map(|_| {
                let shared = &shared;
                s.spawn(move || {
                    let mut ids = Vec::new();
                    for _ in 0..100_000 {
                        match shared.attach() {
                            Ok(ctx) => ids.push(ctx.id()),
                            Err(BrokerError::Shutdown) => break,
                            Err(err) => panic!("unexpected attach error: {}", err),
                        }
                    }
                    ids
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(2));
        let reclaimed = shared.stop_attaching();
        let attached: Vec<ContextId> = attachers.into_iter().flat_map(|h| h.join().unwrap()).collect();
        (attached, reclaimed)
    });

    assert!(matches!(broker.attach(), Err(BrokerError::Shutdown)));
    let reclaimed_ids: HashSet<ContextId> = reclaimed.iter().map(|ctx| ctx.id()).collect();
    assert!(attached.iter().all(|id| reclaimed_ids.contains(id)));
    assert_eq!(reclaimed_ids.len(), attached.len());
    assert_eq!(broker.attached_contexts(), 0);

    for ctx in reclaimed {
        ctx.detach();
    }
    broker.stop().unwrap();
}

//! Write/read-back exercise
//!
//! Drives a device through the broker the way a database client would: a
//! stream of multiplexed writes, each filled with its own seeded pattern, then
//! a read of every range written and a byte-for-byte check.

use crate::broker::{
    Broker, Completion, IoDescriptor, IoResultFlags, StatusFlags, Timeout, SECTOR_SIZE,
};
use crate::broker::{ClientContext, DiskInfo};
use crate::stats::StatsSnapshot;
use crate::util::buffer::{AlignedBuffer, FillPattern, DEFAULT_ALIGNMENT};
use crate::util::time::Timestamp;
use crate::Result;
use anyhow::Context;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long one multiplexed call may block before the loop re-checks
const ROUND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ExerciseOptions {
    pub writes: u64,
    /// Blocks of 512 bytes per transfer
    pub blocks: u64,
    pub start_block: u64,
    pub seed: u64,
}

/// Outcome of an exercise run
#[derive(Debug, Clone, Serialize)]
pub struct ExerciseReport {
    pub device: PathBuf,
    pub disk: DiskInfo,
    pub seed: u64,
    pub transfers: u64,
    pub bytes: u64,
    pub write_us: u64,
    pub read_us: u64,
    pub verified: u64,
    pub busy_retries: u64,
    pub stats: StatsSnapshot,
}

/// Write, read back and verify `options.writes` ranges of `path`
pub fn run_exercise(broker: &Broker, path: &Path, options: &ExerciseOptions) -> Result<ExerciseReport> {
    if options.writes == 0 || options.blocks == 0 {
        anyhow::bail!("exercise needs at least one write of at least one block");
    }

    let ctx = broker.attach()?;
    let disk = ctx
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let info = ctx.disk_info(disk)?;

    let end = options
        .writes
        .checked_mul(options.blocks)
        .and_then(|span| span.checked_add(options.start_block))
        .context("exercise range overflows")?;
    if end > info.sectors {
        anyhow::bail!(
            "exercise needs blocks {}..{} but {} has {}",
            options.start_block,
            end,
            path.display(),
            info.sectors
        );
    }

    let length = (options.blocks * SECTOR_SIZE) as usize;
    let drain = broker.config().transport.queue_depth;
    let pattern = |index: u64| FillPattern::Random(options.seed.wrapping_add(index));

    // Shuffled so the device sees the ranges out of order
    let mut order: Vec<u64> = (0..options.writes).collect();
    order.shuffle(&mut Xoshiro256PlusPlus::seed_from_u64(options.seed));

    let mut writes = Vec::with_capacity(order.len());
    for &index in &order {
        let mut buffer = AlignedBuffer::new(length, DEFAULT_ALIGNMENT)?;
        buffer.fill(pattern(index));
        let first_block = options.start_block + index * options.blocks;
        writes.push(IoDescriptor::write(disk, first_block, buffer).with_tag(index));
    }

    let started = Timestamp::now();
    let (written, mut busy_retries) = transfer_all(&ctx, writes, drain)?;
    let write_us = started.elapsed_micros();
    for completion in &written {
        check(completion)?;
    }
    tracing::info!(transfers = written.len(), elapsed_us = write_us, "writes complete");

    let mut reads = Vec::with_capacity(order.len());
    for &index in &order {
        let buffer = AlignedBuffer::new(length, DEFAULT_ALIGNMENT)?;
        let first_block = options.start_block + index * options.blocks;
        reads.push(IoDescriptor::read(disk, first_block, buffer).with_tag(index));
    }

    let started = Timestamp::now();
    let (read, retries) = transfer_all(&ctx, reads, drain)?;
    let read_us = started.elapsed_micros();
    busy_retries += retries;

    let mut verified = 0;
    for completion in &read {
        check(completion)?;
        let buffer = completion.buffer.as_ref().context("read completed without its buffer")?;
        if let Err(offset) = buffer.verify(pattern(completion.tag)) {
            anyhow::bail!(
                "verify failed at block {} byte {}",
                options.start_block + completion.tag * options.blocks,
                offset
            );
        }
        verified += 1;
    }
    tracing::info!(verified, elapsed_us = read_us, "read-back verified");

    ctx.close(disk)?;
    ctx.detach();

    Ok(ExerciseReport {
        device: path.to_path_buf(),
        disk: info,
        seed: options.seed,
        transfers: options.writes,
        bytes: options.writes * length as u64,
        write_us,
        read_us,
        verified,
        busy_retries,
        stats: broker.stats(),
    })
}

/// Push every descriptor through `io`, resubmitting those refused as busy
fn transfer_all(
    ctx: &ClientContext,
    descs: Vec<IoDescriptor>,
    drain: usize,
) -> Result<(Vec<Completion>, u64)> {
    let total = descs.len();
    let mut pending: VecDeque<IoDescriptor> = descs.into();
    let mut done = Vec::with_capacity(total);
    let mut busy_retries = 0;

    while done.len() < total {
        let take = pending.len().min(drain);
        let mut batch: Vec<IoDescriptor> = pending.drain(..take).collect();
        let outcome = ctx.io(&mut batch, &[], drain, Timeout::After(ROUND_TIMEOUT), false)?;

        for desc in batch {
            if desc.status == StatusFlags::SUBMITTED {
                continue;
            }
            if desc.status.contains(StatusFlags::BUSY) {
                busy_retries += 1;
                pending.push_back(desc);
                continue;
            }
            anyhow::bail!(
                "transfer {} refused with status {:?}, error {}",
                desc.tag,
                desc.status,
                desc.error
            );
        }

        let drained = outcome.drained.len();
        done.extend(outcome.drained);
        if drained == 0 && pending.is_empty() && outcome.flags.contains(IoResultFlags::IDLE) {
            anyhow::bail!("{} transfers never completed", total - done.len());
        }
    }

    Ok((done, busy_retries))
}

fn check(completion: &Completion) -> Result<()> {
    if !completion.is_success() {
        anyhow::bail!(
            "{} of range {} failed with status {:?}, error {}",
            completion.op,
            completion.tag,
            completion.status,
            completion.error
        );
    }
    Ok(())
}

//! Completion and wait engine
//!
//! Three ways to get requests back from a context:
//!
//! - [`ClientContext::wait_for_set`]: block until named requests are terminal
//! - [`ClientContext::drain_one`]: take any one completed request, never blocks
//! - [`ClientContext::io`]: submit, wait and drain in one call
//!
//! All of them reap: the request leaves the pool, gains `FREE`, and its
//! [`Completion`] (with the caller's buffer) goes back to the caller. A request
//! is reaped exactly once, by whichever call takes its key off the context's
//! completed list first.
//!
//! Drain order is most recently completed first. Do not depend on it.

use super::context::{ClientContext, ContextState};
use super::request::{Completion, IoDescriptor, IoResultFlags, RequestKey, Timeout};
use crate::error::{BrokerError, BrokerResult};
use crate::util::time::Deadline;
use parking_lot::MutexGuard;

/// Result of a wait for a set of requests
#[derive(Debug)]
pub struct WaitOutcome {
    pub flags: IoResultFlags,
    /// Reaped requests from the wait set, in no particular order
    pub completions: Vec<Completion>,
}

impl WaitOutcome {
    pub fn satisfied(&self) -> bool {
        self.flags.contains(IoResultFlags::WAIT_SATISFIED)
    }
}

/// Result of a multiplexed call
#[derive(Debug, Default)]
pub struct IoOutcome {
    pub flags: IoResultFlags,
    /// Requests from the wait set that were reaped
    pub waited: Vec<Completion>,
    /// Other completed requests drained, up to the drain capacity
    pub drained: Vec<Completion>,
}

impl ClientContext {
    /// Wait for every request in `keys` to reach a terminal status
    ///
    /// Returns early on timeout or interruption with whatever subset finished;
    /// requests still outstanding stay owned by the context. Keys that do not
    /// name a request of this context fail the whole call with `InvalidKey`,
    /// or count as already satisfied when `wait.strict_keys` is off.
    pub fn wait_for_set(&self, keys: &[RequestKey], timeout: Timeout) -> BrokerResult<WaitOutcome> {
        self.wait_keys(keys, &timeout.deadline(), true)
    }

    /// Take one completed request, if any
    ///
    /// Never runs transfers. Without a completion thread it first collects
    /// whatever the engine has already finished.
    pub fn drain_one(&self) -> Option<Completion> {
        if self.shared.must_drive() {
            self.shared.collect();
        }
        loop {
            let key = self.state.lock().completed.pop()?;
            if let Some(completion) = self.shared.reap(key) {
                return Some(completion);
            }
        }
    }

    /// Submit, then wait, then drain
    ///
    /// 1. Every descriptor in `submit` is submitted; per-descriptor failures
    ///    are reported in the descriptor and do not stop the call.
    /// 2. If `wait` is not empty, blocks until it is satisfied, the timeout
    ///    passes, or (when `interruptible`) the context is interrupted.
    /// 3. If `wait` is empty and `drain_capacity` is not zero, blocks until
    ///    at least one request has completed, under the same exits.
    /// 4. Drains up to `drain_capacity` completed requests without blocking.
    ///
    /// `IDLE` is reported when the context has nothing in flight and nothing
    /// left to reap.
    pub fn io(
        &self,
        submit: &mut [IoDescriptor],
        wait: &[RequestKey],
        drain_capacity: usize,
        timeout: Timeout,
        interruptible: bool,
    ) -> BrokerResult<IoOutcome> {
        for desc in submit.iter_mut() {
            if let Err(BrokerError::Shutdown) = self.submit(desc) {
                return Err(BrokerError::Shutdown);
            }
        }

        let deadline = timeout.deadline();
        let mut outcome = IoOutcome::default();

        if !wait.is_empty() {
            let waited = self.wait_keys(wait, &deadline, interruptible)?;
            outcome.flags |= waited.flags;
            outcome.waited = waited.completions;
        } else {
            outcome.flags |= IoResultFlags::WAIT_SATISFIED;
            if drain_capacity > 0 {
                outcome.flags |= self.wait_any(&deadline, interruptible);
            }
        }

        while outcome.drained.len() < drain_capacity {
            match self.drain_one() {
                Some(completion) => outcome.drained.push(completion),
                None => break,
            }
        }
        if drain_capacity > 0 && outcome.drained.len() == drain_capacity {
            outcome.flags |= IoResultFlags::DRAIN_FULL;
        }

        {
            let state = self.state.lock();
            if state.inflight.is_empty() && state.completed.is_empty() {
                outcome.flags |= IoResultFlags::IDLE;
            }
        }

        tracing::debug!(
            ctx = %self.id,
            flags = ?outcome.flags,
            waited = outcome.waited.len(),
            drained = outcome.drained.len(),
            "io call returned"
        );
        Ok(outcome)
    }

    pub(super) fn wait_keys(
        &self,
        keys: &[RequestKey],
        deadline: &Deadline,
        interruptible: bool,
    ) -> BrokerResult<WaitOutcome> {
        let strict = self.shared.config.wait.strict_keys;
        let mut state = self.state.lock();

        let mut pending: Vec<RequestKey> = Vec::with_capacity(keys.len());
        for key in keys {
            if state.owns(key) {
                if !pending.contains(key) {
                    pending.push(*key);
                }
            } else if strict {
                tracing::debug!(ctx = %self.id, key = %key, "wait on unknown key");
                return Err(BrokerError::InvalidKey);
            }
        }

        let mut done: Vec<RequestKey> = Vec::with_capacity(pending.len());
        let flags = loop {
            take_finished(&mut state, &mut pending, &mut done);

            if pending.is_empty() {
                break IoResultFlags::WAIT_SATISFIED;
            }
            if interruptible && self.take_interrupt() {
                break IoResultFlags::INTERRUPTED;
            }
            if deadline.expired() {
                break IoResultFlags::TIMED_OUT;
            }
            self.block(&mut state, deadline);
        };
        drop(state);

        let completions = done.into_iter().filter_map(|key| self.shared.reap(key)).collect();
        Ok(WaitOutcome { flags, completions })
    }

    /// Block until any request has completed
    fn wait_any(&self, deadline: &Deadline, interruptible: bool) -> IoResultFlags {
        let mut state = self.state.lock();
        loop {
            if !state.completed.is_empty() {
                return IoResultFlags::empty();
            }
            if state.inflight.is_empty() {
                return IoResultFlags::IDLE;
            }
            if interruptible && self.take_interrupt() {
                return IoResultFlags::INTERRUPTED;
            }
            if deadline.expired() {
                return IoResultFlags::TIMED_OUT;
            }
            self.block(&mut state, deadline);
        }
    }
}

/// Move keys that are no longer in flight from `pending` to `done`,
/// claiming them off the completed list
fn take_finished(
    state: &mut MutexGuard<'_, ContextState>,
    pending: &mut Vec<RequestKey>,
    done: &mut Vec<RequestKey>,
) {
    pending.retain(|key| {
        if state.inflight.contains(key) {
            return true;
        }
        // Gone from both lists means another caller reaped it
        if state.take_completed(key) {
            done.push(*key);
        }
        false
    });
}

//! Request pool
//!
//! A fixed arena of request slots with a free list. Each slot has its own lock,
//! so completions for different requests never contend. Slots are named by a
//! [`RequestKey`] whose generation half changes on every allocation.

use super::request::{Request, RequestKey};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    request: Option<Request>,
}

/// Fixed-capacity request arena
#[derive(Debug)]
pub(crate) struct RequestPool {
    slots: Vec<Mutex<Slot>>,
    free: Mutex<Vec<u32>>,
}

impl RequestPool {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Mutex::new(Slot::default())).collect();
        // Reversed so low slots are handed out first
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free: Mutex::new(free),
        }
    }

    /// Take a free slot and fill it with the request built for its key
    ///
    /// The slot comes back locked. Returns None when the pool is exhausted.
    pub fn insert(
        &self,
        build: impl FnOnce(RequestKey) -> Request,
    ) -> Option<(RequestKey, MappedMutexGuard<'_, Request>)> {
        let index = self.free.lock().pop()?;
        let mut slot = self.slots[index as usize].lock();
        slot.generation = slot.generation.wrapping_add(1);
        let key = RequestKey::new(index, slot.generation);
        let request = MutexGuard::map(slot, |slot| slot.request.insert(build(key)));
        Some((key, request))
    }

    /// Lock the request named by `key`
    ///
    /// None if the key is stale or out of range.
    pub fn get(&self, key: RequestKey) -> Option<MappedMutexGuard<'_, Request>> {
        let slot = self.slots.get(key.index() as usize)?.lock();
        if slot.generation != key.generation() {
            return None;
        }
        MutexGuard::try_map(slot, |slot| slot.request.as_mut()).ok()
    }

    /// Take the request named by `key` out of the pool and free its slot
    pub fn remove(&self, key: RequestKey) -> Option<Request> {
        let request = {
            let mut slot = self.slots.get(key.index() as usize)?.lock();
            if slot.generation != key.generation() {
                return None;
            }
            slot.request.take()?
        };
        self.free.lock().push(key.index());
        Some(request)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.lock().len()
    }
}

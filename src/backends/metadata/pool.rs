// SPDX-License-Identifier: GPL-3.0-only

//! Bounded metadata pool
//!
//! Hands out at most `capacity` live entries. When the pool is empty,
//! `acquire` waits on a condition variable until an entry is returned or the
//! timeout elapses, so exhaustion surfaces as an error instead of a hang.

use super::{MetadataHandle, MetadataResult, MetadataStore, ReleaseHook, TagMap};
use crate::errors::MetadataError;
use crate::multicam::types::FrameNumber;
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct PoolState {
    /// Ids of entries currently handed out
    outstanding: HashSet<u64>,
    next_id: u64,
}

struct PoolShared {
    capacity: usize,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl ReleaseHook for PoolShared {
    fn released(&self, entry_id: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.outstanding.remove(&entry_id) {
            warn!(entry = entry_id, "Metadata entry released twice");
        }
        drop(state);
        self.returned.notify_one();
    }
}

/// Fixed-capacity, reference-counted metadata store
#[derive(Clone)]
pub struct MetadataPool {
    shared: Arc<PoolShared>,
    timeout: Duration,
}

impl MetadataPool {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        debug!(capacity, ?timeout, "Creating metadata pool");
        Self {
            shared: Arc::new(PoolShared {
                capacity,
                state: Mutex::new(PoolState {
                    outstanding: HashSet::new(),
                    next_id: 1,
                }),
                returned: Condvar::new(),
            }),
            timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Entries currently held by some owner
    pub fn outstanding(&self) -> usize {
        self.lock_state().outstanding.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetadataStore for MetadataPool {
    fn acquire(&self, frame_number: FrameNumber) -> MetadataResult<MetadataHandle> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.lock_state();

        loop {
            if state.outstanding.len() < self.shared.capacity {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    frame = frame_number,
                    capacity = self.shared.capacity,
                    "Metadata pool exhausted"
                );
                return Err(MetadataError::Timeout(self.timeout));
            }

            let (guard, _) = self
                .shared
                .returned
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.outstanding.insert(id);
        drop(state);

        let hook: Arc<dyn ReleaseHook> = self.shared.clone();
        Ok(MetadataHandle::with_hook(
            id,
            frame_number,
            TagMap::new(),
            Some(hook),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::metadata::{Tag, TagValue};
    use std::thread;

    #[test]
    fn test_entry_returns_when_last_handle_drops() {
        let pool = MetadataPool::new(2, Duration::from_millis(10));
        let handle = pool.acquire(1).unwrap();
        let clone = handle.clone();
        assert_eq!(pool.outstanding(), 1);

        pool.release(handle);
        assert_eq!(pool.outstanding(), 1);
        drop(clone);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let pool = MetadataPool::new(1, Duration::from_millis(20));
        let _held = pool.acquire(1).unwrap();

        let started = Instant::now();
        let result = pool.acquire(2);
        assert!(matches!(result, Err(MetadataError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let pool = MetadataPool::new(1, Duration::from_secs(2));
        let held = pool.acquire(1).unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(held);
        });

        let handle = pool.acquire(2).unwrap();
        assert_eq!(handle.frame_number(), 2);
        releaser.join().unwrap();
    }

    #[test]
    fn test_store_accessors_use_entry() {
        let pool = MetadataPool::new(1, Duration::from_millis(10));
        let handle = pool.acquire(9).unwrap();
        pool.set_tag(&handle, Tag::LuxIndex, TagValue::Float(3.5));

        assert_eq!(pool.find_tag(&handle, Tag::LuxIndex), Some(TagValue::Float(3.5)));
        let blob = pool.translate_to_wire_format(&handle).unwrap();
        assert_eq!(
            blob.decode().unwrap().get(&Tag::LuxIndex),
            Some(&TagValue::Float(3.5))
        );
    }
}

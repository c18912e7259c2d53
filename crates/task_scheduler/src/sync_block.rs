//! The task sync-block pool.
//!
//! Every task needs a `(Mutex, Condvar, completion flag)` triple so
//! [`crate::task::Task::wait`] has something to block on, but allocating one
//! per task would cost roughly 40 bytes and an allocator round-trip per
//! task. Instead the scheduler pre-allocates a fixed array of blocks once
//! and hands tasks a 16-bit handle into it, exactly the way
//! `synca::EntryList` hands out short handles into a flat array elsewhere in
//! this codebase.

use std::sync::{Condvar, Mutex};

use concurrent_queue::ConcurrentQueue;

use crate::error::{SchedulerError, SchedulerResult};

/// Default static capacity of the sync-block pool.
pub const DEFAULT_SYNC_BLOCK_POOL_CAPACITY: usize = 16 * 1024;

/// A short handle into the sync-block pool's flat array.
///
/// Handles are unique while held. After `release`, a later `acquire` may
/// hand the same numeric handle back out; this is safe only because no task
/// still holds a reference to the old block at that point (enforced by the
/// pool being the sole owner of the array and tasks only ever referencing a
/// block through the pool plus their own handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncHandle(u16);

impl SyncHandle {
    /// The handle's raw numeric value, mostly useful for logging.
    pub fn raw(self) -> u16 {
        self.0
    }
}

/// The `(mutex, condvar, completion flag)` triple a task waits on.
#[derive(Debug, Default)]
pub struct SyncBlock {
    completed: Mutex<bool>,
    condvar: Condvar,
}

impl SyncBlock {
    fn reset(&self) {
        let mut completed = self.completed.lock().unwrap();
        *completed = false;
    }

    /// Marks the block completed and wakes every waiter. Must be called
    /// after the owning task has set its `Finished` state bit, and the
    /// caller must not be holding any other lock that a waiter might need
    /// to make progress.
    pub fn mark_completed(&self) {
        let mut completed = self.completed.lock().unwrap();
        *completed = true;
        self.condvar.notify_all();
    }

    /// Blocks the calling thread until [`SyncBlock::mark_completed`] has
    /// been called. Returns immediately, without ever touching the condvar,
    /// if the block is already completed.
    pub fn wait(&self) {
        let mut completed = self.completed.lock().unwrap();
        while !*completed {
            completed = self.condvar.wait(completed).unwrap();
        }
    }

    /// Non-blocking check of the completion flag.
    pub fn is_completed(&self) -> bool {
        *self.completed.lock().unwrap()
    }
}

/// Fixed-capacity pool of [`SyncBlock`]s, indexed by [`SyncHandle`].
pub struct SyncBlockPool {
    blocks: Vec<SyncBlock>,
    free: ConcurrentQueue<u16>,
    capacity: usize,
}

impl std::fmt::Debug for SyncBlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBlockPool")
            .field("capacity", &self.capacity)
            .field("open_slots", &self.free.len())
            .finish()
    }
}

impl SyncBlockPool {
    /// Builds a pool with the given static capacity. Zero capacity is
    /// rejected as a configuration error: a scheduler with no sync blocks
    /// could never create a task.
    pub fn new(capacity: usize) -> SchedulerResult<Self> {
        if capacity == 0 {
            return Err(SchedulerError::InvalidConfiguration {
                reason: "sync-block pool capacity must be non-zero".into(),
            });
        }
        if capacity > u16::MAX as usize + 1 {
            return Err(SchedulerError::InvalidConfiguration {
                reason: format!(
                    "sync-block pool capacity {capacity} exceeds the 16-bit handle space ({})",
                    u16::MAX as usize + 1
                ),
            });
        }

        let free = ConcurrentQueue::bounded(capacity);
        let mut blocks = Vec::with_capacity(capacity);
        for handle in 0..capacity {
            blocks.push(SyncBlock::default());
            // capacity was checked against u16 range by the caller path
            // (Scheduler::new); push cannot fail here since the queue is
            // sized to exactly `capacity`.
            let _ = free.push(handle as u16);
        }

        Ok(Self {
            blocks,
            free,
            capacity,
        })
    }

    /// The pool's static capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many handles are currently free.
    pub fn open_slots(&self) -> usize {
        self.free.len()
    }

    /// Pops a handle from the free list and reinitializes its block.
    /// Returns `Err` rather than blocking or growing the pool when the
    /// pool is exhausted; callers that treat this as fatal (task creation)
    /// should `expect` it.
    pub fn try_acquire(&self) -> SchedulerResult<SyncHandle> {
        match self.free.pop() {
            Ok(raw) => {
                let handle = SyncHandle(raw);
                self.blocks[raw as usize].reset();
                Ok(handle)
            }
            Err(_) => {
                ewe_trace::error!(
                    "sync-block pool exhausted (capacity {})",
                    self.capacity
                );
                Err(SchedulerError::SyncBlockPoolExhausted {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Like [`SyncBlockPool::try_acquire`] but panics on exhaustion. Task
    /// construction treats pool exhaustion as unrecoverable; callers that
    /// want the `Result` instead should go through `try_acquire` directly.
    pub fn acquire(&self) -> SyncHandle {
        self.try_acquire()
            .unwrap_or_else(|err| panic!("{err}"))
    }

    /// Returns a handle to the free list. No block reset is needed here;
    /// `try_acquire` reinitializes on the way out.
    pub fn release(&self, handle: SyncHandle) {
        // The queue is bounded to exactly `capacity` slots and a handle is
        // only ever released once, so this cannot fail.
        let _ = self.free.push(handle.0);
    }

    /// O(1) lookup of the block behind a handle.
    pub fn block_of(&self, handle: SyncHandle) -> &SyncBlock {
        &self.blocks[handle.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_round_trips() {
        let pool = SyncBlockPool::new(4).unwrap();
        assert_eq!(pool.open_slots(), 4);

        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_eq!(pool.open_slots(), 2);
        assert_ne!(a, b);

        pool.release(a);
        assert_eq!(pool.open_slots(), 3);

        pool.release(b);
        assert_eq!(pool.open_slots(), 4);
    }

    #[test]
    fn exhaustion_is_reported_not_panicked() {
        let pool = SyncBlockPool::new(1).unwrap();
        let handle = pool.try_acquire().unwrap();
        let err = pool.try_acquire().unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::SyncBlockPoolExhausted { capacity: 1 }
        ));

        pool.release(handle);
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            SyncBlockPool::new(0),
            Err(SchedulerError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn reacquired_handle_starts_fresh() {
        let pool = SyncBlockPool::new(1).unwrap();
        let handle = pool.try_acquire().unwrap();
        pool.block_of(handle).mark_completed();
        assert!(pool.block_of(handle).is_completed());

        pool.release(handle);
        let handle2 = pool.try_acquire().unwrap();
        assert!(!pool.block_of(handle2).is_completed());
    }

    #[test]
    fn wait_returns_immediately_once_completed() {
        let pool = SyncBlockPool::new(1).unwrap();
        let handle = pool.try_acquire().unwrap();
        pool.block_of(handle).mark_completed();
        // Must not block.
        pool.block_of(handle).wait();
    }
}

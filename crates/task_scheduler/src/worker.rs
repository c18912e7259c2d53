//! A single worker OS thread: its private LIFO queue and its main loop.
//!
//! Grounded on `valtron::executors::threads`'s thread-bookkeeping idioms
//! (atomic counters read with `Acquire`/`AcqRel`, a `ConcurrentQueue`-backed
//! shared structure, `tracing`-gated lifecycle logging) generalized from a
//! single shared work queue into the private-queue-then-shared-queue fetch
//! order the scheduler's affinity model requires.
//!
//! A worker's private queue and please-look counter are guarded by its own
//! mutex, but the condition variable it blocks on is the one *shared* by
//! every worker of its class (owned by `SchedulerShared`): any worker of a
//! class can service that class's shared queue, so a shared condvar lets a
//! single `notify_one` wake whichever one of them happens to be parked,
//! instead of always the same worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::ThreadId;

use crate::affinity::AffinityClass;
use crate::scheduler::SchedulerShared;
use crate::task::AnyTask;

struct WorkerState {
    please_look: usize,
    private_queue: VecDeque<Arc<dyn AnyTask>>,
}

/// The cross-thread-visible half of a worker thread: everything a producer
/// or the scheduler needs to push work at a specific worker or check its
/// idleness, without needing the `JoinHandle` itself.
pub(crate) struct WorkerHandle {
    pub(crate) class: AffinityClass,
    pub(crate) index: usize,
    thread_id: OnceLock<ThreadId>,
    state: Mutex<WorkerState>,
    executing: AtomicBool,
}

impl WorkerHandle {
    pub(crate) fn new(class: AffinityClass, index: usize) -> Self {
        Self {
            class,
            index,
            thread_id: OnceLock::new(),
            state: Mutex::new(WorkerState {
                please_look: 0,
                private_queue: VecDeque::new(),
            }),
            executing: AtomicBool::new(false),
        }
    }

    /// Set once, immediately after `thread::Builder::spawn` returns (a
    /// `JoinHandle` carries its thread's id without waiting for the thread
    /// body to run), so this is always populated before any other code can
    /// observe the `WorkerHandle` at all.
    pub(crate) fn set_thread_id(&self, id: ThreadId) {
        let _ = self.thread_id.set(id);
    }

    pub(crate) fn thread_id(&self) -> Option<ThreadId> {
        self.thread_id.get().copied()
    }

    /// Pushes directly onto this worker's private queue, bypassing its
    /// class's shared queue entirely. Used by `Scheduler::run_on_thread`,
    /// which is responsible for waking the class's condvar afterwards (with
    /// `notify_all`, since the condvar is shared across the class and this
    /// specific worker must be among those that wake up and recheck).
    pub(crate) fn force_push(&self, task: Arc<dyn AnyTask>) {
        let mut state = self.state.lock().unwrap();
        state.private_queue.push_back(task);
        state.please_look += 1;
    }

    /// Bumps the please-look counter. Used when a task became ready on this
    /// worker's class's shared queue; the caller wakes the class's shared
    /// condvar separately once every worker of the class has been bumped.
    pub(crate) fn bump_please_look(&self) {
        let mut state = self.state.lock().unwrap();
        state.please_look += 1;
    }

    /// Busy-waits until this worker is between tasks. Used by
    /// `Scheduler::wait_idle` after its class's shared queue has drained,
    /// to close the window between a worker popping the last task and
    /// actually finishing it.
    pub(crate) fn wait_idle(&self) {
        while self.executing.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
    }
}

/// The body every worker OS thread runs until the scheduler shuts down.
pub(crate) fn run_loop(handle: Arc<WorkerHandle>, shared: Arc<SchedulerShared>) {
    ewe_trace::info!(
        "worker thread for {:?}#{} starting",
        handle.class,
        handle.index
    );

    loop {
        let task = {
            let mut state = handle.state.lock().unwrap();
            loop {
                if state.please_look > 0 {
                    if let Some(task) = state.private_queue.pop_back() {
                        state.please_look -= 1;
                        break Some(task);
                    }
                    if let Some(task) = shared.try_fetch_next(handle.class) {
                        state.please_look -= 1;
                        break Some(task);
                    }
                    // Woken but nothing to do (another worker of the same
                    // class already took it): drop the stale signal rather
                    // than spin on it.
                    state.please_look = 0;
                }
                if shared.is_terminating() {
                    break None;
                }
                state = shared.class_condvar(handle.class).wait(state).unwrap();
            }
        };

        match task {
            Some(task) => {
                handle.executing.store(true, Ordering::Release);
                task.execute();
                handle.executing.store(false, Ordering::Release);
            }
            None => break,
        }
    }

    ewe_trace::info!(
        "worker thread for {:?}#{} exiting",
        handle.class,
        handle.index
    );
}

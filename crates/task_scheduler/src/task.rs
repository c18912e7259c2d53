//! The task object: state bits, the dependency/continuation graph, and
//! execution.
//!
//! Grounded on `valtron::executors::task::TaskStatus` for the idea of
//! representing a task's lifecycle as a small piece of state read by both
//! the producer and the worker, generalized here into three independent,
//! monotonic bits (`InQueue`, `Started`, `Finished`) packed into a single
//! `AtomicU8` instead of an enum, since a task's blocker count can change
//! concurrently with its queue/started/finished transitions and an enum
//! can't represent that overlap cleanly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::affinity::AffinityClass;
use crate::scheduler::SchedulerShared;
use crate::sync_block::SyncHandle;

const IN_QUEUE: u8 = 0b001;
const STARTED: u8 = 0b010;
const FINISHED: u8 = 0b100;

/// Type-erased handle to a task, used wherever the scheduler needs to hold
/// or traverse tasks without knowing their concrete `Task<R, A>` type: the
/// shared per-class queues, a worker's private queue, and the
/// dependency/continuation graph all store `Arc<dyn AnyTask>`.
///
/// Kept crate-private: the public surface is [`Task`] and
/// [`crate::Scheduler`] only.
pub(crate) trait AnyTask: Send + Sync {
    fn name(&self) -> &str;
    fn affinity(&self) -> AffinityClass;
    fn is_queued(&self) -> bool;
    fn is_started(&self) -> bool;
    fn is_finished(&self) -> bool;
    fn is_ready(&self) -> bool;
    fn decrement_blocker(&self);
    fn try_mark_queued(&self) -> bool;
    fn forward_neighbors(&self) -> Vec<Arc<dyn AnyTask>>;
    fn backward_neighbor(&self) -> Option<Arc<dyn AnyTask>>;
    fn wait_for_finish(&self);
    fn execute(self: Arc<Self>);
}

/// A unit of work bound to one [`AffinityClass`], producing an `R` from an
/// `A`.
///
/// Cheaply `Clone` (it's an `Arc` handle); cloning does not duplicate the
/// underlying task, so `join`/`then` on any clone observe and mutate the
/// same state.
pub struct Task<R, A> {
    pub(crate) inner: Arc<TaskInner<R, A>>,
}

impl<R, A> Clone for Task<R, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R, A> std::fmt::Debug for Task<R, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("affinity", &self.inner.affinity)
            .field("queued", &self.inner.is_queued())
            .field("started", &self.inner.is_started())
            .field("finished", &self.inner.is_finished())
            .finish()
    }
}

pub(crate) struct TaskInner<R, A> {
    name: String,
    affinity: AffinityClass,
    state: AtomicU8,
    blockers: AtomicUsize,
    scheduler: Arc<SchedulerShared>,
    sync_handle: SyncHandle,
    callable: Mutex<Option<Box<dyn FnOnce(A) -> R + Send>>>,
    arg: Mutex<Option<A>>,
    result: Mutex<Option<R>>,
    /// Cleared at completion: weak back-references used once, to decrement
    /// a dependent's blocker count.
    dependents: Mutex<Vec<Weak<dyn AnyTask>>>,
    /// Persistent: weak forward links used by chain expansion at submit
    /// time. Not cleared at completion, since a late `run()` on a sibling
    /// of an already-finished predecessor still needs to find this task.
    chained_next: Mutex<Vec<Weak<dyn AnyTask>>>,
    /// Persistent: the single strong backward link that keeps a
    /// not-yet-run predecessor alive as long as this task is alive.
    chained_prev: Mutex<Option<Arc<dyn AnyTask>>>,
    /// Closures that copy this task's result into a continuation's argument
    /// slot. Hold the continuation only weakly: a strong ref here paired
    /// with the continuation's strong `chained_prev` back-link would be a
    /// reference cycle.
    chain_publishers: Mutex<Vec<Box<dyn FnOnce(&R) + Send>>>,
}

impl<R, A> Drop for TaskInner<R, A> {
    fn drop(&mut self) {
        self.scheduler.pool.release(self.sync_handle);
    }
}

pub(crate) fn build_task<R, A>(
    scheduler: Arc<SchedulerShared>,
    name: String,
    affinity: AffinityClass,
    callable: Box<dyn FnOnce(A) -> R + Send>,
    arg: Option<A>,
) -> Task<R, A>
where
    R: Send + Clone + 'static,
    A: Send + 'static,
{
    let sync_handle = scheduler.pool.acquire();
    let inner = Arc::new(TaskInner {
        name,
        affinity,
        state: AtomicU8::new(0),
        blockers: AtomicUsize::new(0),
        scheduler,
        sync_handle,
        callable: Mutex::new(Some(callable)),
        arg: Mutex::new(arg),
        result: Mutex::new(None),
        dependents: Mutex::new(Vec::new()),
        chained_next: Mutex::new(Vec::new()),
        chained_prev: Mutex::new(None),
        chain_publishers: Mutex::new(Vec::new()),
    });
    Task { inner }
}

impl<R, A> TaskInner<R, A>
where
    R: Send + Clone + 'static,
    A: Send + 'static,
{
    /// Adds `dep` to this task's dependent set unless this task has already
    /// finished. The check and the push happen under the same lock, so a
    /// concurrent completion can never drain the dependent list without
    /// seeing an entry added before it started draining, nor can a caller
    /// add an entry after draining has started and have it silently lost:
    /// whichever side acquires the lock second observes a state left
    /// consistent by the side that acquired it first.
    fn register_dependent(&self, dep: Weak<dyn AnyTask>) -> bool {
        let mut deps = self.dependents.lock().unwrap();
        if self.state.load(Ordering::Acquire) & FINISHED != 0 {
            return false;
        }
        deps.push(dep);
        true
    }

    fn complete_dependents_and_finish(&self) {
        let mut buckets: HashMap<usize, (AffinityClass, usize)> = HashMap::new();
        {
            let mut deps = self.dependents.lock().unwrap();
            let drained = std::mem::take(&mut *deps);
            for weak_dep in drained {
                if let Some(dep) = weak_dep.upgrade() {
                    dep.decrement_blocker();
                    let class = dep.affinity();
                    buckets.entry(class.index()).or_insert((class, 0)).1 += 1;
                }
            }
            // Set Finished while still holding the dependents lock, so that
            // register_dependent's finished-check and this drain can never
            // interleave in a way that loses a wakeup (see register_dependent).
            self.state.fetch_or(FINISHED, Ordering::AcqRel);
        }

        for (_, (class, count)) in buckets {
            self.scheduler.notify(class, count > 1);
        }

        self.scheduler.pool.block_of(self.sync_handle).mark_completed();
    }
}

impl<R, A> AnyTask for TaskInner<R, A>
where
    R: Send + Clone + 'static,
    A: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn affinity(&self) -> AffinityClass {
        self.affinity
    }

    fn is_queued(&self) -> bool {
        self.state.load(Ordering::Acquire) & IN_QUEUE != 0
    }

    fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) & STARTED != 0
    }

    fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) & FINISHED != 0
    }

    fn is_ready(&self) -> bool {
        let bits = self.state.load(Ordering::Acquire);
        bits & (STARTED | FINISHED) == 0 && self.blockers.load(Ordering::Acquire) == 0
    }

    fn decrement_blocker(&self) {
        self.blockers.fetch_sub(1, Ordering::AcqRel);
    }

    fn try_mark_queued(&self) -> bool {
        let prev = self.state.fetch_or(IN_QUEUE, Ordering::AcqRel);
        prev & IN_QUEUE == 0
    }

    fn forward_neighbors(&self) -> Vec<Arc<dyn AnyTask>> {
        self.chained_next
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn backward_neighbor(&self) -> Option<Arc<dyn AnyTask>> {
        self.chained_prev.lock().unwrap().clone()
    }

    fn wait_for_finish(&self) {
        self.scheduler.pool.block_of(self.sync_handle).wait();
    }

    fn execute(self: Arc<Self>) {
        self.state.fetch_or(STARTED, Ordering::AcqRel);
        ewe_trace::debug!("task '{}' started on {:?}", self.name, self.affinity);

        let callable = self
            .callable
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| panic!("task '{}' has no callable to run (executed twice?)", self.name));
        let arg = self
            .arg
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| panic!("task '{}' ran with an empty argument slot", self.name));

        let result = callable(arg);

        // Publish to continuations before this task becomes visible as
        // finished: a continuation can only become ready once its argument
        // slot is populated, and that must happen-before the blocker
        // decrement in complete_dependents_and_finish.
        let publishers = std::mem::take(&mut *self.chain_publishers.lock().unwrap());
        for publisher in publishers {
            publisher(&result);
        }

        *self.result.lock().unwrap() = Some(result);

        self.complete_dependents_and_finish();
        ewe_trace::debug!("task '{}' finished", self.name);
    }
}

impl<R, A> Task<R, A>
where
    R: Send + Clone + 'static,
    A: Send + 'static,
{
    /// The task's diagnostic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The affinity class this task will run on.
    pub fn affinity(&self) -> AffinityClass {
        self.inner.affinity
    }

    /// Whether the task has been submitted (via `run`, directly or as part
    /// of someone else's chain expansion) but hasn't started yet.
    pub fn is_queued(&self) -> bool {
        self.inner.is_queued()
    }

    /// Whether a worker has popped and begun executing this task.
    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// Whether the task's callable has returned.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Registers `self` as a dependent of `other`: `self` will not become
    /// ready until `other` finishes. A no-op if `other` has already
    /// finished (there is nothing left to wait for).
    pub fn join<R2, A2>(&self, other: &Task<R2, A2>)
    where
        R2: Send + Clone + 'static,
        A2: Send + 'static,
    {
        let self_weak: Weak<dyn AnyTask> = Arc::downgrade(&self.inner);
        if other.inner.register_dependent(self_weak) {
            self.inner.blockers.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Builds a continuation that runs `f` with this task's result once it
    /// finishes, on `affinity`. If this task has already finished, the
    /// result is copied into the continuation's argument slot immediately
    /// and the continuation is submitted right away if this task was ever
    /// submitted in the first place.
    pub fn then<R2, F>(&self, name: impl Into<String>, affinity: AffinityClass, f: F) -> Task<R2, R>
    where
        R2: Send + Clone + 'static,
        F: FnOnce(R) -> R2 + Send + 'static,
    {
        let next = build_task(
            self.inner.scheduler.clone(),
            name.into(),
            affinity,
            Box::new(f),
            None,
        );

        *next.inner.chained_prev.lock().unwrap() = Some(self.inner.clone());

        let next_weak: Weak<dyn AnyTask> = Arc::downgrade(&next.inner);
        self.inner.chained_next.lock().unwrap().push(next_weak.clone());

        if self.inner.register_dependent(next_weak) {
            next.inner.blockers.fetch_add(1, Ordering::AcqRel);
            let next_weak_for_publish: Weak<TaskInner<R2, R>> = Arc::downgrade(&next.inner);
            self.inner
                .chain_publishers
                .lock()
                .unwrap()
                .push(Box::new(move |result: &R| {
                    if let Some(next_inner) = next_weak_for_publish.upgrade() {
                        *next_inner.arg.lock().unwrap() = Some(result.clone());
                    }
                }));
            // self isn't finished (register_dependent said so), but it may
            // already be in-queue or started: a continuation attached after
            // run() but before completion still needs submitting here,
            // since self's own completion only decrements next's blocker
            // count, it never enqueues anything.
            if self.inner.is_queued() || self.inner.is_started() {
                self.inner.scheduler.submit_with_chain(next.inner.clone());
            }
        } else {
            // Already finished: copy the result across synchronously.
            let result = self.inner.result.lock().unwrap().clone();
            *next.inner.arg.lock().unwrap() = result;
            if self.inner.is_queued() || self.inner.is_started() {
                self.inner.scheduler.submit_with_chain(next.inner.clone());
            }
        }

        next
    }

    /// Submits this task (and, transitively, every task reachable through
    /// its chain edges that isn't already submitted) to the scheduler it
    /// was created from.
    pub fn run(&self) -> Self {
        self.inner.scheduler.submit_with_chain(self.inner.clone());
        self.clone()
    }

    /// Blocks the calling thread until this task finishes.
    pub fn wait(&self) {
        self.inner
            .scheduler
            .pool
            .block_of(self.inner.sync_handle)
            .wait();
    }

    /// Returns a clone of the task's result.
    ///
    /// # Panics
    /// Panics if the task has not finished yet; call [`Task::wait`] first
    /// if that isn't already guaranteed.
    pub fn get_result(&self) -> R {
        self.inner
            .result
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| panic!("get_result called on unfinished task '{}'", self.inner.name))
    }
}

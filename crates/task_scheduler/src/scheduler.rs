//! The scheduler itself: per-class shared queues, worker-thread ownership,
//! task creation, and the chain-expansion algorithm `run` uses.
//!
//! Grounded on `valtron::executors::threads::get_max_threads` for core-count
//! detection (`std::thread::available_parallelism`), deliberately without
//! that module's `VALTRON_NUM_THREADS` environment-variable override: this
//! scheduler's configuration surface is exactly [`SchedulerConfig`], nothing
//! ambient.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use crate::affinity::AffinityClass;
use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;
use crate::sync_block::SyncBlockPool;
use crate::task::{self, AnyTask, Task};
use crate::worker::{self, WorkerHandle};

/// The state shared, via `Arc`, between the [`Scheduler`] handle, every
/// worker thread's run loop, and every [`Task`] it creates.
pub(crate) struct SchedulerShared {
    shared_queues: [Mutex<VecDeque<Arc<dyn AnyTask>>>; AffinityClass::COUNT],
    workers_by_class: [Vec<Arc<WorkerHandle>>; AffinityClass::COUNT],
    /// One condvar per class, shared by every worker of that class: any
    /// worker of a class can service that class's shared queue, so a single
    /// `notify_one` should be free to wake whichever one of them happens to
    /// be parked, not always the same one.
    class_condvars: [Condvar; AffinityClass::COUNT],
    terminating: AtomicBool,
    main_thread_id: ThreadId,
    pub(crate) pool: Arc<SyncBlockPool>,
}

impl SchedulerShared {
    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    pub(crate) fn class_condvar(&self, class: AffinityClass) -> &Condvar {
        &self.class_condvars[class.index()]
    }

    fn enqueue(&self, task: Arc<dyn AnyTask>) {
        let class = task.affinity();
        ewe_trace::debug!("enqueueing task '{}' onto {:?}", task.name(), class);
        self.shared_queues[class.index()].lock().unwrap().push_back(task);
        self.notify(class, false);
    }

    /// Wakes one (or, if `broadcast`, every) worker of `class`. A no-op if
    /// `class` has no dedicated threads (`Main`, `FileSystem`): those are
    /// drained cooperatively instead.
    ///
    /// Every matching worker's please-look counter is bumped first,
    /// regardless of `broadcast`: the shared queue is shared, so whichever
    /// worker the condvar wakes up — not necessarily any particular one —
    /// must find its counter already nonzero. The wake itself goes through
    /// the class's single shared condvar, so `notify_one` can land on any
    /// parked worker of the class rather than being pinned to one.
    pub(crate) fn notify(&self, class: AffinityClass, broadcast: bool) {
        let workers = &self.workers_by_class[class.index()];
        for worker in workers {
            worker.bump_please_look();
        }
        if workers.is_empty() {
            return;
        }
        if broadcast {
            self.class_condvars[class.index()].notify_all();
        } else {
            self.class_condvars[class.index()].notify_one();
        }
    }

    /// Linear scan of `class`'s shared queue for the first ready task,
    /// removing and returning it. O(n) in the queue depth, by design: see
    /// the crate's concurrency-model docs for why that's an accepted
    /// trade-off here.
    pub(crate) fn try_fetch_next(&self, class: AffinityClass) -> Option<Arc<dyn AnyTask>> {
        let mut queue = self.shared_queues[class.index()].lock().unwrap();
        let pos = queue.iter().position(|task| task.is_ready())?;
        queue.remove(pos)
    }

    pub(crate) fn find_worker(&self, id: ThreadId) -> Option<Arc<WorkerHandle>> {
        for class in AffinityClass::ALL {
            for worker in &self.workers_by_class[class.index()] {
                if worker.thread_id() == Some(id) {
                    return Some(worker.clone());
                }
            }
        }
        None
    }

    fn identity(task: &Arc<dyn AnyTask>) -> usize {
        Arc::as_ptr(task) as *const () as usize
    }

    /// Breadth-first expansion over `task`'s chain edges (both directions),
    /// enqueueing every not-yet-submitted node reached. Excludes `task`
    /// itself: the caller is responsible for getting `task` into a queue by
    /// whatever means it chose (the class's shared queue for a plain
    /// `run`, a specific worker's private queue for `run_on_thread`).
    fn expand_chain_from(&self, task: Arc<dyn AnyTask>) {
        let mut frontier: VecDeque<Arc<dyn AnyTask>> = VecDeque::new();
        let mut visited: HashSet<usize> = HashSet::new();
        visited.insert(Self::identity(&task));
        frontier.extend(task.forward_neighbors());
        if let Some(prev) = task.backward_neighbor() {
            frontier.push_back(prev);
        }

        while let Some(node) = frontier.pop_front() {
            if !visited.insert(Self::identity(&node)) {
                continue;
            }
            if !node.is_queued() && !node.is_started() && node.try_mark_queued() {
                self.enqueue(node.clone());
            }
            frontier.extend(node.forward_neighbors());
            if let Some(prev) = node.backward_neighbor() {
                frontier.push_back(prev);
            }
        }
    }

    pub(crate) fn submit_with_chain(&self, task: Arc<dyn AnyTask>) {
        assert!(
            task.try_mark_queued(),
            "task '{}' has already been submitted",
            task.name()
        );
        self.enqueue(task.clone());
        self.expand_chain_from(task);
    }
}

/// The task-scheduling engine: owns one OS thread per `Render` and `RHI`
/// instance plus `n` `Worker` threads, and a per-class shared queue that
/// `Main` and `FileSystem` work sits in until something drains it
/// cooperatively.
///
/// Must be constructed on the thread that will be treated as `Main` for the
/// lifetime of the scheduler; [`Scheduler::is_main_thread`] and
/// [`Scheduler::current_thread_class`] are both defined relative to the
/// thread that called [`Scheduler::new`].
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    join_handles: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_worker_threads", &self.num_worker_threads())
            .field("is_main_thread", &self.is_main_thread())
            .finish()
    }
}

impl Scheduler {
    /// Builds a scheduler and spawns its dedicated threads: one `Render`,
    /// `config.n_rhi_threads()` `RHI`, and `max(1, cores - 2 - n_rhi)`
    /// `Worker` threads (or exactly `config.worker_count()` if that was set
    /// explicitly). `Main` and `FileSystem` never get a dedicated thread.
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        let main_thread_id = thread::current().id();
        let pool = Arc::new(SyncBlockPool::new(config.pool_capacity())?);

        let available = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let n_rhi = config.n_rhi();
        let n_worker = config
            .worker_override()
            .unwrap_or_else(|| available.saturating_sub(2 + n_rhi).max(1));

        let mut workers_by_class: [Vec<Arc<WorkerHandle>>; AffinityClass::COUNT] =
            std::array::from_fn(|_| Vec::new());
        workers_by_class[AffinityClass::Render.index()]
            .push(Arc::new(WorkerHandle::new(AffinityClass::Render, 0)));
        for i in 0..n_rhi {
            workers_by_class[AffinityClass::RHI.index()]
                .push(Arc::new(WorkerHandle::new(AffinityClass::RHI, i)));
        }
        for i in 0..n_worker {
            workers_by_class[AffinityClass::Worker.index()]
                .push(Arc::new(WorkerHandle::new(AffinityClass::Worker, i)));
        }

        let shared = Arc::new(SchedulerShared {
            shared_queues: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            workers_by_class,
            class_condvars: std::array::from_fn(|_| Condvar::new()),
            terminating: AtomicBool::new(false),
            main_thread_id,
            pool,
        });

        let mut join_handles = Vec::new();
        for class in AffinityClass::ALL {
            if !class.has_dedicated_thread() {
                continue;
            }
            for worker_handle in &shared.workers_by_class[class.index()] {
                let worker_handle = worker_handle.clone();
                let shared_for_thread = shared.clone();
                let join = thread::Builder::new()
                    .name(format!("{:?}-{}", class, worker_handle.index))
                    .spawn(move || worker::run_loop(worker_handle, shared_for_thread))
                    .expect("failed to spawn scheduler worker thread");
                shared.workers_by_class[class.index()][worker_handle_index(&shared, class, &join)]
                    .set_thread_id(join.thread().id());
                join_handles.push(join);
            }
        }

        Ok(Self {
            shared,
            join_handles: Mutex::new(Some(join_handles)),
        })
    }

    /// Creates a task with no predecessor argument: `callable` is invoked
    /// with `()`.
    pub fn create_task_with_result<R, F>(
        &self,
        name: impl Into<String>,
        affinity: AffinityClass,
        callable: F,
    ) -> Task<R, ()>
    where
        R: Send + Clone + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        task::build_task(
            self.shared.clone(),
            name.into(),
            affinity,
            Box::new(move |(): ()| callable()),
            Some(()),
        )
    }

    /// Creates a task whose argument is supplied directly at construction,
    /// rather than by a predecessor's result.
    pub fn create_task<R, A, F>(
        &self,
        name: impl Into<String>,
        affinity: AffinityClass,
        arg: A,
        callable: F,
    ) -> Task<R, A>
    where
        R: Send + Clone + 'static,
        A: Send + 'static,
        F: FnOnce(A) -> R + Send + 'static,
    {
        task::build_task(self.shared.clone(), name.into(), affinity, Box::new(callable), Some(arg))
    }

    /// Submits `task` (and its not-yet-submitted chain neighbors) for
    /// execution on its affinity class.
    pub fn run<R, A>(&self, task: &Task<R, A>)
    where
        R: Send + Clone + 'static,
        A: Send + 'static,
    {
        self.shared.submit_with_chain(task.inner.clone());
    }

    /// Submits `task` directly onto a specific thread's private queue
    /// instead of its class's shared queue. `target_thread_id` must be the
    /// id of a thread this scheduler owns, or the main thread id — in the
    /// latter case `task`'s affinity must be `Main`. Chain neighbors are
    /// still expanded normally, through their own classes' shared queues.
    pub fn run_on_thread<R, A>(&self, task: &Task<R, A>, target_thread_id: ThreadId)
    where
        R: Send + Clone + 'static,
        A: Send + 'static,
    {
        let erased: Arc<dyn AnyTask> = task.inner.clone();
        assert!(
            erased.try_mark_queued(),
            "task '{}' has already been submitted",
            erased.name()
        );

        if target_thread_id == self.shared.main_thread_id {
            assert_eq!(
                erased.affinity(),
                AffinityClass::Main,
                "run_on_thread targeted the main thread with a non-Main task"
            );
            self.shared.enqueue(erased.clone());
        } else if let Some(worker) = self.shared.find_worker(target_thread_id) {
            worker.force_push(erased.clone());
            // notify_all, not notify_one: the condvar is shared by every
            // worker of this class, and notify_one could land on an idle
            // sibling instead of the one we just force-pushed onto.
            self.shared.class_condvars[worker.class.index()].notify_all();
        } else {
            panic!("run_on_thread: target_thread_id matches no worker this scheduler owns");
        }

        self.shared.expand_chain_from(erased);
    }

    /// Cooperatively drains `class`'s shared queue on the calling thread,
    /// running every ready task until the queue is empty. The primary way
    /// `Main` and `FileSystem` work (neither has a dedicated thread) ever
    /// executes.
    pub fn drain_class(&self, class: AffinityClass) {
        while let Some(task) = self.shared.try_fetch_next(class) {
            task.execute();
        }
    }

    /// Equivalent to `drain_class(AffinityClass::Main)`, named for the
    /// common case of a host application's per-frame pump.
    pub fn process_main_thread_tasks(&self) {
        self.drain_class(AffinityClass::Main);
    }

    /// Blocks until `class`'s shared queue is empty and every worker of
    /// that class is idle. Calling this for `Main` from the main thread
    /// drains it instead of blocking, since nothing else will ever drain
    /// it.
    pub fn wait_idle(&self, class: AffinityClass) {
        if class == AffinityClass::Main && self.is_main_thread() {
            self.process_main_thread_tasks();
            return;
        }

        loop {
            let snapshot: Vec<Arc<dyn AnyTask>> = {
                let queue = self.shared.shared_queues[class.index()].lock().unwrap();
                queue.iter().cloned().collect()
            };
            if snapshot.is_empty() {
                break;
            }
            for task in snapshot {
                task.wait_for_finish();
            }
        }

        for worker in &self.shared.workers_by_class[class.index()] {
            worker.wait_idle();
        }
    }

    /// Number of tasks currently sitting in `class`'s shared queue
    /// (excludes whatever is sitting in a worker's private queue).
    pub fn num_tasks(&self, class: AffinityClass) -> u32 {
        self.shared.shared_queues[class.index()].lock().unwrap().len() as u32
    }

    /// Total number of dedicated OS threads this scheduler owns across all
    /// classes (`Render` + `RHI` + `Worker`; `Main` and `FileSystem` are
    /// never counted, having no dedicated thread).
    pub fn num_worker_threads(&self) -> u32 {
        AffinityClass::ALL
            .iter()
            .map(|class| self.shared.workers_by_class[class.index()].len())
            .sum::<usize>() as u32
    }

    /// Thread ids of every dedicated thread in `class`, in spawn order.
    pub fn worker_thread_ids(&self, class: AffinityClass) -> Vec<ThreadId> {
        self.shared.workers_by_class[class.index()]
            .iter()
            .filter_map(|worker| worker.thread_id())
            .collect()
    }

    /// The affinity class of the calling thread, or `None` if it's neither
    /// the main thread nor one of this scheduler's dedicated threads.
    pub fn current_thread_class(&self) -> Option<AffinityClass> {
        let id = thread::current().id();
        if id == self.shared.main_thread_id {
            return Some(AffinityClass::Main);
        }
        for class in AffinityClass::ALL {
            for worker in &self.shared.workers_by_class[class.index()] {
                if worker.thread_id() == Some(id) {
                    return Some(class);
                }
            }
        }
        None
    }

    /// Whether the calling thread is the one that constructed this
    /// scheduler.
    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.shared.main_thread_id
    }

    /// The thread id captured at construction.
    pub fn main_thread_id(&self) -> ThreadId {
        self.shared.main_thread_id
    }

    /// The single `Render`-class thread's id.
    pub fn render_thread_id(&self) -> ThreadId {
        self.shared.workers_by_class[AffinityClass::Render.index()][0]
            .thread_id()
            .expect("render thread id is set before Scheduler::new returns")
    }

    /// Sets the terminating flag, wakes every dedicated thread, and joins
    /// them. Idempotent: calling this more than once (or letting `Drop` do
    /// it after an explicit call) is harmless.
    pub fn shutdown(&self) {
        self.shared.terminating.store(true, Ordering::SeqCst);
        for class in AffinityClass::ALL {
            self.shared.class_condvars[class.index()].notify_all();
        }
        if let Some(handles) = self.join_handles.lock().unwrap().take() {
            for handle in handles {
                let _ = handle.join();
            }
        }
        self.drain_class(AffinityClass::Main);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Helper used only while spawning: the index of the worker in its class's
/// `Vec` whose handle we just launched, identified by the freshly-known
/// thread id not yet being set on any entry. Exists purely to avoid moving
/// `worker_handle` into the closure and also needing it afterward.
fn worker_handle_index(shared: &SchedulerShared, class: AffinityClass, join: &JoinHandle<()>) -> usize {
    shared.workers_by_class[class.index()]
        .iter()
        .position(|w| w.thread_id().is_none())
        .unwrap_or_else(|| {
            panic!(
                "no unset worker handle left for newly spawned {:?} thread {:?}",
                class,
                join.thread().id()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    // Reads `available_parallelism`, which is process-global machine state;
    // kept off the default parallel test run to avoid flaking under load
    // from whatever else cargo is running concurrently.
    #[serial]
    fn default_worker_count_follows_the_documented_formula() {
        let scheduler = Scheduler::new(SchedulerConfig::new().n_rhi_threads(1)).unwrap();
        let available = thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let expected_workers = available.saturating_sub(2 + 1).max(1);
        // Render (1) + RHI (1) + Worker (expected_workers).
        assert_eq!(scheduler.num_worker_threads() as usize, 2 + expected_workers);
    }

    #[test]
    fn new_spawns_configured_thread_counts() {
        let scheduler = Scheduler::new(
            SchedulerConfig::new().worker_count(3).n_rhi_threads(1),
        )
        .unwrap();
        assert_eq!(scheduler.num_worker_threads(), 3 + 1 + 1);
        assert!(scheduler.is_main_thread());
        assert_eq!(scheduler.current_thread_class(), Some(AffinityClass::Main));
    }

    #[test]
    fn run_executes_a_task_on_a_worker() {
        let scheduler = Scheduler::new(SchedulerConfig::new().worker_count(2)).unwrap();
        let task = scheduler.create_task_with_result("t", AffinityClass::Worker, || 7);
        scheduler.run(&task);
        task.wait();
        assert_eq!(task.get_result(), 7);
    }

    #[test]
    fn main_class_work_only_runs_when_drained() {
        let scheduler = Scheduler::new(SchedulerConfig::new().worker_count(1)).unwrap();
        let task = scheduler.create_task_with_result("m", AffinityClass::Main, || 1);
        scheduler.run(&task);
        assert_eq!(scheduler.num_tasks(AffinityClass::Main), 1);
        assert!(!task.is_finished());

        scheduler.process_main_thread_tasks();
        assert!(task.is_finished());
        assert_eq!(scheduler.num_tasks(AffinityClass::Main), 0);
    }

    #[test]
    fn filesystem_class_is_addressable_but_undriven_by_default() {
        let scheduler = Scheduler::new(SchedulerConfig::new().worker_count(1)).unwrap();
        assert_eq!(scheduler.num_worker_threads(), 1 + 1 + 2);
        let task = scheduler.create_task_with_result("f", AffinityClass::FileSystem, || 1);
        scheduler.run(&task);
        assert_eq!(scheduler.num_tasks(AffinityClass::FileSystem), 1);
        scheduler.drain_class(AffinityClass::FileSystem);
        assert!(task.is_finished());
    }
}

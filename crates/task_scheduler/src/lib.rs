//! Multi-threaded, typed, dependency-aware task execution engine.
//!
//! A [`Scheduler`] owns one OS thread per `Render`/`RHI`/`Worker` instance
//! (see [`AffinityClass`]) plus a sync-block pool tasks borrow a
//! `(Mutex, Condvar, completion flag)` triple from. Producers build a
//! [`Task`] with [`Scheduler::create_task`] or
//! [`Scheduler::create_task_with_result`], wire it up with [`Task::join`]
//! (wait for another task) and [`Task::then`] (typed continuation), then
//! call [`Task::run`] to enqueue it and the rest of its chain.
//!
//! `Main` and `FileSystem` tasks never get a dedicated thread; they sit in
//! their class's shared queue until something calls
//! [`Scheduler::drain_class`] (or its `Main`-specific spelling,
//! [`Scheduler::process_main_thread_tasks`]) on the thread meant to run them.
//!
//! A callable that panics is not caught here; it unwinds the worker thread
//! that ran it. Callables that can fail should encode that in their result
//! type rather than panicking.

mod affinity;
mod config;
mod error;
mod scheduler;
mod sync_block;
mod task;
mod worker;

pub use affinity::AffinityClass;
pub use config::{SchedulerConfig, DEFAULT_N_RHI_THREADS};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::Scheduler;
pub use sync_block::{SyncHandle, DEFAULT_SYNC_BLOCK_POOL_CAPACITY};
pub use task::Task;

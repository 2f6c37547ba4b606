use std::time::Duration;

use super::{Shared, WorkerHook};
use super::sync::{Arc, Ordering};
use super::task::TaskTraits;
use super::worker::is_pool_thread;
use crate::config;
use crate::error::{PoolError, PostError};
use crate::handle::TaskHandle;
use crate::runner::{SequencedTaskRunner, TaskRunner};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ThreadPoolId(pub(crate) u32);

/// A reference to a thread pool.
///
/// The pool is joined when the last reference goes away. Task runners don't keep
/// the pool alive: their posts are rejected once it is joined.
#[derive(Clone)]
pub struct ThreadPool {
    pub(crate) shared: Arc<Shared>,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            worker_capacity: std::thread::available_parallelism().map_or(4, |n| n.get()),
            reclaim_time: Duration::from_secs(30),
            max_background_sequences: usize::MAX,
            may_block_threshold: Duration::from_millis(10),
            start_handler: None,
            exit_handler: None,
            name_handler: Box::new(|idx| format!("Worker#{}", idx)),
            stack_size: None,
        }
    }

    /// Post a task that may run in parallel with other tasks.
    ///
    /// Returns false if the task was rejected because the pool is shutting down.
    #[track_caller]
    pub fn post_task<F>(&self, traits: TaskTraits, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.create_task_runner(traits).post_task(f)
    }

    #[track_caller]
    pub fn post_delayed_task<F>(&self, traits: TaskTraits, f: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.create_task_runner(traits).post_delayed_task(f, delay)
    }

    #[track_caller]
    pub fn submit<F, T>(&self, traits: TaskTraits, f: F) -> Result<TaskHandle<T>, PostError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.create_task_runner(traits).submit(f)
    }

    pub fn create_task_runner(&self, traits: TaskTraits) -> TaskRunner {
        TaskRunner::new(self.shared.pool.clone(), traits)
    }

    pub fn create_sequenced_task_runner(&self, traits: TaskTraits) -> SequencedTaskRunner {
        SequencedTaskRunner::new(self.shared.pool.clone(), traits)
    }

    /// Start shutting down.
    ///
    /// From now on only `BlockShutdown` tasks are accepted and tasks that haven't
    /// started are skipped unless they block shutdown. Panics if shutdown was already
    /// started.
    pub fn begin_shutdown(&self) -> ShutdownHandle {
        self.shared.task_tracker.start_shutdown();

        ShutdownHandle { shared: Arc::clone(&self.shared) }
    }

    /// Shut down and block until all `BlockShutdown` tasks and all running
    /// `SkipOnShutdown` tasks completed.
    ///
    /// Panics if called twice or from one of the pool's threads.
    pub fn shutdown(&self) {
        self.begin_shutdown().wait();
    }

    /// Block until all the tasks posted so far ran or were skipped. Delayed tasks
    /// are only waited for once their delay expired.
    ///
    /// Panics if called from one of the pool's threads.
    pub fn flush(&self) {
        if self.shared.joined.load(Ordering::Acquire) {
            return;
        }

        self.shared.task_tracker.flush();
    }

    /// Stop the worker threads and wait for them to exit.
    ///
    /// Tasks that haven't run are dropped, and posting fails from now on. This is done
    /// automatically when the last reference to the pool is dropped.
    pub fn join(&self) {
        self.shared.join();
    }

    /// Idle worker threads are kept until the pool is joined.
    pub fn disallow_worker_cleanup(&self) {
        self.shared.pool.disallow_worker_cleanup();
    }

    pub fn has_shutdown_started(&self) -> bool {
        self.shared.task_tracker.has_shutdown_started()
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shared.task_tracker.is_shutdown_complete()
    }

    pub fn id(&self) -> ThreadPoolId {
        self.shared.id
    }

    pub fn stats(&self) -> ThreadPoolStats {
        let pool = &self.shared.pool;
        ThreadPoolStats {
            worker_capacity: pool.worker_capacity(),
            num_workers: pool.num_workers(),
            num_idle_workers: pool.num_idle_workers(),
            num_queued_sequences: pool.num_queued_sequences(),
            num_delayed_tasks: self.shared.delayed_task_manager.num_pending(),
            num_tasks_run: self.shared.task_tracker.num_tasks_run(),
            num_tasks_skipped: self.shared.task_tracker.num_tasks_skipped(),
        }
    }
}

/// A snapshot of the state of a thread pool.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadPoolStats {
    pub worker_capacity: usize,
    pub num_workers: usize,
    pub num_idle_workers: usize,
    pub num_queued_sequences: usize,
    pub num_delayed_tasks: usize,
    pub num_tasks_run: u64,
    pub num_tasks_skipped: u64,
}

pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    /// Block until shutdown completes.
    pub fn wait(self) {
        assert!(!is_pool_thread(), "waiting for shutdown from a thread of the pool would deadlock");
        self.shared.task_tracker.complete_shutdown();
    }
}

pub struct ThreadPoolBuilder {
    pub(crate) worker_capacity: usize,
    pub(crate) reclaim_time: Duration,
    pub(crate) max_background_sequences: usize,
    pub(crate) may_block_threshold: Duration,
    pub(crate) start_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) exit_handler: Option<Box<dyn WorkerHook>>,
    pub(crate) name_handler: Box<dyn Fn(u32) -> String + Send + Sync>,
    pub(crate) stack_size: Option<usize>,
}

impl ThreadPoolBuilder {
    pub fn with_start_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.start_handler = Some(Box::new(handler));

        self
    }

    pub fn with_exit_handler<F>(mut self, handler: F) -> Self
    where F: Fn(u32) + Send + Sync + 'static
    {
        self.exit_handler = Some(Box::new(handler));

        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where F: Fn(u32) -> String + Send + Sync + 'static
    {
        self.name_handler = Box::new(handler);

        self
    }

    /// The number of tasks that may run concurrently when none of them is blocked.
    pub fn with_worker_capacity(mut self, capacity: usize) -> Self {
        self.worker_capacity = capacity.max(1);

        self
    }

    /// How long a worker may stay idle before its thread is reclaimed.
    pub fn with_reclaim_time(mut self, reclaim_time: Duration) -> Self {
        self.reclaim_time = reclaim_time;

        self
    }

    /// The maximum number of background sequences that may be scheduled at once.
    pub fn with_max_background_sequences(mut self, max: usize) -> Self {
        self.max_background_sequences = max.max(1);

        self
    }

    /// How long a `MayBlock` call must last before the worker capacity is raised.
    pub fn with_may_block_threshold(mut self, threshold: Duration) -> Self {
        self.may_block_threshold = threshold;

        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);

        self
    }

    /// Override the current settings with the ones found in environment variables.
    ///
    /// See the `config` module for the list of variables.
    pub fn from_env(self) -> Self {
        let worker_capacity = config::env_get(config::WORKERS_VAR, self.worker_capacity);
        let reclaim_time = config::env_get_millis(config::RECLAIM_MS_VAR, self.reclaim_time);
        let max_background = config::env_get(config::MAX_BACKGROUND_VAR, self.max_background_sequences);
        let may_block_threshold = config::env_get_millis(config::MAY_BLOCK_THRESHOLD_MS_VAR, self.may_block_threshold);

        self.with_worker_capacity(worker_capacity)
            .with_reclaim_time(reclaim_time)
            .with_max_background_sequences(max_background)
            .with_may_block_threshold(may_block_threshold)
    }

    pub fn build(self) -> Result<ThreadPool, PoolError> {
        crate::core::init(self)
    }
}

#[test]
fn builder_from_env() {
    std::env::set_var(config::WORKERS_VAR, "3");
    std::env::set_var(config::MAY_BLOCK_THRESHOLD_MS_VAR, "25");
    std::env::set_var(config::MAX_BACKGROUND_VAR, "not a number");

    let builder = ThreadPool::builder()
        .with_max_background_sequences(2)
        .from_env();

    std::env::remove_var(config::WORKERS_VAR);
    std::env::remove_var(config::MAY_BLOCK_THRESHOLD_MS_VAR);
    std::env::remove_var(config::MAX_BACKGROUND_VAR);

    assert_eq!(builder.worker_capacity, 3);
    assert_eq!(builder.may_block_threshold, Duration::from_millis(25));
    assert_eq!(builder.max_background_sequences, 2);
    assert_eq!(builder.reclaim_time, Duration::from_secs(30));
}

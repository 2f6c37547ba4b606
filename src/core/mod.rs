pub mod task;
pub mod sequence;
pub mod priority_queue;
pub mod task_tracker;
pub mod blocking;
pub mod delayed;
pub mod worker;
pub mod worker_pool;
pub mod thread_pool;
/// basic std::sync types reexported here so that we can hook loom into them for
/// testing.
pub mod sync;

use sync::{Arc, AtomicBool, Ordering};
use thread_pool::{ThreadPool, ThreadPoolBuilder, ThreadPoolId};
use task_tracker::TaskTracker;
use delayed::DelayedTaskManager;
use worker::is_pool_thread;
use worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::error::PoolError;

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_THREADPOOL_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

/// Data owned by the `ThreadPool` handles.
///
/// The worker pool, and everything reachable from it, is also referenced by the
/// workers and the task runners, so dropping this is what stops the threads.
pub(crate) struct Shared {
    pub id: ThreadPoolId,
    /// Admission and shutdown.
    pub task_tracker: Arc<TaskTracker>,
    /// Holds delayed tasks until they are ripe.
    pub delayed_task_manager: Arc<DelayedTaskManager>,
    pub pool: WorkerPool,
    pub joined: AtomicBool,
}

impl Shared {
    pub fn join(&self) {
        if self.joined.swap(true, Ordering::AcqRel) {
            return;
        }

        // Joining from one of our own threads would deadlock, stop them without waiting.
        let join_threads = !is_pool_thread();

        // Also stops the delayed task manager.
        self.pool.join(join_threads);

        tracing::debug!(pool = self.id.0, join_threads, "thread pool joined");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.join();
    }
}

pub(crate) fn init(params: ThreadPoolBuilder) -> Result<ThreadPool, PoolError> {
    let id = ThreadPoolId(NEXT_THREADPOOL_ID.fetch_add(1, Ordering::Relaxed));

    let task_tracker = Arc::new(TaskTracker::new(params.max_background_sequences));
    let delayed_task_manager = DelayedTaskManager::new();

    let pool = WorkerPool::new(
        task_tracker.clone(),
        delayed_task_manager.clone(),
        WorkerPoolConfig {
            name_handler: params.name_handler,
            stack_size: params.stack_size,
            start_handler: params.start_handler,
            exit_handler: params.exit_handler,
            may_block_threshold: params.may_block_threshold,
        },
    );

    let shared = Arc::new(Shared {
        id,
        task_tracker,
        delayed_task_manager,
        pool,
        joined: AtomicBool::new(false),
    });

    let delayed_thread_name = format!("seqpool#{}-delayed", id.0);
    shared.delayed_task_manager.start(delayed_thread_name.clone())
        .map_err(|source| PoolError::Spawn { name: delayed_thread_name, source })?;

    // On failure, dropping `shared` stops whatever was started.
    shared.pool.start(params.worker_capacity, params.reclaim_time)?;

    tracing::debug!(
        pool = id.0,
        worker_capacity = params.worker_capacity,
        max_background_sequences = params.max_background_sequences,
        "thread pool created",
    );

    Ok(ThreadPool { shared })
}

pub trait WorkerHook: Send + Sync {
    fn run(&self, worker_id: u32);
}

impl<F> WorkerHook for F where F: Fn(u32) + Send + Sync + 'static {
    fn run(&self, worker_id: u32) { self(worker_id) }
}

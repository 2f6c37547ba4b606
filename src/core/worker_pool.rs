//! The worker pool
//!
//! Owns the worker threads and the priority queue of sequences ready to run.
//!
//! Workers are created lazily, up to the worker capacity. A worker that runs out of
//! work pushes itself on the idle stack and parks, and posting work wakes the most
//! recently idle worker first so that the workers deep in the stack stay idle long
//! enough to be reclaimed.
//!
//! The capacity is elastic: while workers are blocked (see `ScopedBlockingCall`) the
//! capacity is raised so that other work can make progress, and lowered again when
//! they unblock. Workers in excess of the capacity are suspended: they don't pick up
//! work until enough running workers go idle.
//!
//! Lock order: pool state, then priority queue transaction, then per-worker blocking
//! state. The task tracker's lock is never taken while holding any of these.

use std::cell::RefCell;
use std::mem;
use std::time::{Duration, Instant};

use super::blocking::{self, BlockingObserver, BlockingType, ScopedBlockingCall, ScopedBlockingPermission};
use super::delayed::DelayedTaskManager;
use super::priority_queue::PriorityQueue;
use super::sequence::Sequence;
use super::sync::{Arc, AtomicBool, Mutex, MutexGuard, Ordering, thread};
use super::task::{deadline_after, Task};
use super::task_tracker::{CanScheduleSequenceObserver, TaskTracker};
use super::worker::{WorkerDelegate, WorkerThread};
use super::WorkerHook;
use crate::error::PoolError;
use crate::util::join_thread;

// Idle workers that can't be reclaimed sleep this long, unless woken up.
const MAX_SLEEP_TIME: Duration = Duration::from_secs(60 * 60);

thread_local! {
    static CURRENT_POOL: RefCell<Option<WorkerPool>> = RefCell::new(None);
}

pub(crate) struct WorkerPoolConfig {
    pub name_handler: Box<dyn Fn(u32) -> String + Send + Sync>,
    pub stack_size: Option<usize>,
    pub start_handler: Option<Box<dyn WorkerHook>>,
    pub exit_handler: Option<Box<dyn WorkerHook>>,
    pub may_block_threshold: Duration,
}

struct IdleWorker {
    worker: Arc<WorkerThread>,
    since: Instant,
}

struct PoolState {
    workers: Vec<Arc<WorkerThread>>,
    /// Most recently idle worker at the end.
    idle: Vec<IdleWorker>,
    worker_capacity: usize,
    reclaim_time: Duration,
    started: bool,
    cleanup_allowed: bool,
    adjuster_scheduled: bool,
    next_worker_id: u32,
    /// Threads of reclaimed workers that may still be exiting.
    reclaimed_threads: Vec<thread::JoinHandle<()>>,
}

impl PoolState {
    fn num_running_workers(&self) -> usize {
        self.workers.len().saturating_sub(self.idle.len())
    }

    fn idle_position(&self, worker: &Arc<WorkerThread>) -> Option<usize> {
        self.idle.iter().position(|idle| Arc::ptr_eq(&idle.worker, worker))
    }

    fn push_idle(&mut self, worker: &Arc<WorkerThread>) {
        // The previous top of the stack becomes reclaimable, and may be sleeping
        // without a timeout.
        if let Some(top) = self.idle.last() {
            top.worker.wake_up();
        }
        self.idle.push(IdleWorker { worker: worker.clone(), since: Instant::now() });
    }

    fn join_finished_threads(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = mem::take(&mut self.reclaimed_threads)
            .into_iter()
            .partition(|handle| handle.is_finished());
        self.reclaimed_threads = running;

        for handle in finished {
            join_thread(handle);
        }
    }
}

struct Inner {
    task_tracker: Arc<TaskTracker>,
    delayed_task_manager: Arc<DelayedTaskManager>,
    priority_queue: PriorityQueue,
    state: Mutex<PoolState>,
    join_started: AtomicBool,
    config: WorkerPoolConfig,
}

/// A reference to a worker pool.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    pub fn new(
        task_tracker: Arc<TaskTracker>,
        delayed_task_manager: Arc<DelayedTaskManager>,
        config: WorkerPoolConfig,
    ) -> Self {
        WorkerPool {
            inner: Arc::new(Inner {
                task_tracker,
                delayed_task_manager,
                priority_queue: PriorityQueue::new(),
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                    idle: Vec::new(),
                    worker_capacity: 0,
                    reclaim_time: Duration::ZERO,
                    started: false,
                    cleanup_allowed: true,
                    adjuster_scheduled: false,
                    next_worker_id: 0,
                    reclaimed_threads: Vec::new(),
                }),
                join_started: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// The pool that owns the calling worker thread, if any.
    pub fn current() -> Option<WorkerPool> {
        CURRENT_POOL.with(|pool| pool.borrow().clone())
    }

    #[cfg(test)]
    pub fn ptr_eq(&self, other: &WorkerPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap()
    }

    /// Create the initial workers: one per sequence already queued plus one standby,
    /// up to the capacity.
    pub fn start(&self, worker_capacity: usize, reclaim_time: Duration) -> Result<(), PoolError> {
        assert!(worker_capacity > 0);

        let mut state = self.lock_state();
        assert!(!state.started, "the worker pool was already started");

        state.worker_capacity = worker_capacity;
        state.reclaim_time = reclaim_time;
        state.started = true;

        let num_queued = self.inner.priority_queue.begin_transaction().len();
        let num_initial_workers = worker_capacity.min(num_queued + 1);
        for _ in 0..num_initial_workers {
            self.create_worker_locked(&mut state)?;
        }

        tracing::debug!(worker_capacity, ?reclaim_time, num_initial_workers, "worker pool started");

        Ok(())
    }

    /// Post a task to a sequence.
    ///
    /// Returns false if the task was rejected, in which case it is dropped.
    pub fn post_task_with_sequence(&self, task: Task, sequence: Arc<Sequence>) -> bool {
        if self.inner.join_started.load(Ordering::Acquire) {
            return false;
        }

        if !self.inner.task_tracker.will_post_task(&task) {
            return false;
        }

        if task.is_delayed() {
            let pool = self.clone();
            let added = self.inner.delayed_task_manager.add_delayed_task(task, move |task| {
                pool.inner.task_tracker.will_queue_ripe_delayed_task();
                pool.post_task_with_sequence_now(task, sequence);
            });
            if !added {
                // The pool is being joined.
                self.inner.task_tracker.discard_delayed_tasks(1);
            }
        } else {
            self.post_task_with_sequence_now(task, sequence);
        }

        true
    }

    /// Push an accepted task into its sequence and schedule the sequence if the
    /// task made it non-empty.
    pub fn post_task_with_sequence_now(&self, task: Task, sequence: Arc<Sequence>) {
        if !sequence.push_task(task) {
            // Already scheduled, running, or deferred by the task tracker.
            return;
        }

        if let Some(sequence) = self.inner.task_tracker.will_schedule_sequence(sequence, self) {
            self.push_sequence_and_wake(sequence);
        }
    }

    fn push_sequence_and_wake(&self, sequence: Arc<Sequence>) {
        if self.push_sequence(sequence) {
            let mut state = self.lock_state();
            self.wake_one_worker_locked(&mut state);
        }
    }

    /// Put a sequence that still has work back in the queue without waking anyone:
    /// the worker that ran it is about to look for work again.
    fn reenqueue_sequence(&self, sequence: Arc<Sequence>) {
        self.push_sequence(sequence);
    }

    /// Push a scheduled sequence into the priority queue, or discard its tasks if the
    /// pool was joined. Returns false in the latter case.
    fn push_sequence(&self, sequence: Arc<Sequence>) -> bool {
        let sort_key = sequence.sort_key();
        {
            // Checked under the transaction so that `join` can't miss the sequence.
            let mut transaction = self.inner.priority_queue.begin_transaction();
            if !self.inner.join_started.load(Ordering::Acquire) {
                transaction.push(sequence, sort_key);
                return true;
            }
        }

        self.inner.task_tracker.discard_sequence(sequence, true);

        false
    }

    /// Returns false if no worker could be woken or created.
    fn wake_one_worker_locked(&self, state: &mut PoolState) -> bool {
        if !state.started || self.inner.join_started.load(Ordering::Acquire) {
            return false;
        }

        if state.num_running_workers() >= state.worker_capacity {
            return false;
        }

        if let Some(idle) = state.idle.pop() {
            idle.worker.wake_up();
            return true;
        }

        if state.workers.len() < state.worker_capacity {
            if let Err(error) = self.create_worker_locked(state) {
                tracing::error!(%error, "failed to create a worker");
                return false;
            }
            return true;
        }

        false
    }

    /// Wake or create workers until there are enough for the queued sequences or
    /// the capacity is reached.
    fn wake_workers_for_pending_work_locked(&self, state: &mut PoolState) {
        let num_queued = self.inner.priority_queue.begin_transaction().len();
        for _ in 0..num_queued {
            if !self.wake_one_worker_locked(state) {
                break;
            }
        }
    }

    fn create_worker_locked(&self, state: &mut PoolState) -> Result<(), PoolError> {
        let id = state.next_worker_id;
        state.next_worker_id += 1;

        let name = (self.inner.config.name_handler)(id);
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(stack_size) = self.inner.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let delegate = Arc::new(PoolWorkerDelegate { pool: self.clone() });

        let worker = WorkerThread::spawn(id, builder, delegate)
            .map_err(|source| PoolError::Spawn { name, source })?;

        state.workers.push(worker);
        tracing::debug!(worker = id, num_workers = state.workers.len(), "created a worker");

        Ok(())
    }

    fn get_work(&self, worker: &Arc<WorkerThread>) -> Option<Arc<Sequence>> {
        profiling::scope!("get_work");

        let mut state = self.lock_state();
        if worker.should_exit() || self.inner.join_started.load(Ordering::Acquire) {
            return None;
        }

        let idle_position = state.idle_position(worker);

        if let Some(position) = idle_position {
            if self.can_cleanup_locked(&state, position) {
                self.cleanup_locked(&mut state, position);
                return None;
            }
        }

        // A worker that isn't on the idle stack counts itself as running.
        let num_running_others = state.num_running_workers().saturating_sub(idle_position.map_or(1, |_| 0));
        if num_running_others >= state.worker_capacity {
            // Suspended until a running worker goes idle or the capacity grows.
            if idle_position.is_none() {
                state.push_idle(worker);
            }
            return None;
        }

        let sequence = self.inner.priority_queue.begin_transaction().pop_sequence();
        match (sequence, idle_position) {
            (Some(sequence), Some(position)) => {
                state.idle.remove(position);
                Some(sequence)
            }
            (Some(sequence), None) => Some(sequence),
            (None, Some(_)) => None,
            (None, None) => {
                state.push_idle(worker);
                None
            }
        }
    }

    fn can_cleanup_locked(&self, state: &PoolState, idle_position: usize) -> bool {
        let is_top_of_idle_stack = idle_position + 1 == state.idle.len();
        let over_capacity = state.workers.len() > state.worker_capacity;

        state.idle[idle_position].since.elapsed() >= state.reclaim_time
            && !is_top_of_idle_stack
            && (state.cleanup_allowed || over_capacity)
    }

    fn cleanup_locked(&self, state: &mut PoolState, idle_position: usize) {
        let worker = state.idle.remove(idle_position).worker;
        state.workers.retain(|other| !Arc::ptr_eq(other, &worker));

        worker.request_exit();
        state.join_finished_threads();
        if let Some(handle) = worker.take_join_handle() {
            state.reclaimed_threads.push(handle);
        }

        tracing::debug!(worker = worker.id(), num_workers = state.workers.len(), "reclaimed an idle worker");
    }

    fn run_sequence(&self, sequence: Arc<Sequence>) {
        let may_block = sequence.front_traits().map_or(false, |traits| traits.may_block());

        let next = {
            let _permission = ScopedBlockingPermission::new(may_block);
            let _blocking = may_block.then(|| ScopedBlockingCall::new_unchecked(BlockingType::MayBlock));

            self.inner.task_tracker.run_next_task(sequence, self)
        };

        if let Some(sequence) = next {
            self.reenqueue_sequence(sequence);
        }
    }

    fn increment_worker_capacity(&self) {
        let mut state = self.lock_state();
        state.worker_capacity += 1;
        tracing::trace!(worker_capacity = state.worker_capacity, "raised the worker capacity for a blocked worker");

        self.wake_workers_for_pending_work_locked(&mut state);
    }

    fn decrement_worker_capacity(&self) {
        let mut state = self.lock_state();
        state.worker_capacity -= 1;
        tracing::trace!(worker_capacity = state.worker_capacity, "restored the worker capacity");

        // Idle workers sleep without a timeout while cleanup is disallowed, but surplus
        // ones can now be reclaimed.
        if !state.cleanup_allowed && state.workers.len() > state.worker_capacity {
            for idle in &state.idle {
                idle.worker.wake_up();
            }
        }
    }

    fn schedule_adjust_worker_capacity(&self) {
        let mut state = self.lock_state();
        if state.adjuster_scheduled || self.inner.join_started.load(Ordering::Acquire) {
            return;
        }

        state.adjuster_scheduled = true;
        self.post_adjust_worker_capacity(deadline_after(self.inner.config.may_block_threshold));
    }

    fn post_adjust_worker_capacity(&self, deadline: Instant) {
        let pool = self.clone();
        self.inner.delayed_task_manager.post_callback_at(deadline, move || pool.adjust_worker_capacity());
    }

    /// Raise the capacity for each worker that has been in a `MayBlock` scope for
    /// longer than the threshold.
    fn adjust_worker_capacity(&self) {
        profiling::scope!("adjust_worker_capacity");

        let threshold = self.inner.config.may_block_threshold;
        let now = Instant::now();

        let mut state = self.lock_state();
        state.adjuster_scheduled = false;

        let mut increments = 0;
        let mut next_deadline: Option<Instant> = None;
        for worker in &state.workers {
            let mut blocking = worker.blocking.lock().unwrap();
            let since = match blocking.may_block_since {
                Some(since) if !blocking.incremented_capacity => since,
                _ => continue,
            };

            if now.duration_since(since) >= threshold {
                blocking.incremented_capacity = true;
                increments += 1;
            } else if let Some(deadline) = since.checked_add(threshold) {
                next_deadline = Some(next_deadline.map_or(deadline, |next| next.min(deadline)));
            }
        }

        if increments > 0 {
            state.worker_capacity += increments;
            tracing::debug!(
                increments,
                worker_capacity = state.worker_capacity,
                "raised the worker capacity for blocked workers",
            );
            self.wake_workers_for_pending_work_locked(&mut state);
        }

        if let Some(deadline) = next_deadline {
            if !self.inner.join_started.load(Ordering::Acquire) {
                state.adjuster_scheduled = true;
                self.post_adjust_worker_capacity(deadline);
            }
        }
    }

    /// Stop all workers and, if `join_threads` is true, wait for their threads to exit.
    ///
    /// Pending delayed tasks and sequences that haven't run are discarded, and count
    /// as skipped. Threads are never joined from one of the pool's own workers.
    pub fn join(&self, join_threads: bool) {
        if self.inner.join_started.swap(true, Ordering::AcqRel) {
            return;
        }

        // Stop producing ripe delayed tasks before stopping the workers.
        let num_delayed = self.inner.delayed_task_manager.stop(join_threads);
        self.inner.task_tracker.discard_delayed_tasks(num_delayed);

        let (workers, mut threads) = {
            let mut state = self.lock_state();
            state.idle.clear();
            (mem::take(&mut state.workers), mem::take(&mut state.reclaimed_threads))
        };

        for worker in &workers {
            worker.request_exit();
        }

        let dropped = self.inner.priority_queue.begin_transaction().clear();
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "discarding queued sequences");
        }
        for sequence in dropped {
            self.inner.task_tracker.discard_sequence(sequence, true);
        }
        self.inner.task_tracker.discard_deferred_sequences();

        threads.extend(workers.iter().filter_map(|worker| worker.take_join_handle()));
        tracing::debug!(num_threads = threads.len(), join_threads, "joining the worker pool");

        if !join_threads {
            return;
        }

        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            join_thread(handle);
        }
    }

    /// How long an idle worker sleeps before looking for work again.
    ///
    /// Workers that can't be reclaimed have nothing to check until they are woken up.
    fn sleep_timeout(&self, worker: &Arc<WorkerThread>) -> Duration {
        let state = self.lock_state();
        let can_be_reclaimed = match state.idle_position(worker) {
            Some(position) => position + 1 != state.idle.len()
                && (state.cleanup_allowed || state.workers.len() > state.worker_capacity),
            None => true,
        };

        if can_be_reclaimed {
            state.reclaim_time.min(MAX_SLEEP_TIME)
        } else {
            MAX_SLEEP_TIME
        }
    }

    /// Idle workers are never reclaimed after this, unless the pool is above capacity.
    pub fn disallow_worker_cleanup(&self) {
        self.lock_state().cleanup_allowed = false;
    }

    pub fn worker_capacity(&self) -> usize {
        self.lock_state().worker_capacity
    }

    pub fn num_workers(&self) -> usize {
        self.lock_state().workers.len()
    }

    pub fn num_idle_workers(&self) -> usize {
        self.lock_state().idle.len()
    }

    pub fn num_queued_sequences(&self) -> usize {
        self.inner.priority_queue.begin_transaction().len()
    }
}

impl CanScheduleSequenceObserver for WorkerPool {
    fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>) {
        self.push_sequence_and_wake(sequence);
    }
}

struct PoolWorkerDelegate {
    pool: WorkerPool,
}

impl WorkerDelegate for PoolWorkerDelegate {
    fn on_main_entry(&self, worker: &Arc<WorkerThread>) {
        CURRENT_POOL.with(|pool| *pool.borrow_mut() = Some(self.pool.clone()));
        blocking::set_blocking_observer(Some(Arc::new(WorkerBlockingObserver {
            pool: self.pool.clone(),
            worker: worker.clone(),
        })));

        if let Some(handler) = &self.pool.inner.config.start_handler {
            handler.run(worker.id());
        }
    }

    fn get_work(&self, worker: &Arc<WorkerThread>) -> Option<Arc<Sequence>> {
        self.pool.get_work(worker)
    }

    fn run_sequence(&self, _worker: &Arc<WorkerThread>, sequence: Arc<Sequence>) {
        self.pool.run_sequence(sequence);
    }

    fn sleep_timeout(&self, worker: &Arc<WorkerThread>) -> Duration {
        self.pool.sleep_timeout(worker)
    }

    fn on_main_exit(&self, worker: &Arc<WorkerThread>) {
        if let Some(handler) = &self.pool.inner.config.exit_handler {
            handler.run(worker.id());
        }

        blocking::set_blocking_observer(None);
        CURRENT_POOL.with(|pool| pool.borrow_mut().take());
    }
}

/// Adjusts the worker capacity of the pool when the worker it is registered on blocks.
struct WorkerBlockingObserver {
    pool: WorkerPool,
    worker: Arc<WorkerThread>,
}

impl WorkerBlockingObserver {
    fn increment_now(&self) {
        {
            let mut blocking = self.worker.blocking.lock().unwrap();
            blocking.may_block_since = None;
            if blocking.incremented_capacity {
                return;
            }
            blocking.incremented_capacity = true;
        }

        self.pool.increment_worker_capacity();
    }
}

impl BlockingObserver for WorkerBlockingObserver {
    fn blocking_started(&self, blocking_type: BlockingType) {
        match blocking_type {
            BlockingType::MayBlock => {
                self.worker.blocking.lock().unwrap().may_block_since = Some(Instant::now());
                self.pool.schedule_adjust_worker_capacity();
            }
            BlockingType::WillBlock => self.increment_now(),
        }
    }

    fn blocking_type_upgraded(&self) {
        self.increment_now();
    }

    fn blocking_ended(&self) {
        let incremented = {
            let mut blocking = self.worker.blocking.lock().unwrap();
            blocking.may_block_since = None;
            mem::take(&mut blocking.incremented_capacity)
        };

        if incremented {
            self.pool.decrement_worker_capacity();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{ShutdownBehavior, TaskPriority, TaskTraits};
    use std::sync::{mpsc, Barrier};

    fn test_pool(worker_capacity: usize, reclaim_time: Duration) -> WorkerPool {
        let tracker = Arc::new(TaskTracker::new(usize::MAX));
        let delayed = DelayedTaskManager::new();
        delayed.start("test-delayed".to_string()).unwrap();

        let pool = WorkerPool::new(tracker, delayed, WorkerPoolConfig {
            name_handler: Box::new(|id| format!("test-worker#{}", id)),
            stack_size: None,
            start_handler: None,
            exit_handler: None,
            may_block_threshold: Duration::from_millis(10),
        });
        pool.start(worker_capacity, reclaim_time).unwrap();

        pool
    }

    fn stop(pool: WorkerPool) {
        pool.join(true);
    }

    fn post(pool: &WorkerPool, traits: TaskTraits, f: impl FnOnce() + Send + 'static) -> bool {
        let sequence = Arc::new(Sequence::new(traits));
        pool.post_task_with_sequence(Task::new(traits, f, Duration::ZERO), sequence)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        false
    }

    #[test]
    fn runs_posted_tasks() {
        let pool = test_pool(4, Duration::from_secs(30));
        let (tx, rx) = mpsc::channel();

        for i in 0..100 {
            let tx = tx.clone();
            assert!(post(&pool, TaskTraits::new(), move || tx.send(i).unwrap()));
        }

        let mut received: Vec<u32> = (0..100).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        received.sort();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
        assert!(pool.num_workers() <= 4);

        stop(pool);
    }

    #[test]
    fn tasks_know_their_pool() {
        let pool = test_pool(1, Duration::from_secs(30));
        let (tx, rx) = mpsc::channel();

        let expected = pool.clone();
        post(&pool, TaskTraits::new(), move || {
            let current = WorkerPool::current().unwrap();
            tx.send(current.ptr_eq(&expected)).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(WorkerPool::current().is_none());

        stop(pool);
    }

    #[test]
    fn reclaims_idle_workers() {
        let pool = test_pool(4, Duration::from_millis(30));
        let barrier = Arc::new(Barrier::new(5));

        for _ in 0..4 {
            let barrier = barrier.clone();
            post(&pool, TaskTraits::new(), move || { barrier.wait(); });
        }

        barrier.wait();
        assert_eq!(pool.num_workers(), 4);

        // All but the most recently idle worker go away.
        assert!(wait_until(|| pool.num_workers() == 1));
        assert_eq!(pool.num_idle_workers(), 1);

        stop(pool);
    }

    #[test]
    fn cleanup_can_be_disallowed() {
        let pool = test_pool(2, Duration::from_millis(10));
        pool.disallow_worker_cleanup();
        let barrier = Arc::new(Barrier::new(3));

        for _ in 0..2 {
            let barrier = barrier.clone();
            post(&pool, TaskTraits::new(), move || { barrier.wait(); });
        }
        barrier.wait();

        assert!(wait_until(|| pool.num_idle_workers() == 2));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.num_workers(), 2);

        stop(pool);
    }

    #[test]
    fn will_block_raises_capacity() {
        let pool = test_pool(1, Duration::from_secs(30));
        let (blocked_tx, blocked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        post(&pool, TaskTraits::new().with_may_block(), move || {
            let _blocking = ScopedBlockingCall::new(BlockingType::WillBlock);
            blocked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        blocked_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.worker_capacity(), 2);

        // Runs while the first task is blocked.
        post(&pool, TaskTraits::new(), move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        release_tx.send(()).unwrap();
        assert!(wait_until(|| pool.worker_capacity() == 1));

        stop(pool);
    }

    #[test]
    fn capacity_limits_concurrency() {
        let pool = test_pool(2, Duration::from_secs(30));
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..20 {
            let running = running.clone();
            let max_running = max_running.clone();
            let tx = tx.clone();
            post(&pool, TaskTraits::new().with_priority(TaskPriority::UserBlocking), move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                running.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }

        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(max_running.load(Ordering::SeqCst) <= 2);

        stop(pool);
    }

    #[test]
    fn join_drops_queued_work_and_rejects_posts() {
        let pool = test_pool(1, Duration::from_secs(30));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        post(&pool, TaskTraits::new(), move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (dropped_tx, dropped_rx) = mpsc::channel::<()>();
        post(&pool, TaskTraits::new(), move || dropped_tx.send(()).unwrap());

        let joiner = {
            let pool = pool.clone();
            std::thread::spawn(move || stop(pool))
        };
        assert!(wait_until(|| pool.inner.join_started.load(Ordering::Acquire)));
        release_tx.send(()).unwrap();
        joiner.join().unwrap();

        // The queued task was dropped without running.
        assert!(dropped_rx.recv().is_err());
        assert!(!post(&pool, TaskTraits::new(), || {}));
        assert_eq!(pool.num_workers(), 0);
    }

    #[test]
    fn join_discards_pending_work_so_shutdown_completes() {
        let pool = test_pool(1, Duration::from_secs(30));
        let tracker = pool.inner.task_tracker.clone();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        post(&pool, TaskTraits::new(), move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let blocking = TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::BlockShutdown);
        assert!(post(&pool, blocking, || panic!("must not run")));
        let delayed = Task::new(TaskTraits::new(), || panic!("must not run"), Duration::from_secs(60));
        assert!(pool.post_task_with_sequence(delayed, Arc::new(Sequence::new(TaskTraits::new()))));

        let joiner = {
            let pool = pool.clone();
            std::thread::spawn(move || stop(pool))
        };
        assert!(wait_until(|| pool.inner.join_started.load(Ordering::Acquire)));
        release_tx.send(()).unwrap();
        joiner.join().unwrap();

        assert_eq!(tracker.num_tasks_run(), 1);
        assert_eq!(tracker.num_tasks_skipped(), 2);

        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            tracker.flush();
            tracker.shutdown();
            done_tx.send(()).unwrap();
        });
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn workers_that_cant_be_reclaimed_sleep_until_woken() {
        let pool = test_pool(2, Duration::ZERO);
        let barrier = Arc::new(Barrier::new(3));

        for _ in 0..2 {
            let barrier = barrier.clone();
            post(&pool, TaskTraits::new(), move || { barrier.wait(); });
        }
        barrier.wait();

        // With no reclaim delay only the top of the idle stack survives, and it has
        // no reason to wake up on its own.
        assert!(wait_until(|| pool.num_workers() == 1 && pool.num_idle_workers() == 1));
        let worker = pool.lock_state().workers[0].clone();
        assert_eq!(pool.sleep_timeout(&worker), MAX_SLEEP_TIME);

        // It still picks up new work.
        let (tx, rx) = mpsc::channel();
        post(&pool, TaskTraits::new(), move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        stop(pool);
    }

    #[test]
    fn idle_workers_sleep_until_woken_when_cleanup_is_disallowed() {
        let pool = test_pool(2, Duration::ZERO);
        pool.disallow_worker_cleanup();
        let barrier = Arc::new(Barrier::new(3));

        for _ in 0..2 {
            let barrier = barrier.clone();
            post(&pool, TaskTraits::new(), move || { barrier.wait(); });
        }
        barrier.wait();

        assert!(wait_until(|| pool.num_idle_workers() == 2));
        let workers = pool.lock_state().workers.clone();
        for worker in &workers {
            assert_eq!(pool.sleep_timeout(worker), MAX_SLEEP_TIME);
        }
        assert_eq!(pool.num_workers(), 2);

        stop(pool);
    }

    #[test]
    fn surplus_workers_stay_suspended_after_blocking_ends() {
        let pool = test_pool(1, Duration::from_secs(30));
        let (blocked_tx, blocked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        post(&pool, TaskTraits::new().with_may_block(), move || {
            let _blocking = ScopedBlockingCall::new(BlockingType::WillBlock);
            blocked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        blocked_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // A second worker is created to run this while the first one is blocked.
        post(&pool, TaskTraits::new(), move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.num_workers(), 2);

        release_tx.send(()).unwrap();
        assert!(wait_until(|| pool.worker_capacity() == 1));
        assert!(wait_until(|| pool.num_idle_workers() == 2));

        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let max_running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..50 {
            let running = running.clone();
            let max_running = max_running.clone();
            let tx = tx.clone();
            post(&pool, TaskTraits::new(), move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_micros(200));
                running.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            });
        }

        for _ in 0..50 {
            {
                let state = pool.lock_state();
                assert!(state.idle.len() <= state.workers.len());
                assert!(state.num_running_workers() <= state.worker_capacity);
            }
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }

        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert_eq!(pool.num_workers(), 2);

        stop(pool);
    }

    #[test]
    fn reclaimed_threads_are_joined_once_finished() {
        let pool = test_pool(4, Duration::from_millis(10));
        let barrier = Arc::new(Barrier::new(5));

        for _ in 0..4 {
            let barrier = barrier.clone();
            post(&pool, TaskTraits::new(), move || { barrier.wait(); });
        }
        barrier.wait();

        assert!(wait_until(|| pool.num_workers() == 1));
        assert!(wait_until(|| pool.lock_state().reclaimed_threads.iter().all(|handle| handle.is_finished())));

        let mut state = pool.lock_state();
        state.join_finished_threads();
        assert!(state.reclaimed_threads.is_empty());
        drop(state);

        stop(pool);
    }
}

//! Task runners
//!
//! Task runners are the usual way to post work. A `TaskRunner` runs its tasks in
//! parallel, each in its own sequence. A `SequencedTaskRunner` runs its tasks one at a
//! time in posting order, possibly on different threads.

use std::time::Duration;

use crate::core::sequence::{Sequence, SequenceToken};
use crate::core::sync::Arc;
use crate::core::task::{CancellationFlag, Task, TaskTraits};
use crate::core::worker_pool::WorkerPool;
use crate::error::PostError;
use crate::handle::{promise, TaskHandle};

#[track_caller]
fn post_to_sequence<F>(pool: &WorkerPool, sequence: Arc<Sequence>, f: F, delay: Duration) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let task = Task::new(sequence.traits(), f, delay);
    pool.post_task_with_sequence(task, sequence)
}

#[track_caller]
fn submit_to_sequence<F, T>(pool: &WorkerPool, sequence: Arc<Sequence>, f: F) -> Result<TaskHandle<T>, PostError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (promise, handle) = promise();
    let cancellation = CancellationFlag::new();
    let task = Task::new(sequence.traits(), move || promise.fulfill(f), Duration::ZERO)
        .with_cancellation(cancellation.clone());

    if pool.post_task_with_sequence(task, sequence) {
        Ok(handle.with_cancellation(cancellation))
    } else {
        Err(PostError::Rejected)
    }
}

fn reply_runner() -> SequencedTaskRunner {
    SequencedTaskRunner::current()
        .expect("replies can only be posted from a task running on a sequence")
}

/// Posts tasks that may run in parallel.
#[derive(Clone)]
pub struct TaskRunner {
    pool: WorkerPool,
    traits: TaskTraits,
}

impl TaskRunner {
    pub(crate) fn new(pool: WorkerPool, traits: TaskTraits) -> Self {
        TaskRunner { pool, traits }
    }

    pub fn traits(&self) -> TaskTraits { self.traits }

    /// Returns false if the task was rejected because the pool is shutting down.
    #[track_caller]
    pub fn post_task<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_delayed_task(f, Duration::ZERO)
    }

    #[track_caller]
    pub fn post_delayed_task<F>(&self, f: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        post_to_sequence(&self.pool, self.new_sequence(), f, delay)
    }

    /// Post a task and get a handle to its output.
    #[track_caller]
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, PostError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        submit_to_sequence(&self.pool, self.new_sequence(), f)
    }

    /// Post `task`, then post `reply` back to the calling task's sequence once it ran.
    ///
    /// Panics if not called from a sequenced task.
    #[track_caller]
    pub fn post_task_and_reply<F, R>(&self, task: F, reply: R) -> bool
    where
        F: FnOnce() + Send + 'static,
        R: FnOnce() + Send + 'static,
    {
        self.post_task_and_reply_with_result(task, move |()| reply())
    }

    /// Like `post_task_and_reply`, passing the output of `task` to `reply`.
    #[track_caller]
    pub fn post_task_and_reply_with_result<F, R, T>(&self, task: F, reply: R) -> bool
    where
        F: FnOnce() -> T + Send + 'static,
        R: FnOnce(T) + Send + 'static,
        T: Send + 'static,
    {
        let reply_to = reply_runner();
        self.post_task(move || {
            let output = task();
            reply_to.post_task(move || reply(output));
        })
    }

    // Every task gets a sequence of its own, which is dropped once the task ran.
    fn new_sequence(&self) -> Arc<Sequence> {
        Arc::new(Sequence::new(self.traits))
    }
}

/// Posts tasks that run one at a time, in posting order.
///
/// Delayed tasks join the sequence when their delay expires.
#[derive(Clone)]
pub struct SequencedTaskRunner {
    pool: WorkerPool,
    sequence: Arc<Sequence>,
}

impl SequencedTaskRunner {
    pub(crate) fn new(pool: WorkerPool, traits: TaskTraits) -> Self {
        SequencedTaskRunner {
            pool,
            sequence: Arc::new(Sequence::new(traits)),
        }
    }

    /// A runner for the sequence of the task running on the calling thread, if any.
    pub fn current() -> Option<SequencedTaskRunner> {
        let sequence = Sequence::current()?;
        let pool = WorkerPool::current()?;

        Some(SequencedTaskRunner { pool, sequence })
    }

    pub fn traits(&self) -> TaskTraits { self.sequence.traits() }

    pub fn token(&self) -> SequenceToken { self.sequence.token() }

    /// Whether the calling thread is running one of this runner's tasks.
    pub fn runs_tasks_in_current_sequence(&self) -> bool {
        SequenceToken::current() == Some(self.sequence.token())
    }

    #[track_caller]
    pub fn post_task<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_delayed_task(f, Duration::ZERO)
    }

    #[track_caller]
    pub fn post_delayed_task<F>(&self, f: F, delay: Duration) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        post_to_sequence(&self.pool, self.sequence.clone(), f, delay)
    }

    #[track_caller]
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, PostError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        submit_to_sequence(&self.pool, self.sequence.clone(), f)
    }

    /// Post `task` to this sequence, then post `reply` back to the calling task's
    /// sequence once it ran.
    ///
    /// Panics if not called from a sequenced task.
    #[track_caller]
    pub fn post_task_and_reply<F, R>(&self, task: F, reply: R) -> bool
    where
        F: FnOnce() + Send + 'static,
        R: FnOnce() + Send + 'static,
    {
        self.post_task_and_reply_with_result(task, move |()| reply())
    }

    #[track_caller]
    pub fn post_task_and_reply_with_result<F, R, T>(&self, task: F, reply: R) -> bool
    where
        F: FnOnce() -> T + Send + 'static,
        R: FnOnce(T) + Send + 'static,
        T: Send + 'static,
    {
        let reply_to = reply_runner();
        self.post_task(move || {
            let output = task();
            reply_to.post_task(move || reply(output));
        })
    }
}

impl std::fmt::Debug for SequencedTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencedTaskRunner")
            .field("token", &self.sequence.token())
            .field("traits", &self.sequence.traits())
            .finish()
    }
}

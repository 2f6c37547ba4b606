//! Worker threads
//!
//! A worker thread repeatedly asks its delegate for a sequence, runs it, and parks
//! when there is nothing to do. All scheduling decisions belong to the delegate.

use std::cell::Cell;
use std::io;
use std::time::{Duration, Instant};

use crossbeam_utils::sync::{Parker, Unparker};

use super::sequence::Sequence;
use super::sync::{Arc, AtomicBool, Mutex, Ordering, thread};

thread_local! {
    static IS_POOL_THREAD: Cell<bool> = Cell::new(false);
}

/// Whether the calling thread is a worker of any pool.
pub fn is_pool_thread() -> bool {
    IS_POOL_THREAD.with(Cell::get)
}

pub(crate) trait WorkerDelegate: Send + Sync {
    fn on_main_entry(&self, worker: &Arc<WorkerThread>);
    /// Returns the next sequence to run, or `None` if the worker should sleep or exit.
    fn get_work(&self, worker: &Arc<WorkerThread>) -> Option<Arc<Sequence>>;
    fn run_sequence(&self, worker: &Arc<WorkerThread>, sequence: Arc<Sequence>);
    /// How long to sleep when there is no work.
    fn sleep_timeout(&self, worker: &Arc<WorkerThread>) -> Duration;
    fn on_main_exit(&self, worker: &Arc<WorkerThread>);
}

/// Tracks how long a worker has been blocked, to decide when to raise the pool's capacity.
#[derive(Default, Debug)]
pub(crate) struct BlockingState {
    /// Set while the worker is in a `MayBlock` scope that hasn't been accounted for.
    pub may_block_since: Option<Instant>,
    /// Whether the worker capacity was incremented for the current blocking scope.
    pub incremented_capacity: bool,
}

pub(crate) struct WorkerThread {
    id: u32,
    unparker: Unparker,
    should_exit: AtomicBool,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
    pub(crate) blocking: Mutex<BlockingState>,
}

impl WorkerThread {
    pub fn spawn(
        id: u32,
        builder: thread::Builder,
        delegate: Arc<dyn WorkerDelegate>,
    ) -> io::Result<Arc<WorkerThread>> {
        let parker = Parker::new();
        let worker = Arc::new(WorkerThread {
            id,
            unparker: parker.unparker().clone(),
            should_exit: AtomicBool::new(false),
            join_handle: Mutex::new(None),
            blocking: Mutex::new(BlockingState::default()),
        });

        let handle = builder.spawn({
            let worker = worker.clone();
            move || worker.run(parker, delegate)
        })?;

        *worker.join_handle.lock().unwrap() = Some(handle);

        Ok(worker)
    }

    pub fn id(&self) -> u32 { self.id }

    pub fn wake_up(&self) {
        profiling::scope!("unpark");
        self.unparker.unpark();
    }

    /// Make the worker exit next time it looks for work.
    pub fn request_exit(&self) {
        self.should_exit.store(true, Ordering::Release);
        self.unparker.unpark();
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::Acquire)
    }

    pub fn take_join_handle(&self) -> Option<thread::JoinHandle<()>> {
        self.join_handle.lock().unwrap().take()
    }

    fn run(self: Arc<Self>, parker: Parker, delegate: Arc<dyn WorkerDelegate>) {
        profiling::register_thread!("Worker");
        IS_POOL_THREAD.with(|flag| flag.set(true));

        delegate.on_main_entry(&self);

        while !self.should_exit() {
            match delegate.get_work(&self) {
                Some(sequence) => delegate.run_sequence(&self, sequence),
                None => {
                    if self.should_exit() {
                        break;
                    }

                    profiling::scope!("sleep");
                    parker.park_timeout(delegate.sleep_timeout(&self));
                }
            }
        }

        delegate.on_main_exit(&self);
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("id", &self.id)
            .field("should_exit", &self.should_exit())
            .finish()
    }
}

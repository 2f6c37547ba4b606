//! Delayed tasks
//!
//! Delayed tasks are held by a service thread until their requested run time, then
//! handed back to whoever posted them. The service thread waits on a condition variable
//! with a timeout matching the earliest deadline, and is woken early when an earlier
//! deadline is added.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::io;
use std::time::Instant;

use super::sync::{Arc, AtomicBool, Condvar, Mutex, Ordering, thread};
use super::task::Task;
use crate::util::join_thread;

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    run_at: Instant,
    // Callbacks with the same deadline fire in the order they were added.
    order: u64,
    // Whether the callback carries a task, as opposed to internal housekeeping.
    is_task: bool,
    callback: Callback,
}

// Reversed so that the binary heap pops the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.run_at.cmp(&self.run_at)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.order == other.order
    }
}

impl Eq for Entry {}

struct Pending {
    entries: BinaryHeap<Entry>,
    next_order: u64,
}

pub(crate) struct DelayedTaskManager {
    pending: Mutex<Pending>,
    notify: Condvar,
    stopped: AtomicBool,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DelayedTaskManager {
    pub fn new() -> Arc<Self> {
        Arc::new(DelayedTaskManager {
            pending: Mutex::new(Pending {
                entries: BinaryHeap::new(),
                next_order: 0,
            }),
            notify: Condvar::new(),
            stopped: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Start the service thread. Callbacks added before this are kept and fire once
    /// the thread runs.
    pub fn start(self: &Arc<Self>, name: String) -> io::Result<()> {
        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                profiling::register_thread!("Delayed tasks");
                manager.run_loop();
            })?;

        *self.handle.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Call `post_now` with the task once its requested run time is reached.
    ///
    /// `post_now` runs on the service thread, exactly once, unless the manager stops
    /// first in which case the task is dropped. Returns false if the manager was
    /// already stopped.
    pub fn add_delayed_task<F>(&self, task: Task, post_now: F) -> bool
    where
        F: FnOnce(Task) + Send + 'static,
    {
        let run_at = task.requested_run_time().unwrap_or_else(Instant::now);
        self.push(run_at, true, Box::new(move || post_now(task)))
    }

    /// Run a callback on the service thread at or after `deadline`.
    pub fn post_callback_at<F>(&self, deadline: Instant, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(deadline, false, Box::new(callback));
    }

    fn push(&self, run_at: Instant, is_task: bool, callback: Callback) -> bool {
        let mut pending = self.pending.lock().unwrap();
        // Checked under the lock so that `stop` can't miss the entry.
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }

        let order = pending.next_order;
        pending.next_order += 1;

        let is_earliest = pending.entries.peek().map_or(true, |entry| run_at < entry.run_at);
        pending.entries.push(Entry { run_at, order, is_task, callback });

        if is_earliest {
            self.notify.notify_one();
        }

        true
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().unwrap().entries.len()
    }

    /// Stop the service thread and drop the pending callbacks.
    ///
    /// Returns the number of delayed tasks that were dropped.
    pub fn stop(&self, join: bool) -> usize {
        let dropped: Vec<Entry> = {
            let mut pending = self.pending.lock().unwrap();
            self.stopped.store(true, Ordering::Release);
            self.notify.notify_one();
            pending.entries.drain().collect()
        };

        let num_tasks = dropped.iter().filter(|entry| entry.is_task).count();
        if num_tasks > 0 {
            tracing::debug!(count = num_tasks, "dropped pending delayed tasks");
        }
        drop(dropped);

        let handle = self.handle.lock().unwrap().take();
        if let (true, Some(handle)) = (join, handle) {
            // A callback may be what caused the manager to stop.
            if handle.thread().id() != thread::current().id() {
                join_thread(handle);
            }
        }

        num_tasks
    }

    fn run_loop(&self) {
        let mut pending = self.pending.lock().unwrap();
        loop {
            // Checked under the lock so that a notification from stop() isn't missed.
            if self.stopped.load(Ordering::Acquire) {
                break;
            }

            let now = Instant::now();
            let next_deadline = pending.entries.peek().map(|entry| entry.run_at);
            match next_deadline {
                Some(deadline) if deadline <= now => {
                    let entry = pending.entries.pop().unwrap();
                    drop(pending);

                    profiling::scope!("delayed callback");
                    (entry.callback)();

                    pending = self.pending.lock().unwrap();
                }
                Some(deadline) => {
                    pending = self.notify.wait_timeout(pending, deadline - now).unwrap().0;
                }
                None => {
                    pending = self.notify.wait(pending).unwrap();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskTraits;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order() {
        let manager = DelayedTaskManager::new();
        manager.start("delayed-test".to_string()).unwrap();

        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        for (name, delay) in [("c", 30), ("a", 10), ("b", 20)] {
            let tx = tx.clone();
            manager.post_callback_at(start + Duration::from_millis(delay), move || tx.send(name).unwrap());
        }

        let order: Vec<_> = (0..3).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(start.elapsed() >= Duration::from_millis(30));

        manager.stop(true);
    }

    #[test]
    fn delayed_task_not_posted_early() {
        let manager = DelayedTaskManager::new();
        manager.start("delayed-test".to_string()).unwrap();

        let (tx, rx) = mpsc::channel();
        let task = Task::new(TaskTraits::new(), || {}, Duration::from_millis(25));
        let requested = task.requested_run_time().unwrap();
        manager.add_delayed_task(task, move |task| tx.send((Instant::now(), task)).unwrap());

        let (posted_at, task) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(posted_at >= requested);
        assert!(task.is_delayed());

        manager.stop(true);
    }

    #[test]
    fn stop_drops_pending_callbacks() {
        let manager = DelayedTaskManager::new();
        manager.start("delayed-test".to_string()).unwrap();

        let (tx, rx) = mpsc::channel::<()>();
        manager.post_callback_at(Instant::now() + Duration::from_secs(60), move || tx.send(()).unwrap());
        let task = Task::new(TaskTraits::new(), || {}, Duration::from_secs(60));
        assert!(manager.add_delayed_task(task, |_| panic!("must not be posted")));
        assert_eq!(manager.num_pending(), 2);

        // Only the entry carrying a task is reported.
        assert_eq!(manager.stop(true), 1);
        assert_eq!(manager.num_pending(), 0);
        // The callback was dropped along with its sender.
        assert!(rx.recv().is_err());

        // Callbacks posted after stopping are ignored.
        manager.post_callback_at(Instant::now(), || panic!("must not run"));
        let task = Task::new(TaskTraits::new(), || {}, Duration::from_millis(1));
        assert!(!manager.add_delayed_task(task, |_| panic!("must not be posted")));
        assert_eq!(manager.num_pending(), 0);
    }
}

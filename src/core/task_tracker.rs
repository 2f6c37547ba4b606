//! Task tracking and shutdown
//!
//! The task tracker is the gatekeeper of the pool. It decides whether a task can be
//! posted, whether a sequence can be scheduled now or has to wait, and whether a task
//! that reached the front of its sequence actually runs or is skipped.
//!
//! Shutdown goes through three states: running, shutdown requested and shutdown complete.
//! Once shutdown is requested only `BlockShutdown` tasks are accepted, and tasks that
//! haven't started are skipped unless they are `BlockShutdown`. Shutdown completes when
//! no `BlockShutdown` task is pending and no `SkipOnShutdown` task is running. A lock-free
//! flag mirrors the "shutdown requested" state for the posting fast path; everything
//! else is behind a single mutex, with a condition variable for each kind of waiter.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use crossbeam_utils::CachePadded;

use super::sequence::{ScopedCurrentSequence, Sequence};
use super::sync::{Arc, AtomicBool, AtomicU64, Condvar, Mutex, Ordering};
use super::task::{ShutdownBehavior, Task};
use super::worker::is_pool_thread;
use crate::util::panic_message;

/// Notified when a sequence that was deferred by `TaskTracker::will_schedule_sequence`
/// can be scheduled.
pub trait CanScheduleSequenceObserver: Send + Sync {
    fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>);
}

impl<T: CanScheduleSequenceObserver + ?Sized> CanScheduleSequenceObserver for Arc<T> {
    fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>) {
        (**self).on_can_schedule_sequence(sequence)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShutdownRequested,
    ShutdownComplete,
}

struct DeferredSequence {
    sequence: Arc<Sequence>,
    observer: Arc<dyn CanScheduleSequenceObserver>,
}

struct TrackerState {
    shutdown_state: ShutdownState,
    /// Posted `BlockShutdown` tasks plus running `SkipOnShutdown` tasks.
    num_tasks_blocking_shutdown: usize,
    /// Undelayed tasks that have been posted but haven't run or been skipped.
    num_incomplete_tasks: usize,
    /// Non-background sequences that have been scheduled and haven't started their task.
    num_scheduled_foreground_sequences: usize,
    /// Background sequences that have been scheduled and haven't finished their task.
    num_scheduled_background_sequences: usize,
    deferred_background_sequences: VecDeque<DeferredSequence>,
    /// Set when the pool stops: sequences are discarded instead of deferred.
    discard_sequences: bool,
}

pub struct TaskTracker {
    shutdown_started: AtomicBool,
    state: Mutex<TrackerState>,
    shutdown_cond: Condvar,
    flush_cond: Condvar,
    max_scheduled_background_sequences: usize,
    num_tasks_run: CachePadded<AtomicU64>,
    num_tasks_skipped: CachePadded<AtomicU64>,
}

impl TaskTracker {
    pub fn new(max_scheduled_background_sequences: usize) -> Self {
        assert!(max_scheduled_background_sequences > 0);

        TaskTracker {
            shutdown_started: AtomicBool::new(false),
            state: Mutex::new(TrackerState {
                shutdown_state: ShutdownState::Running,
                num_tasks_blocking_shutdown: 0,
                num_incomplete_tasks: 0,
                num_scheduled_foreground_sequences: 0,
                num_scheduled_background_sequences: 0,
                deferred_background_sequences: VecDeque::new(),
                discard_sequences: false,
            }),
            shutdown_cond: Condvar::new(),
            flush_cond: Condvar::new(),
            max_scheduled_background_sequences,
            num_tasks_run: CachePadded::new(AtomicU64::new(0)),
            num_tasks_skipped: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Decide whether a task may be posted.
    ///
    /// If this returns false the task must be dropped without being scheduled.
    pub fn will_post_task(&self, task: &Task) -> bool {
        let behavior = task.traits().shutdown_behavior();

        if behavior != ShutdownBehavior::BlockShutdown && self.shutdown_started.load(Ordering::Acquire) {
            tracing::trace!(posted_from = %task.posted_from(), "rejected a task posted after shutdown started");
            return false;
        }

        let mut state = self.state.lock().unwrap();
        match (state.shutdown_state, behavior) {
            (ShutdownState::ShutdownComplete, _) => {
                tracing::warn!(posted_from = %task.posted_from(), ?behavior, "rejected a task posted after shutdown completed");
                return false;
            }
            (ShutdownState::ShutdownRequested, ShutdownBehavior::BlockShutdown) => {}
            (ShutdownState::ShutdownRequested, _) => return false,
            (ShutdownState::Running, _) => {}
        }

        if behavior == ShutdownBehavior::BlockShutdown {
            state.num_tasks_blocking_shutdown += 1;
        }

        if !task.is_delayed() {
            state.num_incomplete_tasks += 1;
        }

        true
    }

    /// Start tracking a delayed task that has become ready and is about to be
    /// pushed into its sequence.
    pub fn will_queue_ripe_delayed_task(&self) {
        self.state.lock().unwrap().num_incomplete_tasks += 1;
    }

    /// Decide whether a sequence may be scheduled now.
    ///
    /// Returns the sequence if it can be pushed into the priority queue immediately.
    /// Otherwise the sequence is kept until it can be scheduled, at which point
    /// `observer.on_can_schedule_sequence` is called exactly once with it.
    ///
    /// Background sequences wait while foreground sequences are scheduled but haven't
    /// started running, and while the maximum number of scheduled background sequences
    /// is reached.
    pub fn will_schedule_sequence<O>(&self, sequence: Arc<Sequence>, observer: &O) -> Option<Arc<Sequence>>
    where
        O: CanScheduleSequenceObserver + Clone + 'static,
    {
        let priority = sequence.sort_key().priority();

        let mut state = self.state.lock().unwrap();
        if state.discard_sequences {
            drop(state);
            self.discard_sequence(sequence, false);
            return None;
        }

        if !priority.is_background() {
            state.num_scheduled_foreground_sequences += 1;
            return Some(sequence);
        }

        let must_wait = state.num_scheduled_foreground_sequences > 0
            || state.num_scheduled_background_sequences >= self.max_scheduled_background_sequences
            // Keep deferred sequences in order.
            || !state.deferred_background_sequences.is_empty();

        if must_wait {
            tracing::trace!(token = ?sequence.token(), "deferred a background sequence");
            state.deferred_background_sequences.push_back(DeferredSequence {
                sequence,
                observer: Arc::new(observer.clone()),
            });
            return None;
        }

        state.num_scheduled_background_sequences += 1;

        Some(sequence)
    }

    /// Run or skip the front task of a sequence that was returned by
    /// `will_schedule_sequence`.
    ///
    /// Returns the sequence if it still has tasks and may be scheduled again right
    /// away. If it still has tasks but has to wait, `observer` is notified later
    /// and `None` is returned, same as when the sequence is drained.
    pub fn run_next_task<O>(&self, sequence: Arc<Sequence>, observer: &O) -> Option<Arc<Sequence>>
    where
        O: CanScheduleSequenceObserver + Clone + 'static,
    {
        profiling::scope!("run_next_task");

        let run_guard = sequence.begin_run();
        let task = sequence.take_task();
        let is_background = task.traits().priority().is_background();
        let behavior = task.traits().shutdown_behavior();

        let (can_run, released) = {
            let mut state = self.state.lock().unwrap();
            if !is_background {
                state.num_scheduled_foreground_sequences -= 1;
            }

            let can_run = !task.is_cancelled() && match behavior {
                ShutdownBehavior::BlockShutdown => true,
                ShutdownBehavior::SkipOnShutdown => {
                    let running = state.shutdown_state == ShutdownState::Running;
                    if running {
                        // Shutdown waits for skippable tasks that have already started.
                        state.num_tasks_blocking_shutdown += 1;
                    }
                    running
                }
                ShutdownBehavior::ContinueOnShutdown => state.shutdown_state == ShutdownState::Running,
            };

            (can_run, self.release_deferred_sequences(&mut state))
        };
        notify_observers(released);

        if can_run {
            let posted_from = task.posted_from();
            let _current = ScopedCurrentSequence::new(&sequence);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                tracing::error!(%posted_from, message = panic_message(&*payload), "task panicked");
            }
            self.num_tasks_run.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::trace!(posted_from = %task.posted_from(), ?behavior, "skipped a task");
            drop(task);
            self.num_tasks_skipped.fetch_add(1, Ordering::Relaxed);
        }

        let is_empty = sequence.pop();
        drop(run_guard);

        let released = {
            let mut state = self.state.lock().unwrap();
            if is_background {
                state.num_scheduled_background_sequences -= 1;
            }

            let was_blocking_shutdown = behavior == ShutdownBehavior::BlockShutdown
                || (behavior == ShutdownBehavior::SkipOnShutdown && can_run);
            if was_blocking_shutdown {
                state.num_tasks_blocking_shutdown -= 1;
                if state.num_tasks_blocking_shutdown == 0 && state.shutdown_state != ShutdownState::Running {
                    self.shutdown_cond.notify_all();
                }
            }

            state.num_incomplete_tasks -= 1;
            if state.num_incomplete_tasks == 0 {
                self.flush_cond.notify_all();
            }

            self.release_deferred_sequences(&mut state)
        };
        notify_observers(released);

        if is_empty {
            return None;
        }

        self.will_schedule_sequence(sequence, observer)
    }

    fn release_deferred_sequences(&self, state: &mut TrackerState) -> Vec<DeferredSequence> {
        let mut released = Vec::new();
        while state.num_scheduled_foreground_sequences == 0
            && state.num_scheduled_background_sequences < self.max_scheduled_background_sequences
        {
            match state.deferred_background_sequences.pop_front() {
                Some(deferred) => {
                    state.num_scheduled_background_sequences += 1;
                    released.push(deferred);
                }
                None => break,
            }
        }

        released
    }

    /// Start shutting down without waiting for it to complete.
    ///
    /// Panics if shutdown was already started.
    pub fn start_shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.shutdown_state, ShutdownState::Running, "shutdown can only happen once");

        self.shutdown_started.store(true, Ordering::Release);
        state.shutdown_state = ShutdownState::ShutdownRequested;

        tracing::debug!(blocking_tasks = state.num_tasks_blocking_shutdown, "shutdown started");
    }

    /// Block until no task is blocking shutdown anymore, then complete shutdown.
    pub fn complete_shutdown(&self) {
        assert!(!is_pool_thread(), "waiting for shutdown from a thread of the pool would deadlock");

        let mut state = self.state.lock().unwrap();
        assert!(state.shutdown_state != ShutdownState::Running, "complete_shutdown() called before start_shutdown()");

        while state.num_tasks_blocking_shutdown > 0 {
            state = self.shutdown_cond.wait(state).unwrap();
        }

        if state.shutdown_state != ShutdownState::ShutdownComplete {
            state.shutdown_state = ShutdownState::ShutdownComplete;
            tracing::debug!(
                run = self.num_tasks_run(),
                skipped = self.num_tasks_skipped(),
                "shutdown complete",
            );
        }

        // Flush doesn't wait past shutdown.
        self.flush_cond.notify_all();
    }

    /// Start shutdown and block until it completes.
    pub fn shutdown(&self) {
        self.start_shutdown();
        self.complete_shutdown();
    }

    /// Block until all undelayed tasks that were posted have run or been skipped, or
    /// until shutdown completes.
    pub fn flush(&self) {
        assert!(!is_pool_thread(), "flushing from a thread of the pool would deadlock");

        let mut state = self.state.lock().unwrap();
        while state.num_incomplete_tasks > 0 && state.shutdown_state != ShutdownState::ShutdownComplete {
            state = self.flush_cond.wait(state).unwrap();
        }
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.state.lock().unwrap().shutdown_state
    }

    pub fn has_shutdown_started(&self) -> bool {
        self.shutdown_started.load(Ordering::Acquire)
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_state() == ShutdownState::ShutdownComplete
    }

    pub fn num_tasks_run(&self) -> u64 {
        self.num_tasks_run.load(Ordering::Relaxed)
    }

    pub fn num_tasks_skipped(&self) -> u64 {
        self.num_tasks_skipped.load(Ordering::Relaxed)
    }

    /// Skip every task left in a sequence that will never be scheduled again.
    ///
    /// `scheduled` is true if the sequence was admitted by `will_schedule_sequence`
    /// and hasn't started its front task, false if it was deferred. The skipped tasks
    /// stop counting towards `flush` and `shutdown`.
    pub(crate) fn discard_sequence(&self, sequence: Arc<Sequence>, scheduled: bool) {
        if sequence.is_empty() {
            return;
        }

        let is_background = sequence.sort_key().priority().is_background();
        let tasks = sequence.take_all();
        let num_blocking = tasks.iter()
            .filter(|task| task.traits().shutdown_behavior() == ShutdownBehavior::BlockShutdown)
            .count();

        let released = {
            let mut state = self.state.lock().unwrap();
            if scheduled {
                if is_background {
                    state.num_scheduled_background_sequences -= 1;
                } else {
                    state.num_scheduled_foreground_sequences -= 1;
                }
            }

            state.num_tasks_blocking_shutdown -= num_blocking;
            if num_blocking > 0 && state.num_tasks_blocking_shutdown == 0 && state.shutdown_state != ShutdownState::Running {
                self.shutdown_cond.notify_all();
            }

            state.num_incomplete_tasks -= tasks.len();
            if state.num_incomplete_tasks == 0 {
                self.flush_cond.notify_all();
            }

            self.release_deferred_sequences(&mut state)
        };

        self.num_tasks_skipped.fetch_add(tasks.len() as u64, Ordering::Relaxed);
        tracing::trace!(token = ?sequence.token(), count = tasks.len(), "discarded the tasks of a sequence");
        drop(tasks);

        notify_observers(released);
    }

    /// Discard the deferred sequences, and any sequence that would be deferred from
    /// now on.
    ///
    /// Used when the pool is joined.
    pub(crate) fn discard_deferred_sequences(&self) {
        let deferred: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.discard_sequences = true;
            state.deferred_background_sequences.drain(..).collect()
        };

        for DeferredSequence { sequence, .. } in deferred {
            self.discard_sequence(sequence, false);
        }
    }

    /// Count delayed tasks that were dropped before becoming ripe.
    ///
    /// Delayed tasks only count towards `flush` once ripe and never block shutdown,
    /// so only the skip counter changes.
    pub(crate) fn discard_delayed_tasks(&self, count: usize) {
        self.num_tasks_skipped.fetch_add(count as u64, Ordering::Relaxed);
    }
}

fn notify_observers(released: Vec<DeferredSequence>) {
    for DeferredSequence { sequence, observer } in released {
        observer.on_can_schedule_sequence(sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{TaskPriority, TaskTraits};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingObserver {
        sequences: Mutex<Vec<Arc<Sequence>>>,
    }

    impl CanScheduleSequenceObserver for RecordingObserver {
        fn on_can_schedule_sequence(&self, sequence: Arc<Sequence>) {
            self.sequences.lock().unwrap().push(sequence);
        }
    }

    fn observer() -> (Arc<RecordingObserver>, Arc<dyn CanScheduleSequenceObserver>) {
        let recording = Arc::new(RecordingObserver::default());
        let observer: Arc<dyn CanScheduleSequenceObserver> = recording.clone();
        (recording, observer)
    }

    fn counting_task(traits: TaskTraits, counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        Task::new(traits, move || { counter.fetch_add(1, Ordering::SeqCst); }, Duration::ZERO)
    }

    // Posts a task to a new sequence the way the pool does.
    fn post(tracker: &TaskTracker, task: Task) -> Option<Arc<Sequence>> {
        if !tracker.will_post_task(&task) {
            return None;
        }
        let sequence = Arc::new(Sequence::new(*task.traits()));
        assert!(sequence.push_task(task));
        Some(sequence)
    }

    #[test]
    fn runs_accepted_tasks() {
        let tracker = TaskTracker::new(usize::MAX);
        let (_, observer) = observer();
        let counter = Arc::new(AtomicUsize::new(0));

        let sequence = post(&tracker, counting_task(TaskTraits::new(), &counter)).unwrap();
        let sequence = tracker.will_schedule_sequence(sequence, &observer).unwrap();
        assert!(tracker.run_next_task(sequence, &observer).is_none());

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.num_tasks_run(), 1);
        // Nothing left to flush.
        tracker.flush();
    }

    #[test]
    fn returns_sequence_with_remaining_tasks() {
        let tracker = TaskTracker::new(usize::MAX);
        let (_, observer) = observer();
        let counter = Arc::new(AtomicUsize::new(0));

        let sequence = Arc::new(Sequence::new(TaskTraits::new()));
        for _ in 0..3 {
            let task = counting_task(TaskTraits::new(), &counter);
            assert!(tracker.will_post_task(&task));
            sequence.push_task(task);
        }

        let mut next = tracker.will_schedule_sequence(sequence, &observer);
        let mut runs = 0;
        while let Some(sequence) = next {
            next = tracker.run_next_task(sequence, &observer);
            runs += 1;
        }

        assert_eq!(runs, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rejects_after_shutdown() {
        let tracker = TaskTracker::new(usize::MAX);
        tracker.shutdown();
        assert!(tracker.is_shutdown_complete());

        for behavior in [
            ShutdownBehavior::ContinueOnShutdown,
            ShutdownBehavior::SkipOnShutdown,
            ShutdownBehavior::BlockShutdown,
        ] {
            let traits = TaskTraits::new().with_shutdown_behavior(behavior);
            let task = Task::new(traits, || panic!("must not run"), Duration::ZERO);
            assert!(!tracker.will_post_task(&task));
        }
    }

    #[test]
    fn only_block_shutdown_accepted_during_shutdown() {
        let tracker = Arc::new(TaskTracker::new(usize::MAX));
        let (_, observer) = observer();
        let counter = Arc::new(AtomicUsize::new(0));

        let blocking = TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::BlockShutdown);
        let sequence = post(&tracker, counting_task(blocking, &counter)).unwrap();

        tracker.start_shutdown();
        assert!(tracker.has_shutdown_started());

        let skip = TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::SkipOnShutdown);
        let cont = TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::ContinueOnShutdown);
        assert!(post(&tracker, counting_task(skip, &counter)).is_none());
        assert!(post(&tracker, counting_task(cont, &counter)).is_none());
        let late_blocking = post(&tracker, counting_task(blocking, &counter)).unwrap();

        let waiter = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.complete_shutdown())
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!tracker.is_shutdown_complete());

        for sequence in [sequence, late_blocking] {
            let sequence = tracker.will_schedule_sequence(sequence, &observer).unwrap();
            assert!(tracker.run_next_task(sequence, &observer).is_none());
        }

        waiter.join().unwrap();
        assert!(tracker.is_shutdown_complete());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn skips_pending_tasks_once_shutdown_started() {
        let tracker = TaskTracker::new(usize::MAX);
        let (_, observer) = observer();
        let counter = Arc::new(AtomicUsize::new(0));

        let skip = TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::SkipOnShutdown);
        let cont = TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::ContinueOnShutdown);
        let a = post(&tracker, counting_task(skip, &counter)).unwrap();
        let b = post(&tracker, counting_task(cont, &counter)).unwrap();

        tracker.shutdown();

        for sequence in [a, b] {
            let sequence = tracker.will_schedule_sequence(sequence, &observer).unwrap();
            assert!(tracker.run_next_task(sequence, &observer).is_none());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.num_tasks_skipped(), 2);
    }

    #[test]
    fn running_skip_on_shutdown_task_blocks_shutdown() {
        let tracker = Arc::new(TaskTracker::new(usize::MAX));
        let (_, observer) = observer();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let done = Arc::new(AtomicBool::new(false));

        let task = {
            let done = done.clone();
            Task::new(TaskTraits::new(), move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                done.store(true, Ordering::SeqCst);
            }, Duration::ZERO)
        };
        let sequence = post(&tracker, task).unwrap();
        let sequence = tracker.will_schedule_sequence(sequence, &observer).unwrap();

        let runner = {
            let tracker = tracker.clone();
            let observer = observer.clone();
            std::thread::spawn(move || { tracker.run_next_task(sequence, &observer); })
        };
        started_rx.recv().unwrap();

        let shutdown = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.shutdown())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!tracker.is_shutdown_complete());

        release_tx.send(()).unwrap();
        shutdown.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        runner.join().unwrap();
    }

    #[test]
    fn background_deferred_while_foreground_pending() {
        let tracker = TaskTracker::new(usize::MAX);
        let (recording, observer) = observer();
        let counter = Arc::new(AtomicUsize::new(0));

        let foreground = TaskTraits::new().with_priority(TaskPriority::UserBlocking);
        let background = TaskTraits::new().with_priority(TaskPriority::Background);

        let fg = post(&tracker, counting_task(foreground, &counter)).unwrap();
        let fg = tracker.will_schedule_sequence(fg, &observer).unwrap();

        let bg = post(&tracker, counting_task(background, &counter)).unwrap();
        assert!(tracker.will_schedule_sequence(bg.clone(), &observer).is_none());
        assert!(recording.sequences.lock().unwrap().is_empty());

        assert!(tracker.run_next_task(fg, &observer).is_none());

        let released = recording.sequences.lock().unwrap().clone();
        assert_eq!(released.len(), 1);
        assert!(Arc::ptr_eq(&released[0], &bg));
        assert!(tracker.run_next_task(bg, &observer).is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn background_cap_releases_in_order() {
        let tracker = TaskTracker::new(1);
        // A concrete observer works as well as a trait object.
        let (recording, _) = observer();
        let counter = Arc::new(AtomicUsize::new(0));
        let background = TaskTraits::new().with_priority(TaskPriority::Background);

        let a = post(&tracker, counting_task(background, &counter)).unwrap();
        let b = post(&tracker, counting_task(background, &counter)).unwrap();
        let c = post(&tracker, counting_task(background, &counter)).unwrap();

        let a = tracker.will_schedule_sequence(a, &recording).unwrap();
        assert!(tracker.will_schedule_sequence(b.clone(), &recording).is_none());
        assert!(tracker.will_schedule_sequence(c.clone(), &recording).is_none());

        assert!(tracker.run_next_task(a, &recording).is_none());
        assert_eq!(recording.sequences.lock().unwrap().len(), 1);
        assert!(Arc::ptr_eq(&recording.sequences.lock().unwrap()[0], &b));

        assert!(tracker.run_next_task(b, &recording).is_none());
        assert_eq!(recording.sequences.lock().unwrap().len(), 2);
        assert!(Arc::ptr_eq(&recording.sequences.lock().unwrap()[1], &c));

        assert!(tracker.run_next_task(c, &recording).is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelled_task_is_skipped() {
        let tracker = TaskTracker::new(usize::MAX);
        let (_, observer) = observer();
        let counter = Arc::new(AtomicUsize::new(0));
        let flag = crate::core::task::CancellationFlag::new();

        let task = counting_task(TaskTraits::new(), &counter).with_cancellation(flag.clone());
        let sequence = post(&tracker, task).unwrap();
        flag.cancel();

        let sequence = tracker.will_schedule_sequence(sequence, &observer).unwrap();
        assert!(tracker.run_next_task(sequence, &observer).is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.num_tasks_skipped(), 1);
        tracker.flush();
    }

    #[test]
    fn flush_waits_for_pending_tasks() {
        let tracker = Arc::new(TaskTracker::new(usize::MAX));
        let (_, observer) = observer();
        let counter = Arc::new(AtomicUsize::new(0));

        let sequence = post(&tracker, counting_task(TaskTraits::new(), &counter)).unwrap();
        let flushed = Arc::new(AtomicBool::new(false));
        let flusher = {
            let tracker = tracker.clone();
            let flushed = flushed.clone();
            std::thread::spawn(move || {
                tracker.flush();
                flushed.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!flushed.load(Ordering::SeqCst));

        let sequence = tracker.will_schedule_sequence(sequence, &observer).unwrap();
        tracker.run_next_task(sequence, &observer);
        flusher.join().unwrap();
        assert!(flushed.load(Ordering::SeqCst));
    }

    #[test]
    fn flush_returns_when_shutdown_completes() {
        let tracker = Arc::new(TaskTracker::new(usize::MAX));
        let counter = Arc::new(AtomicUsize::new(0));
        let _pending = post(&tracker, counting_task(TaskTraits::new(), &counter)).unwrap();

        let flusher = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.flush())
        };

        std::thread::sleep(Duration::from_millis(10));
        tracker.shutdown();
        flusher.join().unwrap();
    }

    #[test]
    fn panicking_task_is_contained() {
        let tracker = TaskTracker::new(usize::MAX);
        let (_, observer) = observer();

        let sequence = post(&tracker, Task::new(TaskTraits::new(), || panic!("oops"), Duration::ZERO)).unwrap();
        let sequence = tracker.will_schedule_sequence(sequence, &observer).unwrap();
        assert!(tracker.run_next_task(sequence, &observer).is_none());
        assert_eq!(tracker.num_tasks_run(), 1);
        tracker.flush();
    }

    #[test]
    fn discarded_tasks_no_longer_block_shutdown() {
        let tracker = TaskTracker::new(usize::MAX);
        let (_, observer) = observer();
        let counter = Arc::new(AtomicUsize::new(0));

        let blocking = TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::BlockShutdown);
        let sequence = post(&tracker, counting_task(blocking, &counter)).unwrap();
        let task = counting_task(TaskTraits::new(), &counter);
        assert!(tracker.will_post_task(&task));
        sequence.push_task(task);

        let sequence = tracker.will_schedule_sequence(sequence, &observer).unwrap();
        tracker.discard_sequence(sequence.clone(), true);
        assert!(sequence.is_empty());

        tracker.discard_delayed_tasks(3);
        assert_eq!(tracker.num_tasks_skipped(), 5);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Neither waits on the discarded tasks.
        tracker.flush();
        tracker.shutdown();
    }

    #[test]
    fn deferred_sequences_discarded_once_the_pool_stops() {
        let tracker = TaskTracker::new(usize::MAX);
        let (recording, observer) = observer();
        let counter = Arc::new(AtomicUsize::new(0));

        let foreground = post(&tracker, counting_task(TaskTraits::new(), &counter)).unwrap();
        let foreground = tracker.will_schedule_sequence(foreground, &observer).unwrap();

        let background = TaskTraits::new().with_priority(TaskPriority::Background);
        let deferred = post(&tracker, counting_task(background, &counter)).unwrap();
        assert!(tracker.will_schedule_sequence(deferred.clone(), &observer).is_none());

        tracker.discard_deferred_sequences();
        assert!(deferred.is_empty());
        assert_eq!(tracker.num_tasks_skipped(), 1);

        // Sequences are no longer deferred, and nothing is released to the observer.
        let late = post(&tracker, counting_task(background, &counter)).unwrap();
        assert!(tracker.will_schedule_sequence(late.clone(), &observer).is_none());
        assert!(late.is_empty());
        assert!(tracker.run_next_task(foreground, &observer).is_none());
        assert!(recording.sequences.lock().unwrap().is_empty());

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.num_tasks_skipped(), 2);
        tracker.flush();
    }

    #[test]
    #[should_panic]
    fn shutdown_twice_panics() {
        let tracker = TaskTracker::new(usize::MAX);
        tracker.shutdown();
        tracker.shutdown();
    }
}

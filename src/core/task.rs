use std::fmt;
use std::panic::Location;
use std::time::{Duration, Instant};

use super::sync::{Arc, AtomicBool, Ordering};

/// The priority of a task.
///
/// Sequences are dispatched in priority order. Background work is additionally
/// subject to admission limits in the task tracker so that it doesn't crowd out
/// work the user is waiting on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Work the user won't notice if it takes a while.
    Background,
    /// Work whose result is visible to the user but not blocking interaction.
    #[default]
    UserVisible,
    /// Work the user is actively waiting on.
    UserBlocking,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 3] = [
        TaskPriority::Background,
        TaskPriority::UserVisible,
        TaskPriority::UserBlocking,
    ];

    #[inline]
    pub fn is_background(&self) -> bool {
        *self == TaskPriority::Background
    }
}

/// What happens to a task when the thread pool shuts down.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShutdownBehavior {
    /// The task is not run if it hasn't started when shutdown begins. If it is
    /// already running, shutdown doesn't wait for it.
    ContinueOnShutdown,
    /// The task is not run if it hasn't started when shutdown begins. If it is
    /// already running, shutdown waits for it to complete.
    #[default]
    SkipOnShutdown,
    /// The task is always run and shutdown waits for it. Tasks with this behavior
    /// may still be posted after shutdown has started, until it completes.
    BlockShutdown,
}

/// Properties attached to every task.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TaskTraits {
    priority: TaskPriority,
    shutdown_behavior: ShutdownBehavior,
    may_block: bool,
}

impl TaskTraits {
    pub fn new() -> Self {
        TaskTraits::default()
    }

    #[inline]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;

        self
    }

    #[inline]
    pub fn with_shutdown_behavior(mut self, behavior: ShutdownBehavior) -> Self {
        self.shutdown_behavior = behavior;

        self
    }

    /// Declare that the task may perform blocking operations.
    ///
    /// Blocking tasks temporarily raise the worker capacity of the pool so that
    /// other work can make progress while they wait.
    #[inline]
    pub fn with_may_block(mut self) -> Self {
        self.may_block = true;

        self
    }

    #[inline]
    pub fn priority(&self) -> TaskPriority { self.priority }

    #[inline]
    pub fn shutdown_behavior(&self) -> ShutdownBehavior { self.shutdown_behavior }

    #[inline]
    pub fn may_block(&self) -> bool { self.may_block }
}

/// A flag that can be raised to prevent a task from running if it hasn't started yet.
#[derive(Clone, Debug)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        CancellationFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// Deadlines that would overflow `Instant` are pushed this far out instead.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// The instant `delay` from now, saturating to a far away deadline.
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// A unit of work along with the metadata the scheduler needs to route it.
///
/// A task is owned by its sequence until a worker checks it out, and is dropped
/// after it runs or is skipped. Dropping the body without running it is how skipped
/// tasks release whatever they captured.
pub struct Task {
    posted_from: &'static Location<'static>,
    body: Box<dyn FnOnce() + Send>,
    traits: TaskTraits,
    delay: Duration,
    delayed_run_time: Option<Instant>,
    sequenced_time: Option<Instant>,
    cancellation: Option<CancellationFlag>,
}

impl Task {
    #[track_caller]
    pub fn new<F>(traits: TaskTraits, body: F, delay: Duration) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut traits = traits;
        let delayed_run_time = if delay.is_zero() {
            None
        } else {
            // A delayed task can't block shutdown since there is no telling when it
            // would become ready.
            if traits.shutdown_behavior == ShutdownBehavior::BlockShutdown {
                traits.shutdown_behavior = ShutdownBehavior::SkipOnShutdown;
            }
            Some(deadline_after(delay))
        };

        Task {
            posted_from: Location::caller(),
            body: Box::new(body),
            traits,
            delay,
            delayed_run_time,
            sequenced_time: None,
            cancellation: None,
        }
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = Some(flag);

        self
    }

    #[inline]
    pub fn traits(&self) -> &TaskTraits { &self.traits }

    #[inline]
    pub fn posted_from(&self) -> &'static Location<'static> { self.posted_from }

    #[inline]
    pub fn delay(&self) -> Duration { self.delay }

    #[inline]
    pub fn is_delayed(&self) -> bool { self.delayed_run_time.is_some() }

    /// The earliest time at which a delayed task may run.
    #[inline]
    pub fn requested_run_time(&self) -> Option<Instant> { self.delayed_run_time }

    /// The time at which the task was pushed into its sequence.
    #[inline]
    pub fn sequenced_time(&self) -> Option<Instant> { self.sequenced_time }

    pub(crate) fn set_sequenced_time(&mut self, time: Instant) {
        self.sequenced_time = Some(time);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().map_or(false, CancellationFlag::is_cancelled)
    }

    pub(crate) fn run(self) {
        (self.body)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("posted_from", &format_args!("{}", self.posted_from))
            .field("traits", &self.traits)
            .field("delay", &self.delay)
            .field("sequenced_time", &self.sequenced_time)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[test]
fn priority_order() {
    assert!(TaskPriority::Background < TaskPriority::UserVisible);
    assert!(TaskPriority::UserVisible < TaskPriority::UserBlocking);
    assert_eq!(TaskTraits::new().priority(), TaskPriority::UserVisible);
    assert_eq!(TaskTraits::new().shutdown_behavior(), ShutdownBehavior::SkipOnShutdown);
}

#[test]
fn delayed_block_shutdown_is_downgraded() {
    let traits = TaskTraits::new().with_shutdown_behavior(ShutdownBehavior::BlockShutdown);

    let immediate = Task::new(traits, || {}, Duration::ZERO);
    assert!(!immediate.is_delayed());
    assert_eq!(immediate.traits().shutdown_behavior(), ShutdownBehavior::BlockShutdown);

    let delayed = Task::new(traits, || {}, Duration::from_millis(5));
    assert!(delayed.is_delayed());
    assert!(delayed.requested_run_time().is_some());
    assert_eq!(delayed.traits().shutdown_behavior(), ShutdownBehavior::SkipOnShutdown);
}

#[test]
fn huge_delay_does_not_overflow() {
    let before = Instant::now();
    let task = Task::new(TaskTraits::new(), || {}, Duration::MAX);

    assert!(task.is_delayed());
    assert_eq!(task.delay(), Duration::MAX);
    assert!(task.requested_run_time().unwrap() >= before + Duration::from_secs(60 * 60 * 24 * 365));
}

#[test]
fn cancellation() {
    let flag = CancellationFlag::new();
    let task = Task::new(TaskTraits::new(), || {}, Duration::ZERO).with_cancellation(flag.clone());
    assert!(!task.is_cancelled());
    flag.cancel();
    assert!(task.is_cancelled());
}

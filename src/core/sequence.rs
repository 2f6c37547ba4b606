//! Sequences
//!
//! A sequence is an ordered queue of tasks that run one at a time, in push order,
//! possibly on different worker threads. While a task runs, its slot at the front
//! of the queue stays occupied by an empty placeholder so that pushing more tasks
//! doesn't make the sequence look schedulable a second time.

use std::any::Any;
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::mem;
use std::time::Instant;

use super::sync::{Arc, Mutex, Ordering};
use super::task::{Task, TaskPriority, TaskTraits};
use crate::util::{ExclusiveCheck, ExclusiveGuard};

// Use std's atomic type explicitly here because loom's doesn't support static initialization.
static NEXT_SEQUENCE_TOKEN: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
static NEXT_STORAGE_SLOT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

thread_local! {
    static CURRENT_SEQUENCE: RefCell<Option<CurrentSequence>> = RefCell::new(None);
}

/// An opaque identifier for a sequence.
///
/// Can be used to check whether the calling thread is currently running one of
/// the sequence's tasks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SequenceToken(u64);

impl SequenceToken {
    fn create() -> Self {
        SequenceToken(NEXT_SEQUENCE_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// The token of the sequence whose task is running on this thread, if any.
    pub fn current() -> Option<SequenceToken> {
        CURRENT_SEQUENCE.with(|current| {
            current.borrow().as_ref().map(|current| current.sequence.token())
        })
    }
}

/// The key used to order sequences in the priority queue.
///
/// Higher priority first, then the sequence whose front task was pushed earliest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    priority: TaskPriority,
    sequenced_time: Instant,
}

impl SortKey {
    pub fn new(priority: TaskPriority, sequenced_time: Instant) -> Self {
        SortKey { priority, sequenced_time }
    }

    pub fn priority(&self) -> TaskPriority { self.priority }

    pub fn sequenced_time(&self) -> Instant { self.sequenced_time }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority)
            // Earlier is greater.
            .then_with(|| other.sequenced_time.cmp(&self.sequenced_time))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

type SequenceLocalStorage = HashMap<usize, Box<dyn Any + Send>>;

pub struct Sequence {
    token: SequenceToken,
    // The traits of the runner that created this sequence.
    traits: TaskTraits,
    // None at the front means the front task is checked out.
    queue: Mutex<VecDeque<Option<Task>>>,
    // Moved into the running thread's thread-local storage for the duration of each task.
    storage: Mutex<SequenceLocalStorage>,
    run_check: ExclusiveCheck<SequenceToken>,
}

impl Sequence {
    pub fn new(traits: TaskTraits) -> Self {
        let token = SequenceToken::create();
        Sequence {
            token,
            traits,
            queue: Mutex::new(VecDeque::new()),
            storage: Mutex::new(HashMap::new()),
            run_check: ExclusiveCheck::with_tag(token),
        }
    }

    pub fn token(&self) -> SequenceToken { self.token }

    pub fn traits(&self) -> TaskTraits { self.traits }

    /// Push a task at the back of the sequence.
    ///
    /// Returns true if the sequence was empty, in which case the caller is responsible
    /// for scheduling it.
    pub fn push_task(&self, mut task: Task) -> bool {
        task.set_sequenced_time(Instant::now());

        let mut queue = self.queue.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_back(Some(task));

        was_empty
    }

    /// Check out the front task, leaving a placeholder in its slot until `pop`
    /// is called.
    ///
    /// Panics if the sequence is empty or if the front task is already checked out.
    pub fn take_task(&self) -> Task {
        let mut queue = self.queue.lock().unwrap();
        let front = queue.front_mut().expect("take_task() called on an empty sequence");

        front.take().expect("take_task() called while the front task is checked out")
    }

    /// Remove the placeholder left by `take_task`.
    ///
    /// Returns true if the sequence is now empty.
    pub fn pop(&self) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let front = queue.pop_front().expect("pop() called on an empty sequence");
        assert!(front.is_none(), "pop() called before take_task()");

        queue.is_empty()
    }

    /// Remove every pending task, leaving the sequence empty.
    ///
    /// Panics if the front task is checked out.
    pub(crate) fn take_all(&self) -> Vec<Task> {
        let mut queue = self.queue.lock().unwrap();
        queue.drain(..)
            .map(|task| task.expect("take_all() called while the front task is checked out"))
            .collect()
    }

    /// Compute the sort key from the front task.
    ///
    /// Panics if the sequence is empty or if the front task is checked out.
    pub fn sort_key(&self) -> SortKey {
        let queue = self.queue.lock().unwrap();
        let front = queue.front()
            .and_then(Option::as_ref)
            .expect("sort_key() requires a pending task at the front of the sequence");

        SortKey {
            priority: front.traits().priority(),
            sequenced_time: front.sequenced_time().unwrap_or_else(Instant::now),
        }
    }

    /// The traits of the front task, if it is not checked out.
    pub fn front_traits(&self) -> Option<TaskTraits> {
        let queue = self.queue.lock().unwrap();
        queue.front().and_then(Option::as_ref).map(|task| *task.traits())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Panics if a task of this sequence is already running.
    pub(crate) fn begin_run(&self) -> ExclusiveGuard<'_, SequenceToken> {
        self.run_check.enter()
    }

    /// The sequence whose task is running on this thread, if any.
    pub(crate) fn current() -> Option<Arc<Sequence>> {
        CURRENT_SEQUENCE.with(|current| {
            current.borrow().as_ref().map(|current| current.sequence.clone())
        })
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("token", &self.token)
            .field("len", &self.len())
            .finish()
    }
}

struct CurrentSequence {
    sequence: Arc<Sequence>,
    storage: SequenceLocalStorage,
}

/// Makes a sequence current on this thread for the duration of a task.
pub(crate) struct ScopedCurrentSequence {
    previous: Option<CurrentSequence>,
    _not_send: PhantomData<*const ()>,
}

impl ScopedCurrentSequence {
    pub fn new(sequence: &Arc<Sequence>) -> Self {
        let storage = mem::take(&mut *sequence.storage.lock().unwrap());
        let previous = CURRENT_SEQUENCE.with(|current| {
            current.replace(Some(CurrentSequence {
                sequence: sequence.clone(),
                storage,
            }))
        });

        ScopedCurrentSequence { previous, _not_send: PhantomData }
    }
}

impl Drop for ScopedCurrentSequence {
    fn drop(&mut self) {
        let current = CURRENT_SEQUENCE.with(|current| current.replace(self.previous.take()));
        if let Some(current) = current {
            if let Ok(mut storage) = current.sequence.storage.lock() {
                *storage = current.storage;
            }
        }
    }
}

/// A value stored per sequence, accessible from the tasks of that sequence.
///
/// Each slot is an independent key: the same slot holds a different value in each
/// sequence. Values are dropped along with their sequence.
///
/// Accessing a slot outside of a sequenced task panics.
pub struct SequenceLocalStorageSlot<T> {
    id: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> SequenceLocalStorageSlot<T> {
    pub fn new() -> Self {
        SequenceLocalStorageSlot {
            id: NEXT_STORAGE_SLOT.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    /// Store a value, returning the previous one.
    pub fn set(&self, value: T) -> Option<T> {
        Self::with_storage(|storage| storage.insert(self.id, Box::new(value)))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    pub fn take(&self) -> Option<T> {
        Self::with_storage(|storage| storage.remove(&self.id))
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn get(&self) -> Option<T> where T: Clone {
        Self::with_storage(|storage| {
            storage.get(&self.id)
                .and_then(|value| value.downcast_ref::<T>())
                .cloned()
        })
    }

    /// Mutate the stored value in place, starting from the default if the slot is empty.
    ///
    /// The value is moved out of storage while `f` runs, so `f` may access other slots.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R where T: Default {
        let mut value = self.take().unwrap_or_default();
        let result = f(&mut value);
        self.set(value);

        result
    }

    fn with_storage<R>(f: impl FnOnce(&mut SequenceLocalStorage) -> R) -> R {
        CURRENT_SEQUENCE.with(|current| {
            let mut current = current.borrow_mut();
            let current = current.as_mut()
                .expect("sequence-local storage is only accessible from a sequenced task");
            f(&mut current.storage)
        })
    }
}

impl<T: Send + 'static> Default for SequenceLocalStorageSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
fn test_task(traits: TaskTraits, log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Task {
    let log = log.clone();
    Task::new(traits, move || log.lock().unwrap().push(name), std::time::Duration::ZERO)
}

#[test]
fn push_take_pop_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sequence = Sequence::new(TaskTraits::new());

    assert!(sequence.push_task(test_task(TaskTraits::new(), &log, "A")));
    assert!(!sequence.push_task(test_task(TaskTraits::new(), &log, "B")));
    assert!(!sequence.push_task(test_task(TaskTraits::new(), &log, "C")));

    let mut remaining = 3;
    loop {
        sequence.take_task().run();
        remaining -= 1;
        let empty = sequence.pop();
        assert_eq!(empty, remaining == 0);
        if empty {
            break;
        }
    }

    assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);
}

#[test]
fn push_while_checked_out_is_not_a_transition() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sequence = Sequence::new(TaskTraits::new());

    assert!(sequence.push_task(test_task(TaskTraits::new(), &log, "A")));
    let task = sequence.take_task();
    // The placeholder keeps the sequence non-empty.
    assert!(!sequence.push_task(test_task(TaskTraits::new(), &log, "B")));
    task.run();
    assert!(!sequence.pop());
    sequence.take_task().run();
    assert!(sequence.pop());
    assert!(sequence.push_task(test_task(TaskTraits::new(), &log, "C")));
}

#[test]
#[should_panic]
fn double_take_panics() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sequence = Sequence::new(TaskTraits::new());
    sequence.push_task(test_task(TaskTraits::new(), &log, "A"));
    sequence.push_task(test_task(TaskTraits::new(), &log, "B"));

    let _a = sequence.take_task();
    let _b = sequence.take_task();
}

#[test]
#[should_panic]
fn take_from_empty_panics() {
    Sequence::new(TaskTraits::new()).take_task();
}

#[test]
#[should_panic]
fn pop_without_take_panics() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sequence = Sequence::new(TaskTraits::new());
    sequence.push_task(test_task(TaskTraits::new(), &log, "A"));
    sequence.pop();
}

#[test]
fn sort_key_follows_front_task() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sequence = Sequence::new(TaskTraits::new());
    let background = TaskTraits::new().with_priority(TaskPriority::Background);
    let blocking = TaskTraits::new().with_priority(TaskPriority::UserBlocking);

    sequence.push_task(test_task(background, &log, "A"));
    sequence.push_task(test_task(blocking, &log, "B"));
    assert_eq!(sequence.sort_key().priority(), TaskPriority::Background);

    sequence.take_task();
    sequence.pop();
    assert_eq!(sequence.sort_key().priority(), TaskPriority::UserBlocking);
}

#[test]
fn sort_key_ordering() {
    let now = Instant::now();
    let later = now + std::time::Duration::from_millis(1);

    let high = SortKey::new(TaskPriority::UserBlocking, later);
    let low = SortKey::new(TaskPriority::Background, now);
    assert!(high > low);

    let first = SortKey::new(TaskPriority::UserVisible, now);
    let second = SortKey::new(TaskPriority::UserVisible, later);
    assert!(first > second);
}

#[test]
fn current_token_and_storage() {
    let sequence = Arc::new(Sequence::new(TaskTraits::new()));
    let slot: SequenceLocalStorageSlot<u32> = SequenceLocalStorageSlot::new();
    assert_eq!(SequenceToken::current(), None);

    {
        let _current = ScopedCurrentSequence::new(&sequence);
        assert_eq!(SequenceToken::current(), Some(sequence.token()));
        assert_eq!(slot.get(), None);
        slot.set(7);
        slot.with_mut(|value| *value += 1);
    }

    assert_eq!(SequenceToken::current(), None);

    // The value survives across tasks of the same sequence.
    {
        let _current = ScopedCurrentSequence::new(&sequence);
        assert_eq!(slot.get(), Some(8));
    }

    // But is not visible from another sequence.
    let other = Arc::new(Sequence::new(TaskTraits::new()));
    {
        let _current = ScopedCurrentSequence::new(&other);
        assert_eq!(slot.get(), None);
    }
}

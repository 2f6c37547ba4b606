use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use super::sequence::{Sequence, SortKey};
use super::sync::{Arc, Mutex, MutexGuard};

struct Entry {
    sequence: Arc<Sequence>,
    sort_key: SortKey,
    // Breaks ties between equal sort keys in insertion order.
    insertion: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.sort_key.cmp(&other.sort_key)
            .then_with(|| other.insertion.cmp(&self.insertion))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

struct Heap {
    entries: BinaryHeap<Entry>,
    next_insertion: u64,
}

/// A collection of sequences ordered by sort key.
///
/// All access goes through a transaction which holds the queue's lock, so there
/// can be at most one open transaction per queue at a time. Independent queues
/// don't share anything.
pub struct PriorityQueue {
    heap: Mutex<Heap>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        PriorityQueue {
            heap: Mutex::new(Heap {
                entries: BinaryHeap::new(),
                next_insertion: 0,
            }),
        }
    }

    pub fn begin_transaction(&self) -> PriorityQueueTransaction<'_> {
        PriorityQueueTransaction {
            heap: self.heap.lock().unwrap(),
        }
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to a `PriorityQueue`, released when dropped.
pub struct PriorityQueueTransaction<'l> {
    heap: MutexGuard<'l, Heap>,
}

impl<'l> PriorityQueueTransaction<'l> {
    /// Insert a sequence.
    ///
    /// A sequence must not be in the queue more than once.
    pub fn push(&mut self, sequence: Arc<Sequence>, sort_key: SortKey) {
        debug_assert!(
            !self.heap.entries.iter().any(|entry| Arc::ptr_eq(&entry.sequence, &sequence)),
            "{:?} is already in the priority queue", sequence.token(),
        );

        let insertion = self.heap.next_insertion;
        self.heap.next_insertion += 1;
        self.heap.entries.push(Entry { sequence, sort_key, insertion });
    }

    /// Remove and return the sequence with the highest sort key.
    pub fn pop_sequence(&mut self) -> Option<Arc<Sequence>> {
        self.heap.entries.pop().map(|entry| entry.sequence)
    }

    pub fn peek_sort_key(&self) -> Option<SortKey> {
        self.heap.entries.peek().map(|entry| entry.sort_key)
    }

    pub fn len(&self) -> usize {
        self.heap.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.entries.is_empty()
    }

    /// Remove every sequence from the queue.
    pub fn clear(&mut self) -> Vec<Arc<Sequence>> {
        self.heap.entries.drain().map(|entry| entry.sequence).collect()
    }
}

#[cfg(test)]
use super::task::{TaskPriority, TaskTraits};

#[cfg(test)]
fn sequence_with_priority(priority: TaskPriority) -> Arc<Sequence> {
    let traits = TaskTraits::new().with_priority(priority);
    let sequence = Arc::new(Sequence::new(traits));
    sequence.push_task(super::task::Task::new(traits, || {}, std::time::Duration::ZERO));

    sequence
}

#[test]
fn pops_highest_priority_first() {
    let queue = PriorityQueue::new();

    let background = sequence_with_priority(TaskPriority::Background);
    let visible = sequence_with_priority(TaskPriority::UserVisible);
    let blocking = sequence_with_priority(TaskPriority::UserBlocking);

    {
        let mut transaction = queue.begin_transaction();
        for sequence in [&visible, &background, &blocking] {
            transaction.push(sequence.clone(), sequence.sort_key());
        }
        assert_eq!(transaction.len(), 3);
        assert_eq!(transaction.peek_sort_key().map(|key| key.priority()), Some(TaskPriority::UserBlocking));
    }

    let mut transaction = queue.begin_transaction();
    assert!(Arc::ptr_eq(&transaction.pop_sequence().unwrap(), &blocking));
    assert!(Arc::ptr_eq(&transaction.pop_sequence().unwrap(), &visible));
    assert!(Arc::ptr_eq(&transaction.pop_sequence().unwrap(), &background));
    assert!(transaction.pop_sequence().is_none());
    assert!(transaction.is_empty());
}

#[test]
fn fifo_within_a_priority() {
    let queue = PriorityQueue::new();
    let sequences: Vec<_> = (0..10).map(|_| sequence_with_priority(TaskPriority::UserVisible)).collect();

    let mut transaction = queue.begin_transaction();
    for sequence in &sequences {
        transaction.push(sequence.clone(), sequence.sort_key());
    }

    for sequence in &sequences {
        assert!(Arc::ptr_eq(&transaction.pop_sequence().unwrap(), sequence));
    }
}

#[test]
fn independent_queues() {
    let a = PriorityQueue::new();
    let b = PriorityQueue::new();

    // Holding a transaction on one queue doesn't prevent using the other.
    let mut ta = a.begin_transaction();
    let mut tb = b.begin_transaction();
    let sequence = sequence_with_priority(TaskPriority::UserVisible);
    ta.push(sequence.clone(), sequence.sort_key());
    assert!(tb.pop_sequence().is_none());
    assert_eq!(ta.len(), 1);
}

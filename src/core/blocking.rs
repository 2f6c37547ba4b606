//! Blocking calls
//!
//! A task that is about to block (on I/O, a lock, a handle...) wraps the blocking
//! operation in a `ScopedBlockingCall`. When the task runs on a pool worker, the pool
//! is notified and may temporarily raise its worker capacity so that other work keeps
//! flowing while this thread waits.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;

use super::sync::Arc;

/// How likely the wrapped operation is to actually block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlockingType {
    /// The operation may return quickly. Capacity is only raised if it lasts longer
    /// than the pool's may-block threshold.
    MayBlock,
    /// The operation is known to block. Capacity is raised immediately.
    WillBlock,
}

/// Receives notifications about blocking calls on the thread it is registered on.
pub(crate) trait BlockingObserver: Send + Sync {
    fn blocking_started(&self, blocking_type: BlockingType);
    /// A `WillBlock` call was nested in a `MayBlock` one.
    fn blocking_type_upgraded(&self);
    fn blocking_ended(&self);
}

struct BlockingScopeState {
    depth: u32,
    blocking_type: Option<BlockingType>,
}

thread_local! {
    static BLOCKING_OBSERVER: RefCell<Option<Arc<dyn BlockingObserver>>> = RefCell::new(None);
    static BLOCKING_SCOPE: RefCell<BlockingScopeState> = RefCell::new(BlockingScopeState {
        depth: 0,
        blocking_type: None,
    });
    // Threads that don't belong to a pool may always block.
    static BLOCKING_ALLOWED: Cell<bool> = Cell::new(true);
}

pub(crate) fn set_blocking_observer(observer: Option<Arc<dyn BlockingObserver>>) {
    BLOCKING_OBSERVER.with(|current| *current.borrow_mut() = observer);
}

/// Whether the current task declared that it may block.
pub fn blocking_allowed() -> bool {
    BLOCKING_ALLOWED.with(Cell::get)
}

/// Sets whether blocking calls are allowed on this thread until dropped.
pub(crate) struct ScopedBlockingPermission {
    previous: bool,
    _not_send: PhantomData<*const ()>,
}

impl ScopedBlockingPermission {
    pub fn new(allowed: bool) -> Self {
        let previous = BLOCKING_ALLOWED.with(|current| current.replace(allowed));

        ScopedBlockingPermission { previous, _not_send: PhantomData }
    }
}

impl Drop for ScopedBlockingPermission {
    fn drop(&mut self) {
        BLOCKING_ALLOWED.with(|current| current.set(self.previous));
    }
}

enum Notification {
    Started(BlockingType),
    Upgraded,
}

/// Marks the scope of a blocking operation.
///
/// Scopes can be nested. Only the outermost one notifies the pool, except when
/// a `WillBlock` scope is nested in a `MayBlock` one, which upgrades it.
///
/// ```ignore
/// pool.post_task(TaskTraits::new().with_may_block(), || {
///     let _blocking = ScopedBlockingCall::new(BlockingType::WillBlock);
///     std::fs::read("big_file.bin").unwrap();
/// });
/// ```
pub struct ScopedBlockingCall {
    observer: Option<Arc<dyn BlockingObserver>>,
    _not_send: PhantomData<*const ()>,
}

impl ScopedBlockingCall {
    /// Panics when called from a pool task that wasn't posted with `may_block`.
    pub fn new(blocking_type: BlockingType) -> Self {
        assert!(
            blocking_allowed(),
            "blocking calls are only allowed in tasks posted with TaskTraits::with_may_block()",
        );

        Self::new_unchecked(blocking_type)
    }

    pub(crate) fn new_unchecked(blocking_type: BlockingType) -> Self {
        let notification = BLOCKING_SCOPE.with(|scope| {
            let mut scope = scope.borrow_mut();
            scope.depth += 1;
            match scope.blocking_type {
                None => {
                    scope.blocking_type = Some(blocking_type);
                    Some(Notification::Started(blocking_type))
                }
                Some(BlockingType::MayBlock) if blocking_type == BlockingType::WillBlock => {
                    scope.blocking_type = Some(BlockingType::WillBlock);
                    Some(Notification::Upgraded)
                }
                Some(_) => None,
            }
        });

        let observer = BLOCKING_OBSERVER.with(|observer| observer.borrow().clone());
        if let Some(observer) = &observer {
            match notification {
                Some(Notification::Started(blocking_type)) => observer.blocking_started(blocking_type),
                Some(Notification::Upgraded) => observer.blocking_type_upgraded(),
                None => {}
            }
        }

        ScopedBlockingCall { observer, _not_send: PhantomData }
    }
}

impl Drop for ScopedBlockingCall {
    fn drop(&mut self) {
        let outermost = BLOCKING_SCOPE.with(|scope| {
            let mut scope = scope.borrow_mut();
            scope.depth -= 1;
            if scope.depth == 0 {
                scope.blocking_type = None;
            }

            scope.depth == 0
        });

        if outermost {
            if let Some(observer) = &self.observer {
                observer.blocking_ended();
            }
        }
    }
}

#[cfg(test)]
use super::sync::Mutex;

#[cfg(test)]
#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

#[cfg(test)]
impl BlockingObserver for RecordingObserver {
    fn blocking_started(&self, blocking_type: BlockingType) {
        self.events.lock().unwrap().push(format!("started {:?}", blocking_type));
    }
    fn blocking_type_upgraded(&self) {
        self.events.lock().unwrap().push("upgraded".to_string());
    }
    fn blocking_ended(&self) {
        self.events.lock().unwrap().push("ended".to_string());
    }
}

#[test]
fn nested_scopes_notify_once() {
    let observer = Arc::new(RecordingObserver::default());
    set_blocking_observer(Some(observer.clone() as Arc<dyn BlockingObserver>));

    {
        let _outer = ScopedBlockingCall::new(BlockingType::MayBlock);
        {
            let _inner = ScopedBlockingCall::new(BlockingType::MayBlock);
        }
        let _upgrade = ScopedBlockingCall::new(BlockingType::WillBlock);
        let _nested_will = ScopedBlockingCall::new(BlockingType::WillBlock);
    }

    set_blocking_observer(None);

    assert_eq!(
        *observer.events.lock().unwrap(),
        vec!["started MayBlock", "upgraded", "ended"],
    );
}

#[test]
fn permission_scope() {
    assert!(blocking_allowed());
    {
        let _permission = ScopedBlockingPermission::new(false);
        assert!(!blocking_allowed());
        {
            let _nested = ScopedBlockingPermission::new(true);
            assert!(blocking_allowed());
        }
        assert!(!blocking_allowed());
    }
    assert!(blocking_allowed());
}

#[test]
#[should_panic]
fn blocking_without_permission_panics() {
    let _permission = ScopedBlockingPermission::new(false);
    let _blocking = ScopedBlockingCall::new(BlockingType::WillBlock);
}

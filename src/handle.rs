//! Handles are references to the result of submitted work.
//!
//! A `Promise` and a `TaskHandle` are the two ends of a single-use channel. The promise
//! travels with the task and is resolved exactly once: either with the task's output, or
//! with an error if the task panicked or was dropped before running (skipped at shutdown,
//! cancelled, or discarded when the pool was joined).

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::core::blocking::{BlockingType, ScopedBlockingCall};
use crate::core::sync::{Arc, Condvar, Mutex};
use crate::core::task::CancellationFlag;
use crate::core::worker::is_pool_thread;
use crate::error::TaskError;
use crate::runner::SequencedTaskRunner;
use crate::util::panic_message;

enum Slot<T> {
    Pending,
    Ready(Result<T, TaskError>),
    Taken,
}

struct State<T> {
    slot: Slot<T>,
    // Runs once the slot is ready.
    continuation: Option<Box<dyn FnOnce() + Send>>,
}

struct OneShot<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> OneShot<T> {
    fn complete(&self, result: Result<T, TaskError>) {
        let continuation = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(matches!(state.slot, Slot::Pending));
            state.slot = Slot::Ready(result);
            self.cond.notify_all();

            state.continuation.take()
        };

        if let Some(continuation) = continuation {
            continuation();
        }
    }

    fn take(&self) -> Result<T, TaskError> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut state.slot, Slot::Taken) {
            Slot::Ready(result) => result,
            Slot::Pending | Slot::Taken => unreachable!("the result was taken before it was ready"),
        }
    }
}

/// Create a connected promise and handle.
pub fn promise<T>() -> (Promise<T>, TaskHandle<T>) {
    let shared = Arc::new(OneShot {
        state: Mutex::new(State { slot: Slot::Pending, continuation: None }),
        cond: Condvar::new(),
    });

    (
        Promise { shared: Some(shared.clone()) },
        TaskHandle { shared, cancellation: None },
    )
}

/// The sending end of a task result.
///
/// Dropping a promise without resolving it resolves its handle with `TaskError::Abandoned`.
pub struct Promise<T> {
    shared: Option<Arc<OneShot<T>>>,
}

impl<T> Promise<T> {
    pub fn resolve(mut self, value: T) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Ok(value));
        }
    }

    /// Resolve with the output of `f`, or with `TaskError::Panicked` if it panics.
    ///
    /// The panic is propagated after the handle is resolved.
    pub(crate) fn fulfill<F>(mut self, f: F)
    where
        F: FnOnce() -> T,
    {
        let shared = match self.shared.take() {
            Some(shared) => shared,
            None => return,
        };

        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => shared.complete(Ok(value)),
            Err(payload) => {
                shared.complete(Err(TaskError::Panicked(panic_message(&*payload).to_string())));
                panic::resume_unwind(payload);
            }
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(TaskError::Abandoned));
        }
    }
}

/// The receiving end of a task result.
pub struct TaskHandle<T> {
    shared: Arc<OneShot<T>>,
    cancellation: Option<CancellationFlag>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = Some(flag);

        self
    }

    pub fn is_ready(&self) -> bool {
        !matches!(self.shared.state.lock().unwrap().slot, Slot::Pending)
    }

    /// Block until the result is available.
    ///
    /// When called from a pool task this counts as a blocking call, so the pool may
    /// raise its capacity while waiting.
    pub fn wait(self) -> Result<T, TaskError> {
        profiling::scope!("TaskHandle::wait");

        let _blocking = (is_pool_thread() && !self.is_ready())
            .then(|| ScopedBlockingCall::new_unchecked(BlockingType::WillBlock));

        let mut state = self.shared.state.lock().unwrap();
        while let Slot::Pending = state.slot {
            state = self.shared.cond.wait(state).unwrap();
        }
        drop(state);

        self.shared.take()
    }

    /// Block until the result is available or the timeout expires, in which case the
    /// handle is given back.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, TaskError>, Self> {
        let deadline = Instant::now() + timeout;
        let _blocking = (is_pool_thread() && !self.is_ready())
            .then(|| ScopedBlockingCall::new_unchecked(BlockingType::WillBlock));

        let mut state = self.shared.state.lock().unwrap();
        while let Slot::Pending = state.slot {
            let now = Instant::now();
            if now >= deadline {
                drop(state);
                return Err(self);
            }
            state = self.shared.cond.wait_timeout(state, deadline - now).unwrap().0;
        }
        drop(state);

        Ok(self.shared.take())
    }

    /// Take the result if it is ready, otherwise give the handle back.
    pub fn try_take(self) -> Result<Result<T, TaskError>, Self> {
        if self.is_ready() {
            Ok(self.shared.take())
        } else {
            Err(self)
        }
    }

    /// Prevent the task from running if it hasn't started yet.
    ///
    /// A cancelled task is skipped and its handle resolves with `TaskError::Abandoned`.
    /// Has no effect on a task that already started or on handles that aren't attached
    /// to a posted task.
    pub fn cancel(&self) {
        if let Some(flag) = &self.cancellation {
            flag.cancel();
        }
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Post `f` with the result to `runner` once it is available.
    ///
    /// If `runner` rejects the task (for example because the pool is shutting down),
    /// `f` is dropped without being called.
    pub fn on_complete<F>(self, runner: &SequencedTaskRunner, f: F)
    where
        F: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        let shared = self.shared.clone();
        let runner = runner.clone();
        let post_reply = move || {
            runner.post_task(move || f(shared.take()));
        };

        let mut state = self.shared.state.lock().unwrap();
        if let Slot::Pending = state.slot {
            state.continuation = Some(Box::new(post_reply));
            return;
        }
        drop(state);

        post_reply();
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[test]
fn resolve_then_wait() {
    let (promise, handle) = promise();
    assert!(!handle.is_ready());
    promise.resolve(42u32);
    assert!(handle.is_ready());
    assert_eq!(handle.wait(), Ok(42));
}

#[test]
fn dropped_promise_abandons() {
    let (promise, handle) = promise::<u32>();
    drop(promise);
    assert_eq!(handle.wait(), Err(TaskError::Abandoned));
}

#[test]
fn wait_across_threads() {
    let (promise, handle) = promise();
    let thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        promise.resolve("done");
    });

    assert_eq!(handle.wait(), Ok("done"));
    thread.join().unwrap();
}

#[test]
fn try_take_and_timeout() {
    let (promise, handle) = promise::<u32>();
    let handle = handle.try_take().unwrap_err();
    let handle = handle.wait_timeout(Duration::from_millis(5)).unwrap_err();

    promise.resolve(1);
    assert_eq!(handle.try_take().unwrap(), Ok(1));
}

#[test]
fn fulfill_catches_panics() {
    let (promise, handle) = promise::<u32>();
    let result = panic::catch_unwind(AssertUnwindSafe(move || promise.fulfill(|| panic!("boom"))));
    assert!(result.is_err());
    assert_eq!(handle.wait(), Err(TaskError::Panicked("boom".to_string())));
}

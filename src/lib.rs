//! A thread pool that runs tasks by priority and knows what to do with them at shutdown.
//!
//! What we want:
//! - Tasks posted to a sequence run one at a time, in posting order, on whichever
//!   worker is available.
//! - Sequences are dispatched by priority, then in the order their front task was posted.
//! - Background work doesn't crowd out work the user is waiting on.
//! - Every task says what happens to it at shutdown: it can block shutdown, be skipped,
//!   or be abandoned if it is already running.
//! - Threads are created on demand, reclaimed when idle for a while, and the pool grows
//!   temporarily while tasks are blocked.
//! - No implicit global thread pool.
//!
//! ```ignore
//! let pool = ThreadPool::builder().with_worker_capacity(4).build()?;
//!
//! let runner = pool.create_sequenced_task_runner(TaskTraits::new());
//! runner.post_task(|| println!("first"));
//! runner.post_task(|| println!("second"));
//!
//! let handle = pool.submit(TaskTraits::new().with_priority(TaskPriority::UserBlocking), || 40 + 2)?;
//! assert_eq!(handle.wait(), Ok(42));
//!
//! pool.shutdown();
//! ```

mod core;
mod config;
pub mod util;
pub mod error;
pub mod handle;
pub mod runner;

pub use crate::core::task::{TaskPriority, TaskTraits, ShutdownBehavior};
pub use crate::core::sequence::{SequenceToken, SequenceLocalStorageSlot};
pub use crate::core::blocking::{BlockingType, ScopedBlockingCall};
pub use crate::core::thread_pool::{ThreadPool, ThreadPoolId, ThreadPoolBuilder, ThreadPoolStats, ShutdownHandle};
pub use crate::core::WorkerHook;
pub use crate::core::worker::is_pool_thread;
pub use crate::core::sync;
pub use crate::error::{PostError, TaskError, PoolError};
pub use crate::handle::{Promise, TaskHandle};
pub use crate::runner::{TaskRunner, SequencedTaskRunner};

use std::any::Any;

use crate::core::sync::{AtomicBool, Ordering, thread};

/// A simple utility to dynamically assert that a section of code is executed
/// by a single thread at a time.
///
/// Unlike a lock, a second concurrent entry doesn't wait: it panics.
pub struct ExclusiveCheck<T> {
    lock: AtomicBool,
    tag: T
}

impl<T: std::fmt::Debug> ExclusiveCheck<T> {
    pub fn with_tag(tag: T) -> Self {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag,
        }
    }

    /// Mark the beginning of the exclusive section, which lasts until the returned
    /// guard is dropped.
    pub fn enter(&self) -> ExclusiveGuard<T> {
        let res = self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (enter): {:?}", self.tag);

        ExclusiveGuard { check: self }
    }

    pub fn is_entered(&self) -> bool {
        self.lock.load(Ordering::Acquire)
    }
}

pub struct ExclusiveGuard<'l, T: std::fmt::Debug> {
    check: &'l ExclusiveCheck<T>,
}

impl<'l, T: std::fmt::Debug> Drop for ExclusiveGuard<'l, T> {
    fn drop(&mut self) {
        let res = self.check.lock.compare_exchange(true, false, Ordering::Release, Ordering::Relaxed);
        // Don't double-panic if the section is being unwound.
        if !std::thread::panicking() {
            assert!(res.is_ok(), "Exclusive check failed (exit): {:?}", self.check.tag);
        }
    }
}

/// The message of a caught panic, if it has one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<unknown>"
    }
}

/// Join a thread, logging the panic that ended it if there was one.
///
/// Returns false if the thread panicked.
pub(crate) fn join_thread(handle: thread::JoinHandle<()>) -> bool {
    let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
    match handle.join() {
        Ok(()) => true,
        Err(payload) => {
            tracing::error!(thread = %name, message = panic_message(&*payload), "thread panicked");
            false
        }
    }
}

#[test]
fn exclu_check_01() {
    let check = ExclusiveCheck::with_tag(());

    for _ in 0..3 {
        let guard = check.enter();
        assert!(check.is_entered());
        drop(guard);
        assert!(!check.is_entered());
    }
}

#[test]
#[should_panic]
fn exclu_check_02() {
    let check = ExclusiveCheck::with_tag("overlap");

    let _a = check.enter();
    let _b = check.enter();
}

#[test]
fn panic_messages() {
    let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
    assert_eq!(panic_message(&*payload), "static");

    let payload = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
    assert_eq!(panic_message(&*payload), "formatted 42");
}

#[test]
fn join_thread_reports_panics() {
    let clean = std::thread::Builder::new()
        .name("clean".to_string())
        .spawn(|| {})
        .unwrap();
    assert!(join_thread(clean));

    let panicking = std::thread::Builder::new()
        .name("panicking".to_string())
        .spawn(|| panic!("worker failure"))
        .unwrap();
    assert!(!join_thread(panicking));
}

//! Two-level locking discipline.
//!
//! The pipeline has two lock tiers:
//!
//! - **coarse** locks guard one shared resource for the whole stage: the
//!   decoder input plus its path map, and the multiplexer's context list;
//! - **fine** locks guard one unit of work: a File Entry, or one stream
//!   context's destination.
//!
//! A coarse lock is always released before a fine lock is taken, so no
//! thread ever holds one of each.  Debug builds track coarse ownership per
//! thread and panic when a fine lock is requested while a coarse one is held.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};

thread_local! {
    static COARSE_HELD: Cell<usize> = const { Cell::new(0) };
}

/// Guard for a coarse lock.  Derefs to the protected value.
pub struct CoarseGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for CoarseGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T { &self.guard }
}

impl<T> DerefMut for CoarseGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T { &mut self.guard }
}

impl<T> Drop for CoarseGuard<'_, T> {
    fn drop(&mut self) {
        COARSE_HELD.with(|held| held.set(held.get() - 1));
    }
}

/// Acquire a coarse lock.  A poisoned mutex is recovered: every critical
/// section in this crate leaves its data consistent before it can fail.
pub fn lock_coarse<T>(mutex: &Mutex<T>) -> CoarseGuard<'_, T> {
    let guard = mutex.lock().unwrap_or_else(|e| e.into_inner());
    COARSE_HELD.with(|held| held.set(held.get() + 1));
    CoarseGuard { guard }
}

/// Acquire a fine lock.
pub fn lock_fine<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    assert_no_coarse();
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Block on `condvar` while holding a fine lock.
pub fn wait_fine<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    assert_no_coarse();
    condvar.wait(guard).unwrap_or_else(|e| e.into_inner())
}

/// True when the current thread holds a coarse lock.
pub fn coarse_held() -> bool {
    COARSE_HELD.with(|held| held.get() > 0)
}

fn assert_no_coarse() {
    debug_assert!(
        !coarse_held(),
        "fine-grained lock requested while a coarse lock is held"
    );
}

//! Keeps the thread's OS error value stable across a forwarded call.
//!
//! The redirect body runs framework code after the original returns (logging, region queries,
//! subscribers). Any of it may overwrite the per-thread error slot, yet the real caller expects
//! to observe exactly what the original left there. The preserver snapshots the value after the
//! forward and writes it back when it goes out of scope.

use std::cell::Cell;

/// Access to the per-thread error value the OS exposes to callers (`GetLastError` on Windows).
pub trait ThreadErrorState: Send + Sync {
    fn last_error(&self) -> u32;
    fn set_last_error(&self, code: u32);
}

/// RAII snapshot of the thread error value. Dropping it restores the snapshot.
pub struct LastErrorPreserver<'a, S: ThreadErrorState + ?Sized> {
    state: &'a S,
    saved: u32,
}

impl<'a, S: ThreadErrorState + ?Sized> LastErrorPreserver<'a, S> {
    #[inline]
    pub fn new(state: &'a S) -> Self {
        Self {
            saved: state.last_error(),
            state,
        }
    }

    /// Re-snapshot the current value, typically right after the original returned.
    #[inline]
    pub fn update(&mut self) {
        self.saved = self.state.last_error();
    }

    #[inline]
    pub fn saved(&self) -> u32 {
        self.saved
    }
}

impl<S: ThreadErrorState + ?Sized> Drop for LastErrorPreserver<'_, S> {
    fn drop(&mut self) {
        self.state.set_last_error(self.saved);
    }
}

thread_local! {
    static SOFT_LAST_ERROR: Cell<u32> = const { Cell::new(0) };
}

/// Thread-local error slot for hosts without an OS-level one (and for tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadLocalErrorState;

impl ThreadErrorState for ThreadLocalErrorState {
    fn last_error(&self) -> u32 {
        SOFT_LAST_ERROR.with(Cell::get)
    }

    fn set_last_error(&self, code: u32) {
        SOFT_LAST_ERROR.with(|slot| slot.set(code));
    }
}

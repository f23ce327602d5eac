//! Ordered subscriber registry.
//!
//! Every notification family (module map, module unmap, and whatever sibling subsystems add)
//! keeps one `Callbacks<E>`. Subscribers are invoked in registration order with the same event.
//! A subscriber that panics is logged and skipped; the remaining subscribers of the same pass
//! still run, and nothing unwinds into the intercepted call.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Handle returned by [`Callbacks::register`]. Ids increase monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(usize);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Outcome of one [`Callbacks::run`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatch {
    /// Subscribers that returned normally.
    pub delivered: usize,
    /// Subscribers that panicked.
    pub failed: usize,
}

pub struct Callbacks<E: ?Sized> {
    label: &'static str,
    next_id: AtomicUsize,
    entries: RwLock<Vec<(CallbackId, Callback<E>)>>,
}

impl<E: ?Sized> Callbacks<E> {
    /// `label` names the family in log lines.
    pub const fn new(label: &'static str) -> Self {
        Self {
            label,
            next_id: AtomicUsize::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        log::debug!("[{}] registered callback {id}", self.label);
        id
    }

    /// Remove a subscriber. Unknown or already removed ids are ignored.
    ///
    /// Returns whether something was removed.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if removed {
            log::debug!("[{}] unregistered callback {id}", self.label);
        }
        removed
    }

    /// Drop every subscriber. Ids handed out so far stay retired.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every subscriber in registration order.
    ///
    /// Iterates over a snapshot, so a subscriber may register or unregister (itself included)
    /// without deadlocking; such changes apply from the next pass.
    pub fn run(&self, event: &E) -> Dispatch {
        let snapshot: Vec<(CallbackId, Callback<E>)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut dispatch = Dispatch::default();
        for (id, callback) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| (*callback)(event))) {
                Ok(()) => dispatch.delivered += 1,
                Err(payload) => {
                    dispatch.failed += 1;
                    log::error!(
                        "[{}] callback {id} panicked: {}",
                        self.label,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        dispatch
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

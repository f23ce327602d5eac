// Per-interception call accounting.
// ---------------------------------
//   • In-flight counter: every thread inside the redirect body holds an `InFlight` token.
//     `remove` unpatches first, then drains this counter before the trampoline is freed.
//   • Recursion flag: one per interception and per thread. It gates only the extended
//     processing (decode, filter, notify); the pass-through to the original always happens.
//   • Both are released by `Drop`, so early returns and unwinding cannot leak them.
//
// Windows notes
// -------------
// - The recursion flag lives in a raw Win32 TLS slot instead of `thread_local!`, so it works
//   on threads running under the loader lock (`LdrpSnapModule`, `DllMain`).
// - We store a dummy non-NULL pointer (0x1) and never dereference it.
// - Setting or clearing the flag does not allocate. The `thread_local!` fallback used off
//   Windows keeps a small per-thread list and may.

#![allow(unsafe_code)]

use std::hint;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use shared::errors::HookError;

/// How long `remove` spins before it starts complaining in the log.
const SPIN_WARN_AFTER: Duration = Duration::from_millis(250);

/// In-flight tracking plus re-entrancy protection for one intercepted function.
pub struct CallGuard {
    in_flight: AtomicU32,
    recursion: RecursionFlag,
}

impl CallGuard {
    pub const fn new() -> Self {
        Self {
            in_flight: AtomicU32::new(0),
            recursion: RecursionFlag::new(),
        }
    }

    /// Count the calling thread as inside the redirect body until the token drops.
    ///
    /// SeqCst pairs with the remover's detach-then-poll sequence.
    #[inline(always)]
    pub fn track(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight {
            counter: &self.in_flight,
        }
    }

    /// Try to start extended processing on this thread.
    ///
    /// Returns `None` if this thread is already inside extended processing for the same
    /// interception (our own logic re-entered the hooked API).
    #[inline(always)]
    pub fn enter(&self) -> Option<Reentrancy<'_>> {
        self.recursion.enter()
    }

    #[inline]
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Busy-poll until no thread is inside the redirect body.
    ///
    /// `limit == None` spins forever. With a limit, gives up with `HookError::Stuck` once it
    /// elapses; the caller must then keep every resource a straggler might still touch.
    pub fn wait_for_quiescence(
        &self,
        hook: &'static str,
        limit: Option<Duration>,
    ) -> Result<(), HookError> {
        let started = Instant::now();
        let mut warned = false;

        loop {
            let in_flight = self.in_flight();
            if in_flight == 0 {
                return Ok(());
            }

            let waited = started.elapsed();
            if !warned && waited >= SPIN_WARN_AFTER {
                log::warn!("[guard] spinning on `{hook}`: {in_flight} call(s) in flight");
                warned = true;
            }
            if let Some(limit) = limit {
                if waited >= limit {
                    log::error!(
                        "[guard] `{hook}` did not quiesce within {} ms ({in_flight} in flight)",
                        limit.as_millis()
                    );
                    return Err(HookError::Stuck {
                        hook,
                        in_flight,
                        waited_ms: waited.as_millis() as u64,
                    });
                }
            }

            hint::spin_loop();
            thread::yield_now();
        }
    }
}

impl Default for CallGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Token held by a thread for as long as it executes inside the redirect body.
pub struct InFlight<'a> {
    counter: &'a AtomicU32,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let previous = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "in-flight counter underflow");
    }
}

/// Per-thread "inside extended processing" flag for one interception.
///
/// The backing TLS slot is allocated on first use so the flag can live in a `static`.
pub struct RecursionFlag {
    slot: OnceCell<tls::Slot>,
}

impl RecursionFlag {
    pub const fn new() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }

    /// Returns `Some(Reentrancy)` on first entry on this thread, `None` when re-entering.
    #[inline(always)]
    pub fn enter(&self) -> Option<Reentrancy<'_>> {
        // If no slot can be allocated, behave as re-entered: skipping extended processing
        // is always safe, recursing is not.
        let slot = self
            .slot
            .get_or_try_init(|| tls::Slot::alloc().ok_or(()))
            .ok()?;

        if slot.is_set() {
            return None;
        }
        if slot.set() {
            Some(Reentrancy {
                slot,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }
}

impl Default for RecursionFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII object returned by [`RecursionFlag::enter`]. Clears the flag for this thread on drop.
pub struct Reentrancy<'a> {
    slot: &'a tls::Slot,
    _not_send: PhantomData<*const ()>,
}

impl Drop for Reentrancy<'_> {
    fn drop(&mut self) {
        // Worst case the clear fails and the flag stays set: we keep short-circuiting to the
        // original on this thread, which is safe.
        self.slot.clear();
    }
}

#[cfg(windows)]
mod tls {
    use core::ffi::c_void;
    use windows::Win32::System::Threading::{
        TLS_OUT_OF_INDEXES, TlsAlloc, TlsFree, TlsGetValue, TlsSetValue,
    };

    /// Dummy non-NULL pointer used as the "inside" marker.
    const SENTINEL: *const c_void = 1_usize as *const c_void;

    pub struct Slot(u32);

    impl Slot {
        pub fn alloc() -> Option<Self> {
            let index = unsafe { TlsAlloc() };
            (index != TLS_OUT_OF_INDEXES).then_some(Self(index))
        }

        #[inline(always)]
        pub fn is_set(&self) -> bool {
            unsafe { !TlsGetValue(self.0).is_null() }
        }

        #[inline(always)]
        pub fn set(&self) -> bool {
            unsafe { TlsSetValue(self.0, Some(SENTINEL)).is_ok() }
        }

        #[inline(always)]
        pub fn clear(&self) {
            unsafe {
                let _ = TlsSetValue(self.0, None);
            }
        }
    }

    impl Drop for Slot {
        fn drop(&mut self) {
            unsafe {
                let _ = TlsFree(self.0);
            }
        }
    }
}

#[cfg(not(windows))]
mod tls {
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_SLOT: AtomicUsize = AtomicUsize::new(1);

    thread_local! {
        static ENTERED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    pub struct Slot(usize);

    impl Slot {
        pub fn alloc() -> Option<Self> {
            Some(Self(NEXT_SLOT.fetch_add(1, Ordering::Relaxed)))
        }

        // During thread teardown the thread-local is gone; report "set" so nothing recurses.
        #[inline]
        pub fn is_set(&self) -> bool {
            ENTERED
                .try_with(|entered| entered.borrow().contains(&self.0))
                .unwrap_or(true)
        }

        #[inline]
        pub fn set(&self) -> bool {
            ENTERED
                .try_with(|entered| entered.borrow_mut().push(self.0))
                .is_ok()
        }

        #[inline]
        pub fn clear(&self) {
            let _ = ENTERED.try_with(|entered| entered.borrow_mut().retain(|&id| id != self.0));
        }
    }
}

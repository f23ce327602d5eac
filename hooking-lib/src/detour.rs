//! Install/remove lifecycle of a single interception.
//!
//! An `InterceptedFunction` is a slot with a stable address (typically inside the context
//! object the OS entry stub can reach). `DetourController::install` resolves the target, has
//! the patcher build a trampoline, publishes it in the slot and only then lets the patcher make
//! the redirect live. `DetourController::remove` undoes the redirect, drains in-flight callers
//! and only then drops the trampoline.
//!
//! ```text
//! Uninstalled --install--> Installed --remove--> Removing --(in-flight == 0)--> Uninstalled
//! ```
//!
//! Install and remove on the same slot must be serialized by the caller. `remove` must never
//! run from inside the slot's own redirect body: it would wait for itself.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use shared::errors::{HookError, PatchError};

use crate::call_guard::CallGuard;
use crate::callbacks::panic_message;
use crate::last_error::{LastErrorPreserver, ThreadErrorState};

/// Exported routine to intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetSymbol {
    pub module: &'static str,
    pub symbol: &'static str,
}

impl fmt::Display for TargetSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.module, self.symbol)
    }
}

/// Maps a symbol to its address in the current process.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, target: &TargetSymbol) -> Option<usize>;
}

/// Call-through capability to the original routine.
///
/// Dropping it releases whatever the patcher allocated for it.
pub trait Trampoline: Send + Sync {
    /// Address that behaves like the un-intercepted routine.
    fn entry(&self) -> usize;
}

/// Rewrites call sites. The rewriting algorithm itself is out of scope here.
///
/// Installing is two-phase so the trampoline can be published before any thread, including
/// the installing one, can be redirected.
pub trait Patcher: Send + Sync {
    type Trampoline: Trampoline;

    /// Build a way to reach the original behaviour of `target` without touching `target`.
    fn prepare(&self, target: usize) -> Result<Self::Trampoline, PatchError>;

    /// Make the redirect of the prepared target to `replacement` live.
    fn commit(&self, trampoline: &mut Self::Trampoline, replacement: usize) -> Result<(), PatchError>;

    /// Undo the redirect. New calls reach the original directly afterwards, but the trampoline
    /// must stay alive until in-flight callers have left.
    fn remove(&self, trampoline: &mut Self::Trampoline) -> Result<(), PatchError>;
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Uninstalled = 0,
    Installed = 1,
    Removing = 2,
}

impl HookState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Installed,
            2 => Self::Removing,
            _ => Self::Uninstalled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninstalled => "uninstalled",
            Self::Installed => "installed",
            Self::Removing => "removing",
        }
    }
}

impl fmt::Display for HookState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One interception: lifecycle state, the trampoline it owns and its call accounting.
pub struct InterceptedFunction<T> {
    name: &'static str,
    state: AtomicU8,
    target: AtomicUsize,
    /// Published trampoline entry; 0 once detached.
    original: AtomicUsize,
    trampoline: Mutex<Option<T>>,
    guard: CallGuard,
}

impl<T: Trampoline> InterceptedFunction<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AtomicU8::new(HookState::Uninstalled as u8),
            target: AtomicUsize::new(0),
            original: AtomicUsize::new(0),
            trampoline: Mutex::new(None),
            guard: CallGuard::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> HookState {
        HookState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Resolved address of the intercepted routine, once known.
    pub fn target(&self) -> Option<usize> {
        match self.target.load(Ordering::Acquire) {
            0 => None,
            address => Some(address),
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.guard.in_flight()
    }

    /// Redirect body shared by every entry stub.
    ///
    /// 1. Counts the caller as in flight until return, whatever happens.
    /// 2. Forwards exactly once via `forward(original_entry)` and keeps the thread error value
    ///    the original produced.
    /// 3. Runs `extended` unless this thread is already inside it for this interception.
    ///    Panics from it are logged and swallowed.
    /// 4. Returns the original's result untouched.
    pub fn redirect<R, S, F, X>(&self, errors: &S, forward: F, extended: X) -> R
    where
        S: ThreadErrorState + ?Sized,
        F: FnOnce(usize) -> R,
        X: FnOnce(&R),
    {
        let _in_flight = self.guard.track();
        let mut preserver = LastErrorPreserver::new(errors);

        let ret = forward(self.original_entry());
        preserver.update();

        if let Some(_reentrancy) = self.guard.enter() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| extended(&ret))) {
                log::error!(
                    "[detour] extended processing of `{}` panicked: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
            }
        }

        ret
    }

    /// Address that performs the original behaviour right now.
    ///
    /// The trampoline is published before the redirect goes live and detached only after it
    /// is undone, so without one the target itself is unpatched.
    fn original_entry(&self) -> usize {
        match self.original.load(Ordering::SeqCst) {
            0 => self.target.load(Ordering::Acquire),
            original => original,
        }
    }

    fn set_state(&self, state: HookState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn lock_trampoline(&self) -> std::sync::MutexGuard<'_, Option<T>> {
        self.trampoline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives [`InterceptedFunction`] slots through their lifecycle.
pub struct DetourController<P> {
    patcher: P,
    resolver: Box<dyn SymbolResolver>,
    drain_limit: Option<Duration>,
}

impl<P: Patcher> DetourController<P> {
    pub fn new(patcher: P, resolver: impl SymbolResolver + 'static) -> Self {
        Self {
            patcher,
            resolver: Box::new(resolver),
            drain_limit: None,
        }
    }

    /// Bound how long `remove` spins waiting for in-flight callers. `None` spins forever.
    pub fn with_drain_limit(mut self, limit: Option<Duration>) -> Self {
        self.drain_limit = limit;
        self
    }

    pub fn patcher(&self) -> &P {
        &self.patcher
    }

    pub fn install(
        &self,
        function: &InterceptedFunction<P::Trampoline>,
        target: &TargetSymbol,
        replacement: usize,
    ) -> Result<(), HookError> {
        let state = function.state();
        if state != HookState::Uninstalled {
            return Err(HookError::InvalidState {
                hook: function.name,
                operation: "install",
                state: state.as_str(),
            });
        }

        let address = self
            .resolver
            .resolve(target)
            .ok_or_else(|| HookError::Resolution {
                module: target.module.to_owned(),
                symbol: target.symbol.to_owned(),
            })?;

        function.target.store(address, Ordering::Release);
        let trampoline = self.patcher.prepare(address).inspect_err(|e| {
            log::error!("[detour] `{}` cannot prepare {target}: {e}", function.name);
        })?;
        let entry = trampoline.entry();

        let mut slot = function.lock_trampoline();
        let trampoline = slot.insert(trampoline);
        // Published first: once the redirect is live any thread, this one included, may enter.
        function.original.store(entry, Ordering::SeqCst);

        if let Err(e) = self.patcher.commit(trampoline, replacement) {
            function.original.store(0, Ordering::SeqCst);
            let unused = slot.take();
            drop(slot);
            log::error!("[detour] `{}` install failed on {target}: {e}", function.name);
            self.discard(function, unused);
            return Err(e.into());
        }
        drop(slot);

        function.set_state(HookState::Installed);
        log::info!(
            "[detour] `{}` installed: {target} at {address:#x}, trampoline {entry:#x}",
            function.name
        );
        Ok(())
    }

    /// Drop a trampoline that never went live, once nobody can still be running on it.
    fn discard(&self, function: &InterceptedFunction<P::Trampoline>, unused: Option<P::Trampoline>) {
        if let Err(e) = function.guard.wait_for_quiescence(function.name, self.drain_limit) {
            log::error!("[detour] `{}` leaking unused trampoline: {e}", function.name);
            std::mem::forget(unused);
        }
    }

    pub fn remove(&self, function: &InterceptedFunction<P::Trampoline>) -> Result<(), HookError> {
        let state = function.state();
        if state != HookState::Installed {
            return Err(HookError::InvalidState {
                hook: function.name,
                operation: "remove",
                state: state.as_str(),
            });
        }
        function.set_state(HookState::Removing);

        if let Some(trampoline) = function.lock_trampoline().as_mut() {
            self.patcher.remove(trampoline).inspect_err(|e| {
                log::error!(
                    "[detour] `{}` could not be unpatched, trampoline kept: {e}",
                    function.name
                );
            })?;
        }
        log::info!("[detour] `{}` unpatched", function.name);

        // Detach before draining: callers counted from now on fall back to the target.
        function.original.store(0, Ordering::SeqCst);

        // Stragglers keep the trampoline alive; on timeout it is leaked in the slot.
        function
            .guard
            .wait_for_quiescence(function.name, self.drain_limit)?;

        let trampoline = function.lock_trampoline().take();
        drop(trampoline);
        function.set_state(HookState::Uninstalled);
        log::info!("[detour] `{}` free of references", function.name);
        Ok(())
    }
}

//! Module map/unmap notifications.
//!
//! `ModuleHooks` is the context object the host creates once and keeps alive for as long as
//! the interceptions may run. It owns the two interception slots, the decoder and the two
//! subscriber registries, and exposes the registration surface consumers use.

use shared::constants::{NT_MAP_VIEW_OF_SECTION, NT_UNMAP_VIEW_OF_SECTION, NTDLL};
use shared::errors::HookError;
use shared::events::{ModuleMapped, ModuleUnmapped};

use crate::callbacks::{CallbackId, Callbacks};
use crate::config::HooksConfig;
use crate::decoder::{EventDecoder, MapViewCall, NtStatus, ProcessIntrospection, UnmapViewCall};
use crate::detour::{DetourController, HookState, InterceptedFunction, Patcher, TargetSymbol};
use crate::last_error::ThreadErrorState;

pub const MAP_VIEW_TARGET: TargetSymbol = TargetSymbol {
    module: NTDLL,
    symbol: NT_MAP_VIEW_OF_SECTION,
};

pub const UNMAP_VIEW_TARGET: TargetSymbol = TargetSymbol {
    module: NTDLL,
    symbol: NT_UNMAP_VIEW_OF_SECTION,
};

pub type OnMapCallback = dyn Fn(&ModuleMapped) + Send + Sync;
pub type OnUnmapCallback = dyn Fn(&ModuleUnmapped) + Send + Sync;

/// Registration surface handed to sibling subsystems.
pub trait ModuleInterface: Send + Sync {
    fn register_on_map(&self, callback: Box<OnMapCallback>) -> CallbackId;
    fn unregister_on_map(&self, id: CallbackId);
    fn register_on_unmap(&self, callback: Box<OnUnmapCallback>) -> CallbackId;
    fn unregister_on_unmap(&self, id: CallbackId);
}

/// Addresses of the entry stubs the patcher redirects to.
#[derive(Debug, Clone, Copy)]
pub struct Replacements {
    pub map_view: usize,
    pub unmap_view: usize,
}

/// Snapshot of one interception, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookStatus {
    pub name: &'static str,
    pub state: HookState,
    pub target: Option<usize>,
    pub in_flight: u32,
}

pub struct ModuleHooks<P: Patcher> {
    controller: DetourController<P>,
    decoder: EventDecoder,
    errors: Box<dyn ThreadErrorState>,
    map_view: InterceptedFunction<P::Trampoline>,
    unmap_view: InterceptedFunction<P::Trampoline>,
    on_map: Callbacks<ModuleMapped>,
    on_unmap: Callbacks<ModuleUnmapped>,
}

impl<P: Patcher> ModuleHooks<P> {
    pub fn new(
        controller: DetourController<P>,
        introspection: impl ProcessIntrospection + 'static,
        errors: impl ThreadErrorState + 'static,
    ) -> Self {
        Self {
            controller,
            decoder: EventDecoder::new(introspection),
            errors: Box::new(errors),
            map_view: InterceptedFunction::new(NT_MAP_VIEW_OF_SECTION),
            unmap_view: InterceptedFunction::new(NT_UNMAP_VIEW_OF_SECTION),
            on_map: Callbacks::new("on_map"),
            on_unmap: Callbacks::new("on_unmap"),
        }
    }

    pub fn controller(&self) -> &DetourController<P> {
        &self.controller
    }

    /// Install the enabled interceptions. If one fails, those installed by this call are
    /// removed again before the error is returned.
    pub fn install(&self, hooks: &HooksConfig, replacements: &Replacements) -> Result<(), HookError> {
        let plan = [
            (hooks.map_view, &self.map_view, &MAP_VIEW_TARGET, replacements.map_view),
            (hooks.unmap_view, &self.unmap_view, &UNMAP_VIEW_TARGET, replacements.unmap_view),
        ];

        let mut installed = Vec::with_capacity(plan.len());
        for (enabled, function, target, replacement) in plan {
            if !enabled {
                log::info!("[module] `{}` disabled by configuration", function.name());
                continue;
            }
            if let Err(e) = self.controller.install(function, target, replacement) {
                for done in installed.into_iter().rev() {
                    if let Err(rollback) = self.controller.remove(done) {
                        log::error!("[module] rollback failed: {rollback}");
                    }
                }
                return Err(e);
            }
            installed.push(function);
        }
        Ok(())
    }

    /// Remove every installed interception and drop all subscribers.
    ///
    /// Every slot is attempted even if an earlier one fails; the first error is returned.
    pub fn teardown(&self) -> Result<(), HookError> {
        let mut first_error = None;
        for function in [&self.map_view, &self.unmap_view] {
            if function.state() != HookState::Installed {
                continue;
            }
            if let Err(e) = self.controller.remove(function) {
                log::error!("[module] teardown of `{}` failed: {e}", function.name());
                first_error.get_or_insert(e);
            }
        }
        self.on_map.clear();
        self.on_unmap.clear();
        log::info!("[module] teardown complete");
        first_error.map_or(Ok(()), Err)
    }

    pub fn status(&self) -> [HookStatus; 2] {
        [&self.map_view, &self.unmap_view].map(|function| HookStatus {
            name: function.name(),
            state: function.state(),
            target: function.target(),
            in_flight: function.in_flight(),
        })
    }

    pub fn register_on_map<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&ModuleMapped) + Send + Sync + 'static,
    {
        self.on_map.register(callback)
    }

    pub fn unregister_on_map(&self, id: CallbackId) {
        self.on_map.unregister(id);
    }

    pub fn register_on_unmap<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&ModuleUnmapped) + Send + Sync + 'static,
    {
        self.on_unmap.register(callback)
    }

    pub fn unregister_on_unmap(&self, id: CallbackId) {
        self.on_unmap.unregister(id);
    }

    /// Redirect body for `NtMapViewOfSection`.
    ///
    /// `forward` calls the original through the given entry address. `mapped_base` reads the
    /// base address out-parameter; it is only consulted when the call succeeded.
    pub fn map_view_of_section<F, B>(&self, process: usize, forward: F, mapped_base: B) -> NtStatus
    where
        F: FnOnce(usize) -> NtStatus,
        B: FnOnce() -> Option<usize>,
    {
        self.map_view.redirect(&*self.errors, forward, |status| {
            // Logging only after the recursion check: the logger may map files itself.
            log::trace!("[module] map view: process {process:#x}, status {:#010x}", status.0);
            let call = MapViewCall {
                process,
                base: if status.is_success() { mapped_base() } else { None },
                status: *status,
            };
            match self.decoder.decode_map(&call) {
                Ok(Some(event)) => {
                    self.on_map.run(&event);
                }
                Ok(None) => {}
                Err(e) => log::error!("[module] could not decode map view: {e}"),
            }
        })
    }

    /// Redirect body for `NtUnmapViewOfSection`.
    pub fn unmap_view_of_section<F>(&self, process: usize, base: usize, forward: F) -> NtStatus
    where
        F: FnOnce(usize) -> NtStatus,
    {
        self.unmap_view.redirect(&*self.errors, forward, |status| {
            log::trace!(
                "[module] unmap view: process {process:#x}, base {base:#x}, status {:#010x}",
                status.0
            );
            let call = UnmapViewCall {
                process,
                base,
                status: *status,
            };
            if let Some(event) = self.decoder.decode_unmap(&call) {
                self.on_unmap.run(&event);
            }
        })
    }
}

impl<P: Patcher> ModuleInterface for ModuleHooks<P> {
    fn register_on_map(&self, callback: Box<OnMapCallback>) -> CallbackId {
        self.on_map.register(callback)
    }

    fn unregister_on_map(&self, id: CallbackId) {
        self.on_map.unregister(id);
    }

    fn register_on_unmap(&self, callback: Box<OnUnmapCallback>) -> CallbackId {
        self.on_unmap.register(callback)
    }

    fn unregister_on_unmap(&self, id: CallbackId) {
        self.on_unmap.unregister(id);
    }
}

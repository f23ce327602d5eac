//! In-memory stand-ins for the patcher, resolver and process introspection so the redirect
//! bodies can be driven directly from test threads.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use loadwatch::decoder::{NtStatus, ProcessIntrospection, RegionType};
use loadwatch::detour::{DetourController, Patcher, SymbolResolver, TargetSymbol, Trampoline};
use loadwatch::last_error::ThreadLocalErrorState;
use loadwatch::module_hooks::{ModuleHooks, Replacements};
use shared::constants::{NT_MAP_VIEW_OF_SECTION, NT_UNMAP_VIEW_OF_SECTION};
use shared::errors::{DecodeError, PatchError};

/// `GetCurrentProcess()` pseudo-handle.
pub const CURRENT_PROCESS: usize = usize::MAX;
pub const OTHER_PROCESS: usize = 0x2a0;

pub const MAP_TARGET: usize = 0x7ffa_1000;
pub const UNMAP_TARGET: usize = 0x7ffa_2000;
pub const TRAMPOLINE_OFFSET: usize = 0x10_0000;

pub const REPLACEMENTS: Replacements = Replacements {
    map_view: 0x1_0000,
    unmap_view: 0x2_0000,
};

pub const IMAGE_BASE: usize = 0x1800_0000;
pub const DATA_BASE: usize = 0x0300_0000;

pub struct FakeGateway {
    entry: usize,
    live: Arc<Mutex<HashSet<usize>>>,
}

impl Trampoline for FakeGateway {
    fn entry(&self) -> usize {
        self.entry
    }
}

impl Drop for FakeGateway {
    fn drop(&mut self) {
        self.live.lock().unwrap().remove(&self.entry);
    }
}

#[derive(Default)]
pub struct FakePatcher {
    patched: Mutex<HashSet<usize>>,
    /// Entries of trampolines handed out and not yet dropped.
    live: Arc<Mutex<HashSet<usize>>>,
}

impl FakePatcher {
    pub fn is_patched(&self, target: usize) -> bool {
        self.patched.lock().unwrap().contains(&target)
    }

    pub fn live_trampolines(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn trampoline_alive(&self, entry: usize) -> bool {
        self.live.lock().unwrap().contains(&entry)
    }
}

impl Patcher for FakePatcher {
    type Trampoline = FakeGateway;

    fn prepare(&self, target: usize) -> Result<FakeGateway, PatchError> {
        if self.is_patched(target) {
            return Err(PatchError::AlreadyPatched { target });
        }
        let entry = target + TRAMPOLINE_OFFSET;
        self.live.lock().unwrap().insert(entry);
        Ok(FakeGateway {
            entry,
            live: Arc::clone(&self.live),
        })
    }

    fn commit(&self, trampoline: &mut FakeGateway, _replacement: usize) -> Result<(), PatchError> {
        self.patched
            .lock()
            .unwrap()
            .insert(trampoline.entry - TRAMPOLINE_OFFSET);
        Ok(())
    }

    fn remove(&self, trampoline: &mut FakeGateway) -> Result<(), PatchError> {
        self.patched
            .lock()
            .unwrap()
            .remove(&(trampoline.entry - TRAMPOLINE_OFFSET));
        Ok(())
    }
}

pub struct FakeResolver(HashMap<&'static str, usize>);

impl FakeResolver {
    pub fn ntdll() -> Self {
        Self(HashMap::from([
            (NT_MAP_VIEW_OF_SECTION, MAP_TARGET),
            (NT_UNMAP_VIEW_OF_SECTION, UNMAP_TARGET),
        ]))
    }

    pub fn without(mut self, symbol: &str) -> Self {
        self.0.remove(symbol);
        self
    }
}

impl SymbolResolver for FakeResolver {
    fn resolve(&self, target: &TargetSymbol) -> Option<usize> {
        self.0.get(target.symbol).copied()
    }
}

#[derive(Default)]
struct ProcessState {
    regions: Mutex<HashMap<usize, RegionType>>,
    loader_path: Mutex<Option<String>>,
    region_queries: AtomicUsize,
}

/// Shared handle: one clone goes into the hooks, the test keeps the other.
#[derive(Clone, Default)]
pub struct FakeProcess(Arc<ProcessState>);

impl FakeProcess {
    pub fn with_standard_regions() -> Self {
        let process = Self::default();
        process.add_region(IMAGE_BASE, RegionType::Image);
        process.add_region(DATA_BASE, RegionType::Mapped);
        process
    }

    pub fn add_region(&self, base: usize, kind: RegionType) {
        self.0.regions.lock().unwrap().insert(base, kind);
    }

    pub fn set_loader_path(&self, path: Option<&str>) {
        *self.0.loader_path.lock().unwrap() = path.map(str::to_owned);
    }

    pub fn region_queries(&self) -> usize {
        self.0.region_queries.load(Ordering::SeqCst)
    }
}

impl ProcessIntrospection for FakeProcess {
    fn is_current_process(&self, process: usize) -> bool {
        process == CURRENT_PROCESS
    }

    fn region_type(&self, address: usize) -> Result<RegionType, DecodeError> {
        self.0.region_queries.fetch_add(1, Ordering::SeqCst);
        self.0
            .regions
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .ok_or(DecodeError::RegionQuery {
                address,
                reason: "no such region".into(),
            })
    }

    fn loader_path(&self) -> Option<String> {
        self.0.loader_path.lock().unwrap().clone()
    }
}

pub type TestHooks = ModuleHooks<FakePatcher>;

pub fn hooks_with(resolver: FakeResolver) -> (TestHooks, FakeProcess) {
    let process = FakeProcess::with_standard_regions();
    let controller = DetourController::new(FakePatcher::default(), resolver);
    let hooks = ModuleHooks::new(controller, process.clone(), ThreadLocalErrorState);
    (hooks, process)
}

pub fn hooks() -> (TestHooks, FakeProcess) {
    hooks_with(FakeResolver::ntdll())
}

/// Map `base` into `process` through the map redirect body, with the original reporting
/// `status`.
pub fn map_through(hooks: &TestHooks, process: usize, base: usize, status: NtStatus) -> NtStatus {
    hooks.map_view_of_section(process, |_entry| status, || Some(base))
}

pub fn unmap_through(hooks: &TestHooks, process: usize, base: usize, status: NtStatus) -> NtStatus {
    hooks.unmap_view_of_section(process, base, |_entry| status)
}

//! Windows backend: export resolution, the Nt* syscall-stub patcher, memory/TEB introspection,
//! `GetLastError` preservation and the two `extern "system"` entry stubs.
//!
//! The patcher first builds a small RWX "gateway" that re-implements the original syscall stub
//! (see `syscall_stub`); the gateway is the trampoline. Only when the controller has published
//! it does the patcher overwrite the start of the Nt* function with a jump to the entry stub.

#![allow(unsafe_code)]

use std::ffi::{CString, c_void};
use std::mem;
use std::path::Path;
use std::{ptr, slice};

use once_cell::sync::OnceCell;
use windows::Win32::Foundation::{GetLastError, HANDLE, NTSTATUS, SetLastError, WIN32_ERROR};
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_FREE, MEM_IMAGE, MEM_MAPPED, MEM_RELEASE, MEM_RESERVE,
    MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualAlloc,
    VirtualFree, VirtualProtect, VirtualQuery,
};
use windows::Win32::System::Threading::{GetCurrentProcessId, GetProcessId};
use windows::core::PCSTR;

use shared::errors::{DecodeError, HookError, PatchError};

use crate::config::LoadwatchConfig;
use crate::decoder::{self, NtStatus, ProcessIntrospection, RegionType};
use crate::detour::{DetourController, Patcher, SymbolResolver, TargetSymbol, Trampoline};
use crate::last_error::ThreadErrorState;
use crate::module_hooks::{ModuleHooks, Replacements};
use crate::platform::syscall_stub::{self, GATEWAY_LEN, PATCH_LEN, STUB_SCAN_LEN};

/// STATUS_INTERNAL_ERROR, returned if an entry stub runs without a published context.
const STATUS_INTERNAL_ERROR: NTSTATUS = NTSTATUS(0xC000_00E5_u32 as i32);

/// `GetLastError`/`SetLastError` of the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32LastError;

impl ThreadErrorState for Win32LastError {
    fn last_error(&self) -> u32 {
        unsafe { GetLastError().0 }
    }

    fn set_last_error(&self, code: u32) {
        unsafe { SetLastError(WIN32_ERROR(code)) }
    }
}

/// Resolves exports of modules already loaded in this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExportResolver;

impl SymbolResolver for ExportResolver {
    fn resolve(&self, target: &TargetSymbol) -> Option<usize> {
        let module = CString::new(target.module).ok()?;
        let symbol = CString::new(target.symbol).ok()?;
        unsafe {
            let hmod = GetModuleHandleA(PCSTR(module.as_ptr() as *const u8)).ok()?;
            GetProcAddress(hmod, PCSTR(symbol.as_ptr() as *const u8)).map(|f| f as usize)
        }
    }
}

/// Trampoline built by [`SyscallPatcher`].
///
/// Owns the saved prologue bytes and the RWX gateway buffer. Dropping it frees the gateway,
/// so it must outlive every caller that may still be executing it.
pub struct SyscallGateway {
    target: *mut u8,
    saved: [u8; PATCH_LEN],
    gateway: *mut u8,
}

// SAFETY: only raw pointers into process-wide executable memory; no thread affinity.
unsafe impl Send for SyscallGateway {}
unsafe impl Sync for SyscallGateway {}

impl Trampoline for SyscallGateway {
    fn entry(&self) -> usize {
        self.gateway as usize
    }
}

impl Drop for SyscallGateway {
    fn drop(&mut self) {
        unsafe {
            let _ = VirtualFree(self.gateway as _, 0, MEM_RELEASE);
        }
    }
}

/// Inline patcher for ntdll Nt* system call stubs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyscallPatcher;

impl SyscallPatcher {
    /// Allocates the gateway and writes a clean syscall stub into it.
    unsafe fn make_gateway(id: u32) -> Result<*mut u8, PatchError> {
        let gw = unsafe {
            VirtualAlloc(None, GATEWAY_LEN, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE)
        } as *mut u8;
        if gw.is_null() {
            return Err(PatchError::Allocation(format!(
                "VirtualAlloc({GATEWAY_LEN}) failed: {:?}",
                unsafe { GetLastError() }
            )));
        }
        let code = syscall_stub::gateway_code(id);
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), gw, GATEWAY_LEN) };
        Ok(gw)
    }

    /// Copy `bytes` over `target` with the page temporarily made writable.
    unsafe fn write_code(target: *mut u8, bytes: &[u8; PATCH_LEN]) -> Result<(), PatchError> {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        unsafe {
            VirtualProtect(target as _, PATCH_LEN, PAGE_EXECUTE_READWRITE, &mut old).map_err(
                |e| PatchError::ProtectedMemory {
                    target: target as usize,
                    reason: e.to_string(),
                },
            )?;
            ptr::copy_nonoverlapping(bytes.as_ptr(), target, PATCH_LEN);
            let mut tmp = PAGE_PROTECTION_FLAGS::default();
            let _ = VirtualProtect(target as _, PATCH_LEN, old, &mut tmp);
            let _ = FlushInstructionCache(HANDLE(ptr::null_mut()), Some(target as _), PATCH_LEN);
        }
        Ok(())
    }
}

impl Patcher for SyscallPatcher {
    type Trampoline = SyscallGateway;

    fn prepare(&self, target: usize) -> Result<SyscallGateway, PatchError> {
        // SAFETY: `target` comes from GetProcAddress on a loaded module; every Nt* stub is at
        // least STUB_SCAN_LEN bytes long.
        let prologue = unsafe { slice::from_raw_parts(target as *const u8, STUB_SCAN_LEN) };
        let layout = syscall_stub::inspect(target, prologue)?;
        let gateway = unsafe { Self::make_gateway(layout.syscall_id)? };
        log::debug!("[patcher] gateway for {target:#x} (syscall {:#x})", layout.syscall_id);
        Ok(SyscallGateway {
            target: target as *mut u8,
            saved: layout.saved,
            gateway,
        })
    }

    // No logging here: once the jump is written, any call may re-enter the redirect.
    fn commit(&self, trampoline: &mut SyscallGateway, replacement: usize) -> Result<(), PatchError> {
        unsafe { Self::write_code(trampoline.target, &syscall_stub::jump_to(replacement)) }
    }

    fn remove(&self, trampoline: &mut SyscallGateway) -> Result<(), PatchError> {
        unsafe { Self::write_code(trampoline.target, &trampoline.saved) }
    }
}

/// Region and process queries against the live process.
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32Introspection;

impl ProcessIntrospection for Win32Introspection {
    fn is_current_process(&self, process: usize) -> bool {
        let pid = unsafe { GetProcessId(HANDLE(process as *mut c_void)) };
        pid != 0 && pid == unsafe { GetCurrentProcessId() }
    }

    fn region_type(&self, address: usize) -> Result<RegionType, DecodeError> {
        let mut mbi = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(address as *const c_void),
                &mut mbi,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return Err(DecodeError::RegionQuery {
                address,
                reason: format!("VirtualQuery failed: {:?}", unsafe { GetLastError() }),
            });
        }
        Ok(if mbi.State == MEM_FREE {
            RegionType::Free
        } else if mbi.Type == MEM_IMAGE {
            RegionType::Image
        } else if mbi.Type == MEM_MAPPED {
            RegionType::Mapped
        } else {
            RegionType::Private
        })
    }

    fn loader_path(&self) -> Option<String> {
        let raw = arbitrary_user_pointer() as *const u16;
        if raw.is_null() {
            return None;
        }
        // SAFETY: while mapping an image the loader points this slot at a NUL-terminated
        // UTF-16 path that stays valid for the duration of the call.
        let wide = unsafe {
            let mut len = 0usize;
            while *raw.add(len) != 0 {
                len += 1;
            }
            slice::from_raw_parts(raw, len)
        };
        let path = decoder::path_from_wide(wide);
        if path.is_none() {
            log::trace!("[win32] loader path is not valid UTF-16, mapping not reported");
        }
        path
    }
}

/// `NtCurrentTeb()->NtTib.ArbitraryUserPointer`.
#[cfg(target_arch = "x86_64")]
fn arbitrary_user_pointer() -> *mut c_void {
    let value: *mut c_void;
    unsafe {
        std::arch::asm!("mov {}, gs:[0x28]", out(reg) value, options(nostack, readonly, preserves_flags));
    }
    value
}

#[cfg(target_arch = "x86")]
fn arbitrary_user_pointer() -> *mut c_void {
    let value: *mut c_void;
    unsafe {
        std::arch::asm!("mov {}, fs:[0x14]", out(reg) value, options(nostack, readonly, preserves_flags));
    }
    value
}

#[cfg(target_arch = "aarch64")]
fn arbitrary_user_pointer() -> *mut c_void {
    let value: *mut c_void;
    unsafe {
        std::arch::asm!("ldr {}, [x18, #0x28]", out(reg) value, options(nostack, readonly, preserves_flags));
    }
    value
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
fn arbitrary_user_pointer() -> *mut c_void {
    ptr::null_mut()
}

type NtMapViewOfSectionFn = unsafe extern "system" fn(
    HANDLE,
    HANDLE,
    *mut *mut c_void,
    usize,
    usize,
    *mut i64,
    *mut usize,
    u32,
    u32,
    u32,
) -> NTSTATUS;

type NtUnmapViewOfSectionFn = unsafe extern "system" fn(HANDLE, *mut c_void) -> NTSTATUS;

/// Context reached by the entry stubs. Published before anything is patched and kept for the
/// life of the process, so a late caller never finds it missing.
static CONTEXT: OnceCell<ModuleHooks<SyscallPatcher>> = OnceCell::new();

pub fn context() -> Option<&'static ModuleHooks<SyscallPatcher>> {
    CONTEXT.get()
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn nt_map_view_of_section_detour(
    section: HANDLE,
    process: HANDLE,
    base: *mut *mut c_void,
    zero_bits: usize,
    commit_size: usize,
    section_offset: *mut i64,
    view_size: *mut usize,
    inherit_disposition: u32,
    alloc_type: u32,
    alloc_protect: u32,
) -> NTSTATUS {
    let Some(hooks) = CONTEXT.get() else {
        return STATUS_INTERNAL_ERROR;
    };
    let status = hooks.map_view_of_section(
        process.0 as usize,
        |entry| {
            let original: NtMapViewOfSectionFn = unsafe { mem::transmute(entry) };
            let ret = unsafe {
                original(
                    section,
                    process,
                    base,
                    zero_bits,
                    commit_size,
                    section_offset,
                    view_size,
                    inherit_disposition,
                    alloc_type,
                    alloc_protect,
                )
            };
            NtStatus(ret.0)
        },
        || unsafe { base.as_ref() }.map(|b| *b as usize),
    );
    NTSTATUS(status.0)
}

unsafe extern "system" fn nt_unmap_view_of_section_detour(
    process: HANDLE,
    base: *mut c_void,
) -> NTSTATUS {
    let Some(hooks) = CONTEXT.get() else {
        return STATUS_INTERNAL_ERROR;
    };
    let status = hooks.unmap_view_of_section(process.0 as usize, base as usize, |entry| {
        let original: NtUnmapViewOfSectionFn = unsafe { mem::transmute(entry) };
        NtStatus(unsafe { original(process, base) }.0)
    });
    NTSTATUS(status.0)
}

/// Build (once) and publish the context, then install the configured interceptions.
pub fn start(cfg: &LoadwatchConfig) -> Result<(), HookError> {
    let hooks = CONTEXT.get_or_init(|| {
        let controller = DetourController::new(SyscallPatcher, ExportResolver)
            .with_drain_limit(cfg.removal.drain_limit());
        ModuleHooks::new(controller, Win32Introspection, Win32LastError)
    });
    let replacements = Replacements {
        map_view: nt_map_view_of_section_detour as NtMapViewOfSectionFn as usize,
        unmap_view: nt_unmap_view_of_section_detour as NtUnmapViewOfSectionFn as usize,
    };
    hooks.install(&cfg.hooks, &replacements)
}

/// Remove every interception. The context itself stays published.
pub fn stop() -> Result<(), HookError> {
    match CONTEXT.get() {
        Some(hooks) => hooks.teardown(),
        None => Ok(()),
    }
}

/// Directory of the host executable, where the configuration and log file live by default.
pub fn host_dir() -> std::path::PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| ".".into())
}

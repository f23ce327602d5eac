//! In-process interception of the image loader's map/unmap entry points.
//!
//! The core (`detour`, `call_guard`, `last_error`, `callbacks`, `decoder`, `module_hooks`) is
//! platform independent and talks to the OS through traits. `platform::win32` provides the
//! Windows implementations and the DLL entry point installs them.

pub mod call_guard;
pub mod callbacks;
pub mod config;
pub mod decoder;
pub mod detour;
pub mod last_error;
pub mod logger;
pub mod module_hooks;
pub mod platform;

pub use callbacks::{CallbackId, Callbacks, Dispatch};
pub use config::LoadwatchConfig;
pub use detour::{DetourController, HookState, InterceptedFunction, Patcher, SymbolResolver, Trampoline};
pub use module_hooks::{ModuleHooks, ModuleInterface, Replacements};

#[cfg(windows)]
mod dll {
    use std::ffi::c_void;
    use std::thread;

    use windows::Win32::Foundation::{HINSTANCE, HMODULE};
    use windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    use crate::config::LoadwatchConfig;
    use crate::logger;
    use crate::platform::{Detach, win32};

    /// Windows-recommended pattern: do minimal work under loader lock, spawn a thread for the
    /// heavy lifting. Installing touches ntdll code pages and may call into the loader, so it
    /// never runs inside `DllMain` itself.
    #[unsafe(no_mangle)]
    pub extern "system" fn DllMain(hinst: HINSTANCE, reason: u32, reserved: *mut c_void) -> bool {
        match reason {
            DLL_PROCESS_ATTACH => {
                // Thread notifications are not needed.
                let _ = unsafe { DisableThreadLibraryCalls(HMODULE::from(hinst)) };

                let spawned = thread::Builder::new()
                    .name("loadwatch_install".into())
                    .spawn(install);
                if spawned.is_err() {
                    return false;
                }
            }

            DLL_PROCESS_DETACH => {
                // Only a FreeLibrary unload runs teardown. At process exit the patched code
                // and the context simply go away with the process.
                if !Detach::from_reserved(reserved).runs_teardown() {
                    return true;
                }
                if let Err(e) = win32::stop() {
                    log::error!("[loadwatch] teardown failed: {e}");
                }
            }

            _ => {}
        }
        true
    }

    fn install() {
        let dir = win32::host_dir();
        let cfg = match LoadwatchConfig::discover(&dir) {
            Ok(cfg) => cfg,
            Err(e) => {
                // No logger yet; fall back to defaults and report once one exists.
                let cfg = LoadwatchConfig::default();
                let _ = logger::init_logger(&cfg, &dir);
                log::error!("[loadwatch] configuration rejected, using defaults: {e}");
                return start(&cfg);
            }
        };
        if let Err(e) = logger::init_logger(&cfg, &dir) {
            eprintln!("[loadwatch] logger init failed: {e}");
        }
        start(&cfg);
    }

    fn start(cfg: &LoadwatchConfig) {
        match win32::start(cfg) {
            Ok(()) => log::info!("[loadwatch] module interceptions installed"),
            Err(e) => log::error!("[loadwatch] install failed: {e}"),
        }
    }
}

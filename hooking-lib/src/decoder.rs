//! Turns the raw arguments and result of a forwarded map/unmap call into a module event.
//!
//! Filters run cheapest first: failed calls and calls aimed at other processes are discarded
//! before any memory query. Only image mappings with a loader-published path produce a map
//! event. None of the filters are errors.

use shared::constants::PATH_SEPARATOR;
use shared::errors::DecodeError;
use shared::events::{ModuleHandle, ModuleMapped, ModuleUnmapped};

/// NTSTATUS returned by the native API. Non-negative values are success codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtStatus(pub i32);

impl NtStatus {
    pub const SUCCESS: Self = Self(0);

    #[inline]
    pub fn is_success(self) -> bool {
        self.0 >= 0
    }
}

/// What backs a region of the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    /// Executable image mapped through an image section.
    Image,
    /// Data file or pagefile-backed section view.
    Mapped,
    Private,
    Free,
}

/// Memory and process queries the decoder depends on.
pub trait ProcessIntrospection: Send + Sync {
    /// Whether `process` (a raw handle) refers to the calling process.
    fn is_current_process(&self, process: usize) -> bool;

    fn region_type(&self, address: usize) -> Result<RegionType, DecodeError>;

    /// Path the loader stashed in the calling thread's scratch slot for the mapping in
    /// progress. `None` means the path is unknown.
    fn loader_path(&self) -> Option<String>;
}

/// Arguments of interest from a forwarded `NtMapViewOfSection`.
#[derive(Debug, Clone, Copy)]
pub struct MapViewCall {
    pub process: usize,
    /// Base address written back by the call. Only meaningful on success.
    pub base: Option<usize>,
    pub status: NtStatus,
}

/// Arguments of interest from a forwarded `NtUnmapViewOfSection`.
#[derive(Debug, Clone, Copy)]
pub struct UnmapViewCall {
    pub process: usize,
    pub base: usize,
    pub status: NtStatus,
}

pub struct EventDecoder {
    introspection: Box<dyn ProcessIntrospection>,
}

impl EventDecoder {
    pub fn new(introspection: impl ProcessIntrospection + 'static) -> Self {
        Self {
            introspection: Box::new(introspection),
        }
    }

    pub fn decode_map(&self, call: &MapViewCall) -> Result<Option<ModuleMapped>, DecodeError> {
        if !call.status.is_success() {
            log::trace!("[decoder] map failed with {:#010x}", call.status.0);
            return Ok(None);
        }
        if !self.introspection.is_current_process(call.process) {
            log::trace!("[decoder] map targets foreign process handle {:#x}", call.process);
            return Ok(None);
        }

        let base = call.base.filter(|&b| b != 0).ok_or(DecodeError::MissingBase)?;
        let region = self.introspection.region_type(base)?;
        if region != RegionType::Image {
            log::trace!("[decoder] {base:#x} is not an image ({region:?})");
            return Ok(None);
        }

        let Some(path) = self.introspection.loader_path() else {
            log::trace!("[decoder] no loader path for {base:#x}");
            return Ok(None);
        };
        let name = to_upper_ordinal(module_name(&path));
        log::debug!("[decoder] mapped {name} at {base:#x} ({path})");

        Ok(Some(ModuleMapped {
            module: ModuleHandle(base),
            path,
            name,
        }))
    }

    pub fn decode_unmap(&self, call: &UnmapViewCall) -> Option<ModuleUnmapped> {
        if !call.status.is_success() {
            log::trace!("[decoder] unmap failed with {:#010x}", call.status.0);
            return None;
        }
        if !self.introspection.is_current_process(call.process) {
            log::trace!("[decoder] unmap targets foreign process handle {:#x}", call.process);
            return None;
        }
        Some(ModuleUnmapped {
            module: ModuleHandle(call.base),
        })
    }
}

/// File name component: everything after the last `\`, or the whole path if there is none.
pub fn module_name(path: &str) -> &str {
    match path.rfind(PATH_SEPARATOR) {
        Some(i) => &path[i + PATH_SEPARATOR.len_utf8()..],
        None => path,
    }
}

/// Loader path from its UTF-16 form.
///
/// Unpaired surrogates yield `None` rather than replacement characters, which would let two
/// distinct files decode to the same name.
pub fn path_from_wide(wide: &[u16]) -> Option<String> {
    String::from_utf16(wide).ok()
}

/// Uppercase one code point at a time, ignoring locale.
///
/// Characters whose uppercase form is not a single code point (e.g. `ß`) are kept as is, so
/// the result has the same number of characters as the input.
pub fn to_upper_ordinal(s: &str) -> String {
    s.chars()
        .map(|c| {
            let mut upper = c.to_uppercase();
            match (upper.next(), upper.next()) {
                (Some(u), None) => u,
                _ => c,
            }
        })
        .collect()
}

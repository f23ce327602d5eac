//! Events delivered to module subscribers. They are built per notification, lent to every
//! callback for the duration of one dispatch and dropped afterwards.

use std::fmt;

/// Base address of a mapped view, which for images doubles as the module handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle(pub usize);

impl ModuleHandle {
    #[inline]
    pub fn base(self) -> usize {
        self.0
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An executable image was mapped into the current process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMapped {
    pub module: ModuleHandle,
    /// Full path as published by the loader for this mapping.
    pub path: String,
    /// File name after the last path separator, uppercased with ordinal rules so it can be
    /// compared byte for byte regardless of the system locale.
    pub name: String,
}

/// A view was unmapped from the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleUnmapped {
    pub module: ModuleHandle,
}

impl From<&ModuleMapped> for ModuleUnmapped {
    /// The unmap counterpart of a mapping, identified by the same handle.
    #[inline]
    fn from(mapped: &ModuleMapped) -> Self {
        Self { module: mapped.module }
    }
}

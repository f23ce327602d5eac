//! OS backends for the patcher, resolver, introspection and error-state seams.

use std::ffi::c_void;

pub mod syscall_stub;
#[cfg(windows)]
pub mod win32;

/// Why `DLL_PROCESS_DETACH` was delivered, from `DllMain`'s reserved argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    /// `FreeLibrary`: the other threads are alive and finish their calls normally.
    Unload,
    /// Process exit: the other threads were terminated wherever they stood, possibly inside a
    /// redirect body, so their in-flight counts never drop.
    ProcessExit,
}

impl Detach {
    pub fn from_reserved(reserved: *const c_void) -> Self {
        if reserved.is_null() {
            Self::Unload
        } else {
            Self::ProcessExit
        }
    }

    /// Only an unload removes the interceptions; at exit the drain could never finish.
    pub fn runs_teardown(self) -> bool {
        self == Self::Unload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn free_library_tears_down() {
        let detach = Detach::from_reserved(ptr::null());
        assert_eq!(detach, Detach::Unload);
        assert!(detach.runs_teardown());
    }

    #[test]
    fn process_exit_leaves_interceptions_in_place() {
        let context = 0x1usize as *const c_void;
        let detach = Detach::from_reserved(context);
        assert_eq!(detach, Detach::ProcessExit);
        assert!(!detach.runs_teardown());
    }
}

use thiserror::Error;

/// Rejections reported by the patcher while rewriting or restoring a target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("target {target:#x} is already patched")]
    AlreadyPatched { target: usize },

    #[error("not enough room at {target:#x} for a redirect")]
    InsufficientSpace { target: usize },

    #[error("prologue at {target:#x} is not a recognised syscall stub")]
    UnrecognizedStub { target: usize },

    #[error("memory at {target:#x} is protected: {reason}")]
    ProtectedMemory { target: usize, reason: String },

    #[error("trampoline allocation failed: {0}")]
    Allocation(String),
}

/// All errors surfaced by the install/remove lifecycle.
#[derive(Error, Debug)]
pub enum HookError {
    /// The target symbol could not be located. Fatal to install, never retried.
    #[error("could not resolve {module}!{symbol}")]
    Resolution { module: String, symbol: String },

    /// The patcher refused to redirect (or restore) the target.
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error("cannot {operation} `{hook}` while it is {state}")]
    InvalidState {
        hook: &'static str,
        operation: &'static str,
        state: &'static str,
    },

    /// A bounded drain gave up while calls were still executing inside the redirect body.
    #[error("`{hook}` still has {in_flight} call(s) in flight after {waited_ms} ms")]
    Stuck {
        hook: &'static str,
        in_flight: u32,
        waited_ms: u64,
    },
}

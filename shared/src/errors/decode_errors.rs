use thiserror::Error;

/// Failures while turning a forwarded call into a module event. These never reach the real
/// caller; the redirect body logs them and drops the notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("memory region query failed at {address:#x}: {reason}")]
    RegionQuery { address: usize, reason: String },

    #[error("map call succeeded without publishing a base address")]
    MissingBase,
}

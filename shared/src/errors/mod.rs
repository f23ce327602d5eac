mod config_errors;
mod decode_errors;
mod hook_errors;

pub use config_errors::ConfigError;
pub use decode_errors::DecodeError;
pub use hook_errors::{HookError, PatchError};

use std::path::PathBuf;
use thiserror::Error;

/// Problems with `loadwatch.toml` (or the file named by the override variable). The DLL entry
/// reports them and falls back to built-in defaults.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed TOML, an unknown key or a value of the wrong type.
    #[error("malformed configuration: {0}")]
    Parse(toml::de::Error),

    /// Well-formed but unusable settings.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

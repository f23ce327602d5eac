use serde::Deserialize;
use shared::constants::{CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE};
use shared::errors::ConfigError;
use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Full configuration, loaded from TOML. Every section is optional.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoadwatchConfig {
    /// Logging settings `[logging]`
    pub logging: LoggingConfig,
    /// Which interceptions to install `[hooks]`
    pub hooks: HooksConfig,
    /// Interception removal settings `[removal]`
    pub removal: RemovalConfig,
}

/// Logging section `[logging]`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Whether to install a logger at all
    pub enable: bool,
    /// Level filter name (`off`, `error`, `warn`, `info`, `debug`, `trace`)
    pub level: String,
    /// Optional log file, relative paths resolve against the host executable directory
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable: true,
            level: "info".into(),
            file: None,
        }
    }
}

/// Interception selection `[hooks]`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HooksConfig {
    pub map_view: bool,
    pub unmap_view: bool,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            map_view: true,
            unmap_view: true,
        }
    }
}

/// Removal section `[removal]`.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RemovalConfig {
    /// Give up waiting for in-flight calls after this many milliseconds. Absent or 0 waits
    /// forever.
    pub drain_timeout_ms: Option<u64>,
}

impl RemovalConfig {
    pub fn drain_limit(&self) -> Option<Duration> {
        self.drain_timeout_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }
}

impl LoadwatchConfig {
    /// Load, parse, and validate a config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&s)
    }

    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let cfg: LoadwatchConfig = toml::from_str(toml).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Resolve the configuration the way the DLL entry does: the override environment
    /// variable first, then `loadwatch.toml` in `dir`, then built-in defaults.
    ///
    /// An override that points to a missing file is an error; a missing default file is not.
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os(CONFIG_ENV_VAR) {
            return Self::load(Path::new(&path));
        }
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        log::LevelFilter::from_str(&self.logging.level).unwrap_or(log::LevelFilter::Info)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if log::LevelFilter::from_str(&self.logging.level).is_err() {
            return Err(ConfigError::Validation(format!(
                "logging.level `{}` is not a log level",
                self.logging.level
            )));
        }
        if !self.hooks.map_view && !self.hooks.unmap_view {
            return Err(ConfigError::Validation(
                "hooks: at least one of map_view/unmap_view must be enabled".into(),
            ));
        }
        Ok(())
    }
}

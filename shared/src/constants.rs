/// Module exporting the intercepted native entry points.
pub const NTDLL: &str = "ntdll.dll";

pub const NT_MAP_VIEW_OF_SECTION: &str = "NtMapViewOfSection";
pub const NT_UNMAP_VIEW_OF_SECTION: &str = "NtUnmapViewOfSection";

/// Environment variable that overrides the configuration file location.
pub const CONFIG_ENV_VAR: &str = "LOADWATCH_CONFIG";

/// Configuration file looked up next to the host executable when no override is set.
pub const DEFAULT_CONFIG_FILE: &str = "loadwatch.toml";

/// Separator used by the loader in NT and Win32 paths.
pub const PATH_SEPARATOR: char = '\\';

//! Configuration
//!
//! Three layers, later layers win:
//! 1. Built-in defaults
//! 2. Project config (`apkforge.toml`)
//! 3. CLI flags

mod merge;
mod settings;

pub use merge::{deep_merge, merge_layers};
pub use settings::{
    resolve_secret, BuildConfig, BuildSettings, ConfigError, ProjectSettings, SigningSettings,
    ToolPaths, CONFIG_FILE_NAME,
};

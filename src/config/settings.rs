//! Build configuration (`apkforge.toml`)

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use globset::Glob;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::merge::merge_layers;
use crate::predex::is_valid_revision;
use crate::signing::{Secret, SigningConfig};

/// Config file looked up in the project directory when none is given.
pub const CONFIG_FILE_NAME: &str = "apkforge.toml";

/// Largest accepted per-process timeout.
const MAX_TIMEOUT_SECONDS: u64 = 86_400;

/// Largest accepted worker pool width.
const MAX_PARALLELISM: usize = 256;

const JAVA_SOURCE_LEVELS: &[&str] = &["1.5", "1.6", "1.7", "1.8", "5", "6", "7", "8"];

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("{field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("environment variable {var} referenced by {field} is not set")]
    MissingEnv { field: &'static str, var: String },

    #[error("release signing requested but no [signing] section is configured")]
    NoReleaseSigning,
}

/// Complete build configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub project: ProjectSettings,
    pub tools: ToolPaths,
    pub build: BuildSettings,
    pub signing: Option<SigningSettings>,
}

/// `[project]`: module layout overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectSettings {
    /// APK base name (default: the project directory name)
    pub name: Option<String>,

    /// Java source directories, relative to the project directory
    pub source_dirs: Vec<PathBuf>,

    /// Build output directory, relative to the project directory
    pub build_dir: PathBuf,

    /// Android library directories (unpacked AAR layout), relative to the
    /// project directory. Earlier entries win resource conflicts.
    pub libraries: Vec<PathBuf>,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            name: None,
            source_dirs: vec![PathBuf::from("src/main/java")],
            build_dir: PathBuf::from("build"),
            libraries: Vec::new(),
        }
    }
}

/// `[tools]`: external tool locations.
///
/// Bare names are looked up on `PATH`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub javac: PathBuf,
    pub dx: PathBuf,
    pub dex_merger: PathBuf,
    pub aapt: PathBuf,
    pub apksigner: PathBuf,
    pub keytool: PathBuf,
    pub android_jar: Option<PathBuf>,
    /// Part of every pre-dex cache key
    pub build_tools_revision: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            javac: PathBuf::from("javac"),
            dx: PathBuf::from("dx"),
            dex_merger: PathBuf::from("dex-merger"),
            aapt: PathBuf::from("aapt"),
            apksigner: PathBuf::from("apksigner"),
            keytool: PathBuf::from("keytool"),
            android_jar: None,
            build_tools_revision: "21.1.2".to_string(),
        }
    }
}

/// `[build]`: pipeline behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSettings {
    /// Worker threads for library dexing (0 = available parallelism)
    pub parallelism: usize,

    /// Per tool invocation (0 = no timeout)
    pub process_timeout_seconds: u64,

    /// Debug-level logging and verbose tool output
    pub verbose: bool,

    /// Globs selecting Java sources inside each source directory
    pub java_source_patterns: Vec<String>,

    /// Passed to javac as `-source` and `-target`
    pub java_source_level: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            parallelism: 0,
            process_timeout_seconds: 600,
            verbose: false,
            java_source_patterns: vec!["**/*.java".to_string()],
            java_source_level: "1.7".to_string(),
        }
    }
}

impl BuildSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism > MAX_PARALLELISM {
            return Err(ConfigError::Validation {
                field: "build.parallelism",
                reason: format!("must be at most {}, got {}", MAX_PARALLELISM, self.parallelism),
            });
        }

        if self.process_timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(ConfigError::Validation {
                field: "build.process_timeout_seconds",
                reason: format!(
                    "must be in [0, {}], got {}",
                    MAX_TIMEOUT_SECONDS, self.process_timeout_seconds
                ),
            });
        }

        if self.java_source_patterns.is_empty() {
            return Err(ConfigError::Validation {
                field: "build.java_source_patterns",
                reason: "at least one pattern is required".to_string(),
            });
        }
        for pattern in &self.java_source_patterns {
            if let Err(e) = Glob::new(pattern) {
                return Err(ConfigError::Validation {
                    field: "build.java_source_patterns",
                    reason: format!("invalid glob '{}': {}", pattern, e),
                });
            }
        }

        if !JAVA_SOURCE_LEVELS.contains(&self.java_source_level.as_str()) {
            return Err(ConfigError::Validation {
                field: "build.java_source_level",
                reason: format!(
                    "unsupported level '{}' (expected one of {})",
                    self.java_source_level,
                    JAVA_SOURCE_LEVELS.join(", ")
                ),
            });
        }

        Ok(())
    }

    /// Timeout as a duration, `None` when disabled.
    pub fn process_timeout(&self) -> Option<std::time::Duration> {
        (self.process_timeout_seconds > 0)
            .then(|| std::time::Duration::from_secs(self.process_timeout_seconds))
    }
}

/// `[signing]`: release key material.
///
/// Passwords are either literal or `env:VAR` references resolved at build time.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SigningSettings {
    pub store_file: PathBuf,
    #[serde(default)]
    pub store_type: Option<String>,
    pub key_alias: String,
    pub store_password: String,
    pub key_password: String,
}

impl fmt::Debug for SigningSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningSettings")
            .field("store_file", &self.store_file)
            .field("store_type", &self.store_type)
            .field("key_alias", &self.key_alias)
            .field("store_password", &redact_reference(&self.store_password))
            .field("key_password", &redact_reference(&self.key_password))
            .finish()
    }
}

impl SigningSettings {
    /// Resolve password references into a signing config.
    ///
    /// A relative store file is taken relative to `project_dir`.
    pub fn resolve(&self, project_dir: &Path) -> Result<SigningConfig, ConfigError> {
        let store_file = if self.store_file.is_absolute() {
            self.store_file.clone()
        } else {
            project_dir.join(&self.store_file)
        };
        Ok(SigningConfig {
            store_file,
            store_type: self.store_type.clone(),
            key_alias: self.key_alias.clone(),
            store_password: resolve_secret("signing.store_password", &self.store_password)?,
            key_password: resolve_secret("signing.key_password", &self.key_password)?,
            debug: false,
        })
    }
}

fn redact_reference(raw: &str) -> String {
    if raw.starts_with("env:") {
        raw.to_string()
    } else {
        apkforge_exec::REDACTED.to_string()
    }
}

/// Turn `env:VAR` into the variable's value; anything else is literal.
pub fn resolve_secret(field: &'static str, raw: &str) -> Result<Secret, ConfigError> {
    match raw.strip_prefix("env:") {
        Some(var) => std::env::var(var)
            .map(Secret::new)
            .map_err(|_| ConfigError::MissingEnv {
                field,
                var: var.to_string(),
            }),
        None => {
            tracing::warn!(field, "password stored in plain text in the config file");
            Ok(Secret::new(raw))
        }
    }
}

impl FromStr for BuildConfig {
    type Err = ConfigError;

    /// Parse and validate a single TOML document.
    fn from_str(content: &str) -> Result<Self, Self::Err> {
        Self::from_str_at(Path::new("<inline>"), content)
    }
}

impl BuildConfig {
    fn from_str_at(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = read_config(path)?;
        Self::from_str_at(path, &content)
    }

    /// Merge built-in defaults, the project's config file and CLI overrides.
    ///
    /// `config_path` defaults to `apkforge.toml` in `project_dir`; a missing
    /// default file is not an error.
    pub fn load(
        project_dir: &Path,
        config_path: Option<&Path>,
        cli_overrides: Value,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![serde_json::to_value(Self::default())?];

        let file = match config_path {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let candidate = project_dir.join(CONFIG_FILE_NAME);
                candidate.exists().then_some(candidate)
            }
        };
        if let Some(path) = file {
            let content = read_config(&path)?;
            let value: Value = toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(path = %path.display(), "loaded config file");
            layers.push(value);
        }

        layers.push(cli_overrides);

        let config: Self = serde_json::from_value(merge_layers(layers))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build.validate()?;

        if !is_valid_revision(&self.tools.build_tools_revision) {
            return Err(ConfigError::Validation {
                field: "tools.build_tools_revision",
                reason: format!(
                    "'{}' must be non-empty and use only letters, digits, '.', '_' and '-'",
                    self.tools.build_tools_revision
                ),
            });
        }
        if self.project.source_dirs.is_empty() {
            return Err(ConfigError::Validation {
                field: "project.source_dirs",
                reason: "at least one source directory is required".to_string(),
            });
        }
        for (i, library) in self.project.libraries.iter().enumerate() {
            if library.as_os_str().is_empty() {
                return Err(ConfigError::Validation {
                    field: "project.libraries",
                    reason: format!("entry {} is empty", i),
                });
            }
            if self.project.libraries[..i].contains(library) {
                return Err(ConfigError::Validation {
                    field: "project.libraries",
                    reason: format!("'{}' is listed twice", library.display()),
                });
            }
        }
        if let Some(name) = &self.project.name {
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(ConfigError::Validation {
                    field: "project.name",
                    reason: format!("'{}' is not a valid file name", name),
                });
            }
        }
        Ok(())
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

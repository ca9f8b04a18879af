//! Build errors and exit codes

use std::io;
use std::path::{Path, PathBuf};

use apkforge_exec::{ProcessError, TaskError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::signing::KeystoreError;

/// Result alias for build operations.
pub type BuildResult<T> = Result<T, BuildError>;

/// Stable process exit codes for the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Build succeeded
    Success = 0,
    /// An external tool reported a failure
    ToolFailed = 10,
    /// Dex merge found duplicate class definitions
    DexCollision = 11,
    /// Invalid or unreadable configuration
    Config = 20,
    /// A required input file or tool is missing
    MissingInput = 21,
    /// Keystore or signing failure
    Signing = 30,
    /// Filesystem or process I/O failure
    Io = 40,
    /// Build was cancelled
    Cancelled = 130,
}

impl ExitCode {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

/// Any failure that stops the pipeline.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{tool} failed during {stage}: {detail}")]
    Tool {
        stage: &'static str,
        tool: String,
        detail: String,
    },

    #[error("dex merge failed, classes defined more than once: {}", .classes.join(", "))]
    DexCollision { classes: Vec<String>, output: String },

    #[error("tool not found: {tool} ({reason})")]
    ToolNotFound { tool: String, reason: String },

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Process(ProcessError),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parallel task panicked: {0}")]
    TaskPanicked(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("missing input: {0}")]
    MissingInput(String),
}

impl BuildError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        BuildError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Classify a process failure raised while running `stage`.
    pub fn from_process(stage: &'static str, err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled { .. } => BuildError::Cancelled,
            ProcessError::NonZeroExit { tool, stderr, .. } => BuildError::Tool {
                stage,
                tool,
                detail: stderr,
            },
            other => BuildError::Process(other),
        }
    }

    /// Unwrap the error of a parallel task.
    pub fn from_task(err: TaskError<BuildError>) -> Self {
        match err {
            TaskError::Failed(err) => err,
            TaskError::Panicked(message) => BuildError::TaskPanicked(message),
            TaskError::Interrupted => BuildError::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Cancelled)
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            BuildError::Tool { .. } | BuildError::TaskPanicked(_) => ExitCode::ToolFailed,
            BuildError::DexCollision { .. } => ExitCode::DexCollision,
            BuildError::ToolNotFound { .. } | BuildError::MissingInput(_) => ExitCode::MissingInput,
            BuildError::Keystore(_) => ExitCode::Signing,
            BuildError::Config(_) => ExitCode::Config,
            BuildError::Process(ProcessError::TimedOut { .. }) => ExitCode::ToolFailed,
            BuildError::Process(_) | BuildError::Io { .. } => ExitCode::Io,
            BuildError::Cancelled => ExitCode::Cancelled,
        }
    }
}

//! Build stages
//!
//! The pipeline is a fixed chain:
//!
//! ```text
//! Aapt -> JavaCompiler -> Dexer -> BuildApk -> SignApk
//! ```
//!
//! Each stage reads fixed locations from the [`AndroidProject`], drives one
//! or more external tools and decides on its own whether it is up to date.

mod aapt;
mod apk;
mod dexer;
mod javac;
mod sign;

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use apkforge_depfile::DependencyFile;
use apkforge_exec::{CancellationToken, ProcessInfo, ProcessResult, ProcessRunner, WorkerPool};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::{BuildConfig, ConfigError};
use crate::error::{BuildError, BuildResult};
use crate::predex::{sha256_file, PreDexCache};
use crate::project::AndroidProject;
use crate::signing::SigningConfig;

pub use dexer::find_collisions;

/// One pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BuildStage {
    Aapt,
    JavaCompiler,
    Dexer,
    BuildApk,
    SignApk,
}

impl BuildStage {
    /// Every stage in pipeline order.
    pub const ALL: [BuildStage; 5] = [
        BuildStage::Aapt,
        BuildStage::JavaCompiler,
        BuildStage::Dexer,
        BuildStage::BuildApk,
        BuildStage::SignApk,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuildStage::Aapt => "Aapt",
            BuildStage::JavaCompiler => "JavaCompiler",
            BuildStage::Dexer => "Dexer",
            BuildStage::BuildApk => "BuildApk",
            BuildStage::SignApk => "SignApk",
        }
    }

    /// Run the stage.
    pub fn run(&self, ctx: &BuildContext<'_>) -> BuildResult<StageOutcome> {
        ctx.check_cancelled()?;
        match self {
            BuildStage::Aapt => aapt::run(ctx),
            BuildStage::JavaCompiler => javac::run(ctx),
            BuildStage::Dexer => dexer::run(ctx),
            BuildStage::BuildApk => apk::run(ctx),
            BuildStage::SignApk => sign::run(ctx),
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when parsing an unknown stage name.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown stage '{0}' (expected aapt, java-compiler, dexer, build-apk or sign-apk)")]
pub struct UnknownStage(String);

impl FromStr for BuildStage {
    type Err = UnknownStage;

    /// Case-insensitive; `-` and `_` are ignored (`java-compiler`, `JavaCompiler`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        BuildStage::ALL
            .into_iter()
            .find(|stage| stage.name().to_ascii_lowercase() == wanted)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// What a stage did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Ran,
    UpToDate,
}

/// Everything a stage may use. Borrowed from the builder for one build.
pub struct BuildContext<'a> {
    pub project: &'a AndroidProject,
    pub config: &'a BuildConfig,
    pub runner: &'a ProcessRunner,
    pub pool: &'a Arc<WorkerPool>,
    pub predex: &'a Arc<PreDexCache>,
    /// Resolved only when the build signs
    pub signing: Option<&'a SigningConfig>,
    pub token: &'a CancellationToken,
}

impl BuildContext<'_> {
    pub fn check_cancelled(&self) -> BuildResult<()> {
        if self.token.is_cancelled() {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve a configured tool path or name.
    pub fn tool(&self, configured: &Path) -> BuildResult<PathBuf> {
        resolve_tool(configured)
    }

    pub fn android_jar(&self) -> BuildResult<PathBuf> {
        match &self.config.tools.android_jar {
            Some(jar) if jar.is_file() => Ok(jar.clone()),
            Some(jar) => Err(BuildError::MissingInput(format!(
                "android.jar not found at {}",
                jar.display()
            ))),
            None => Err(BuildError::MissingInput(
                "android.jar is not configured (set tools.android_jar)".to_string(),
            )),
        }
    }

    /// Run a tool and require a zero exit status.
    pub fn run_tool(&self, stage: BuildStage, info: &ProcessInfo) -> BuildResult<ProcessResult> {
        self.runner
            .run(info, self.token)
            .and_then(|result| result.assert_normal_exit())
            .map_err(|e| BuildError::from_process(stage.name(), e))
    }
}

/// Find `configured` on `PATH`, or check it directly when it is a path.
pub fn resolve_tool(configured: &Path) -> BuildResult<PathBuf> {
    which::which(configured).map_err(|e| BuildError::ToolNotFound {
        tool: configured.display().to_string(),
        reason: e.to_string(),
    })
}

/// True when `dep` records every current input and nothing is stale.
pub(crate) fn is_up_to_date(dep: &DependencyFile, current_inputs: &[PathBuf]) -> bool {
    !dep.need_compilation() && current_inputs.iter().all(|input| dep.has_input(input))
}

pub(crate) fn glob_set(patterns: &[String]) -> BuildResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| ConfigError::Validation {
            field: "build.java_source_patterns",
            reason: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| {
        BuildError::Config(ConfigError::Validation {
            field: "build.java_source_patterns",
            reason: e.to_string(),
        })
    })
}

/// Files under `roots` whose root-relative path matches `globs`, sorted.
pub(crate) fn collect_files(roots: &[PathBuf], globs: &GlobSet) -> BuildResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for root in roots.iter().filter(|r| r.is_dir()) {
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root.as_path()).to_path_buf();
                BuildError::io(&path, io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if globs.is_match(relative) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Files with `extension` below `dir`, sorted.
pub(crate) fn files_with_extension(dir: &Path, extension: &str) -> BuildResult<Vec<PathBuf>> {
    let mut builder = GlobSetBuilder::new();
    let glob = Glob::new(&format!("**/*.{}", extension)).map_err(|e| {
        BuildError::io(dir, io::Error::new(io::ErrorKind::InvalidInput, e))
    })?;
    builder.add(glob);
    let globs = builder
        .build()
        .map_err(|e| BuildError::io(dir, io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    collect_files(&[dir.to_path_buf()], &globs)
}

/// Copy `src` to `dst` unless `dst` already has the same content.
///
/// Returns true if `dst` was written.
pub(crate) fn sync_file(src: &Path, dst: &Path) -> BuildResult<bool> {
    if dst.is_file() {
        let same = sha256_file(src).map_err(|e| BuildError::io(src, e))?
            == sha256_file(dst).map_err(|e| BuildError::io(dst, e))?;
        if same {
            return Ok(false);
        }
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    fs::copy(src, dst).map_err(|e| BuildError::io(dst, e))?;
    Ok(true)
}

/// Delete files with `extension` under `dir` that are not in `keep`.
pub(crate) fn remove_stale(dir: &Path, extension: &str, keep: &HashSet<PathBuf>) -> BuildResult<usize> {
    let mut removed = 0;
    for file in files_with_extension(dir, extension)? {
        if !keep.contains(&file) {
            fs::remove_file(&file).map_err(|e| BuildError::io(&file, e))?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove a file if present.
pub(crate) fn remove_file_if_exists(path: &Path) -> BuildResult<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(BuildError::io(path, e)),
        _ => Ok(()),
    }
}

pub(crate) fn create_dir(dir: &Path) -> BuildResult<()> {
    fs::create_dir_all(dir).map_err(|e| BuildError::io(dir, e))
}

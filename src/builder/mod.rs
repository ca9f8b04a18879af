//! Build orchestration
//!
//! [`AndroidBuilder`] owns everything that lives longer than one stage: the
//! worker pool, the pre-dex cache, the process runner and the root
//! cancellation token. [`AndroidBuilder::build`] runs the requested stages in
//! pipeline order and stops at the first failure.

mod log;
mod report;

use std::io;
use std::sync::Arc;
use std::time::Instant;

use apkforge_exec::pool::default_width;
use apkforge_exec::{CancellationToken, OutputHandler, ProcessRunner, ProcessRunnerConfig, WorkerPool};
use chrono::Utc;
use thiserror::Error;

use crate::config::{BuildConfig, ConfigError};
use crate::error::{BuildError, BuildResult};
use crate::predex::{sha256_file, PreDexCache};
use crate::project::AndroidProject;
use crate::signing::SigningConfig;
use crate::tasks::{resolve_tool, BuildContext, BuildStage};

pub use log::BuildLog;
pub use report::{BuildReport, StageReport, SUMMARY_SCHEMA_VERSION};

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Run in pipeline order regardless of the order given
    pub stages: Vec<BuildStage>,
    /// Sign with the `[signing]` config instead of the debug key
    pub release: bool,
}

impl Default for BuildRequest {
    fn default() -> Self {
        Self {
            stages: BuildStage::ALL.to_vec(),
            release: false,
        }
    }
}

impl BuildRequest {
    pub fn release() -> Self {
        Self {
            release: true,
            ..Self::default()
        }
    }

    pub fn stages(stages: impl IntoIterator<Item = BuildStage>) -> Self {
        Self {
            stages: stages.into_iter().collect(),
            release: false,
        }
    }
}

/// A failed build: the stage that failed, why, and the tool output so far.
#[derive(Debug, Error)]
#[error("{stage} failed: {error}")]
pub struct BuildFailure {
    pub stage: BuildStage,
    #[source]
    pub error: BuildError,
    pub log: Vec<String>,
}

impl BuildFailure {
    pub fn exit_code(&self) -> crate::error::ExitCode {
        self.error.exit_code()
    }
}

/// Runs the build pipeline for one project.
pub struct AndroidBuilder {
    project: AndroidProject,
    config: BuildConfig,
    pool: Arc<WorkerPool>,
    predex: Arc<PreDexCache>,
    runner: ProcessRunner,
    log: Arc<BuildLog>,
    token: CancellationToken,
    debug_signing: Option<SigningConfig>,
}

impl AndroidBuilder {
    /// Create a builder with its own worker pool sized by `build.parallelism`.
    pub fn new(project: AndroidProject, config: BuildConfig) -> BuildResult<Self> {
        let width = match config.build.parallelism {
            0 => default_width(),
            n => n,
        };
        let pool = WorkerPool::new(width).map_err(|e| BuildError::io(project.root(), e))?;
        Self::with_pool(project, config, Arc::new(pool))
    }

    /// Create a builder on a pool owned by the caller.
    pub fn with_pool(
        project: AndroidProject,
        config: BuildConfig,
        pool: Arc<WorkerPool>,
    ) -> BuildResult<Self> {
        config.validate()?;

        let log = Arc::new(BuildLog::new());
        let runner = ProcessRunner::new(ProcessRunnerConfig {
            timeout: config.build.process_timeout(),
            ..ProcessRunnerConfig::default()
        })
        .with_output_handler(Arc::clone(&log) as Arc<dyn OutputHandler>);
        let token = CancellationToken::new();

        // A missing dx only matters once a library has to be dexed
        let dx = resolve_tool(&config.tools.dx).unwrap_or_else(|_| config.tools.dx.clone());
        let predex = Arc::new(PreDexCache::open(
            project.predex_store_dir(),
            dx,
            runner.clone(),
            token.clone(),
        )?);

        Ok(Self {
            project,
            config,
            pool,
            predex,
            runner,
            log,
            token,
            debug_signing: None,
        })
    }

    /// Use this debug keystore instead of `~/.android/debug.keystore`.
    pub fn with_debug_signing(mut self, signing: SigningConfig) -> Self {
        self.debug_signing = Some(signing);
        self
    }

    pub fn project(&self) -> &AndroidProject {
        &self.project
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn predex(&self) -> &PreDexCache {
        &self.predex
    }

    /// Cancelling this token stops the running build.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn log(&self) -> &BuildLog {
        &self.log
    }

    /// Run the requested stages in pipeline order.
    pub fn build(&self, request: &BuildRequest) -> Result<BuildReport, BuildFailure> {
        let mut stages = request.stages.clone();
        stages.sort();
        stages.dedup();

        self.log.take();
        let mut report = BuildReport::new(self.project.name(), request.release);
        tracing::info!(
            build_id = %report.build_id,
            project = %self.project.name(),
            release = request.release,
            "build started"
        );

        let first = stages.first().copied().unwrap_or(BuildStage::Aapt);
        self.project
            .ensure_build_dirs()
            .map_err(|e| self.failure(first, BuildError::io(self.project.build_dir(), e)))?;

        let signing = if stages.contains(&BuildStage::SignApk) {
            Some(
                self.signing_config(request.release)
                    .map_err(|e| self.failure(BuildStage::SignApk, e))?,
            )
        } else {
            None
        };

        let ctx = BuildContext {
            project: &self.project,
            config: &self.config,
            runner: &self.runner,
            pool: &self.pool,
            predex: &self.predex,
            signing: signing.as_ref(),
            token: &self.token,
        };

        for stage in stages {
            let start = Instant::now();
            tracing::info!(stage = %stage, "stage started");
            let outcome = stage.run(&ctx).map_err(|e| self.failure(stage, e))?;
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::info!(stage = %stage, ?outcome, duration_ms, "stage finished");
            report.stages.push(StageReport {
                stage,
                outcome,
                duration_ms,
            });
        }

        let merged = self.project.merged_dex();
        if merged.is_file() {
            report.merged_dex_sha256 = sha256_file(&merged).ok();
        }
        let signed = self.project.signed_apk();
        if report.outcome(BuildStage::SignApk).is_some() && signed.is_file() {
            report.signed_apk = Some(signed);
        }
        report.predex = self.predex.stats();
        report.finished_at = Utc::now();

        if let Err(e) = report.write_to(&self.project.summary_file()) {
            tracing::warn!(error = %e, "failed to write build summary");
        }
        tracing::info!(
            build_id = %report.build_id,
            duration_ms = report.duration_ms(),
            "build finished"
        );
        Ok(report)
    }

    /// Delete the build directory and forget pre-dexed libraries.
    pub fn clean(&self) -> BuildResult<()> {
        let build_dir = self.project.build_dir();
        self.predex
            .clear()
            .map_err(|e| BuildError::io(build_dir, io::Error::other(e)))?;
        self.project
            .clean()
            .map_err(|e| BuildError::io(build_dir, e))
    }

    /// Signing config for this build.
    pub fn signing_config(&self, release: bool) -> BuildResult<SigningConfig> {
        if release {
            let settings = self
                .config
                .signing
                .as_ref()
                .ok_or(ConfigError::NoReleaseSigning)?;
            return Ok(settings.resolve(self.project.root())?);
        }
        match &self.debug_signing {
            Some(signing) => Ok(signing.clone()),
            None => Ok(SigningConfig::debug()?),
        }
    }

    fn failure(&self, stage: BuildStage, error: BuildError) -> BuildFailure {
        if error.is_cancelled() {
            tracing::warn!(stage = %stage, "build cancelled");
        } else {
            tracing::error!(stage = %stage, error = %error, "stage failed");
        }
        BuildFailure {
            stage,
            error,
            log: self.log.take(),
        }
    }
}

impl std::fmt::Debug for AndroidBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AndroidBuilder")
            .field("project", &self.project)
            .field("pool", &self.pool)
            .field("predex", &self.predex)
            .finish()
    }
}

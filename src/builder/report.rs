//! Build summary (`build/build_summary.json`)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::predex::PreDexStats;
use crate::tasks::{BuildStage, StageOutcome};

/// Schema version of the summary file
pub const SUMMARY_SCHEMA_VERSION: u32 = 1;

/// One stage's result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: BuildStage,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
}

/// Result of a successful build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub schema_version: u32,
    pub build_id: Uuid,
    pub project: String,
    pub release: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,

    /// SHA-256 of `output/merged/classes.dex`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_dex_sha256: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_apk: Option<PathBuf>,

    pub predex: PreDexStats,
}

impl BuildReport {
    pub fn new(project: &str, release: bool) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SUMMARY_SCHEMA_VERSION,
            build_id: Uuid::new_v4(),
            project: project.to_string(),
            release,
            started_at: now,
            finished_at: now,
            stages: Vec::new(),
            merged_dex_sha256: None,
            signed_apk: None,
            predex: PreDexStats::default(),
        }
    }

    /// Outcome of `stage`, if it was part of the build.
    pub fn outcome(&self, stage: BuildStage) -> Option<StageOutcome> {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| s.outcome)
    }

    /// Total wall time in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    pub fn read_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

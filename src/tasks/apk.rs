//! Unsigned APK assembly

use std::fs;

use apkforge_exec::ProcessInfo;

use super::{create_dir, remove_file_if_exists, BuildContext, BuildStage, StageOutcome};
use crate::error::{BuildError, BuildResult};

/// Start from the packaged resources and add the merged `classes.dex` at the
/// archive root.
pub(super) fn run(ctx: &BuildContext<'_>) -> BuildResult<StageOutcome> {
    let project = ctx.project;
    let merged = project.merged_dex();
    if !merged.is_file() {
        return Err(BuildError::MissingInput(format!(
            "merged dex not found at {}",
            merged.display()
        )));
    }
    let aapt = ctx.tool(&ctx.config.tools.aapt)?;

    let unsigned = project.unsigned_apk();
    create_dir(&project.output_dir())?;
    remove_file_if_exists(&unsigned)?;

    let resources = project.resources_ap();
    if resources.is_file() {
        fs::copy(&resources, &unsigned).map_err(|e| BuildError::io(&unsigned, e))?;
    } else {
        tracing::warn!(path = %resources.display(), "no packaged resources, APK will contain code only");
    }

    // -k stores classes.dex without its directory
    let info = ProcessInfo::new(aapt)
        .describe("aapt")
        .args(["add", "-k"])
        .arg_path(&unsigned)
        .arg_path(&merged)
        .current_dir(project.merged_dir());
    ctx.run_tool(BuildStage::BuildApk, &info)?;

    if !unsigned.is_file() {
        return Err(BuildError::Tool {
            stage: BuildStage::BuildApk.name(),
            tool: "aapt".to_string(),
            detail: format!("no APK written to {}", unsigned.display()),
        });
    }
    tracing::info!(apk = %unsigned.display(), "unsigned APK built");
    Ok(StageOutcome::Ran)
}

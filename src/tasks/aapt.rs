//! Resource packaging and R.java generation

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use apkforge_exec::ProcessInfo;

use super::{create_dir, files_with_extension, remove_stale, sync_file, BuildContext, BuildStage, StageOutcome};
use crate::error::{BuildError, BuildResult};

/// `aapt package` into the staging dir, then sync changed sources into the
/// generated-source dir.
///
/// Each library project first gets its own `R` class with non-constant ids.
/// The app package then overlays library resources and assets under its own.
/// Unchanged `R.java` files keep their timestamps, so a resource edit that
/// does not change any id leaves the Java compile up to date.
pub(super) fn run(ctx: &BuildContext<'_>) -> BuildResult<StageOutcome> {
    let project = ctx.project;
    let manifest = project.manifest();
    if !manifest.is_file() {
        return Err(BuildError::MissingInput(format!(
            "manifest not found at {}",
            manifest.display()
        )));
    }
    for library in project.libraries() {
        if !library.manifest().is_file() {
            return Err(BuildError::MissingInput(format!(
                "library {} has no manifest at {}",
                library.name(),
                library.manifest().display()
            )));
        }
    }
    let aapt = ctx.tool(&ctx.config.tools.aapt)?;
    let android_jar = ctx.android_jar()?;

    let staging = project.r_staging_dir();
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| BuildError::io(&staging, e))?;
    }
    create_dir(&staging)?;
    create_dir(&project.output_dir())?;

    for library in project.libraries() {
        let mut info = package_command(ctx, &aapt)
            .describe(format!("aapt ({})", library.name()))
            .arg("--non-constant-id")
            .arg("-M")
            .arg_path(&library.manifest());
        info = with_resource_dirs(info, &library.res_dir(), &library.assets_dir())
            .arg("-I")
            .arg_path(&android_jar)
            .arg("-J")
            .arg_path(&staging);
        tracing::info!(library = library.name(), "generating library R class");
        ctx.run_tool(BuildStage::Aapt, &info)?;
    }

    let mut info = package_command(ctx, &aapt).arg("-M").arg_path(&manifest);
    info = with_resource_dirs(info, &project.res_dir(), &project.assets_dir());
    for library in project.libraries() {
        info = with_resource_dirs(info, &library.res_dir(), &library.assets_dir());
    }
    info = info
        .arg("-I")
        .arg_path(&android_jar)
        .arg("-J")
        .arg_path(&staging)
        .arg("-F")
        .arg_path(&project.resources_ap());

    ctx.run_tool(BuildStage::Aapt, &info)?;

    let gen = project.gen_source_dir();
    let mut current = HashSet::new();
    let mut changed = 0;
    for staged in files_with_extension(&staging, "java")? {
        let relative = staged.strip_prefix(&staging).unwrap_or(&staged);
        let target = gen.join(relative);
        if sync_file(&staged, &target)? {
            tracing::debug!(file = %target.display(), "generated source changed");
            changed += 1;
        }
        current.insert(target);
    }
    let removed = remove_stale(&gen, "java", &current)?;

    tracing::info!(generated = current.len(), changed, removed, "resources packaged");
    Ok(StageOutcome::Ran)
}

fn package_command(ctx: &BuildContext<'_>, aapt: &Path) -> ProcessInfo {
    let info = ProcessInfo::new(aapt)
        .describe("aapt")
        .args(["package", "-f", "-m", "--auto-add-overlay"]);
    if ctx.config.build.verbose {
        info.arg("-v")
    } else {
        info
    }
}

/// Append `-S` and `-A` for whichever of the two directories exist.
fn with_resource_dirs(mut info: ProcessInfo, res: &Path, assets: &Path) -> ProcessInfo {
    if res.is_dir() {
        info = info.arg("-S").arg_path(res);
    }
    if assets.is_dir() {
        info = info.arg("-A").arg_path(assets);
    }
    info
}

//! Dexing and dex merging
//!
//! 1. Project classes are dexed into `dexedClasses/classes.dex`.
//! 2. Library jars are pre-dexed in parallel through the [`PreDexCache`].
//! 3. The project dex and library dex files are merged into one `classes.dex`.
//!
//! [`PreDexCache`]: crate::predex::PreDexCache

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use apkforge_depfile::DependencyFile;
use apkforge_exec::{ProcessInfo, WaitableExecutor};
use regex_lite::Regex;

use super::{
    create_dir, files_with_extension, is_up_to_date, remove_file_if_exists, remove_stale,
    sync_file, BuildContext, BuildStage, StageOutcome,
};
use crate::error::{BuildError, BuildResult};
use crate::predex::PreDexEntry;

pub(super) fn run(ctx: &BuildContext<'_>) -> BuildResult<StageOutcome> {
    let project_ran = dex_project_classes(ctx)?;
    ctx.check_cancelled()?;
    let libraries = predex_libraries(ctx)?;
    ctx.check_cancelled()?;
    let merge_ran = merge(ctx, &libraries)?;

    if project_ran || merge_ran {
        Ok(StageOutcome::Ran)
    } else {
        Ok(StageOutcome::UpToDate)
    }
}

fn dex_project_classes(ctx: &BuildContext<'_>) -> BuildResult<bool> {
    let project = ctx.project;
    let classes = project.classes_dir();
    let class_files = files_with_extension(&classes, "class")?;
    if class_files.is_empty() {
        return Err(BuildError::MissingInput(format!(
            "no compiled classes in {}",
            classes.display()
        )));
    }

    let dex = project.classes_dex();
    let mut dep = DependencyFile::new(project.classes_dep_file(), vec![classes.clone()]);
    dep.parse();
    if dex.is_file() && dep.has_output(&dex) && is_up_to_date(&dep, &class_files) {
        tracing::debug!("project dex up to date");
        return Ok(false);
    }

    let dx = ctx.tool(&ctx.config.tools.dx)?;
    create_dir(&project.dexed_classes_dir())?;
    remove_file_if_exists(&dex)?;

    let info = ProcessInfo::new(dx)
        .describe("dx")
        .arg("--dex")
        .arg(format!("--output={}", dex.display()))
        .arg_path(&classes);
    tracing::info!(classes = class_files.len(), "dexing project classes");
    ctx.run_tool(BuildStage::Dexer, &info)?;

    DependencyFile::write(&project.classes_dep_file(), &[dex], &class_files)
        .map_err(|e| BuildError::io(&project.classes_dep_file(), e))?;
    Ok(true)
}

/// Pre-dex every library jar and copy the results into `dexedLibs/`.
///
/// Returns the copied dex files ordered by jar path.
fn predex_libraries(ctx: &BuildContext<'_>) -> BuildResult<Vec<PathBuf>> {
    let project = ctx.project;
    let jars = project
        .library_jars()
        .map_err(|e| BuildError::io(&project.libs_dir(), e))?;
    let dexed_libs = project.dexed_libs_dir();
    create_dir(&dexed_libs)?;
    if jars.is_empty() {
        remove_stale(&dexed_libs, "dex", &HashSet::new())?;
        return Ok(Vec::new());
    }

    let revision = ctx.config.tools.build_tools_revision.clone();
    let mut executor: WaitableExecutor<(PathBuf, Arc<PreDexEntry>), BuildError> =
        WaitableExecutor::with_pool_and_parent(Arc::clone(ctx.pool), ctx.token);
    for jar in jars {
        let predex = Arc::clone(ctx.predex);
        let token = executor.token();
        let revision = revision.clone();
        executor
            .execute(move || {
                let entry = predex
                    .get(&jar, &revision, &token)?
                    .ok_or(BuildError::Cancelled)?;
                Ok((jar, entry))
            })
            .map_err(|_| BuildError::Cancelled)?;
    }

    let joined = executor
        .wait_for_tasks_with_quick_fail(true)
        .map_err(BuildError::from_task);
    // Keep whatever finished for the next build, even on failure
    if let Err(e) = ctx.predex.save_index() {
        tracing::warn!(error = %e, "failed to save pre-dex index");
    }
    let mut entries = joined?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut copies = Vec::with_capacity(entries.len());
    for (jar, entry) in &entries {
        let copy = dexed_libs.join(library_dex_name(jar, &entry.sha256));
        sync_file(&entry.dex, &copy)?;
        copies.push(copy);
    }
    let keep: HashSet<PathBuf> = copies.iter().cloned().collect();
    remove_stale(&dexed_libs, "dex", &keep)?;

    let stats = ctx.predex.stats();
    tracing::info!(
        libraries = copies.len(),
        hits = stats.hits,
        reused = stats.reused,
        dexed = stats.dexed,
        "libraries pre-dexed"
    );
    Ok(copies)
}

fn library_dex_name(jar: &Path, sha256: &str) -> String {
    let stem = jar
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "library".to_string());
    let short = &sha256[..sha256.len().min(12)];
    format!("{}-{}.dex", stem, short)
}

fn merge(ctx: &BuildContext<'_>, libraries: &[PathBuf]) -> BuildResult<bool> {
    let project = ctx.project;
    let merged = project.merged_dex();
    let mut inputs = vec![project.classes_dex()];
    inputs.extend(libraries.iter().cloned());

    let mut dep = DependencyFile::new(
        project.merge_dep_file(),
        vec![project.dexed_classes_dir(), project.dexed_libs_dir()],
    );
    dep.parse();
    if merged.is_file()
        && dep.input_files().len() == inputs.len()
        && is_up_to_date(&dep, &inputs)
    {
        tracing::debug!("merged dex up to date");
        return Ok(false);
    }

    create_dir(&project.merged_dir())?;
    remove_file_if_exists(&merged)?;

    if libraries.is_empty() {
        fs::copy(project.classes_dex(), &merged).map_err(|e| BuildError::io(&merged, e))?;
    } else {
        let merger = ctx.tool(&ctx.config.tools.dex_merger)?;
        let info = ProcessInfo::new(merger)
            .describe("dex-merger")
            .arg_path(&merged)
            .args(inputs.iter().map(|p| p.display().to_string()));
        tracing::info!(inputs = inputs.len(), "merging dex files");

        let result = ctx
            .runner
            .run(&info, ctx.token)
            .map_err(|e| BuildError::from_process(BuildStage::Dexer.name(), e))?;
        if !result.success() {
            let output = format!("{}\n{}", result.stdout(), result.stderr());
            let classes = find_collisions(&output);
            if !classes.is_empty() {
                return Err(BuildError::DexCollision { classes, output });
            }
            result
                .assert_normal_exit()
                .map_err(|e| BuildError::from_process(BuildStage::Dexer.name(), e))?;
        }
    }

    if !merged.is_file() {
        return Err(BuildError::Tool {
            stage: BuildStage::Dexer.name(),
            tool: "dex-merger".to_string(),
            detail: format!("no output written to {}", merged.display()),
        });
    }
    DependencyFile::write(&project.merge_dep_file(), &[merged], &inputs)
        .map_err(|e| BuildError::io(&project.merge_dep_file(), e))?;
    Ok(true)
}

/// Class descriptors reported as defined more than once.
pub fn find_collisions(output: &str) -> Vec<String> {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            Regex::new(r"Multiple dex files define (\S+)").expect("static pattern compiles"),
            Regex::new(r"(?:Type|Class) (\S+) is defined multiple times").expect("static pattern compiles"),
        ]
    });

    let mut classes = BTreeSet::new();
    for pattern in patterns {
        for captures in pattern.captures_iter(output) {
            if let Some(class) = captures.get(1) {
                classes.insert(class.as_str().to_string());
            }
        }
    }
    classes.into_iter().collect()
}

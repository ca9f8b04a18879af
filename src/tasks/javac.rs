//! Java compilation

use std::fs;
use std::path::{Path, PathBuf};

use apkforge_depfile::DependencyFile;
use apkforge_exec::ProcessInfo;

use super::{
    collect_files, create_dir, files_with_extension, glob_set, is_up_to_date, BuildContext,
    BuildStage, StageOutcome,
};
use crate::error::{BuildError, BuildResult};

const CLASSPATH_SEPARATOR: &str = if cfg!(windows) { ";" } else { ":" };

pub(super) fn run(ctx: &BuildContext<'_>) -> BuildResult<StageOutcome> {
    let project = ctx.project;
    let settings = &ctx.config.build;

    let roots = project.java_source_roots();
    let sources = collect_files(&roots, &glob_set(&settings.java_source_patterns)?)?;
    if sources.is_empty() {
        return Err(BuildError::MissingInput(format!(
            "no Java sources in {}",
            roots
                .iter()
                .map(|r| r.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    let jars = project.library_jars().map_err(|e| BuildError::io(&project.libs_dir(), e))?;
    let android_jar = ctx.android_jar()?;

    // Library jars count as project inputs so replacing one recompiles
    let mut dep_roots = roots;
    dep_roots.extend(project.jar_roots());
    let mut dep = DependencyFile::new(project.javac_dep_file(), dep_roots);
    dep.parse();

    let mut current: Vec<PathBuf> = sources.clone();
    current.extend(jars.iter().cloned());
    if is_up_to_date(&dep, &current) {
        tracing::info!(sources = sources.len(), "java classes up to date");
        return Ok(StageOutcome::UpToDate);
    }

    let javac = ctx.tool(&ctx.config.tools.javac)?;
    let classes = project.classes_dir();
    if classes.exists() {
        fs::remove_dir_all(&classes).map_err(|e| BuildError::io(&classes, e))?;
    }
    create_dir(&classes)?;

    let argfile = project.build_dir().join("javac-sources.txt");
    write_argfile(&argfile, &sources)?;

    let mut info = ProcessInfo::new(javac)
        .describe("javac")
        .args(["-encoding", "UTF-8", "-g"])
        .args(["-source", settings.java_source_level.as_str()])
        .args(["-target", settings.java_source_level.as_str()])
        .arg("-d")
        .arg_path(&classes)
        .arg("-bootclasspath")
        .arg_path(&android_jar);
    if !jars.is_empty() {
        let classpath = jars
            .iter()
            .map(|j| j.display().to_string())
            .collect::<Vec<_>>()
            .join(CLASSPATH_SEPARATOR);
        info = info.args(["-classpath".to_string(), classpath]);
    }
    info = info.arg(format!("@{}", argfile.display()));

    tracing::info!(sources = sources.len(), libraries = jars.len(), "compiling java sources");
    ctx.run_tool(BuildStage::JavaCompiler, &info)?;

    let outputs = files_with_extension(&classes, "class")?;
    if outputs.is_empty() {
        return Err(BuildError::Tool {
            stage: BuildStage::JavaCompiler.name(),
            tool: "javac".to_string(),
            detail: format!("no class files written to {}", classes.display()),
        });
    }

    let mut inputs = current;
    inputs.push(android_jar);
    DependencyFile::write(&project.javac_dep_file(), &outputs, &inputs)
        .map_err(|e| BuildError::io(&project.javac_dep_file(), e))?;

    Ok(StageOutcome::Ran)
}

/// One quoted source path per line, as javac reads `@file` arguments.
fn write_argfile(path: &Path, sources: &[PathBuf]) -> BuildResult<()> {
    let mut content = String::new();
    for source in sources {
        let escaped = source.display().to_string().replace('\\', "\\\\").replace('"', "\\\"");
        content.push('"');
        content.push_str(&escaped);
        content.push_str("\"\n");
    }
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, content).map_err(|e| BuildError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_argfile_quotes_paths() {
        let temp = TempDir::new().unwrap();
        let argfile = temp.path().join("args.txt");
        write_argfile(
            &argfile,
            &[PathBuf::from("/src/My App/Main.java"), PathBuf::from("/src/B.java")],
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(&argfile).unwrap(),
            "\"/src/My App/Main.java\"\n\"/src/B.java\"\n"
        );
    }
}

//! Makefile-style dependency files
//!
//! A dependency file records what one build step produced and what it read:
//!
//! ```text
//! build/classes/Main.class build/classes/R.class : \
//!     src/main/java/Main.java \
//!     build/generated/source/R.java \
//!     /opt/android/platforms/android-21/android.jar
//! ```
//!
//! Inputs under one of the configured source roots are project inputs; any
//! other input (platform jars, toolchain files) is an SDK input.
//!
//! [`DependencyFile::need_compilation`] is a timestamp heuristic: the step is
//! stale when the newest project input is newer than the oldest output. It
//! does not look at file contents, so touched-but-unchanged files still
//! trigger a rebuild.
//!
//! A missing, unreadable or malformed file never fails the build: it parses
//! to empty lists, which reads as "no previous build".

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

/// Errors from the dependency file syntax.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DepFileError {
    #[error("no ':' separating outputs from inputs")]
    MissingSeparator,

    #[error("rule has no outputs")]
    NoOutputs,
}

/// What [`DependencyFile::parse`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// The file does not exist (first build).
    Missing,
    /// The file was read and parsed.
    Loaded,
    /// The file exists but could not be used; it is treated as missing.
    Discarded(String),
}

#[derive(Debug, Default)]
struct Dependencies {
    outputs: Vec<PathBuf>,
    inputs: Vec<PathBuf>,
    sdk_inputs: Vec<PathBuf>,
}

/// A dependency file, parsed on demand.
#[derive(Debug)]
pub struct DependencyFile {
    path: PathBuf,
    source_roots: Vec<PathBuf>,
    parsed: Option<Dependencies>,
}

impl DependencyFile {
    /// Describe the dependency file at `path`.
    ///
    /// `source_roots` decides which inputs belong to the project.
    pub fn new(path: impl Into<PathBuf>, source_roots: Vec<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source_roots,
            parsed: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed.is_some()
    }

    /// Read and parse the file.
    pub fn parse(&mut self) -> ParseStatus {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.parsed = Some(Dependencies::default());
                return ParseStatus::Missing;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "unreadable dependency file");
                self.parsed = Some(Dependencies::default());
                return ParseStatus::Discarded(e.to_string());
            }
        };

        if content.trim().is_empty() {
            self.parsed = Some(Dependencies::default());
            return ParseStatus::Missing;
        }

        match parse_rule(&content) {
            Ok((outputs, all_inputs)) => {
                let (inputs, sdk_inputs) = all_inputs
                    .into_iter()
                    .partition(|input| self.is_project_file(input));
                self.parsed = Some(Dependencies {
                    outputs,
                    inputs,
                    sdk_inputs,
                });
                ParseStatus::Loaded
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "malformed dependency file");
                self.parsed = Some(Dependencies::default());
                ParseStatus::Discarded(e.to_string())
            }
        }
    }

    /// Files produced by the step.
    pub fn output_files(&self) -> &[PathBuf] {
        &self.parsed("output_files").outputs
    }

    /// Project inputs (under a source root).
    pub fn input_files(&self) -> &[PathBuf] {
        &self.parsed("input_files").inputs
    }

    /// Inputs outside every source root.
    pub fn sdk_input_files(&self) -> &[PathBuf] {
        &self.parsed("sdk_input_files").sdk_inputs
    }

    /// True if `file` is a recorded input, project or SDK.
    pub fn has_input(&self, file: &Path) -> bool {
        let deps = self.parsed("has_input");
        deps.inputs.iter().any(|p| p == file) || deps.sdk_inputs.iter().any(|p| p == file)
    }

    /// True if `file` is a recorded output.
    pub fn has_output(&self, file: &Path) -> bool {
        self.parsed("has_output").outputs.iter().any(|p| p == file)
    }

    /// True when the step has to run again.
    ///
    /// Also true when nothing was recorded, or when any recorded output or
    /// project input no longer exists.
    pub fn need_compilation(&self) -> bool {
        let deps = self.parsed("need_compilation");
        if deps.outputs.is_empty() {
            return true;
        }

        let Some(earliest_output) = earliest_mtime(&deps.outputs) else {
            return true;
        };
        match latest_mtime(&deps.inputs) {
            Some(latest_input) => latest_input > earliest_output,
            None => !deps.inputs.is_empty(),
        }
    }

    /// Write a dependency file in the format [`parse`](Self::parse) reads.
    pub fn write(path: &Path, outputs: &[PathBuf], inputs: &[PathBuf]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, render_rule(outputs, inputs))
    }

    fn parsed(&self, accessor: &str) -> &Dependencies {
        match &self.parsed {
            Some(deps) => deps,
            None => panic!(
                "DependencyFile::{}() called before parse() on {}",
                accessor,
                self.path.display()
            ),
        }
    }

    fn is_project_file(&self, file: &Path) -> bool {
        file.ancestors()
            .skip(1)
            .any(|ancestor| self.source_roots.iter().any(|root| root == ancestor))
    }
}

/// Oldest modification time, `None` if any file is missing.
fn earliest_mtime(files: &[PathBuf]) -> Option<SystemTime> {
    let mut earliest: Option<SystemTime> = None;
    for file in files {
        let modified = mtime(file)?;
        earliest = Some(earliest.map_or(modified, |e| e.min(modified)));
    }
    earliest
}

/// Newest modification time, `None` if there are no files or any is missing.
fn latest_mtime(files: &[PathBuf]) -> Option<SystemTime> {
    let mut latest: Option<SystemTime> = None;
    for file in files {
        let modified = mtime(file)?;
        latest = Some(latest.map_or(modified, |l| l.max(modified)));
    }
    latest
}

fn mtime(file: &Path) -> Option<SystemTime> {
    fs::metadata(file).and_then(|m| m.modified()).ok()
}

/// Parse the first rule of a dependency file into (outputs, inputs).
pub fn parse_rule(content: &str) -> Result<(Vec<PathBuf>, Vec<PathBuf>), DepFileError> {
    let logical = first_logical_line(content);

    let mut outputs = Vec::new();
    let mut inputs = Vec::new();
    let mut seen_separator = false;
    let mut token = String::new();
    let mut chars = logical.chars().peekable();

    let mut flush = |token: &mut String, seen_separator: bool| {
        if token.is_empty() {
            return;
        }
        let path = PathBuf::from(std::mem::take(token));
        if seen_separator {
            inputs.push(path);
        } else {
            outputs.push(path);
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some(&next) if next == ' ' || next == '\\' || next == ':' || next == '#' => {
                    token.push(next);
                    chars.next();
                }
                _ => token.push('\\'),
            },
            ':' if !seen_separator
                && chars.peek().map_or(true, |next| next.is_whitespace()) =>
            {
                flush(&mut token, seen_separator);
                seen_separator = true;
            }
            c if c.is_whitespace() => flush(&mut token, seen_separator),
            c => token.push(c),
        }
    }
    flush(&mut token, seen_separator);
    drop(flush);

    if !seen_separator {
        return Err(DepFileError::MissingSeparator);
    }
    if outputs.is_empty() {
        return Err(DepFileError::NoOutputs);
    }
    Ok((outputs, inputs))
}

/// Join continuation lines and return the first non-empty rule.
fn first_logical_line(content: &str) -> String {
    let mut logical = String::new();
    for line in content.lines() {
        let line = line.trim_end();
        if logical.trim().is_empty() && (line.trim().is_empty() || line.trim_start().starts_with('#')) {
            logical.clear();
            continue;
        }
        match line.strip_suffix('\\') {
            // A trailing `\\` is an escaped backslash, not a continuation
            Some(rest) if !rest.ends_with('\\') => {
                logical.push_str(rest);
                logical.push(' ');
            }
            _ => {
                logical.push_str(line);
                break;
            }
        }
    }
    logical
}

fn render_rule(outputs: &[PathBuf], inputs: &[PathBuf]) -> String {
    let escape = |p: &PathBuf| {
        p.display()
            .to_string()
            .replace('\\', "\\\\")
            .replace(' ', "\\ ")
            .replace(':', "\\:")
    };
    let mut out = String::new();
    let outputs: Vec<String> = outputs.iter().map(escape).collect();
    out.push_str(&outputs.join(" \\\n"));
    out.push_str(" :");
    for input in inputs {
        out.push_str(" \\\n    ");
        out.push_str(&escape(input));
    }
    out.push('\n');
    out
}

//! Android project layout
//!
//! Every stage reads and writes fixed locations below the project directory:
//!
//! ```text
//! <root>/
//!   src/main/java/            Java sources (configurable)
//!   src/main/res/             resources
//!   src/main/assets/          raw assets
//!   src/main/AndroidManifest.xml
//!   libs/*.jar                library jars
//!   <library>/                each entry of `project.libraries`
//!     AndroidManifest.xml
//!     res/  assets/  classes.jar
//!   build/
//!     classes/                javac output
//!     generated/source/       R.java and friends, only rewritten when changed
//!     generated/r-staging/    aapt -J output
//!     dexedClasses/classes.dex
//!     dexedLibs/              pre-dexed library copies
//!     output/merged/classes.dex
//!     output/resources.ap_
//!     output/<name>-unsigned.apk
//!     output/<name>.apk
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::ProjectSettings;

/// An Android library the app depends on, laid out like an unpacked AAR.
///
/// Its resources are overlaid under the app's and it gets its own `R` class
/// with non-constant ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryProject {
    name: String,
    root: PathBuf,
}

impl LibraryProject {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "library".to_string());
        Self { name, root }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("AndroidManifest.xml")
    }

    pub fn res_dir(&self) -> PathBuf {
        self.root.join("res")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.root.join("assets")
    }

    pub fn classes_jar(&self) -> PathBuf {
        self.root.join("classes.jar")
    }
}

/// Immutable project layout shared by every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndroidProject {
    name: String,
    root: PathBuf,
    source_dirs: Vec<PathBuf>,
    build_dir: PathBuf,
    libraries: Vec<LibraryProject>,
}

impl AndroidProject {
    /// Describe the project rooted at `root`.
    ///
    /// `root` should be absolute; dependency files record absolute paths.
    pub fn new(root: impl Into<PathBuf>, settings: &ProjectSettings) -> Self {
        let root = root.into();
        let name = settings
            .name
            .clone()
            .or_else(|| {
                root.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "app".to_string());
        let source_dirs = settings.source_dirs.iter().map(|d| root.join(d)).collect();
        let build_dir = root.join(&settings.build_dir);
        let libraries = settings
            .libraries
            .iter()
            .map(|dir| LibraryProject::new(root.join(dir)))
            .collect();

        Self {
            name,
            root,
            source_dirs,
            build_dir,
            libraries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dirs(&self) -> &[PathBuf] {
        &self.source_dirs
    }

    /// Library projects in declaration order, which is also overlay priority.
    pub fn libraries(&self) -> &[LibraryProject] {
        &self.libraries
    }

    pub fn res_dir(&self) -> PathBuf {
        self.root.join("src/main/res")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.root.join("src/main/assets")
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("src/main/AndroidManifest.xml")
    }

    pub fn libs_dir(&self) -> PathBuf {
        self.root.join("libs")
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn classes_dir(&self) -> PathBuf {
        self.build_dir.join("classes")
    }

    pub fn gen_source_dir(&self) -> PathBuf {
        self.build_dir.join("generated/source")
    }

    pub fn r_staging_dir(&self) -> PathBuf {
        self.build_dir.join("generated/r-staging")
    }

    pub fn dexed_classes_dir(&self) -> PathBuf {
        self.build_dir.join("dexedClasses")
    }

    /// Project classes only.
    pub fn classes_dex(&self) -> PathBuf {
        self.dexed_classes_dir().join("classes.dex")
    }

    pub fn dexed_libs_dir(&self) -> PathBuf {
        self.build_dir.join("dexedLibs")
    }

    pub fn predex_store_dir(&self) -> PathBuf {
        self.build_dir.join("preDexCache")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.build_dir.join("output")
    }

    pub fn merged_dir(&self) -> PathBuf {
        self.output_dir().join("merged")
    }

    /// Project and library classes merged.
    pub fn merged_dex(&self) -> PathBuf {
        self.merged_dir().join("classes.dex")
    }

    pub fn resources_ap(&self) -> PathBuf {
        self.output_dir().join("resources.ap_")
    }

    pub fn unsigned_apk(&self) -> PathBuf {
        self.output_dir().join(format!("{}-unsigned.apk", self.name))
    }

    pub fn signed_apk(&self) -> PathBuf {
        self.output_dir().join(format!("{}.apk", self.name))
    }

    pub fn javac_dep_file(&self) -> PathBuf {
        self.build_dir.join("javac.d")
    }

    pub fn classes_dep_file(&self) -> PathBuf {
        self.build_dir.join("classes.d")
    }

    pub fn merge_dep_file(&self) -> PathBuf {
        self.build_dir.join("merge.d")
    }

    pub fn summary_file(&self) -> PathBuf {
        self.build_dir.join("build_summary.json")
    }

    /// Source directories plus the generated-source directory.
    pub fn java_source_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.source_dirs.clone();
        roots.push(self.gen_source_dir());
        roots
    }

    /// Library jars in `libs/` plus each library project's `classes.jar`,
    /// sorted by path.
    pub fn library_jars(&self) -> io::Result<Vec<PathBuf>> {
        let mut jars: Vec<PathBuf> = self
            .libraries
            .iter()
            .map(LibraryProject::classes_jar)
            .filter(|jar| jar.is_file())
            .collect();
        let libs = self.libs_dir();
        if libs.is_dir() {
            for entry in fs::read_dir(&libs)? {
                let path = entry?.path();
                if path.is_file() && path.extension().is_some_and(|ext| ext == "jar") {
                    jars.push(path);
                }
            }
        }
        jars.sort();
        Ok(jars)
    }

    /// Directories whose jars count as project inputs for dependency files.
    pub fn jar_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.libs_dir()];
        roots.extend(self.libraries.iter().map(|lib| lib.root.clone()));
        roots
    }

    /// Create every build output directory.
    pub fn ensure_build_dirs(&self) -> io::Result<()> {
        for dir in [
            self.classes_dir(),
            self.gen_source_dir(),
            self.r_staging_dir(),
            self.dexed_classes_dir(),
            self.dexed_libs_dir(),
            self.predex_store_dir(),
            self.merged_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Remove the build directory.
    pub fn clean(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.build_dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

//! apkforge - incremental Android build pipeline
//!
//! Compiles Java sources, dexes project and library classes, packages
//! resources and signs the resulting APK:
//!
//! ```text
//! Aapt -> JavaCompiler -> Dexer -> BuildApk -> SignApk
//! ```
//!
//! Every stage skips work whose inputs did not change, and library jars are
//! dexed once per content hash through a shared [`PreDexCache`].

pub mod builder;
pub mod config;
pub mod error;
pub mod logging;
pub mod predex;
pub mod project;
pub mod signing;
pub mod tasks;

pub use builder::{AndroidBuilder, BuildFailure, BuildLog, BuildReport, BuildRequest, StageReport};
pub use config::{BuildConfig, ConfigError};
pub use error::{BuildError, BuildResult, ExitCode};
pub use predex::{PreDexCache, PreDexEntry, PreDexKey, PreDexStats};
pub use project::{AndroidProject, LibraryProject};
pub use signing::{CertificateInfo, KeystoreError, KeystoreHelper, Secret, SigningConfig};
pub use tasks::{BuildContext, BuildStage, StageOutcome};

//! apkforge CLI
//!
//! Entry point for the `apkforge` command-line tool.

use std::path::{Path, PathBuf};
use std::process;

use apkforge::config::{BuildConfig, ConfigError};
use apkforge::logging::init_from_config;
use apkforge::signing::{
    default_debug_keystore, Secret, SigningConfig, DEBUG_KEY_ALIAS, DEBUG_PASSWORD,
};
use apkforge::{
    AndroidBuilder, AndroidProject, BuildError, BuildReport, BuildRequest, BuildStage, ExitCode,
    KeystoreError, KeystoreHelper, StageOutcome,
};
use apkforge_exec::{CancellationToken, ProcessRunner};
use clap::{Parser, Subcommand};
use serde_json::json;

/// Lines of tool output shown when a build fails
const FAILURE_LOG_TAIL: usize = 40;

#[derive(Parser)]
#[command(name = "apkforge")]
#[command(about = "Incremental Android build pipeline", version)]
struct Cli {
    /// Project directory
    #[arg(long, short = 'p', global = true, default_value = ".")]
    project: PathBuf,

    /// Config file (default: <project>/apkforge.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Debug logging and tool output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the APK
    Build {
        /// Sign with the [signing] section instead of the debug key
        #[arg(long)]
        release: bool,

        /// Only run these stages (aapt, java-compiler, dexer, build-apk, sign-apk)
        #[arg(long = "stage", value_delimiter = ',')]
        stages: Vec<BuildStage>,

        /// Worker threads for library dexing
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Per-tool timeout in seconds (0 = none)
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the build report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete the build directory
    Clean,

    /// Create the debug keystore
    DebugKeystore {
        /// Keystore path (default: ~/.android/debug.keystore)
        #[arg(long)]
        keystore: Option<PathBuf>,

        /// Replace an existing keystore
        #[arg(long)]
        force: bool,
    },

    /// Show the signing certificate
    CertInfo {
        /// Inspect the release key instead of the debug key
        #[arg(long)]
        release: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Build {
            release,
            stages,
            jobs,
            timeout,
            json,
        } => run_build(
            &cli.project,
            cli.config.as_deref(),
            cli.verbose,
            release,
            stages,
            jobs,
            timeout,
            json,
        ),
        Commands::Clean => run_clean(&cli.project, cli.config.as_deref(), cli.verbose),
        Commands::DebugKeystore { keystore, force } => {
            run_debug_keystore(&cli.project, cli.config.as_deref(), cli.verbose, keystore, force)
        }
        Commands::CertInfo { release, json } => {
            run_cert_info(&cli.project, cli.config.as_deref(), cli.verbose, release, json)
        }
    };
    process::exit(code);
}

/// CLI layer of the config; absent flags are null and keep lower layers.
fn cli_overrides(verbose: bool, jobs: Option<usize>, timeout: Option<u64>) -> serde_json::Value {
    json!({
        "build": {
            "verbose": if verbose { Some(true) } else { None },
            "parallelism": jobs,
            "process_timeout_seconds": timeout,
        }
    })
}

/// Resolve the project directory, load its layered config and start logging.
fn load_project(
    project_dir: &Path,
    config_path: Option<&Path>,
    overrides: serde_json::Value,
) -> Result<(AndroidProject, BuildConfig), i32> {
    let root = project_dir.canonicalize().map_err(|e| {
        eprintln!("Error: project directory {}: {}", project_dir.display(), e);
        ExitCode::Config.as_i32()
    })?;
    let config = BuildConfig::load(&root, config_path, overrides).map_err(|e| {
        eprintln!("Error loading config: {}", e);
        ExitCode::Config.as_i32()
    })?;
    init_from_config(&config);
    let project = AndroidProject::new(root, &config.project);
    Ok((project, config))
}

#[allow(clippy::too_many_arguments)]
fn run_build(
    project_dir: &Path,
    config_path: Option<&Path>,
    verbose: bool,
    release: bool,
    stages: Vec<BuildStage>,
    jobs: Option<usize>,
    timeout: Option<u64>,
    json: bool,
) -> i32 {
    let overrides = cli_overrides(verbose, jobs, timeout);
    let (project, config) = match load_project(project_dir, config_path, overrides) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };

    let builder = match AndroidBuilder::new(project, config) {
        Ok(builder) => builder,
        Err(e) => {
            eprintln!("Error: {}", e);
            return e.exit_code().as_i32();
        }
    };

    let token = builder.cancellation_token();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("Interrupted, stopping build...");
        token.cancel();
    }) {
        tracing::warn!(error = %e, "cannot install Ctrl-C handler");
    }

    let mut request = if stages.is_empty() {
        BuildRequest::default()
    } else {
        BuildRequest::stages(stages)
    };
    request.release = release;

    match builder.build(&request) {
        Ok(report) => {
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(out) => println!("{}", out),
                    Err(e) => {
                        eprintln!("Error serializing report: {}", e);
                        return ExitCode::Io.as_i32();
                    }
                }
            } else {
                print_report(&report);
            }
            ExitCode::Success.as_i32()
        }
        Err(failure) => {
            eprintln!("Error: {}", failure);
            let skip = failure.log.len().saturating_sub(FAILURE_LOG_TAIL);
            for line in &failure.log[skip..] {
                eprintln!("  {}", line);
            }
            if let BuildError::DexCollision { classes, .. } = &failure.error {
                eprintln!("Duplicate classes:");
                for class in classes {
                    eprintln!("  {}", class);
                }
            }
            failure.exit_code().as_i32()
        }
    }
}

fn print_report(report: &BuildReport) {
    println!("Build {} ({} ms)", report.build_id, report.duration_ms());
    for stage in &report.stages {
        let outcome = match stage.outcome {
            StageOutcome::Ran => "ran",
            StageOutcome::UpToDate => "up to date",
        };
        println!("  {:<14} {:<11} {:>6} ms", stage.stage.name(), outcome, stage.duration_ms);
    }
    println!(
        "Pre-dex: {} hit(s), {} reused, {} dexed",
        report.predex.hits, report.predex.reused, report.predex.dexed
    );
    if let Some(sha) = &report.merged_dex_sha256 {
        println!("classes.dex sha256: {}", sha);
    }
    if let Some(apk) = &report.signed_apk {
        println!("Signed APK: {}", apk.display());
    }
}

fn run_clean(project_dir: &Path, config_path: Option<&Path>, verbose: bool) -> i32 {
    let overrides = cli_overrides(verbose, None, None);
    let (project, _) = match load_project(project_dir, config_path, overrides) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    match project.clean() {
        Ok(()) => {
            println!("Removed {}", project.build_dir().display());
            ExitCode::Success.as_i32()
        }
        Err(e) => {
            eprintln!("Error removing {}: {}", project.build_dir().display(), e);
            ExitCode::Io.as_i32()
        }
    }
}

fn run_debug_keystore(
    project_dir: &Path,
    config_path: Option<&Path>,
    verbose: bool,
    keystore: Option<PathBuf>,
    force: bool,
) -> i32 {
    let overrides = cli_overrides(verbose, None, None);
    let (_, config) = match load_project(project_dir, config_path, overrides) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };
    let Some(path) = keystore.or_else(default_debug_keystore) else {
        eprintln!("Error: {}", KeystoreError::NoHomeDirectory);
        return ExitCode::Signing.as_i32();
    };

    if path.exists() {
        if !force {
            println!("Debug keystore already exists: {}", path.display());
            return ExitCode::Success.as_i32();
        }
        if let Err(e) = std::fs::remove_file(&path) {
            eprintln!("Error removing {}: {}", path.display(), e);
            return ExitCode::Io.as_i32();
        }
    }

    let result = KeystoreHelper::new(&config.tools.keytool, ProcessRunner::default()).and_then(
        |helper| {
            helper.create_debug_store(
                None,
                &path,
                &Secret::new(DEBUG_PASSWORD),
                &Secret::new(DEBUG_PASSWORD),
                DEBUG_KEY_ALIAS,
                &CancellationToken::new(),
            )
        },
    );
    match result {
        Ok(()) => {
            println!("Created {}", path.display());
            ExitCode::Success.as_i32()
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::Signing.as_i32()
        }
    }
}

fn run_cert_info(
    project_dir: &Path,
    config_path: Option<&Path>,
    verbose: bool,
    release: bool,
    json: bool,
) -> i32 {
    let overrides = cli_overrides(verbose, None, None);
    let (project, config) = match load_project(project_dir, config_path, overrides) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };

    let signing = if release {
        config
            .signing
            .as_ref()
            .ok_or(ConfigError::NoReleaseSigning)
            .and_then(|settings| settings.resolve(project.root()))
            .map_err(BuildError::from)
    } else {
        SigningConfig::debug().map_err(BuildError::from)
    };
    let signing = match signing {
        Ok(signing) => signing,
        Err(e) => {
            eprintln!("Error: {}", e);
            return e.exit_code().as_i32();
        }
    };

    let info = KeystoreHelper::new(&config.tools.keytool, ProcessRunner::default()).and_then(
        |helper| {
            helper.certificate_info(
                signing.store_type.as_deref(),
                &signing.store_file,
                &signing.store_password,
                &signing.key_alias,
                &CancellationToken::new(),
            )
        },
    );
    match info {
        Ok(info) if json => match serde_json::to_string_pretty(&info) {
            Ok(out) => {
                println!("{}", out);
                ExitCode::Success.as_i32()
            }
            Err(e) => {
                eprintln!("Error serializing certificate info: {}", e);
                ExitCode::Io.as_i32()
            }
        },
        Ok(info) => {
            println!("Keystore:    {}", signing.store_file.display());
            println!("Alias:       {}", info.alias);
            println!("Owner:       {}", info.owner);
            if let Some(issuer) = &info.issuer {
                println!("Issuer:      {}", issuer);
            }
            if let Some(sha) = &info.sha256 {
                println!("SHA-256:     {}", sha);
            }
            if let (Some(from), Some(until)) = (&info.valid_from, &info.valid_until) {
                println!("Valid:       {} until {}", from, until);
            }
            ExitCode::Success.as_i32()
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::Signing.as_i32()
        }
    }
}

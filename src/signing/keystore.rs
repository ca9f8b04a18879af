//! keytool wrapper
//!
//! Creates the debug keystore and reads certificate details from a store,
//! classifying keytool's failure output into typed errors.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use apkforge_exec::{CancellationToken, ProcessError, ProcessInfo, ProcessRunner};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Secret, DEBUG_DNAME};

/// Environment variable carrying the store password to keytool.
const STORE_PASS_ENV: &str = "APKFORGE_STORE_PASS";

/// Environment variable carrying the key password to keytool.
const KEY_PASS_ENV: &str = "APKFORGE_KEY_PASS";

const KEY_ALGORITHM: &str = "RSA";
const KEY_SIZE: u32 = 2048;

/// 30 years
const DEBUG_VALIDITY_DAYS: u32 = 30 * 365;

/// Keystore errors
#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("keytool not found ({tool}): {reason}")]
    ToolNotFound { tool: String, reason: String },

    #[error("{} failed: {command}\n{stderr}", .tool.display())]
    ToolFailed {
        tool: PathBuf,
        /// Command line with secrets masked
        command: String,
        stderr: String,
    },

    #[error("keystore not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("keystore {} could not be opened: wrong password or corrupt file", .0.display())]
    WrongPassword(PathBuf),

    #[error("alias '{alias}' not found in {}", .store.display())]
    AliasNotFound { alias: String, store: PathBuf },

    #[error("keystore already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("no certificate found in keytool output")]
    UnrecognizedOutput,

    #[error("cannot locate the home directory for the debug keystore")]
    NoHomeDirectory,

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl KeystoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, KeystoreError::Process(e) if e.is_cancelled())
    }
}

/// Certificate details reported by `keytool -list -v`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub alias: String,
    pub owner: String,
    pub issuer: Option<String>,
    pub sha256: Option<String>,
    pub valid_from: Option<String>,
    pub valid_until: Option<String>,
}

/// Runs keytool.
#[derive(Clone)]
pub struct KeystoreHelper {
    keytool: PathBuf,
    runner: ProcessRunner,
}

impl KeystoreHelper {
    /// Resolve `configured` (a path or a name on `PATH`).
    pub fn new(configured: &Path, runner: ProcessRunner) -> Result<Self, KeystoreError> {
        let keytool = which::which(configured).map_err(|e| KeystoreError::ToolNotFound {
            tool: configured.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { keytool, runner })
    }

    pub fn keytool(&self) -> &Path {
        &self.keytool
    }

    /// Generate a self-signed debug key in a new store at `path`.
    pub fn create_debug_store(
        &self,
        store_type: Option<&str>,
        path: &Path,
        store_password: &Secret,
        key_password: &Secret,
        alias: &str,
        token: &CancellationToken,
    ) -> Result<(), KeystoreError> {
        if path.exists() {
            return Err(KeystoreError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| KeystoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut info = ProcessInfo::new(&self.keytool)
            .describe("keytool")
            .args(["-genkeypair", "-alias", alias, "-keyalg", KEY_ALGORITHM])
            .args(["-keysize".to_string(), KEY_SIZE.to_string()])
            .args(["-validity".to_string(), DEBUG_VALIDITY_DAYS.to_string()])
            .args(["-dname", DEBUG_DNAME, "-keystore"])
            .arg_path(path);
        if let Some(store_type) = store_type {
            info = info.args(["-storetype", store_type]);
        }
        info = with_passwords(info, store_password, Some(key_password));

        tracing::info!(keystore = %path.display(), alias, "creating debug keystore");
        self.run_keytool(&info, path, alias, token)?;
        Ok(())
    }

    /// Read the certificate stored under `alias`.
    pub fn certificate_info(
        &self,
        store_type: Option<&str>,
        path: &Path,
        store_password: &Secret,
        alias: &str,
        token: &CancellationToken,
    ) -> Result<CertificateInfo, KeystoreError> {
        if !path.is_file() {
            return Err(KeystoreError::FileNotFound(path.to_path_buf()));
        }

        let mut info = ProcessInfo::new(&self.keytool)
            .describe("keytool")
            .args(["-list", "-v", "-alias", alias, "-keystore"])
            .arg_path(path);
        if let Some(store_type) = store_type {
            info = info.args(["-storetype", store_type]);
        }
        info = with_passwords(info, store_password, None);

        let output = self.run_keytool(&info, path, alias, token)?;
        parse_certificate(&output, alias).ok_or(KeystoreError::UnrecognizedOutput)
    }

    /// Run keytool and return its stdout, classifying failures.
    fn run_keytool(
        &self,
        info: &ProcessInfo,
        path: &Path,
        alias: &str,
        token: &CancellationToken,
    ) -> Result<String, KeystoreError> {
        let result = self.runner.run(info, token)?;
        if result.success() {
            return Ok(result.stdout().to_string());
        }

        // keytool prints its errors on stdout
        let combined = format!("{}\n{}", result.stdout(), result.stderr());
        Err(classify_failure(&combined, path, alias).unwrap_or_else(|| {
            KeystoreError::ToolFailed {
                tool: self.keytool.clone(),
                command: info.command_line(),
                stderr: combined.trim().to_string(),
            }
        }))
    }
}

fn with_passwords(info: ProcessInfo, store: &Secret, key: Option<&Secret>) -> ProcessInfo {
    let info = info
        .args(["-storepass:env", STORE_PASS_ENV])
        .env(STORE_PASS_ENV, store.expose());
    match key {
        Some(key) => info
            .args(["-keypass:env", KEY_PASS_ENV])
            .env(KEY_PASS_ENV, key.expose()),
        None => info,
    }
}

/// Map well-known keytool messages to typed errors.
pub(crate) fn classify_failure(output: &str, path: &Path, alias: &str) -> Option<KeystoreError> {
    let lower = output.to_ascii_lowercase();
    if lower.contains("keystore file does not exist") {
        Some(KeystoreError::FileNotFound(path.to_path_buf()))
    } else if lower.contains("password was incorrect")
        || lower.contains("tampered with")
        || lower.contains("invalid keystore format")
        || lower.contains("unrecognized keystore format")
    {
        Some(KeystoreError::WrongPassword(path.to_path_buf()))
    } else if lower.contains("does not exist") {
        Some(KeystoreError::AliasNotFound {
            alias: alias.to_string(),
            store: path.to_path_buf(),
        })
    } else {
        None
    }
}

fn field_regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

/// Extract certificate fields from `keytool -list -v` output.
pub(crate) fn parse_certificate(output: &str, alias: &str) -> Option<CertificateInfo> {
    static OWNER: OnceLock<Regex> = OnceLock::new();
    static ISSUER: OnceLock<Regex> = OnceLock::new();
    static SHA256: OnceLock<Regex> = OnceLock::new();
    static VALIDITY: OnceLock<Regex> = OnceLock::new();

    let capture = |re: &Regex, group: usize| {
        re.captures(output)
            .and_then(|c| c.get(group))
            .map(|m| m.as_str().trim().to_string())
    };

    let owner = capture(field_regex(&OWNER, r"(?m)^\s*Owner:\s*(.+)$"), 1)?;
    let issuer = capture(field_regex(&ISSUER, r"(?m)^\s*Issuer:\s*(.+)$"), 1);
    let sha256 = capture(
        field_regex(&SHA256, r"(?m)^\s*SHA-?256:\s*([0-9A-Fa-f:]+)\s*$"),
        1,
    );
    let validity = field_regex(&VALIDITY, r"(?m)^\s*Valid from:\s*(.+?)\s+until:\s*(.+)$");

    Some(CertificateInfo {
        alias: alias.to_string(),
        owner,
        issuer,
        sha256,
        valid_from: capture(validity, 1),
        valid_until: capture(validity, 2),
    })
}

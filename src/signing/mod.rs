//! Signing configuration and keystore handling
//!
//! Passwords live in [`Secret`] and only reach external tools through
//! environment variables, never through arguments or logs.

mod keystore;

use std::fmt;
use std::path::PathBuf;

pub use keystore::{CertificateInfo, KeystoreError, KeystoreHelper};

/// Debug key alias used by the Android tooling.
pub const DEBUG_KEY_ALIAS: &str = "AndroidDebugKey";

/// Password of the debug keystore and its key.
pub const DEBUG_PASSWORD: &str = "android";

/// Distinguished name of generated debug certificates.
pub const DEBUG_DNAME: &str = "CN=Android Debug,O=Android,C=US";

/// A password or other value that must not be printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, for handing to a child process environment.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", apkforge_exec::REDACTED)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(apkforge_exec::REDACTED)
    }
}

/// Key material used to sign an APK.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub store_file: PathBuf,
    /// `JKS`, `PKCS12`, or `None` for the keytool default
    pub store_type: Option<String>,
    pub key_alias: String,
    pub store_password: Secret,
    pub key_password: Secret,
    /// Debug stores are created on demand
    pub debug: bool,
}

impl SigningConfig {
    /// The debug config for a keystore at `store_file`.
    pub fn debug_at(store_file: impl Into<PathBuf>) -> Self {
        Self {
            store_file: store_file.into(),
            store_type: None,
            key_alias: DEBUG_KEY_ALIAS.to_string(),
            store_password: Secret::new(DEBUG_PASSWORD),
            key_password: Secret::new(DEBUG_PASSWORD),
            debug: true,
        }
    }

    /// The debug config for `~/.android/debug.keystore`.
    pub fn debug() -> Result<Self, KeystoreError> {
        default_debug_keystore()
            .map(Self::debug_at)
            .ok_or(KeystoreError::NoHomeDirectory)
    }
}

/// `$HOME/.android/debug.keystore`
pub fn default_debug_keystore() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(|home| PathBuf::from(home).join(".android").join("debug.keystore"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_never_printed() {
        let secret = Secret::new("hunter2");
        assert_eq!(secret.to_string(), apkforge_exec::REDACTED);
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_signing_config_debug_output_redacted() {
        let config = SigningConfig::debug_at("/tmp/debug.keystore");
        let printed = format!("{:?}", config);
        assert!(!printed.contains(DEBUG_PASSWORD));
        assert!(printed.contains(DEBUG_KEY_ALIAS));
        assert!(config.debug);
    }
}

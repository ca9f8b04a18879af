//! Logging setup for the CLI
//!
//! Events go to stderr so stdout stays free for `--json` output. The level
//! comes from `build.verbose` after `--verbose` has been merged into the
//! config; `RUST_LOG` overrides both.

use std::io;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::BuildConfig;

/// Default filter directive for the given verbosity.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Filter directive selected by a resolved config.
pub fn config_directive(config: &BuildConfig) -> &'static str {
    default_directive(config.build.verbose)
}

/// Install the global subscriber at the config's verbosity.
pub fn init_from_config(config: &BuildConfig) {
    init_logging(config.build.verbose);
}

/// Install the global subscriber.
///
/// Calling this twice is harmless; the second call is ignored.
pub fn init_logging(verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}

//! `tracing` initialization. `--verbose` raises the default filter from
//! `error` to `debug`, mirroring the reference implementation's two-level
//! `logging.basicConfig` split.

use tracing_subscriber::EnvFilter;

pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "error" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

//! Shared setup helpers for the two binaries in this crate: the
//! `membrokerd` daemon and the `membroker` CLI tool.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing-subscriber` `fmt` layer. `RUST_LOG` always wins when
/// set; otherwise `-v`/`--verbose` raises the default level from `info` to
/// `debug` (§10's Logging section).
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

//! Logging setup for the command line binary

use tracing_subscriber::EnvFilter;

/// Install a stderr `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level follows the number of `-v`
/// flags: warn, info, debug, trace.
pub fn init(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("proxy_probe={default_level}")));

    // A second init (e.g. from tests) is harmless, so the error is ignored.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

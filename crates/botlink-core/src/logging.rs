//! Structured logging setup.
//!
//! Everything logs through `tracing` with structured fields (`account_id`,
//! `child`, `port`, `conn_id`). Child program output is re-emitted under the
//! [`CHILD_OUTPUT_TARGET`] target so it can be filtered independently, e.g.
//! `RUST_LOG=info,botlink::child=warn`.

use tracing_subscriber::EnvFilter;

/// Log target used for lines captured from child stdout/stderr.
pub const CHILD_OUTPUT_TARGET: &str = "botlink::child";

/// Initialize the global tracing subscriber.
///
/// Call once at startup; later calls are no-ops. `RUST_LOG` takes precedence
/// over `level` when set.
///
/// # Arguments
///
/// * `level` - Default filter directive (e.g. `"info"`).
/// * `json` - Emit newline-delimited JSON instead of compact text.
pub fn init_subscriber(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init();
    }
}

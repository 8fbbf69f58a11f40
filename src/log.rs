//! Log-level setup for the probe's own diagnostics.
//!
//! The probe logs through `tracing`. Hosts that already installed a
//! subscriber keep full control; otherwise the environment-driven
//! configuration can install a stderr subscriber at the level given by
//! `BLACKFIRE_LOG_LEVEL`. The value follows the Blackfire CLI convention
//! (1=error, 2=warn, 3=info, 4=debug) and also accepts any tracing filter
//! directive.

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "info";

/// Translate a configured level into a tracing filter directive. Numeric
/// values map per the CLI convention; anything else passes through as a
/// directive of its own.
pub fn filter_directive(level: &str) -> String {
    match level.trim() {
        "" => DEFAULT_DIRECTIVE,
        "1" => "error",
        "2" => "warn",
        "3" => "info",
        "4" => "debug",
        other => other,
    }
    .to_string()
}

/// Install a stderr fmt subscriber at the configured level.
///
/// Idempotent: if a global subscriber is already installed (by the host or
/// an earlier call) this is a no-op. An unparsable level falls back to the
/// default directive rather than failing configuration loading.
pub fn init(level: &str) {
    let directive = filter_directive(level);
    let filter = EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

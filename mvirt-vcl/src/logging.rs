//! Tracing setup for applications embedding the session layer.

use tracing_subscriber::EnvFilter;

use crate::config::VclConfig;

/// Default filter for a configured debug level.
pub fn default_directive(debug: u8) -> &'static str {
    match debug {
        0 => "mvirt_vcl=info",
        1 => "mvirt_vcl=debug",
        _ => "mvirt_vcl=trace",
    }
}

/// Install a fmt subscriber. `RUST_LOG` wins over the configured level.
///
/// Returns false if a global subscriber was already set.
pub fn init(config: &VclConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.debug)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

//! Bootstrap utilities for fiu binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the FIU_LOG environment variable.
///
/// Defaults to "info" level if FIU_LOG is not set. Output goes to stderr so it
/// never mixes with command output on stdout.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing, falling back to `default_filter` when FIU_LOG is unset.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_tracing_with_default(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        init_tracing();
        init_tracing_with_default("debug");
        tracing::info!("tracing initialized twice without panicking");
    }
}

//! Logging initialisation.

use super::config::LoggingConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber for the configured level.
///
/// `RUST_LOG` takes precedence over the configured level when set. Calling
/// this again once a subscriber is installed does nothing.
///
/// # Returns
///
/// `true` if this call installed the subscriber.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .try_init()
        .is_ok();
    if installed {
        debug!(level = %config.level, "logging initialised");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            ansi: false,
            ..Default::default()
        };
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}

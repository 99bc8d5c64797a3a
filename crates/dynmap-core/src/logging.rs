//! Tracing bootstrap for processes embedding the engine.

use crate::config::{defaults, env_vars};

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Setting `DYNMAP_LOG_JSON=true`
/// switches to JSON lines for container environments. Calling this twice is
/// harmless; the second installation is ignored.
pub fn init_logging(default_filter: Option<&str>) {
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let filter = default_filter.unwrap_or(defaults::LOG_FILTER);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let result = if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Subscriber for tests: writes through the test harness capture.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("dynmap=debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_ignored() {
        init_test_logging();
        init_logging(None);
        init_logging(Some("dynmap=trace"));
    }
}

//! Shared tracing/logging initialization.
//!
//! Every process embedding the broker sets up `tracing_subscriber` the same
//! way: an env-filter plus optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"burrow_broker=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialise tracing from the `log` section of the configuration.
///
/// The configured level applies to the `burrow_*` crates only; `RUST_LOG`
/// still wins when set.
pub fn init_from_config(log: &LogConfig) {
    init_tracing(&default_filter(&log.level), log.json);
}

fn default_filter(level: &str) -> String {
    ["burrow_core", "burrow_grpctool", "burrow_proto", "burrow_broker"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::default_filter;

    #[test]
    fn default_filter_covers_all_crates() {
        let filter = default_filter("debug");
        assert_eq!(
            filter,
            "burrow_core=debug,burrow_grpctool=debug,burrow_proto=debug,burrow_broker=debug"
        );
    }
}

//! Tracing/logging initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- filter used when `RUST_LOG` is not set
///   (e.g. `"xraymgr=info"`).
/// * `log_json` -- emit structured JSON lines instead of the human-readable
///   format.
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

/// Build the default filter directive for the given level, covering the
/// control-plane crates and keeping HTTP middleware noise at `warn`.
pub fn default_filter(level: &str) -> String {
    format!("xraymgr={level},xraymgr_core={level},tower_http=warn")
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_both_crates() {
        let filter = default_filter("debug");
        assert!(filter.contains("xraymgr=debug"));
        assert!(filter.contains("xraymgr_core=debug"));
        assert!(filter.contains("tower_http=warn"));
    }
}

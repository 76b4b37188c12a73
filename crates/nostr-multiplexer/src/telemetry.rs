//! Tracing subscriber setup.
//!
//! Environment variables:
//! - `RUST_LOG` - filter directive (default: "info")
//! - `LOG_FORMAT` - "json" or "pretty" (default: "pretty")

use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable terminal output
    #[default]
    Pretty,
}

impl LogFormat {
    /// Read `LOG_FORMAT`, falling back to pretty output.
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(name: &str, default_filter: &str) {
    // tungstenite logs through the `log` crate
    let _ = LogTracer::init();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let result = match LogFormat::from_env() {
        LogFormat::Json => {
            let subscriber = Registry::default().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Pretty => {
            let subscriber = Registry::default().with(env_filter).with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };

    if result.is_ok() {
        tracing::debug!(service = name, "telemetry initialized");
    }
}

/// Test-writer subscriber, enabled only when `TEST_LOG` is set.
pub fn init_test() {
    if std::env::var("TEST_LOG").is_err() {
        return;
    }

    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let subscriber = Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_test_writer());
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

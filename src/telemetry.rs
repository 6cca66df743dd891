//! Telemetry initialization (tracing/tracing-subscriber).
//!
//! - LOG_LEVEL: filter directives, e.g. "debug" or
//!   "info,variants=debug,sandbox=debug,oracle=info".
//! - LOG_FORMAT: "pretty" (default) or "json".
//!
//! Targets in use: `variants` (generation loop, repair), `verify`, `sandbox`,
//! `oracle`, `qvariant_backend` (startup, transport).

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str =
    "info,variants=debug,verify=info,sandbox=info,oracle=info,qvariant_backend=debug,tower_http=info,axum=info";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Unknown values fall back to pretty output.
    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let format = LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    // The two builders have different types.
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
    tracing::debug!(target: "qvariant_backend", ?format, "Tracing initialized");
}

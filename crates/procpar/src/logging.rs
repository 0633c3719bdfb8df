//! Tracing setup shared by orchestrator and worker processes.
//!
//! Output always goes to stderr: a worker's stdout carries its result line,
//! and workers inherit the parent's stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins if set. Otherwise `PROCPAR_LOG` picks the level
/// (debug, info, warn, error; default info). `LOG_FORMAT=json` switches
/// to JSON lines. Calling this twice is harmless.
pub fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .try_init();
}

fn filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = base_level(std::env::var("PROCPAR_LOG").ok().as_deref());
    EnvFilter::new(format!("procpar={level},procpar_demo={level}"))
}

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

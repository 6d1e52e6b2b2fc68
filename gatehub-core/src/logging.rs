use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    filter::{Directive, LevelFilter},
    fmt::{format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Dependencies that flood debug output; held at warn by the default filter
const NOISY_TARGETS: &[&str] = &["sqlx", "hyper", "tower_http", "tungstenite"];

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Output goes to stdout, or is
/// appended to `file_path` (without ANSI colours) when set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(level)?,
    };

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let layer = if config.format == "json" {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(writer)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_ansi(ansi)
            .with_file(false)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;
    Ok(())
}

fn default_filter(level: Level) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::new(LevelFilter::from_level(level).to_string());
    if level > Level::WARN {
        for target in NOISY_TARGETS {
            filter = filter.add_directive(format!("{target}=warn").parse::<Directive>()?);
        }
    }
    Ok(filter)
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(anyhow::anyhow!("Invalid log level: {other}")),
    }
}

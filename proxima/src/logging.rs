use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    tracing_subscriber::registry()
        .with(output_layer(config)?)
        .with(env_filter)
        .try_init()?;

    Ok(())
}

/// JSON or pretty output, to the configured file or stdout
fn output_layer(config: &LoggingConfig) -> anyhow::Result<Box<dyn Layer<Registry> + Send + Sync>> {
    let writer = match &config.file_path {
        Some(file_path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.format == "json" {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer)
            .boxed()
    };
    Ok(layer)
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

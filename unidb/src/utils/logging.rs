//! Logging utilities for unidb
//!
//! This module provides logging setup and configuration.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggerConfig;
use crate::error::{Error, Result};

/// Map a configured level name onto a tracing level; unknown names are INFO.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging based on configuration
///
/// A log file wins over stdout; with neither, nothing is installed.
pub fn init_logging(config: &LoggerConfig) -> Result<()> {
    let level = parse_level(&config.level);
    let directive = format!("unidb={}", level)
        .parse()
        .map_err(|e| Error::Logging(format!("invalid log directive: {}", e)))?;
    let env_filter = EnvFilter::from_default_env().add_directive(directive);

    let writer = match &config.file {
        Some(file_path) => {
            if let Some(parent) = Path::new(file_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            BoxMakeWriter::new(Arc::new(File::create(file_path)?))
        }
        None if config.stdout => BoxMakeWriter::new(std::io::stdout),
        None => return Ok(()),
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(config.file.is_none());

    let installed = if config.format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.map_err(|e| Error::Logging(e.to_string()))
}

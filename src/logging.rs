use anyhow::Result;
use std::fs::{self, File};
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the process-global tracing subscriber described by a stage's
/// logging configuration.
///
/// The subscriber carries up to two layers: a plain verbose layer writing to
/// `config.file` when a path is set, and a compact colored layer on stdout
/// when `config.stdout` is set. With neither, events are discarded. Both
/// layers follow `config.level` for this crate's targets. Fails if a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let directives = format!("{},troupe={}", config.level, config.level);

    let file_layer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let writer = Mutex::new(File::create(path)?);
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .with_line_number(true)
                    .with_filter(EnvFilter::builder().parse(&directives)?),
            )
        }
        None => None,
    };

    let stdout_layer = if config.stdout {
        Some(
            fmt::layer()
                .with_writer(std::io::stdout)
                .compact()
                .with_target(true)
                .with_filter(EnvFilter::builder().parse(&directives)?),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging already initialized: {}", e))
}

//! Logging configuration using tracing.

use crate::config::{LogConfig, LogFormat, LogOutput};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize logging from the `[log]` section, with an optional level override
pub fn init(config: &LogConfig, level_override: Option<&str>) -> anyhow::Result<()> {
    let level = level_override.unwrap_or(&config.level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = match config.output {
        LogOutput::Stdout => match config.format {
            LogFormat::Text => fmt::layer().boxed(),
            LogFormat::Json => fmt::layer().json().boxed(),
        },
        LogOutput::File => {
            // Append, like a long-lived backup.log next to the job
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.file)?;
            let writer = Mutex::new(file);
            match config.format {
                LogFormat::Text => fmt::layer().with_ansi(false).with_writer(writer).boxed(),
                LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
            }
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;

    Ok(())
}

//! Tracing subscriber setup

use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{PacsError, Result};

/// Initialize logging once for the process.
///
/// `RUST_LOG` takes precedence over `log_level`. Output always goes to stderr,
/// leaving stdout to command results; a second layer writes to
/// `log_file_path` when `log_to_file` is set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let file_appender = if config.log_to_file {
        let file = std::fs::File::create(&config.log_file_path)?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file)),
        )
    } else {
        None
    };

    let console_appender = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_appender)
        .with(console_appender)
        .try_init()
        .map_err(|e| PacsError::Task(format!("logging init: {}", e)))
}

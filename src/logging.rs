use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::error::{ExporterError, Result};
use crate::settings::LogFormat;

/// Parses a level name such as `INFO` or `debug`.
pub fn parse_level(level: &str) -> Result<Level> {
    Level::from_str(level.trim()).map_err(|_| ExporterError::Logging {
        reason: format!("unknown log level {level:?}"),
    })
}

/// Installs the global subscriber writing to stdout. `RUST_LOG` directives
/// take precedence over `level`.
pub fn init_logging(level: Level, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout);

    let installed = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.with_target(false).try_init(),
    };

    installed.map_err(|e| ExporterError::Logging {
        reason: e.to_string(),
    })
}

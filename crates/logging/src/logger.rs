//! Tracing subscriber setup

use once_cell::sync::OnceCell;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

use common::error::{Error, Result};
use pipeline_config::LoggingSettings;

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber
///
/// `RUST_LOG` takes precedence over `settings.level`. Calling this more than
/// once is a no-op, so tests and the binary can both call it.
pub fn init(settings: &LoggingSettings) -> Result<()> {
    INSTALLED
        .get_or_try_init(|| {
            let filter = EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&settings.level))
                .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", settings.level, e)))?;

            let installed = if settings.json {
                fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_target(true)
                    .try_init()
            } else {
                fmt().with_env_filter(filter).with_target(true).try_init()
            };

            // Another subscriber (e.g. a test harness) already owns the slot.
            if let Err(e) = installed {
                debug!("Tracing subscriber already installed: {}", e);
            }

            Ok(())
        })
        .map(|_| ())
}

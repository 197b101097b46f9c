//! Installation of the log subscriber.

use thiserror::Error;
use tracing_subscriber::FmtSubscriber;

use crate::settings::LoggingSettings;

#[derive(Debug, Error)]
#[error("failed to install the log subscriber: {0}")]
/// The global subscriber could not be installed, usually because one is already set.
pub struct LoggingError(String);

/// Installs a global formatting subscriber filtered by the logging settings.
///
/// # Errors
/// Fails if a global subscriber has already been installed.
pub fn init(settings: LoggingSettings) -> Result<(), LoggingError> {
    FmtSubscriber::builder()
        .with_env_filter(settings.filter)
        .with_ansi(true)
        .try_init()
        .map_err(|error| LoggingError(error.to_string()))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::EnvFilter;

    use super::*;

    #[test]
    fn test_init_once() {
        let settings = || LoggingSettings {
            filter: EnvFilter::new("silo_client=debug"),
        };
        // the test harness may already have set a subscriber in this process
        let _ = init(settings());
        assert!(init(settings()).is_err());
    }
}

//! Tracing subscriber setup.

use fso_core::LoggingSettings;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter: `RUST_LOG` wins over the configured directives.
pub fn env_filter(settings: &LoggingSettings) -> fso_core::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.filter)
            .map_err(|e| fso_core::Error::tracing_init_failed(format!("{}: {e}", settings.filter))),
    }
}

/// Install the global fmt subscriber.
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_tracing(settings: &LoggingSettings) -> fso_core::Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(settings)?)
        .with(tracing_subscriber::fmt::layer().with_ansi(settings.ansi))
        .try_init()
        .map_err(|e| fso_core::Error::tracing_init_failed(e.to_string()))
}

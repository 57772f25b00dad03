use crate::{
    error::{RebacError, Result},
    settings::LoggingSettings,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `settings.level` when set. Fails if a subscriber is
/// already installed.
pub fn init_tracing(settings: &LoggingSettings) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rebac_engine={}", settings.level).into());

    let installed = if settings.json {
        // Structured JSON logging for production
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_ansi(false).json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .try_init()
    };

    installed.map_err(|error| RebacError::Internal(anyhow::anyhow!("failed to install tracing subscriber: {error}")))
}

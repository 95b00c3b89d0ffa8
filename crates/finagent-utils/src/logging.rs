//! Logging and tracing utilities

use crate::config::Settings;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber with default configuration
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize tracing from [`Settings`]
///
/// `RUST_LOG` still takes precedence over `settings.log_level`.
pub fn init_tracing_with(settings: &Settings) -> anyhow::Result<()> {
    settings.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_ascii_lowercase()));
    let registry = tracing_subscriber::registry().with(filter);

    if settings.json_output() {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()?;
    }

    tracing::debug!(
        app = %settings.app_name,
        environment = %settings.environment,
        "Tracing initialized"
    );
    Ok(())
}

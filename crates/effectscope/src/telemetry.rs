//! Tracing setup
//!
//! The runtime only emits `tracing` events; installing a subscriber is up to
//! the application. [`init_tracing`] installs a formatted subscriber driven
//! by [`RuntimeConfig::log_filter`] for programs that have none of their own.

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use effectscope_error::{ConfigError, ConfigResult};

use crate::config::{RuntimeConfig, ENV_LOG};

static TEST_INIT: Once = Once::new();

//-----------------------------------------------------------------------------
// Subscriber Initialization
//-----------------------------------------------------------------------------

/// Install a global subscriber filtered by `config.log_filter`.
///
/// # Errors
///
/// Returns `ConfigError::Logging` if the filter does not parse or a global
/// subscriber is already installed.
pub fn init_tracing(config: &RuntimeConfig) -> ConfigResult<()> {
    let env_filter = filter(&config.log_filter)?;
    let subscriber = Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_level(true));
    tracing::subscriber::set_global_default(subscriber).map_err(|e| ConfigError::Logging(e.to_string()))?;
    tracing::debug!(filter = %config.log_filter, "tracing initialized");
    Ok(())
}

/// Install a global subscriber using the filter from `EFFECTSCOPE_LOG`,
/// falling back to the default filter when it is unset
pub fn init_tracing_from_env() -> ConfigResult<()> {
    let mut config = RuntimeConfig::default();
    if let Ok(directive) = std::env::var(ENV_LOG) {
        config.log_filter = directive;
    }
    init_tracing(&config)
}

/// Route runtime events to the test harness output.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    TEST_INIT.call_once(|| {
        let subscriber = Registry::default()
            .with(EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("debug")))
            .with(fmt::layer().with_test_writer());
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn filter(directive: &str) -> ConfigResult<EnvFilter> {
    EnvFilter::try_new(directive).map_err(|e| ConfigError::Logging(format!("{:?}: {}", directive, e)))
}

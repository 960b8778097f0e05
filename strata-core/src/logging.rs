//! Tracing subscriber setup for binaries and tests embedding strata.
//!
//! The library itself only emits `tracing` events; nothing is printed until
//! a host installs a subscriber, either its own or the one built here.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::GeneralConfig;
use crate::error::{Result, StrataError};

/// Build the filter: `RUST_LOG` if set, otherwise `config.log_level`.
///
/// # Errors
///
/// Returns [`StrataError::Config`] if the configured level is not a valid
/// filter directive.
pub fn env_filter(config: &GeneralConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.log_level)
        .map_err(|e| StrataError::Config(format!("invalid log level {:?}: {e}", config.log_level)))
}

/// Install a global subscriber, plain text or JSON lines.
///
/// Returns `Ok(false)` if a subscriber was already installed, so hosts and
/// test harnesses can call this more than once.
///
/// # Errors
///
/// Returns [`StrataError::Config`] if the log level does not parse.
pub fn init(config: &GeneralConfig) -> Result<bool> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json_logs {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    Ok(installed.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_level_is_config_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = GeneralConfig {
            log_level: "strata=[[".to_string(),
            json_logs: false,
        };
        assert!(matches!(env_filter(&config), Err(StrataError::Config(_))));
    }

    #[test]
    fn second_init_reports_existing_subscriber() {
        let config = GeneralConfig::default();
        let _ = init(&config);
        assert!(!init(&config).expect("valid level"));
    }
}

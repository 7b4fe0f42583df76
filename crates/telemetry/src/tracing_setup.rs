//! Process-wide log subscriber.
//!
//! The filter comes from `RUST_LOG` (default `info`) and the output shape from
//! `LOG_FORMAT` (`pretty` or `json`). JSON lines carry thread ids and source
//! locations so they can be joined against worker and scheduler events.

use std::str::FromStr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LogSettings {
    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("RUST_LOG").ok(),
            std::env::var("LOG_FORMAT").ok(),
        )
    }

    fn from_vars(filter: Option<String>, format: Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            filter: filter
                .filter(|f| !f.trim().is_empty())
                .unwrap_or(defaults.filter),
            format: format
                .and_then(|f| f.parse().ok())
                .unwrap_or(defaults.format),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install the global subscriber. `false` if one was already set.
pub fn init_tracing(settings: &LogSettings) -> bool {
    let registry = tracing_subscriber::registry().with(settings.env_filter());
    let installed = match settings.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer()).try_init(),
    }
    .is_ok();

    if installed {
        tracing::info!(filter = %settings.filter, format = ?settings.format, "Logging ready");
    }
    installed
}

pub fn init_tracing_from_env() -> bool {
    init_tracing(&LogSettings::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_settings_fall_back_to_defaults() {
        let settings = LogSettings::from_vars(None, Some("yaml".into()));
        assert_eq!(settings.filter, "info");
        assert_eq!(settings.format, LogFormat::Pretty);

        let settings = LogSettings::from_vars(Some("worker=debug".into()), Some("json".into()));
        assert_eq!(settings.filter, "worker=debug");
        assert_eq!(settings.format, LogFormat::Json);
    }
}

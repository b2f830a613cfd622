//! Structured logging configuration.

use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parses a format name, defaulting to pretty output.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Logging configuration.
#[derive(Debug)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Level filter.
    pub filter: EnvFilter,
    /// Optional file to append logs to instead of stderr.
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Builds logging configuration from the environment.
    ///
    /// The filter comes from `KVBRIDGE_LOG`, then `RUST_LOG`, then falls back
    /// to `info` (`debug` when `verbose`). `KVBRIDGE_LOG_FORMAT` selects the
    /// format and `KVBRIDGE_LOG_FILE` redirects output to a file.
    #[must_use]
    pub fn from_env(verbose: bool) -> Self {
        let default_level = if verbose { "debug" } else { "info" };
        let directives = env_value("KVBRIDGE_LOG")
            .or_else(|| env_value("RUST_LOG"))
            .unwrap_or_else(|| default_level.to_string());
        let filter =
            EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(default_level));

        Self {
            format: env_value("KVBRIDGE_LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
            filter,
            file: env_value("KVBRIDGE_LOG_FILE").map(PathBuf::from),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Pretty);
    }
}

//! Application configuration loading and validation.
//!
//! The top-level `Config` aggregates logging, fan-out collector, and
//! distribution settings. It is read from a TOML file once at startup,
//! validated, and treated as immutable afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{collector::CollectorConfig, distribution::DistributionConfig, logger::LoggerConfig};

pub mod collector;
pub mod distribution;
pub mod logger;

/// Environment variable pointing at the configuration file.
pub const CONFIG_ENV: &str = "CLUSTERSCOPE_CONFIG";

/// Location probed when `CLUSTERSCOPE_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/clusterscope/config.toml";

/// Timestamped, styled console output for use before the tracing subscriber
/// is installed. Written to stderr so stdout carries only reports.
#[macro_export]
macro_rules! print_at_level {
    ($label:expr, $($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style(
                time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default()
            ).dim(),
            $label,
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        $crate::print_at_level!(console::style("INFO").green(), $($arg)*)
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        $crate::print_at_level!(console::style("WARN").yellow(), $($arg)*)
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        $crate::print_at_level!(console::style("ERROR").red(), $($arg)*)
    };
}

/// Errors raised while locating, reading, parsing, or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub collector: CollectorConfig,

    #[validate(nested)]
    pub distribution: DistributionConfig,
}

impl Config {
    /// Locates and loads the configuration.
    ///
    /// Priority:
    /// 1. `CLUSTERSCOPE_CONFIG` environment variable (must exist)
    /// 2. `/etc/clusterscope/config.toml`
    /// 3. Built-in defaults
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a chosen file cannot be read, parsed, or validated.
    pub fn new() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) => Self::load(&path),
            None => {
                print_warn!("No configuration file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Some(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        fallback.exists().then(|| fallback.to_path_buf())
    }

    /// Loads and validates configuration from `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let config = Self::parse(&fs::read_to_string(path)?)?;
        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration from TOML text.
    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.collector.concurrency, 32);
        assert_eq!(config.distribution.buffer_size, 64 * 1024);
        assert_eq!(config.logger.level, "info");
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::parse(
            r#"
            [logger]
            level = "debug"

            [collector]
            concurrency = 4
            fetch_timeout_ms = 1500
            raw = true

            [distribution]
            buffer_size = 512
            group_by = "detail.command"
            rate_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.collector.concurrency, 4);
        assert!(config.collector.raw);
        assert_eq!(config.distribution.buffer_size, 512);
        assert_eq!(config.distribution.group_by, "detail.command");
        assert_eq!(config.distribution.rate_secs, 10);
    }

    #[test]
    fn invalid_values_fail_validation() {
        let err = Config::parse("[collector]\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = Config::parse("[distribution]\nbuffer_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let err = Config::parse("[logger]\nlevel = \"loud\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = Config::parse("[collector\nconcurrency = 4").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[collector]\nconcurrency = 9").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.collector.concurrency, 9);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::load(Path::new("/nonexistent/clusterscope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}

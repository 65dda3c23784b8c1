//! Application configuration loading and validation.
//!
//! The configuration file is a JSON object with a required `plugins` map and
//! optional `logger` and `server` sections. Plugin entries keep their file
//! order, which is also the order plugins are constructed and collected in.
//!
//! The configuration is loaded once at startup and is immutable thereafter.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use self::{logger::LoggerConfig, server::ServerConfig};

pub mod logger;
pub mod server;

/// Current UTC time in the format used by the `print_*` macros.
#[doc(hidden)]
pub fn timestamp() -> String {
    time::format_description::parse(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z",
    )
    .ok()
    .and_then(|format| time::OffsetDateTime::now_utc().format(&format).ok())
    .unwrap_or_default()
}

/// Simple macros for printing timestamped messages before the tracing subscriber
/// is initialized. These are used during early configuration loading.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors that can occur during configuration loading, parsing or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// IO error while accessing configuration files.
    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// The file is not valid JSON or does not match the expected shape.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Validation failure after successful parsing.
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    /// The listen address is not `[host]:port`.
    #[error("Invalid bind address '{0}'")]
    InvalidBind(String),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone)]
pub struct Config {
    /// Plugin name to plugin configuration object, in file order.
    pub plugins: Map<String, Value>,

    #[serde(default)]
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,
}

impl Config {
    /// Loads and validates configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing, and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let config = Self::from_json(&fs::read_to_string(path)?)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates a JSON document.
    pub fn from_json(content: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

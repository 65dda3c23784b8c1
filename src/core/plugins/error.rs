use std::fmt;

use thiserror::Error;

use crate::core::metrics::MetricError;

/// Error type shared by every plugin.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Failed to read a file from disk.
    #[error("Failed to read file {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A value could not be parsed from a data source.
    #[error("Failed to parse {metric} from {location}: {reason}")]
    ParseError {
        metric: String,
        location: String,
        reason: String,
    },

    /// Data was found but did not conform to the expected layout.
    #[error("Invalid format in {location}: {reason}")]
    InvalidFormat { location: String, reason: String },

    /// The plugin's configuration object was rejected.
    #[error("Invalid configuration for plugin '{plugin}': {reason}")]
    InvalidConfig { plugin: String, reason: String },

    /// A low-level system call failed.
    #[error("System call failed: {syscall} - {reason}")]
    SystemCall { syscall: String, reason: String },

    /// Declaring or writing a metric failed.
    #[error(transparent)]
    Metric(#[from] MetricError),

    /// I/O error talking to a device or a child process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end answered but not with the expected acknowledgement.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No factory is registered under this name.
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// Catch-all for failures that fit nowhere else.
    #[error("Other error: {0}")]
    Other(String),
}

impl PluginError {
    /// Shorthand for `InvalidConfig` built from any displayable reason.
    pub fn config(plugin: &str, reason: impl fmt::Display) -> Self {
        PluginError::InvalidConfig {
            plugin: plugin.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for `FileRead`.
    pub fn file_read(path: impl fmt::Display, source: std::io::Error) -> Self {
        PluginError::FileRead {
            path: path.to_string(),
            source,
        }
    }
}

/// Lifecycle stage in which a plugin failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Construction; the plugin is skipped.
    Init,
    /// Launching background tasks; collection keeps working.
    UpdateStart,
    /// A single pull-style collection pass.
    Collect,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Init => write!(f, "initialisation"),
            Stage::UpdateStart => write!(f, "starting update"),
            Stage::Collect => write!(f, "collecting"),
        }
    }
}

/// A plugin failure tagged with the plugin's name and the stage it happened in.
#[derive(Error, Debug)]
#[error("Plugin '{plugin}' failed while {stage}: {source}")]
pub struct PluginFailure {
    pub plugin: String,
    pub stage: Stage,
    #[source]
    pub source: PluginError,
}

/// Result alias used throughout the plugin system.
pub type PluginResult<T> = std::result::Result<T, PluginError>;

//! Helpers shared by the built-in plugins.

use std::{path::Path, str::FromStr};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use validator::Validate;

use crate::core::plugins::{PluginError, PluginResult};

/// Deserializes and validates a plugin's configuration object.
///
/// A missing (`null`) configuration is treated as an empty object so that
/// plugins with only defaulted fields can be enabled with `{}` or `null`.
pub fn parse_config<T>(plugin: &str, config: &Value) -> PluginResult<T>
where
    T: DeserializeOwned + Validate,
{
    let value = match config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    let parsed: T = serde_json::from_value(value).map_err(|e| PluginError::config(plugin, e))?;
    parsed
        .validate()
        .map_err(|e| PluginError::config(plugin, e))?;
    Ok(parsed)
}

/// Reads a whole text file, mapping failures to `PluginError::FileRead`.
pub async fn read_file(path: &Path) -> PluginResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PluginError::file_read(path.display(), source))
}

/// Parses one whitespace-separated field.
pub fn parse_field<T: FromStr>(metric: &str, location: &Path, raw: &str) -> PluginResult<T> {
    raw.trim().parse::<T>().map_err(|_| PluginError::ParseError {
        metric: metric.to_string(),
        location: location.display().to_string(),
        reason: format!("invalid value: {}", raw),
    })
}

/// A regular expression matched at the start of the subject.
///
/// An empty pattern matches nothing, so an unset `exclude` option keeps
/// everything.
#[derive(Debug, Clone, Default)]
pub struct Pattern(Option<Regex>);

impl Pattern {
    pub fn new(plugin: &str, pattern: &str) -> PluginResult<Self> {
        if pattern.is_empty() {
            return Ok(Pattern(None));
        }
        Regex::new(pattern)
            .map(|re| Pattern(Some(re)))
            .map_err(|e| PluginError::config(plugin, e))
    }

    pub fn matches(&self, subject: &str) -> bool {
        match &self.0 {
            Some(re) => re.find(subject).is_some_and(|m| m.start() == 0),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize, Validate)]
    struct Sample {
        #[serde(default = "default_interval")]
        #[validate(range(min = 1))]
        interval: u64,
    }

    fn default_interval() -> u64 {
        5
    }

    #[test]
    fn null_config_uses_defaults() {
        let sample: Sample = parse_config("sample", &Value::Null).unwrap();
        assert_eq!(sample.interval, 5);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = parse_config::<Sample>("sample", &json!({"interval": 0})).unwrap_err();
        assert!(matches!(err, PluginError::InvalidConfig { ref plugin, .. } if plugin == "sample"));

        let err = parse_config::<Sample>("sample", &json!({"interval": "soon"})).unwrap_err();
        assert!(matches!(err, PluginError::InvalidConfig { .. }));
    }

    #[test]
    fn pattern_is_anchored_at_start() {
        let pattern = Pattern::new("t", "eth").unwrap();
        assert!(pattern.matches("eth0"));
        assert!(!pattern.matches("veth0"));

        let alternatives = Pattern::new("t", "/(proc|sys)").unwrap();
        assert!(alternatives.matches("/proc"));
        assert!(alternatives.matches("/sys/fs/cgroup"));
        assert!(!alternatives.matches("/home"));
    }

    #[test]
    fn empty_pattern_matches_nothing() {
        let pattern = Pattern::new("t", "").unwrap();
        assert!(!pattern.matches(""));
        assert!(!pattern.matches("lo"));
        assert!(Pattern::new("t", "(").is_err());
    }
}

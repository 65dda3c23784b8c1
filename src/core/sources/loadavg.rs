use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;
use serde_json::Value;
use validator::Validate;

use super::common::{parse_config, parse_field, read_file};
use crate::{
    core::{
        metrics::{Metric, MetricDesc, Registry},
        plugins::{Collect, Construct, Plugin, PluginError, PluginResult, NAMESPACE},
    },
    register_plugin,
};

const SUBSYSTEM: &str = "loadavg";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LoadAvgConfig {
    /// Source file, `/proc/loadavg` unless overridden.
    #[serde(default = "default_path")]
    pub path: PathBuf,
}

fn default_path() -> PathBuf {
    PathBuf::from("/proc/loadavg")
}

/// Parsed content of `/proc/loadavg`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadAverage {
    pub one_minute: f64,
    pub five_minutes: f64,
    pub fifteen_minutes: f64,
    /// Currently runnable kernel scheduling entities.
    pub runnable: u32,
    /// Kernel scheduling entities that exist on the system.
    pub exist: u32,
}

/// Parses a line such as `"1.23 1.45 1.67 1/234 12345"`.
pub fn parse_loadavg(content: &str, location: &std::path::Path) -> PluginResult<LoadAverage> {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 4 {
        return Err(PluginError::InvalidFormat {
            location: location.display().to_string(),
            reason: "Expected at least 4 fields".to_string(),
        });
    }

    let (runnable, exist) = parts[3]
        .split_once('/')
        .ok_or_else(|| PluginError::InvalidFormat {
            location: location.display().to_string(),
            reason: "process field must be in format 'runnable/exist'".to_string(),
        })?;

    Ok(LoadAverage {
        one_minute: parse_field("load1", location, parts[0])?,
        five_minutes: parse_field("load5", location, parts[1])?,
        fifteen_minutes: parse_field("load15", location, parts[2])?,
        runnable: parse_field("runnable", location, runnable)?,
        exist: parse_field("exist", location, exist)?,
    })
}

/// System load averages and scheduling entity counts.
pub struct LoadAvg {
    config: LoadAvgConfig,
    load1: Metric,
    load5: Metric,
    load15: Metric,
    runnable: Metric,
    exist: Metric,
}

impl Plugin for LoadAvg {
    fn name(&self) -> &'static str {
        "loadavg"
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        Some(self)
    }
}

impl Construct for LoadAvg {
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
        let config: LoadAvgConfig = parse_config("loadavg", config)?;
        let gauge = |name: &str, help: &str| {
            registry.declare(
                MetricDesc::gauge(name, help)
                    .namespace(NAMESPACE)
                    .subsystem(SUBSYSTEM),
            )
        };

        Ok(LoadAvg {
            config,
            load1: gauge("load1", "Load average from last 1m.")?,
            load5: gauge("load5", "Load average from last 5m.")?,
            load15: gauge("load15", "Load average from last 15m.")?,
            runnable: gauge(
                "runnable",
                "Number of currently runnable kernel scheduling entities",
            )?,
            exist: gauge(
                "exist",
                "Number of kernel scheduling entities that currently exist on the system.",
            )?,
        })
    }
}

#[async_trait::async_trait]
impl Collect for LoadAvg {
    async fn collect(&self) -> PluginResult<()> {
        let content = read_file(&self.config.path).await?;
        let load = parse_loadavg(&content, &self.config.path)?;

        self.load1.set(&[], load.one_minute)?;
        self.load5.set(&[], load.five_minutes)?;
        self.load15.set(&[], load.fifteen_minutes)?;
        self.runnable.set(&[], f64::from(load.runnable))?;
        self.exist.set(&[], f64::from(load.exist))?;
        Ok(())
    }
}

register_plugin!(LoadAvg, "loadavg");

#[cfg(test)]
mod tests {
    use std::{io::Write, path::Path};

    use serde_json::json;

    use super::*;

    #[test]
    fn parse_typical_line() {
        let load = parse_loadavg("1.23 1.45 1.67 1/234 12345\n", Path::new("loadavg")).unwrap();
        assert_eq!(
            load,
            LoadAverage {
                one_minute: 1.23,
                five_minutes: 1.45,
                fifteen_minutes: 1.67,
                runnable: 1,
                exist: 234,
            }
        );
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        let location = Path::new("loadavg");
        assert!(matches!(
            parse_loadavg("1.0 2.0", location),
            Err(PluginError::InvalidFormat { .. })
        ));
        assert!(matches!(
            parse_loadavg("1.0 2.0 3.0 5-200 1", location),
            Err(PluginError::InvalidFormat { .. })
        ));
        assert!(matches!(
            parse_loadavg("x 2.0 3.0 5/200 1", location),
            Err(PluginError::ParseError { ref metric, .. }) if metric == "load1"
        ));
    }

    #[tokio::test]
    async fn collect_sets_all_series() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "0.10 0.20 0.30 5/200 12345").unwrap();

        let registry = Arc::new(Registry::new());
        let plugin = LoadAvg::construct(&json!({ "path": file.path() }), &registry).unwrap();
        plugin.as_collect().unwrap().collect().await.unwrap();

        assert_eq!(plugin.load1.get(&[]), Some(0.10));
        assert_eq!(plugin.load5.get(&[]), Some(0.20));
        assert_eq!(plugin.load15.get(&[]), Some(0.30));
        assert_eq!(plugin.runnable.get(&[]), Some(5.0));
        assert_eq!(plugin.exist.get(&[]), Some(200.0));

        let text = String::from_utf8(registry.render()).unwrap();
        assert!(text.contains("node_loadavg_load1 0.1\n"));
        assert!(text.contains("node_loadavg_exist 200.0\n"));
    }

    #[tokio::test]
    async fn missing_file_fails_collect_and_keeps_old_values() {
        let registry = Arc::new(Registry::new());
        let plugin =
            LoadAvg::construct(&json!({ "path": "/nonexistent/loadavg" }), &registry).unwrap();
        plugin.load1.set(&[], 9.0).unwrap();

        let err = plugin.as_collect().unwrap().collect().await.unwrap_err();
        assert!(matches!(err, PluginError::FileRead { .. }));
        assert_eq!(plugin.load1.get(&[]), Some(9.0));
    }
}

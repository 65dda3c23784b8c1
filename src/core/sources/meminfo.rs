use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Deserialize;
use serde_json::Value;
use validator::Validate;

use super::common::{parse_config, parse_field, read_file};
use crate::{
    core::{
        metrics::{Metric, MetricDesc, Registry},
        plugins::{Collect, Construct, Plugin, PluginResult, NAMESPACE},
    },
    register_plugin,
};

const SUBSYSTEM: &str = "meminfo";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MemInfoConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
}

fn default_path() -> PathBuf {
    PathBuf::from("/proc/meminfo")
}

/// Turns a `/proc/meminfo` key such as `Active(anon):` into `active_anon`.
pub fn metric_name(key: &str) -> String {
    key.trim_end_matches(':')
        .replace('(', "_")
        .replace(')', "")
        .to_lowercase()
}

/// One gauge per `/proc/meminfo` field, declared the first time it is seen.
pub struct MemInfo {
    config: MemInfoConfig,
    registry: Arc<Registry>,
    metrics: Mutex<HashMap<String, Metric>>,
}

impl MemInfo {
    fn metric(&self, name: &str) -> PluginResult<Metric> {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(metric) = metrics.get(name) {
            return Ok(metric.clone());
        }
        let metric = self.registry.declare(
            MetricDesc::gauge(
                name,
                format!("{} from {}", name, self.config.path.display()),
            )
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
        )?;
        metrics.insert(name.to_string(), metric.clone());
        Ok(metric)
    }
}

impl Plugin for MemInfo {
    fn name(&self) -> &'static str {
        "meminfo"
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        Some(self)
    }
}

impl Construct for MemInfo {
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
        Ok(MemInfo {
            config: parse_config("meminfo", config)?,
            registry: registry.clone(),
            metrics: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait::async_trait]
impl Collect for MemInfo {
    async fn collect(&self) -> PluginResult<()> {
        let path = &self.config.path;
        let content = read_file(path).await?;

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(raw)) = (parts.next(), parts.next()) else {
                continue;
            };
            let name = metric_name(key);
            let value: f64 = parse_field(&name, path, raw)?;
            self.metric(&name)?.set(&[], value)?;
        }
        Ok(())
    }
}

register_plugin!(MemInfo, "meminfo");

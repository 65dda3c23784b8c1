//! Network interface counters and interface presence.

use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;
use serde_json::Value;
use tracing::trace;
use validator::Validate;

use super::common::{parse_config, parse_field, read_file, Pattern};
use crate::{
    core::{
        metrics::{Metric, MetricDesc, Registry},
        plugins::{Collect, Construct, Plugin, PluginError, PluginResult, NAMESPACE},
    },
    register_plugin,
};

const SUBSYSTEM: &str = "netdev";

/// Columns of `/proc/net/dev` after the interface name.
pub const COLUMNS: [&str; 16] = [
    "rx_bytes",
    "rx_packets",
    "rx_errs",
    "rx_drop",
    "rx_fifo",
    "rx_frame",
    "rx_compressed",
    "rx_multicast",
    "tx_bytes",
    "tx_packets",
    "tx_errs",
    "tx_drop",
    "tx_fifo",
    "tx_colls",
    "tx_carrier",
    "tx_compressed",
];

fn default_net_dev_path() -> PathBuf {
    PathBuf::from("/proc/net/dev")
}

fn default_interface_path() -> PathBuf {
    PathBuf::from("/sys/class/net")
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NetDevConfig {
    /// Interfaces matching this pattern (anchored at the start) are skipped.
    #[serde(default)]
    pub exclude: String,

    #[serde(default = "default_net_dev_path")]
    pub net_dev_path: PathBuf,

    #[serde(default = "default_interface_path")]
    pub interface_path: PathBuf,
}

/// One interface row of `/proc/net/dev`.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceStats {
    pub name: String,
    pub values: Vec<f64>,
}

/// Parses `/proc/net/dev`, skipping the two header lines.
pub fn parse_net_dev(content: &str, location: &std::path::Path) -> PluginResult<Vec<InterfaceStats>> {
    let mut interfaces = Vec::new();
    for line in content.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < COLUMNS.len() {
            return Err(PluginError::InvalidFormat {
                location: location.display().to_string(),
                reason: format!(
                    "interface {} has {} columns, expected {}",
                    name.trim(),
                    fields.len(),
                    COLUMNS.len()
                ),
            });
        }
        let values = COLUMNS
            .iter()
            .zip(&fields)
            .map(|(column, raw)| parse_field(column, location, raw))
            .collect::<PluginResult<Vec<f64>>>()?;
        interfaces.push(InterfaceStats {
            name: name.trim().to_string(),
            values,
        });
    }
    Ok(interfaces)
}

/// Per-interface traffic counters plus the carrier flag.
pub struct NetDev {
    config: NetDevConfig,
    exclude: Pattern,
    columns: Vec<Metric>,
    carrier: Metric,
}

impl Plugin for NetDev {
    fn name(&self) -> &'static str {
        "netdev"
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        Some(self)
    }
}

impl Construct for NetDev {
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
        let config: NetDevConfig = parse_config("netdev", config)?;
        let exclude = Pattern::new("netdev", &config.exclude)?;
        let gauge = |name: &str, help: String| {
            registry.declare(
                MetricDesc::gauge(name, help)
                    .namespace(NAMESPACE)
                    .subsystem(SUBSYSTEM)
                    .labels(&["device"]),
            )
        };

        let columns = COLUMNS
            .iter()
            .map(|column| {
                gauge(
                    *column,
                    format!("{} from {}", column, config.net_dev_path.display()),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let carrier = gauge("carrier", "Cable existence".to_string())?;

        Ok(NetDev {
            config,
            exclude,
            columns,
            carrier,
        })
    }
}

#[async_trait::async_trait]
impl Collect for NetDev {
    async fn collect(&self) -> PluginResult<()> {
        let content = read_file(&self.config.net_dev_path).await?;
        let interfaces = parse_net_dev(&content, &self.config.net_dev_path)?;

        for iface in interfaces {
            if self.exclude.matches(&iface.name) {
                trace!("Skipping excluded interface {}", iface.name);
                continue;
            }
            let labels = [iface.name.as_str()];
            for (metric, value) in self.columns.iter().zip(&iface.values) {
                metric.set(&labels, *value)?;
            }

            let carrier_path = self.config.interface_path.join(&iface.name).join("carrier");
            let raw = read_file(&carrier_path).await?;
            self.carrier
                .set(&labels, parse_field("carrier", &carrier_path, &raw)?)?;
        }
        Ok(())
    }
}

register_plugin!(NetDev, "netdev");

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NetDevExistsConfig {
    /// Interface name patterns to look for.
    #[validate(length(min = 1, message = "At least one interface pattern is required"))]
    pub interfaces: Vec<String>,

    #[serde(default = "default_interface_path")]
    pub interface_path: PathBuf,
}

/// Reports whether any interface matching each configured pattern exists.
pub struct NetDevExists {
    config: NetDevExistsConfig,
    patterns: Vec<(String, Pattern)>,
    exists: Metric,
}

impl Plugin for NetDevExists {
    fn name(&self) -> &'static str {
        "netdevexists"
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        Some(self)
    }
}

impl Construct for NetDevExists {
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
        let config: NetDevExistsConfig = parse_config("netdevexists", config)?;
        let patterns = config
            .interfaces
            .iter()
            .map(|raw| Ok((raw.clone(), Pattern::new("netdevexists", raw)?)))
            .collect::<PluginResult<Vec<_>>>()?;
        let exists = registry.declare(
            MetricDesc::gauge("exists", "Interface existence")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM)
                .labels(&["device"]),
        )?;

        Ok(NetDevExists {
            config,
            patterns,
            exists,
        })
    }
}

#[async_trait::async_trait]
impl Collect for NetDevExists {
    async fn collect(&self) -> PluginResult<()> {
        let path = &self.config.interface_path;
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|source| PluginError::file_read(path.display(), source))?;

        let mut present = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                present.push(name);
            }
        }

        for (raw, pattern) in &self.patterns {
            let exists = present.iter().any(|name| pattern.matches(name));
            self.exists.set(&[raw.as_str()], if exists { 1.0 } else { 0.0 })?;
        }
        Ok(())
    }
}

register_plugin!(NetDevExists, "netdevexists");

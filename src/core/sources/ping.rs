//! Round-trip time to configured hosts, measured by background tasks.

use std::{process::Stdio, sync::Arc, time::Duration};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use validator::Validate;

use super::common::parse_config;
use crate::{
    core::{
        metrics::{Metric, MetricDesc, Registry, Series},
        plugins::{
            updater::{spawn_updater, UpdaterSpec},
            Construct, Plugin, PluginError, PluginResult, Update, NAMESPACE,
        },
    },
    register_plugin,
};

/// Sends one echo request and waits for the reply.
#[async_trait::async_trait]
pub trait Prober: Send + Sync + 'static {
    /// Returns the round-trip time, or `None` when no reply came back within
    /// `timeout`.
    async fn probe(&self, host: &str, timeout: Duration) -> PluginResult<Option<Duration>>;
}

/// Prober backed by the system `ping` binary.
#[derive(Debug, Clone)]
pub struct SystemPing {
    pub program: String,
}

impl Default for SystemPing {
    fn default() -> Self {
        Self {
            program: "ping".to_string(),
        }
    }
}

/// Extracts the `time=<ms>` figure from `ping` output.
pub fn parse_rtt(output: &str) -> Option<Duration> {
    let start = output.find("time=")? + "time=".len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let millis: f64 = rest[..end].parse().ok()?;
    Duration::try_from_secs_f64(millis / 1000.0).ok()
}

#[async_trait::async_trait]
impl Prober for SystemPing {
    async fn probe(&self, host: &str, timeout: Duration) -> PluginResult<Option<Duration>> {
        let wait_secs = timeout.as_secs_f64().ceil().max(1.0).to_string();
        let child = tokio::process::Command::new(&self.program)
            .args(["-n", "-c", "1", "-W", &wait_secs, host])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(output) => output?,
            Err(_) => return Ok(None),
        };
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_rtt(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn default_timeout() -> f64 {
    1.0
}

fn default_interval() -> f64 {
    5.0
}

fn seconds(value: f64) -> PluginResult<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| PluginError::config("ping", format!("{}: {}", value, e)))
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PingTarget {
    #[validate(length(min = 1, message = "Ping target address must not be empty"))]
    pub address: String,

    /// Seconds to wait for a reply; also the value recorded when none arrives.
    #[serde(default = "default_timeout")]
    #[validate(range(min = 0.001, max = 86_400.0, message = "Ping timeout must be between 1 ms and one day"))]
    pub timeout: f64,

    /// Seconds between probes.
    #[serde(default = "default_interval")]
    #[validate(range(min = 0.001, max = 86_400.0, message = "Ping interval must be between 1 ms and one day"))]
    pub interval: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PingConfig {
    #[validate(nested)]
    pub targets: Vec<PingTarget>,
}

/// Probes `target` once and records the round-trip in milliseconds.
///
/// When the probe fails or times out the configured timeout (in ms) is
/// recorded instead.
pub async fn ping_once(prober: &dyn Prober, target: &PingTarget, series: &Series) -> PluginResult<()> {
    let timeout = seconds(target.timeout)?;
    let sentinel = target.timeout * 1000.0;

    match prober.probe(&target.address, timeout).await {
        Ok(Some(rtt)) => {
            series.set(rtt.as_secs_f64() * 1000.0);
            Ok(())
        }
        Ok(None) => {
            debug!("No reply from {} within {:?}", target.address, timeout);
            series.set(sentinel);
            Ok(())
        }
        Err(e) => {
            series.set(sentinel);
            Err(e)
        }
    }
}

/// Background ping of every configured target, one task per target.
pub struct Ping {
    targets: Vec<PingTarget>,
    metric: Metric,
    prober: Arc<dyn Prober>,
}

impl Ping {
    pub fn with_prober(
        config: &Value,
        registry: &Arc<Registry>,
        prober: Arc<dyn Prober>,
    ) -> PluginResult<Self> {
        let config: PingConfig = parse_config("ping", config)?;
        let metric = registry.declare(
            MetricDesc::gauge("ping", "Ping to host")
                .namespace(NAMESPACE)
                .labels(&["host"]),
        )?;
        Ok(Ping {
            targets: config.targets,
            metric,
            prober,
        })
    }
}

impl Plugin for Ping {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn as_update(&self) -> Option<&dyn Update> {
        Some(self)
    }
}

impl Construct for Ping {
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
        Self::with_prober(config, registry, Arc::new(SystemPing::default()))
    }
}

impl Update for Ping {
    fn start_update(&self) -> PluginResult<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PluginError::Other("no async runtime to spawn ping tasks".into()));
        }

        for target in &self.targets {
            let interval = seconds(target.interval)?;
            let series = self.metric.with_label_values(&[target.address.as_str()])?;
            let prober = self.prober.clone();
            let target = target.clone();
            let spec = UpdaterSpec {
                plugin: "ping",
                target: target.address.clone(),
                interval,
            };

            spawn_updater(spec, move || {
                let prober = prober.clone();
                let target = target.clone();
                let series = series.clone();
                async move { ping_once(prober.as_ref(), &target, &series).await }
            });
        }
        Ok(())
    }
}

register_plugin!(Ping, "ping");

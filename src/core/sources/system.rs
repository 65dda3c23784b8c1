use std::{path::PathBuf, sync::Arc};

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

/// Column names of the `cpu*` lines, in kernel order.
const CPU_MODES: [&str; 9] = [
    "user", "nice", "system", "idle", "iowait", "irq", "softirq", "steal", "guest",
];

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SystemConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
}

fn default_path() -> PathBuf {
    PathBuf::from("/proc/stat")
}

/// Kernel and CPU statistics from `/proc/stat`.
pub struct System {
    config: SystemConfig,
    cpu: Metric,
    intr: Metric,
    ctxt: Metric,
    forks: Metric,
    btime: Metric,
    procs_running: Metric,
    procs_blocked: Metric,
}

impl Plugin for System {
    fn name(&self) -> &'static str {
        "system"
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        Some(self)
    }
}

impl Construct for System {
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
        let config: SystemConfig = parse_config("system", config)?;
        let declare = |desc: MetricDesc| registry.declare(desc.namespace(NAMESPACE));

        Ok(System {
            config,
            cpu: declare(
                MetricDesc::counter("cpu", "Seconds the cpus spent in each mode.")
                    .labels(&["cpu", "mode"]),
            )?,
            intr: declare(MetricDesc::counter(
                "intr",
                "Total number of interrupts serviced.",
            ))?,
            ctxt: declare(MetricDesc::counter(
                "context_switches",
                "Total number of context switches.",
            ))?,
            forks: declare(MetricDesc::counter("forks", "Total number of forks."))?,
            btime: declare(MetricDesc::gauge("boot_time", "Node boot time, in unixtime."))?,
            procs_running: declare(MetricDesc::gauge(
                "procs_running",
                "Number of processes in runnable state.",
            ))?,
            procs_blocked: declare(MetricDesc::gauge(
                "procs_blocked",
                "Number of processes blocked waiting for I/O to complete.",
            ))?,
        })
    }
}

#[async_trait::async_trait]
impl Collect for System {
    async fn collect(&self) -> PluginResult<()> {
        let path = &self.config.path;
        let content = read_file(path).await?;

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let Some(key) = parts.next() else {
                continue;
            };
            let values: Vec<&str> = parts.collect();

            if key.starts_with("cpu") {
                for (mode, raw) in CPU_MODES.iter().zip(&values) {
                    self.cpu.set(&[key, *mode], parse_field("cpu", path, raw)?)?;
                }
                continue;
            }

            let target = match key {
                "intr" => &self.intr,
                "ctxt" => &self.ctxt,
                "processes" => &self.forks,
                "btime" => &self.btime,
                "procs_running" => &self.procs_running,
                "procs_blocked" => &self.procs_blocked,
                _ => continue,
            };
            if let Some(raw) = values.first() {
                target.set(&[], parse_field(key, path, raw)?)?;
            }
        }
        Ok(())
    }
}

register_plugin!(System, "system");

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    const STAT: &str = "\
cpu  100 2 30 4000 5 0 6 0 0 0
cpu0 50 1 15 2000 3 0 3 0 0 0
intr 123456 1 2 3
ctxt 987654
btime 1700000000
processes 4321
procs_running 3
procs_blocked 1
softirq 11 2 3
";

    #[tokio::test]
    async fn collect_parses_proc_stat() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(STAT.as_bytes()).unwrap();

        let registry = Arc::new(Registry::new());
        let plugin = System::construct(&json!({ "path": file.path() }), &registry).unwrap();
        plugin.as_collect().unwrap().collect().await.unwrap();

        assert_eq!(plugin.cpu.get(&["cpu", "user"]), Some(100.0));
        assert_eq!(plugin.cpu.get(&["cpu0", "idle"]), Some(2000.0));
        assert_eq!(plugin.cpu.get(&["cpu0", "guest"]), Some(0.0));
        assert_eq!(plugin.cpu.series_count(), 18);
        assert_eq!(plugin.intr.get(&[]), Some(123456.0));
        assert_eq!(plugin.ctxt.get(&[]), Some(987654.0));
        assert_eq!(plugin.forks.get(&[]), Some(4321.0));
        assert_eq!(plugin.btime.get(&[]), Some(1_700_000_000.0));
        assert_eq!(plugin.procs_running.get(&[]), Some(3.0));
        assert_eq!(plugin.procs_blocked.get(&[]), Some(1.0));

        let text = String::from_utf8(registry.render()).unwrap();
        assert!(text.contains("# TYPE node_cpu counter\n"));
        assert!(text.contains("node_cpu{cpu=\"cpu0\",mode=\"system\"} 15.0\n"));
    }
}

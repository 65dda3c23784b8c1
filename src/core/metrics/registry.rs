//! Process-wide metric store shared by every plugin and the render path.

use std::{
    collections::HashSet,
    sync::{Arc, PoisonError, RwLock},
};

use tracing::debug;

use super::{
    error::{MetricError, MetricResult},
    metric::{Metric, MetricCore, MetricDesc},
    render,
};

#[derive(Debug, Default)]
struct Inner {
    metrics: Vec<Arc<MetricCore>>,
    names: HashSet<String>,
}

/// The set of all declared metrics and their series.
///
/// Metrics are kept in declaration order, which is also the render order.
/// Declaration takes the write lock; `render` only holds the read lock long
/// enough to clone the metric list, then snapshots each metric separately.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a new metric and returns its handle.
    ///
    /// # Errors
    ///
    /// * `MetricError::InvalidName` if the metric or a label name is malformed.
    /// * `MetricError::DuplicateMetric` if the fully qualified name is taken.
    pub fn declare(&self, desc: MetricDesc) -> MetricResult<Metric> {
        desc.validate()?;
        let core = Arc::new(MetricCore::new(desc));

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.names.insert(core.fq_name.clone()) {
            return Err(MetricError::DuplicateMetric(core.fq_name.clone()));
        }
        inner.metrics.push(core.clone());
        debug!("Declared {} {}", core.desc.kind, core.fq_name);

        Ok(Metric { core })
    }

    /// Number of declared metrics.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes every known series in the text exposition format.
    pub fn render(&self) -> Vec<u8> {
        let metrics: Vec<Arc<MetricCore>> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .clone();

        let mut out = Vec::with_capacity(metrics.len() * 128);
        for metric in &metrics {
            render::write_metric(&mut out, &metric.fq_name, &metric.desc, &metric.snapshot());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(registry: &Registry) -> Vec<String> {
        String::from_utf8(registry.render())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn declare_rejects_duplicate_identity() {
        let registry = Registry::new();
        registry
            .declare(MetricDesc::gauge("load1", "a").namespace("node").subsystem("loadavg"))
            .unwrap();

        let err = registry
            .declare(MetricDesc::counter("load1", "b").namespace("node").subsystem("loadavg"))
            .unwrap_err();
        assert_eq!(err, MetricError::DuplicateMetric("node_loadavg_load1".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn render_emits_one_line_per_series_with_latest_value() {
        let registry = Registry::new();
        let rx = registry
            .declare(
                MetricDesc::gauge("rx_bytes", "rx_bytes from /proc/net/dev")
                    .namespace("node")
                    .subsystem("netdev")
                    .labels(&["device"]),
            )
            .unwrap();
        let forks = registry
            .declare(MetricDesc::counter("forks", "Total number of forks.").namespace("node"))
            .unwrap();

        rx.set(&["lo"], 1.0).unwrap();
        rx.set(&["eth0"], 2.0).unwrap();
        rx.set(&["lo"], 3.0).unwrap();
        forks.set(&[], 100.0).unwrap();

        assert_eq!(
            lines(&registry),
            vec![
                "# HELP node_netdev_rx_bytes rx_bytes from /proc/net/dev",
                "# TYPE node_netdev_rx_bytes gauge",
                "node_netdev_rx_bytes{device=\"eth0\"} 2.0",
                "node_netdev_rx_bytes{device=\"lo\"} 3.0",
                "# HELP node_forks Total number of forks.",
                "# TYPE node_forks counter",
                "node_forks 100.0",
            ]
        );
    }

    #[test]
    fn render_is_deterministic() {
        let registry = Registry::new();
        let metric = registry
            .declare(MetricDesc::gauge("status", "MCU status").labels(&["input"]))
            .unwrap();
        for input in ["usb", "poe", "off", "batbad"] {
            metric.set(&[input], 1.0).unwrap();
        }
        assert_eq!(registry.render(), registry.render());
    }

    #[test]
    fn declared_metric_without_series_renders_metadata_only() {
        let registry = Registry::new();
        registry
            .declare(MetricDesc::gauge("exists", "Interface existence").labels(&["device"]))
            .unwrap();
        assert_eq!(
            lines(&registry),
            vec!["# HELP exists Interface existence", "# TYPE exists gauge"]
        );
        assert!(!registry.is_empty());
    }
}

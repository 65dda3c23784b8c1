//! Metric descriptors, metric handles and per-series value cells.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use once_cell::sync::Lazy;
use regex::Regex;

use super::error::{MetricError, MetricResult};

static METRIC_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("static regex"));
static LABEL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("static regex"));

/// Kind of a metric as announced in the `# TYPE` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to declare a metric.
///
/// Built with [`MetricDesc::gauge`] or [`MetricDesc::counter`] and refined
/// with the builder methods:
///
/// ```
/// use nodewatch::core::metrics::MetricDesc;
///
/// let desc = MetricDesc::gauge("load1", "Load average from last 1m.")
///     .namespace("node")
///     .subsystem("loadavg");
/// assert_eq!(desc.fq_name(), "node_loadavg_load1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDesc {
    pub namespace: String,
    pub subsystem: String,
    pub name: String,
    pub kind: MetricKind,
    pub label_names: Vec<String>,
    pub help: String,
}

impl MetricDesc {
    pub fn new(kind: MetricKind, name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            subsystem: String::new(),
            name: name.into(),
            kind,
            label_names: Vec::new(),
            help: help.into(),
        }
    }

    pub fn gauge(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(MetricKind::Gauge, name, help)
    }

    pub fn counter(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self::new(MetricKind::Counter, name, help)
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = subsystem.into();
        self
    }

    pub fn labels(mut self, label_names: &[&str]) -> Self {
        self.label_names = label_names.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Fully qualified name: non-empty namespace, subsystem and name joined by `_`.
    pub fn fq_name(&self) -> String {
        [&self.namespace, &self.subsystem, &self.name]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.as_str())
            .collect::<Vec<_>>()
            .join("_")
    }

    pub(crate) fn validate(&self) -> MetricResult<()> {
        let fq_name = self.fq_name();
        if !METRIC_NAME_RE.is_match(&fq_name) {
            return Err(MetricError::InvalidName {
                kind: "metric",
                name: fq_name,
            });
        }
        for label in &self.label_names {
            if !LABEL_NAME_RE.is_match(label) || label.starts_with("__") {
                return Err(MetricError::InvalidName {
                    kind: "label",
                    name: label.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Storage cell for one series. The `f64` is kept as its bit pattern so a
/// reader never observes a partially written value.
#[derive(Debug, Default)]
struct ValueCell(AtomicU64);

impl ValueCell {
    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}

#[derive(Debug)]
pub(crate) struct MetricCore {
    pub(crate) desc: MetricDesc,
    pub(crate) fq_name: String,
    series: RwLock<BTreeMap<Vec<String>, Arc<ValueCell>>>,
}

impl MetricCore {
    pub(crate) fn new(desc: MetricDesc) -> Self {
        let fq_name = desc.fq_name();
        Self {
            desc,
            fq_name,
            series: RwLock::new(BTreeMap::new()),
        }
    }

    /// Copies the current series values, sorted by label tuple.
    pub(crate) fn snapshot(&self) -> Vec<(Vec<String>, f64)> {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        series
            .iter()
            .map(|(labels, cell)| (labels.clone(), cell.get()))
            .collect()
    }

    fn check_arity(&self, label_values: &[&str]) -> MetricResult<()> {
        if label_values.len() != self.desc.label_names.len() {
            return Err(MetricError::LabelArity {
                metric: self.fq_name.clone(),
                expected: self.desc.label_names.len(),
                got: label_values.len(),
            });
        }
        Ok(())
    }

    fn cell(&self, label_values: &[&str]) -> MetricResult<Arc<ValueCell>> {
        self.check_arity(label_values)?;
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();

        {
            let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cell) = series.get(&key) {
                return Ok(cell.clone());
            }
        }

        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        Ok(series.entry(key).or_default().clone())
    }

    fn get(&self, label_values: &[&str]) -> Option<f64> {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        series.get(&key).map(|cell| cell.get())
    }
}

/// Handle to a declared metric. Cheap to clone; all clones write into the
/// same registry entry.
#[derive(Debug, Clone)]
pub struct Metric {
    pub(crate) core: Arc<MetricCore>,
}

impl Metric {
    pub fn desc(&self) -> &MetricDesc {
        &self.core.desc
    }

    pub fn fq_name(&self) -> &str {
        &self.core.fq_name
    }

    /// Creates or overwrites the series identified by `label_values`.
    ///
    /// # Errors
    ///
    /// Returns `MetricError::LabelArity` when the number of values differs from
    /// the declared label names; no series is created in that case.
    pub fn set(&self, label_values: &[&str], value: f64) -> MetricResult<()> {
        self.core.cell(label_values)?.set(value);
        Ok(())
    }

    /// Returns a handle bound to one series, creating it with value `0` if needed.
    pub fn with_label_values(&self, label_values: &[&str]) -> MetricResult<Series> {
        Ok(Series {
            cell: self.core.cell(label_values)?,
        })
    }

    /// Current value of a series, `None` if it was never written.
    pub fn get(&self, label_values: &[&str]) -> Option<f64> {
        self.core.get(label_values)
    }

    /// Number of series written so far.
    pub fn series_count(&self) -> usize {
        self.core
            .series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle to a single series, used by background tasks that keep writing
/// the same label tuple.
#[derive(Debug, Clone)]
pub struct Series {
    cell: Arc<ValueCell>,
}

impl Series {
    pub fn set(&self, value: f64) {
        self.cell.set(value);
    }

    pub fn get(&self) -> f64 {
        self.cell.get()
    }
}

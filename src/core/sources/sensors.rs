//! Hardware monitoring sensors.
//!
//! `lmsensors` walks the kernel hwmon class (the same source libsensors reads)
//! and exposes one gauge per chip. `imx28` reads the battery voltage and the
//! on-die temperature ADC of i.MX28 boards.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};
use validator::Validate;

use super::common::{parse_config, parse_field, read_file, Pattern};
use crate::{
    core::{
        metrics::{Metric, MetricDesc, Registry},
        plugins::{Collect, Construct, Plugin, PluginError, PluginResult, NAMESPACE},
    },
    register_plugin,
};

const SUBSYSTEM: &str = "sensors";

/// Chip names taken by other plugins' gauges in the same subsystem.
const RESERVED_CHIP_NAMES: &[&str] = &["imx28"];

static INPUT_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(temp|in|fan|power|curr|humidity)(\d+)_input$").expect("static regex"));

/// Divisor turning the raw sysfs figure into the base unit.
fn scale(kind: &str) -> f64 {
    match kind {
        "temp" | "in" | "curr" | "humidity" => 1_000.0,
        "power" => 1_000_000.0,
        _ => 1.0,
    }
}

/// Turns a chip name into a metric name component.
pub fn sanitize_chip_name(raw: &str) -> String {
    let mut name: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// A hwmon device directory and its metric name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chip {
    pub name: String,
    pub dir: PathBuf,
}

fn chip_name(dir: &Path) -> Option<String> {
    [dir.join("name"), dir.join("device").join("name")]
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|raw| sanitize_chip_name(&raw))
        .filter(|name| !name.is_empty())
}

/// Lists chips under `root` in directory order, minus those matching `exclude`.
///
/// When two chips share a name, later ones get the hwmon directory name
/// appended. The same applies to a chip named after a reserved gauge, so
/// `lmsensors` and `imx28` can be loaded together.
pub fn discover_chips(root: &Path, exclude: &Pattern) -> PluginResult<Vec<Chip>> {
    let entries = std::fs::read_dir(root).map_err(|source| PluginError::file_read(root.display(), source))?;
    let mut dirs: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    dirs.sort();

    let mut seen: HashSet<String> = RESERVED_CHIP_NAMES.iter().map(|n| n.to_string()).collect();
    let mut chips = Vec::new();
    for dir in dirs {
        let Some(mut name) = chip_name(&dir) else {
            trace!("No chip name under {}", dir.display());
            continue;
        };
        if exclude.matches(&name) {
            debug!("Excluding sensor chip {}", name);
            continue;
        }
        if !seen.insert(name.clone()) {
            let suffix = dir
                .file_name()
                .map(|n| sanitize_chip_name(&n.to_string_lossy()))
                .unwrap_or_default();
            name = format!("{}_{}", name, suffix);
            seen.insert(name.clone());
        }
        chips.push(Chip { name, dir });
    }
    Ok(chips)
}

/// One scaled sensor input.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub feature: String,
    pub label: String,
    pub value: f64,
}

/// Reads every `*_input` file of a chip.
///
/// Inputs the driver refuses to read are skipped. The label falls back to the
/// feature name when no `*_label` file exists.
pub async fn read_chip(dir: &Path) -> PluginResult<Vec<Reading>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|source| PluginError::file_read(dir.display(), source))?;

    let mut readings = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(caps) = file_name.to_str().and_then(|n| INPUT_FILE.captures(n)) else {
            continue;
        };
        let kind = &caps[1];
        let feature = format!("{}{}", kind, &caps[2]);

        let path = entry.path();
        let raw = match read_file(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Skipping sensor input: {}", e);
                continue;
            }
        };
        let value: f64 = parse_field(&feature, &path, &raw)?;

        let label = match tokio::fs::read_to_string(dir.join(format!("{}_label", feature))).await {
            Ok(label) if !label.trim().is_empty() => label.trim().to_string(),
            _ => feature.clone(),
        };

        readings.push(Reading {
            value: value / scale(kind),
            feature,
            label,
        });
    }
    Ok(readings)
}

fn default_hwmon_path() -> PathBuf {
    PathBuf::from("/sys/class/hwmon")
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LmSensorsConfig {
    /// Chips whose sanitized name matches this pattern are skipped.
    #[serde(default)]
    pub exclude_chips: String,

    #[serde(default = "default_hwmon_path")]
    pub hwmon_path: PathBuf,
}

/// One gauge per detected chip, labelled by feature and label.
pub struct LmSensors {
    chips: Vec<(Chip, Metric)>,
}

impl Plugin for LmSensors {
    fn name(&self) -> &'static str {
        "lmsensors"
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        Some(self)
    }
}

impl Construct for LmSensors {
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
        let config: LmSensorsConfig = parse_config("lmsensors", config)?;
        let exclude = Pattern::new("lmsensors", &config.exclude_chips)?;

        let chips = discover_chips(&config.hwmon_path, &exclude)?
            .into_iter()
            .map(|chip| {
                let metric = registry.declare(
                    MetricDesc::gauge(&chip.name, format!("Values from {} sensor.", chip.name))
                        .namespace(NAMESPACE)
                        .subsystem(SUBSYSTEM)
                        .labels(&["feature", "label"]),
                )?;
                Ok((chip, metric))
            })
            .collect::<PluginResult<Vec<_>>>()?;

        debug!("Found {} sensor chips", chips.len());
        Ok(LmSensors { chips })
    }
}

#[async_trait::async_trait]
impl Collect for LmSensors {
    async fn collect(&self) -> PluginResult<()> {
        for (chip, metric) in &self.chips {
            for reading in read_chip(&chip.dir).await? {
                metric.set(&[reading.feature.as_str(), reading.label.as_str()], reading.value)?;
            }
        }
        Ok(())
    }
}

register_plugin!(LmSensors, "lmsensors");

fn default_voltage_path() -> PathBuf {
    PathBuf::from("/sys/class/power_supply/battery/voltage_now")
}

fn default_temp_path() -> PathBuf {
    PathBuf::from("/sys/bus/iio/devices/iio:device0/in_temp8_raw")
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Imx28Config {
    #[serde(default = "default_voltage_path")]
    pub voltage_path: PathBuf,

    #[serde(default = "default_temp_path")]
    pub temp_path: PathBuf,
}

/// Converts the raw on-die temperature ADC reading to degrees Celsius.
pub fn imx28_temperature(raw: f64) -> f64 {
    (raw - 1075.69) * 0.253
}

pub struct Imx28 {
    config: Imx28Config,
    metric: Metric,
}

impl Plugin for Imx28 {
    fn name(&self) -> &'static str {
        "imx28"
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        Some(self)
    }
}

impl Construct for Imx28 {
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
        let config = parse_config("imx28", config)?;
        let metric = registry.declare(
            MetricDesc::gauge("imx28", "Values from imx28 sensors")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM)
                .labels(&["label"]),
        )?;
        Ok(Imx28 { config, metric })
    }
}

#[async_trait::async_trait]
impl Collect for Imx28 {
    async fn collect(&self) -> PluginResult<()> {
        let first_line = |content: &str| content.lines().next().unwrap_or_default().to_string();

        let path = &self.config.voltage_path;
        let voltage: f64 = parse_field("voltage", path, &first_line(&read_file(path).await?))?;

        let path = &self.config.temp_path;
        let raw: f64 = parse_field("cpu_temp", path, &first_line(&read_file(path).await?))?;

        self.metric.set(&["voltage"], voltage / 1000.0)?;
        self.metric.set(&["cpu_temp"], imx28_temperature(raw))?;
        Ok(())
    }
}

register_plugin!(Imx28, "imx28");

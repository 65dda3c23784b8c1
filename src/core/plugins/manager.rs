//! Plugin lifecycle: construction, background start-up and scrape-time collection.
//!
//! The manager exclusively owns the active plugin instances. Every failure is
//! contained to the plugin that raised it: a bad constructor skips that entry,
//! a failed `start_update` disables only background behavior, and a failed
//! `collect` leaves that plugin's previous values in the registry.

use std::{collections::BTreeSet, sync::Arc};

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::{
    error::{PluginFailure, Stage},
    registry::PluginTable,
    traits::Plugin,
};
use crate::core::metrics::Registry;

pub struct PluginManager {
    registry: Arc<Registry>,
    plugins: Vec<Arc<dyn Plugin>>,
    failures: Vec<PluginFailure>,
}

impl PluginManager {
    /// Constructs every configured plugin that has a factory in `table`.
    ///
    /// Unknown names and constructor failures are logged and skipped; they are
    /// kept in [`PluginManager::failures`].
    pub fn load(config: &Map<String, Value>, table: &PluginTable, registry: Arc<Registry>) -> Self {
        let mut plugins = Vec::with_capacity(config.len());
        let mut failures = Vec::new();

        for (name, plugin_config) in config {
            let factory = match table.get(name) {
                Ok(factory) => factory,
                Err(e) => {
                    error!("Plugin {} not found! skipped...", name);
                    failures.push(PluginFailure {
                        plugin: name.clone(),
                        stage: Stage::Init,
                        source: e,
                    });
                    continue;
                }
            };

            match factory(plugin_config, &registry) {
                Ok(plugin) => {
                    info!("Plugin {} loaded", name);
                    plugins.push(plugin);
                }
                Err(e) => {
                    let failure = PluginFailure {
                        plugin: name.clone(),
                        stage: Stage::Init,
                        source: e,
                    };
                    error!("{}", failure);
                    failures.push(failure);
                }
            }
        }

        Self {
            registry,
            plugins,
            failures,
        }
    }

    /// Calls `start_update` once on every plugin that supports it.
    ///
    /// Returns the number of plugins whose background tasks started.
    pub fn start_updates(&mut self) -> usize {
        let mut started = 0;
        for plugin in &self.plugins {
            let Some(updater) = plugin.as_update() else {
                continue;
            };
            match updater.start_update() {
                Ok(()) => {
                    debug!("Background update started for {}", plugin.name());
                    started += 1;
                }
                Err(e) => {
                    let failure = PluginFailure {
                        plugin: plugin.name().to_string(),
                        stage: Stage::UpdateStart,
                        source: e,
                    };
                    error!("{}", failure);
                    self.failures.push(failure);
                }
            }
        }
        started
    }

    /// Runs one collection pass over every pull-style plugin, in order.
    ///
    /// Failures are logged and returned; they never stop the pass.
    pub async fn collect_all(&self) -> Vec<PluginFailure> {
        let mut failures = Vec::new();
        for plugin in &self.plugins {
            let Some(collector) = plugin.as_collect() else {
                continue;
            };
            if let Err(e) = collector.collect().await {
                let failure = PluginFailure {
                    plugin: plugin.name().to_string(),
                    stage: Stage::Collect,
                    source: e,
                };
                error!("{}", failure);
                failures.push(failure);
            }
        }
        failures
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Names of the successfully constructed plugins, in configuration order.
    pub fn active(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Failures recorded during construction and `start_updates`.
    pub fn failures(&self) -> &[PluginFailure] {
        &self.failures
    }
}

/// Logs a table of configured versus available plugins.
pub fn log_plugins_table(configured: &Map<String, Value>, table: &PluginTable) {
    let enabled: BTreeSet<String> = configured.keys().map(|k| k.to_lowercase()).collect();
    let available: BTreeSet<String> = table.names().into_iter().map(str::to_string).collect();
    let all_names: BTreeSet<&String> = enabled.iter().chain(available.iter()).collect();

    let name_width = all_names
        .iter()
        .map(|s| s.len())
        .max()
        .unwrap_or(10)
        .max("Plugin".len());

    info!("{:<width$} | Status", "Plugin", width = name_width);
    info!("{}-+-{}", "-".repeat(name_width), "-".repeat(12));

    for name in all_names {
        let status = match (enabled.contains(name), available.contains(name)) {
            (true, true) => "ENABLED",
            (true, false) => "ENABLED (missing)",
            (false, true) => "DISABLED",
            (false, false) => "UNKNOWN",
        };
        if status == "ENABLED (missing)" {
            warn!("{:<width$} | {}", name, status, width = name_width);
        } else {
            info!("{:<width$} | {}", name, status, width = name_width);
        }
    }
}

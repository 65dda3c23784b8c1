use std::sync::Arc;

use serde_json::Value;

use super::error::PluginResult;
use crate::core::metrics::Registry;

/// Pull-style capability: refresh metrics on every scrape.
///
/// Implementations read current state (usually a `/proc` or `/sys` file) and
/// write their metrics before returning. A returned error leaves the previous
/// values in the registry untouched.
#[async_trait::async_trait]
pub trait Collect: Send + Sync {
    async fn collect(&self) -> PluginResult<()>;
}

/// Push-style capability: launch background tasks once at startup.
///
/// Must return immediately; the spawned tasks own everything they need.
pub trait Update: Send + Sync {
    fn start_update(&self) -> PluginResult<()>;
}

/// A data source managed by the plugin manager.
///
/// Capabilities are optional. A plugin exposes the ones it supports by
/// overriding `as_collect` / `as_update`.
pub trait Plugin: Send + Sync + 'static {
    /// Name the plugin was registered under.
    fn name(&self) -> &'static str;

    fn as_collect(&self) -> Option<&dyn Collect> {
        None
    }

    fn as_update(&self) -> Option<&dyn Update> {
        None
    }
}

/// Construction half of the contract, used by `register_plugin!`.
pub trait Construct: Plugin + Sized {
    /// Builds the plugin from its configuration object, declaring its metrics
    /// in `registry`.
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self>;
}

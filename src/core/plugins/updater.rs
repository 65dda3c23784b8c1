//! Generic background polling loop shared by push-style plugins.

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::error::PluginResult;

/// Immutable description of one background target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterSpec {
    /// Plugin that owns the task, used in log lines.
    pub plugin: &'static str,
    /// Logical target (host, device path).
    pub target: String,
    /// Pause between the end of one tick and the start of the next.
    pub interval: Duration,
}

/// Spawns a task that runs `tick` forever, sleeping `spec.interval` between runs.
///
/// A failed tick is logged and the loop goes on; the task only ends when the
/// runtime shuts down.
pub fn spawn_updater<F, Fut>(spec: UpdaterSpec, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = PluginResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match tick().await {
                Ok(()) => trace!("{} update for {} done", spec.plugin, spec.target),
                Err(e) => warn!("Error while updating {} for {}: {}", spec.plugin, spec.target, e),
            }
            tokio::time::sleep(spec.interval).await;
        }
    })
}

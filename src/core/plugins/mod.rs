//! Plugin contract, registration table, lifecycle manager and background updater.

pub mod error;
pub mod manager;
pub mod registry;
pub mod traits;
pub mod updater;

pub use error::{PluginError, PluginFailure, PluginResult, Stage};
pub use manager::PluginManager;
pub use registry::PluginTable;
pub use traits::{Collect, Construct, Plugin, Update};

/// Namespace prefix shared by every built-in plugin's metrics.
pub const NAMESPACE: &str = "node";

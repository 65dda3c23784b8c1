pub mod metrics;
pub mod plugins;
pub mod server;
pub mod sources;

//! Metric registry and exposition rendering.
//!
//! Plugins declare metrics through [`Registry::declare`] and write values
//! through the returned [`Metric`] handles. The HTTP layer calls
//! [`Registry::render`] and [`render::gzip`] on every scrape.

pub mod error;
pub mod metric;
pub mod registry;
pub mod render;

pub use error::{MetricError, MetricResult};
pub use metric::{Metric, MetricDesc, MetricKind, Series};
pub use registry::Registry;

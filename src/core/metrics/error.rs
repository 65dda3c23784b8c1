use thiserror::Error;

/// Errors raised by the metric registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    /// A metric with the same fully qualified name is already declared.
    #[error("Duplicate metric: {0}")]
    DuplicateMetric(String),

    /// The number of label values does not match the declared label names.
    #[error("Metric {metric} expects {expected} label values, got {got}")]
    LabelArity {
        metric: String,
        expected: usize,
        got: usize,
    },

    /// A metric or label name does not satisfy the exposition naming rules.
    #[error("Invalid {kind} name: '{name}'")]
    InvalidName { kind: &'static str, name: String },
}

/// Result alias for registry operations.
pub type MetricResult<T> = std::result::Result<T, MetricError>;

//! Metric types and file writing.
//!
//! Everything here is re-exported from the `fgmarkdup-metrics` crate so callers can depend on the
//! library crate alone.

pub use fgmarkdup_metrics::duplication;
pub use fgmarkdup_metrics::writer;
pub use fgmarkdup_metrics::{
    DuplicationMetrics, FLOAT_PRECISION, Metric, RoiHistogramMetric, UNKNOWN_LIBRARY,
    estimate_library_size, estimate_roi, format_count, format_float,
};
pub use writer::{write_metrics, write_metrics_auto};

#![deny(unsafe_code)]

//! Structured metric types and TSV writer for fgmarkdup.
//!
//! This crate provides:
//! - the [`Metric`] trait implemented by every metric row written to disk
//! - [`duplication`] metrics with library complexity estimation
//! - the [`writer`] module for TSV file output

pub mod duplication;
pub mod writer;

use serde::{Deserialize, Serialize};

/// Number of decimal places used for float metrics.
pub const FLOAT_PRECISION: usize = 6;

/// Formats a float value with the standard precision for metrics.
///
/// # Example
/// ```
/// use fgmarkdup_metrics::format_float;
/// assert_eq!(format_float(0.25), "0.250000");
/// assert_eq!(format_float(0.0), "0.000000");
/// ```
#[must_use]
pub fn format_float(value: f64) -> String {
    format!("{value:.FLOAT_PRECISION$}")
}

/// Formats a count with comma thousands separators.
///
/// # Example
/// ```
/// use fgmarkdup_metrics::format_count;
/// assert_eq!(format_count(0), "0");
/// assert_eq!(format_count(1234567), "1,234,567");
/// ```
#[must_use]
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// A metric type that can be serialized to TSV files.
pub trait Metric: Serialize + for<'de> Deserialize<'de> + Clone + Default {
    /// Human-readable name for this metric type, used in error messages and logs.
    fn metric_name() -> &'static str;
}

pub use duplication::{
    DuplicationMetrics, RoiHistogramMetric, UNKNOWN_LIBRARY, estimate_library_size, estimate_roi,
};
pub use writer::{write_metrics, write_metrics_auto};

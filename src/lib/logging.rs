//! Formatting helpers and summaries for log output.

use std::time::{Duration, Instant};

use fgmarkdup_metrics::DuplicationMetrics;
pub use fgmarkdup_metrics::format_count;

/// Formats a fraction as a percentage with the given number of decimals.
///
/// ```
/// use fgmarkdup_lib::logging::format_percent;
/// assert_eq!(format_percent(0.1234, 1), "12.3%");
/// ```
#[must_use]
pub fn format_percent(value: f64, decimals: usize) -> String {
    format!("{:.decimals$}%", value * 100.0)
}

/// Formats a duration as `45s`, `2m 15s` or `1h 30m`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => match secs % 60 {
            0 => format!("{}m", secs / 60),
            s => format!("{}m {s}s", secs / 60),
        },
        _ => match (secs % 3600) / 60 {
            0 => format!("{}h", secs / 3600),
            m => format!("{}h {m}m", secs / 3600),
        },
    }
}

/// Formats a throughput as records per second (or per minute when slow).
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn format_rate(count: u64, duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 0.001 {
        return format!("{} records/s", format_count(count));
    }
    let rate = count as f64 / secs;
    if rate >= 1.0 {
        format!("{} records/s", format_count(rate as u64))
    } else {
        format!("{:.1} records/min", rate * 60.0)
    }
}

/// Logs a per-library duplication summary.
#[allow(clippy::cast_precision_loss)]
pub fn log_duplication_summary(metrics: &[DuplicationMetrics]) {
    for m in metrics {
        log::info!("Library '{}':", m.library);
        log::info!(
            "  Examined {} unpaired reads and {} read pairs",
            format_count(m.unpaired_reads_examined),
            format_count(m.read_pairs_examined)
        );
        log::info!(
            "  Duplicates: {} unpaired, {} pairs ({} optical)",
            format_count(m.unpaired_read_duplicates),
            format_count(m.read_pair_duplicates),
            format_count(m.read_pair_optical_duplicates + m.unpaired_read_optical_duplicates)
        );
        log::info!("  Percent duplication: {}", format_percent(m.percent_duplication, 2));
        if let Some(size) = m.estimated_library_size {
            log::info!("  Estimated library size: {}", format_count(size));
        }
    }
}

/// Times a named operation and logs its completion with a record count and rate.
///
/// ```no_run
/// use fgmarkdup_lib::logging::OperationTimer;
///
/// let timer = OperationTimer::new("Resolving pair duplicate sets");
/// // ... work ...
/// timer.log_completion(10_000);
/// ```
pub struct OperationTimer {
    operation: String,
    start_time: Instant,
}

impl OperationTimer {
    /// Starts the timer and logs the start of the operation.
    #[must_use]
    pub fn new(operation: &str) -> Self {
        log::info!("{operation} ...");
        Self { operation: operation.to_string(), start_time: Instant::now() }
    }

    /// Logs completion with the number of items processed.
    pub fn log_completion(&self, count: u64) {
        let elapsed = self.start_time.elapsed();
        log::info!(
            "{} completed: {} in {} ({})",
            self.operation,
            format_count(count),
            format_duration(elapsed),
            format_rate(count, elapsed)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(0.5, 1), "50.0%");
        assert_eq!(format_percent(1.0, 0), "100%");
        assert_eq!(format_percent(0.0, 2), "0.00%");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(135)), "2m 15s");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h 30m");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(2000, Duration::from_secs(2)), "1,000 records/s");
        assert_eq!(format_rate(30, Duration::from_secs(60)), "30.0 records/min");
        assert!(format_rate(5, Duration::from_nanos(1)).ends_with("records/s"));
    }

    #[test]
    fn test_log_duplication_summary() {
        let mut metrics = DuplicationMetrics::new("lib");
        metrics.read_pairs_examined = 100;
        metrics.read_pair_duplicates = 10;
        metrics.calculate_derived_fields();
        log_duplication_summary(&[metrics, DuplicationMetrics::default()]);
    }
}

//! Utilities for writing metrics files.

use anyhow::{Context, Result};
use fgoxide::io::DelimFile;
use serde::Serialize;
use std::path::Path;

use crate::Metric;

/// Writes metrics to a TSV file with a header line.
///
/// # Arguments
/// * `path` - Path to the output TSV file
/// * `metrics` - The rows to write
/// * `description` - Human-readable description of the metrics for error messages
///
/// # Errors
/// Returns an error if the file cannot be created or written to.
pub fn write_metrics<P: AsRef<Path>, T: Serialize>(
    path: P,
    metrics: &[T],
    description: &str,
) -> Result<()> {
    let path_ref = path.as_ref();
    DelimFile::default()
        .write_tsv(&path_ref, metrics)
        .with_context(|| format!("Failed to write {} metrics: {}", description, path_ref.display()))
}

/// Writes metrics implementing [`Metric`], using the metric's own name in error messages.
///
/// # Errors
/// Returns an error if the file cannot be created or written to.
pub fn write_metrics_auto<P: AsRef<Path>, T: Metric>(path: P, metrics: &[T]) -> Result<()> {
    write_metrics(path, metrics, T::metric_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DuplicationMetrics;
    use tempfile::TempDir;

    #[test]
    fn test_write_duplication_metrics() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dup.txt");

        let mut metrics = DuplicationMetrics::new("lib1");
        metrics.read_pairs_examined = 4;
        metrics.read_pair_duplicates = 1;
        metrics.calculate_derived_fields();
        write_metrics_auto(&path, &[metrics.clone()]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("library\tunpaired_reads_examined\tread_pairs_examined"));
        assert!(header.ends_with("percent_duplication\testimated_library_size"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("lib1\t0\t4\t"));
        assert!(row.contains("0.250000"));

        let read_back: Vec<DuplicationMetrics> = DelimFile::default().read_tsv(&path).unwrap();
        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back[0].read_pair_duplicates, 1);
        assert_eq!(read_back[0].estimated_library_size, metrics.estimated_library_size);
    }

    #[test]
    fn test_write_metrics_bad_path() {
        let metrics = [DuplicationMetrics::default()];
        let result = write_metrics("/nonexistent/dir/metrics.txt", &metrics, "test");
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to write test metrics"));
    }
}

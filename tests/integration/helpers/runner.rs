//! Running the `fgmarkdup` binary and reading its outputs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use fgmarkdup_lib::bam_io::create_bam_reader;
use fgmarkdup_lib::metrics::DuplicationMetrics;
use fgmarkdup_lib::sam::builder::SamBuilder;
use fgoxide::io::DelimFile;
use noodles::sam::Header;
use noodles::sam::alignment::record_buf::RecordBuf;
use tempfile::TempDir;

/// Scratch directory holding an input BAM and the paths for every output.
pub struct MarkdupRun {
    pub dir: TempDir,
    pub input: PathBuf,
    pub output: PathBuf,
    pub metrics: PathBuf,
}

impl MarkdupRun {
    /// Writes `builder`'s records, coordinate sorted, to a fresh input BAM.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory or BAM cannot be created.
    pub fn new(builder: &SamBuilder) -> Self {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input.bam");
        builder.write_sorted_bam(&input).unwrap();
        Self {
            output: dir.path().join("output.bam"),
            metrics: dir.path().join("metrics.txt"),
            input,
            dir,
        }
    }

    /// Runs `fgmarkdup markdup` with the standard paths plus `extra` arguments.
    ///
    /// # Panics
    ///
    /// Panics if the binary cannot be started.
    pub fn run(&self, extra: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_fgmarkdup"))
            .arg("markdup")
            .arg("--input")
            .arg(&self.input)
            .arg("--output")
            .arg(&self.output)
            .arg("--metrics")
            .arg(&self.metrics)
            .args(extra)
            .output()
            .expect("Failed to run fgmarkdup markdup")
    }

    /// Runs the command and asserts that it succeeded.
    ///
    /// # Panics
    ///
    /// Panics if the command fails.
    pub fn run_ok(&self, extra: &[&str]) {
        let output = self.run(extra);
        assert!(
            output.status.success(),
            "markdup failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Reads the output BAM.
    ///
    /// # Panics
    ///
    /// Panics if the output cannot be read.
    pub fn records(&self) -> (Header, Vec<RecordBuf>) {
        read_bam(&self.output)
    }

    /// Reads the metrics file.
    ///
    /// # Panics
    ///
    /// Panics if the metrics cannot be parsed.
    pub fn metrics(&self) -> Vec<DuplicationMetrics> {
        DelimFile::default().read_tsv(&self.metrics).unwrap()
    }

    #[must_use]
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Reads every record of a BAM file.
///
/// # Panics
///
/// Panics if the file cannot be read.
pub fn read_bam(path: &Path) -> (Header, Vec<RecordBuf>) {
    let (mut reader, header) = create_bam_reader(path, 1).unwrap();
    let records = reader.record_bufs(&header).map(|r| r.unwrap()).collect();
    (header, records)
}

/// Names of the records flagged as duplicates, sorted and deduplicated.
#[must_use]
pub fn duplicate_names(records: &[RecordBuf]) -> Vec<String> {
    let mut names: Vec<String> = records
        .iter()
        .filter(|r| r.flags().is_duplicate())
        .filter_map(|r| r.name().map(ToString::to_string))
        .collect();
    names.sort();
    names.dedup();
    names
}

//! Duplicate marking command.
//!
//! Marks (or removes) PCR and optical duplicates in a coordinate-sorted BAM file, writing
//! per-library duplication metrics and, optionally, a return-on-investment histogram.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use itertools::Itertools;
use log::info;

use fgmarkdup_lib::duplicates::FragmentPolicy;
use fgmarkdup_lib::logging::{OperationTimer, log_duplication_summary};
use fgmarkdup_lib::markdup::{
    MarkDuplicatesEngine, MarkDuplicatesOptions, MarkDuplicatesSummary, ProgramInfo,
    TaggingPolicy,
};
use fgmarkdup_lib::metrics::{RoiHistogramMetric, format_count, write_metrics_auto};
use fgmarkdup_lib::read_ends::{BarcodeTags, ScoringStrategy};
use fgmarkdup_lib::validation::validate_tag;

use crate::commands::command::Command;
use crate::commands::common::{
    BamIoOptions, CompressionOptions, OpticalOptions, SpillOptions, ThreadingOptions,
};

/// Duplicate marking command.
#[derive(Debug, Parser)]
#[command(
    name = "markdup",
    about = "\x1b[38;5;151m[MARKDUP]\x1b[0m       \x1b[36mMark or remove PCR and optical duplicates\x1b[0m",
    long_about = r#"
Marks or removes PCR and optical duplicates in a coordinate-sorted BAM file.

Reads are compared by library, the unclipped 5' position and strand of each end, and, for pairs,
the position of the mate. Within each set of duplicates the read (or pair) with the highest score
is kept and all others are flagged with 0x400. Duplicates whose tile and x/y position (parsed from
the read name) lie within --optical-pixel-distance of another member are also counted as optical
duplicates.

Memory is bounded by --max-records-in-ram, shared by duplication keys, mates waiting for their
partner and duplicate decisions: anything beyond the budget is sorted and spilled to temporary
files, then merged back in order.

With --barcode-tag (and/or --read-one-barcode-tag, --read-two-barcode-tag) reads at the same
position are only duplicates when their molecular barcodes also match. The input is read twice, so it must be a
file rather than standard input.

# Outputs

- The input records, in their original order, with duplicate flags set or cleared
- Per-library duplication metrics (--metrics)
- An optional return-on-investment histogram (--histogram)
"#
)]
pub struct MarkDuplicates {
    /// Input and output BAM files
    #[command(flatten)]
    pub io: BamIoOptions,

    /// Path to write per-library duplication metrics
    #[arg(short = 'm', long = "metrics")]
    pub metrics: PathBuf,

    /// Path to write the return-on-investment histogram
    #[arg(short = 'H', long = "histogram")]
    pub histogram: Option<PathBuf>,

    /// Memory and temporary file options
    #[command(flatten)]
    pub spill: SpillOptions,

    /// Read-name parsing and optical duplicate options
    #[command(flatten)]
    pub optical: OpticalOptions,

    /// How the representative of a duplicate set is chosen
    #[arg(long = "scoring-strategy", value_enum, default_value_t = ScoringStrategy::default())]
    pub scoring_strategy: ScoringStrategy,

    /// How unpaired reads sharing a position with read pairs are treated
    #[arg(long = "fragment-policy", value_enum, default_value_t = FragmentPolicy::default())]
    pub fragment_policy: FragmentPolicy,

    /// Tag every member of a duplicate set with DI (representative name) and DS (set size)
    #[arg(long = "tag-duplicate-set-members", default_value_t = false)]
    pub tag_duplicate_set_members: bool,

    /// Which duplicates receive a DT tag
    #[arg(long = "tagging-policy", value_enum, default_value_t = TaggingPolicy::default())]
    pub tagging_policy: TaggingPolicy,

    /// Remove DT tags already present on input records
    #[arg(long = "clear-dt", default_value_t = true, action = clap::ArgAction::Set)]
    pub clear_dt: bool,

    /// Remove all duplicates instead of marking them
    #[arg(short = 'r', long = "remove-duplicates", default_value_t = false)]
    pub remove_duplicates: bool,

    /// Remove optical duplicates only
    #[arg(long = "remove-sequencing-duplicates", default_value_t = false)]
    pub remove_sequencing_duplicates: bool,

    /// Tag holding a molecular barcode shared by both reads of a pair (e.g. BC)
    #[arg(long = "barcode-tag")]
    pub barcode_tag: Option<String>,

    /// Tag holding the barcode of the first read of a pair
    #[arg(long = "read-one-barcode-tag")]
    pub read_one_barcode_tag: Option<String>,

    /// Tag holding the barcode of the second read of a pair
    #[arg(long = "read-two-barcode-tag")]
    pub read_two_barcode_tag: Option<String>,

    /// Treat the input as coordinate sorted regardless of the header's sort order
    #[arg(long = "assume-sorted", default_value_t = false)]
    pub assume_sorted: bool,

    /// Threading options
    #[command(flatten)]
    pub threading: ThreadingOptions,

    /// Compression options for output BAM
    #[command(flatten)]
    pub compression: CompressionOptions,
}

impl MarkDuplicates {
    /// Checks every option before any file is opened.
    fn validate(&self) -> Result<()> {
        self.io.validate()?;
        self.spill.validate()?;
        self.optical.validate()?;
        self.threading.validate()?;
        self.compression.validate()?;
        self.barcode_tags()?;
        Ok(())
    }

    fn barcode_tags(&self) -> Result<BarcodeTags> {
        let parse = |name: &Option<String>, parameter: &str| {
            name.as_deref().map(|name| validate_tag(name, parameter)).transpose()
        };
        Ok(BarcodeTags {
            barcode: parse(&self.barcode_tag, "barcode-tag")?,
            read_one: parse(&self.read_one_barcode_tag, "read-one-barcode-tag")?,
            read_two: parse(&self.read_two_barcode_tag, "read-two-barcode-tag")?,
        })
    }

    fn engine_options(&self, command_line: &str) -> Result<MarkDuplicatesOptions> {
        Ok(MarkDuplicatesOptions {
            max_records_in_ram: self.spill.max_records_in_ram,
            temp_dir: self.spill.tmp_dir.clone(),
            threads: self.threading.threads,
            compression_level: self.compression.compression_level,
            scoring: self.scoring_strategy,
            fragment_policy: self.fragment_policy,
            optical_finder: self.optical.finder(),
            tag_duplicate_set_members: self.tag_duplicate_set_members,
            tagging_policy: self.tagging_policy,
            clear_dt: self.clear_dt,
            remove_duplicates: self.remove_duplicates,
            remove_sequencing_duplicates: self.remove_sequencing_duplicates,
            assume_sorted: self.assume_sorted,
            barcode_tags: self.barcode_tags()?,
            program: Some(ProgramInfo {
                version: crate::version::VERSION.to_string(),
                command_line: command_line.to_string(),
            }),
        })
    }

    fn log_options(&self) {
        info!("Starting markdup");
        info!("Input: {}", self.io.input.display());
        info!("Output: {}", self.io.output.display());
        info!("Metrics: {}", self.metrics.display());
        info!("Max records in RAM: {}", format_count(self.spill.max_records_in_ram as u64));
        info!("Scoring strategy: {:?}", self.scoring_strategy);
        info!("Fragment policy: {:?}", self.fragment_policy);
        info!(
            "Optical pixel distance: {} ({:?})",
            self.optical.optical_pixel_distance, self.optical.optical_distance_metric
        );
        match &self.optical.read_name_regex {
            Some(regex) => info!("Read name regex: {regex}"),
            None => info!(
                "Read name fields: '{}'-delimited, {} fields",
                self.optical.read_name_delimiter,
                self.optical.read_name_field_counts.iter().join(" or ")
            ),
        }
        info!("Tagging policy: {:?}", self.tagging_policy);
        for (label, tag) in [
            ("Barcode tag", &self.barcode_tag),
            ("Read one barcode tag", &self.read_one_barcode_tag),
            ("Read two barcode tag", &self.read_two_barcode_tag),
        ] {
            if let Some(tag) = tag {
                info!("{label}: {tag}");
            }
        }
        info!("Remove duplicates: {}", self.remove_duplicates);
        info!("Remove sequencing duplicates: {}", self.remove_sequencing_duplicates);
        info!("{}", self.threading.log_message());
    }
}

impl Command for MarkDuplicates {
    fn execute(&self, command_line: &str) -> Result<()> {
        self.validate()?;
        self.log_options();

        let timer = OperationTimer::new("Marking duplicates");
        let engine =
            MarkDuplicatesEngine::new(self.engine_options(command_line)?, self.optical.parser()?);
        let summary = engine.run(&self.io.input, &self.io.output)?;

        write_metrics_auto(&self.metrics, &summary.metrics)?;
        info!("Wrote duplication metrics to {}", self.metrics.display());
        if let Some(path) = &self.histogram {
            write_roi_histogram(&summary, path)?;
        }

        log_run_summary(&summary);
        log_duplication_summary(&summary.metrics);
        timer.log_completion(summary.records_read);
        Ok(())
    }
}

/// Writes the ROI curve of every library whose size could be estimated.
fn write_roi_histogram(summary: &MarkDuplicatesSummary, path: &Path) -> Result<()> {
    let rows: Vec<RoiHistogramMetric> =
        summary.metrics.iter().flat_map(|metrics| metrics.roi_histogram()).collect();
    if rows.is_empty() {
        info!("No library size could be estimated; the ROI histogram will be empty");
    }
    write_metrics_auto(path, &rows)?;
    info!("Wrote ROI histogram to {}", path.display());
    Ok(())
}

fn log_run_summary(summary: &MarkDuplicatesSummary) {
    info!(
        "Read {} records; wrote {} and removed {}",
        format_count(summary.records_read),
        format_count(summary.records_written),
        format_count(summary.records_removed)
    );
    info!(
        "Examined {} fragment ends and {} pair ends; spilled {} chunk(s), peak {} keys in memory",
        format_count(summary.fragment_ends),
        format_count(summary.pair_ends),
        summary.spill_files,
        format_count(summary.peak_resident as u64)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use noodles::sam::alignment::record::data::field::Tag;

    fn parse(args: &[&str]) -> MarkDuplicates {
        let mut argv = vec!["markdup", "-i", "in.bam", "-o", "out.bam", "-m", "metrics.txt"];
        argv.extend_from_slice(args);
        MarkDuplicates::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cmd = parse(&[]);
        assert_eq!(cmd.spill.max_records_in_ram, 500_000);
        assert_eq!(cmd.optical.optical_pixel_distance, 100);
        assert_eq!(cmd.optical.read_name_field_counts, vec![5, 7]);
        assert_eq!(cmd.optical.read_name_delimiter, ':');
        assert_eq!(cmd.fragment_policy, FragmentPolicy::Independent);
        assert_eq!(cmd.tagging_policy, TaggingPolicy::DontTag);
        assert!(cmd.clear_dt);
        assert!(!cmd.remove_duplicates);
        assert_eq!(cmd.threading.threads, 1);
        assert_eq!(cmd.compression.compression_level, 1);
    }

    #[test]
    fn test_parses_enums_and_lists() {
        let cmd = parse(&[
            "--tagging-policy",
            "optical-only",
            "--fragment-policy",
            "pairs-win",
            "--scoring-strategy",
            "total-mapped-reference-length",
            "--read-name-field-counts",
            "7",
            "--clear-dt",
            "false",
            "--optical-distance-metric",
            "chebyshev",
        ]);
        assert_eq!(cmd.tagging_policy, TaggingPolicy::OpticalOnly);
        assert_eq!(cmd.fragment_policy, FragmentPolicy::PairsWin);
        assert_eq!(cmd.scoring_strategy, ScoringStrategy::TotalMappedReferenceLength);
        assert_eq!(cmd.optical.read_name_field_counts, vec![7]);
        assert!(!cmd.clear_dt);
    }

    #[test]
    fn test_engine_options_carry_flags() {
        let cmd = parse(&["--remove-sequencing-duplicates", "--assume-sorted", "--threads", "4"]);
        let options = cmd.engine_options("fgmarkdup markdup").unwrap();
        assert!(options.barcode_tags.is_empty());
        assert!(options.remove_sequencing_duplicates);
        assert!(options.assume_sorted);
        assert_eq!(options.threads, 4);
        assert_eq!(options.program.unwrap().command_line, "fgmarkdup markdup");
    }

    #[test]
    fn test_barcode_tags_reach_engine_options() {
        let cmd = parse(&["--barcode-tag", "BC", "--read-two-barcode-tag", "R2"]);
        let tags = cmd.engine_options("fgmarkdup markdup").unwrap().barcode_tags;
        assert_eq!(tags.barcode, Some(Tag::new(b'B', b'C')));
        assert_eq!(tags.read_one, None);
        assert_eq!(tags.read_two, Some(Tag::new(b'R', b'2')));
    }

    #[test]
    fn test_malformed_barcode_tag_is_rejected() {
        let cmd = parse(&["--read-one-barcode-tag", "BCX"]);
        let err = cmd.barcode_tags().unwrap_err().to_string();
        assert!(err.contains("read-one-barcode-tag"));
    }

    #[test]
    fn test_missing_input_fails_validation() {
        let cmd = parse(&[]);
        assert!(cmd.validate().unwrap_err().to_string().contains("does not exist"));
    }
}

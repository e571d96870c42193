//! Two-pass duplicate marking of a coordinate-sorted BAM.
//!
//! # Algorithm
//!
//! 1. Scan the input, building a fragment key for every primary mapped record and a pair key for
//!    every pair whose mates are both mapped. Keys are buffered in two spillable
//!    [`SortingCollection`]s.
//! 2. Merge each collection in key order, group equal keys and resolve every group into
//!    representative, duplicate and optical-duplicate decisions, recorded by record ordinal.
//! 3. Re-read the input and write every record in its original order, applying the decisions and
//!    collecting per-library metrics.
//!
//! Secondary, supplementary and unmapped records never carry the duplicate flag.
//!
//! # Memory
//!
//! `max_records_in_ram` bounds every spillable structure together. They all count into one
//! [`ResidencyTracker`], and the budget is split by [`MemoryPlan`] between the structures that are
//! alive at the same time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use log::{debug, info, warn};
use noodles::sam::alignment::io::Write as _;
use noodles::sam::alignment::record::Flags;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::alignment::record_buf::data::field::Value;

use fgmarkdup_metrics::DuplicationMetrics;

use crate::bam_io::{create_bam_reader, create_bam_writer, finish_bam_writer};
use crate::duplicates::{
    DuplicateAccumulator, DuplicateMarks, DuplicateSetHistogram, FragmentPolicy, OutputDecision,
    resolve_fragments, resolve_pairs,
};
use crate::header::add_pg_record;
use crate::library::LibraryIndex;
use crate::logging::{OperationTimer, format_count};
use crate::optical::{LocationParser, OpticalDuplicateFinder};
use crate::pending::PendingMates;
use crate::progress::ProgressTracker;
use crate::read_ends::{BarcodeTags, ReadEnds, ScoringStrategy, SignatureBuilder};
use crate::sam::{has_mapped_mate, is_coordinate_sorted, is_secondary_or_supplementary};
use crate::sort::{DEFAULT_MAX_RECORDS_IN_RAM, GroupBy, ResidencyTracker, SortingCollection};

/// Tag recording the duplicate type (`SQ` optical, `LB` library).
pub const DUPLICATE_TYPE_TAG: Tag = Tag::new(b'D', b'T');
/// Tag naming the representative read of a duplicate set.
pub const DUPLICATE_SET_REPRESENTATIVE_TAG: Tag = Tag::new(b'D', b'I');
/// Tag holding the size of a duplicate set.
pub const DUPLICATE_SET_SIZE_TAG: Tag = Tag::new(b'D', b'S');

const DUPLICATE_TYPE_SEQUENCING: &str = "SQ";
const DUPLICATE_TYPE_LIBRARY: &str = "LB";

/// Which duplicates get a `DT` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TaggingPolicy {
    #[default]
    DontTag,
    /// `DT:Z:SQ` on optical duplicates only.
    OpticalOnly,
    /// `DT:Z:SQ` on optical duplicates and `DT:Z:LB` on all others.
    All,
}

/// Identity written to the output's `@PG` record.
#[derive(Debug, Clone)]
pub struct ProgramInfo {
    pub version: String,
    pub command_line: String,
}

/// How the record budget is split between structures that are alive at the same time.
///
/// The scan holds the pair keys, the fragment keys and the pending mates. Resolution merges the
/// two key collections while the decision collections fill, so the decisions take the third that
/// the pending mates have released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPlan {
    /// Budget of each of the pair and fragment key collections.
    pub keys: usize,
    /// Budget for sorting mates parked across references.
    pub pending_mates: usize,
    /// Budget shared by the three decision collections.
    pub decisions: usize,
}

impl MemoryPlan {
    #[must_use]
    pub fn new(max_records_in_ram: usize) -> Self {
        let third = (max_records_in_ram / 3).max(1);
        Self { keys: third, pending_mates: third, decisions: third }
    }
}

/// Options for a duplicate-marking run.
#[derive(Debug, Clone)]
pub struct MarkDuplicatesOptions {
    /// Items held in memory by all spillable structures together.
    pub max_records_in_ram: usize,
    pub temp_dir: Option<PathBuf>,
    pub threads: usize,
    pub compression_level: u32,
    pub scoring: ScoringStrategy,
    /// Tags whose values split duplicate sets.
    pub barcode_tags: BarcodeTags,
    pub fragment_policy: FragmentPolicy,
    pub optical_finder: OpticalDuplicateFinder,
    /// Adds `DI`/`DS` to every member of a duplicate set.
    pub tag_duplicate_set_members: bool,
    pub tagging_policy: TaggingPolicy,
    /// Drops any `DT` tag already on the input records.
    pub clear_dt: bool,
    pub remove_duplicates: bool,
    pub remove_sequencing_duplicates: bool,
    /// Skips the `SO:coordinate` header check.
    pub assume_sorted: bool,
    pub program: Option<ProgramInfo>,
}

impl Default for MarkDuplicatesOptions {
    fn default() -> Self {
        Self {
            max_records_in_ram: DEFAULT_MAX_RECORDS_IN_RAM,
            temp_dir: None,
            threads: 1,
            compression_level: 1,
            scoring: ScoringStrategy::default(),
            barcode_tags: BarcodeTags::default(),
            fragment_policy: FragmentPolicy::default(),
            optical_finder: OpticalDuplicateFinder::default(),
            tag_duplicate_set_members: false,
            tagging_policy: TaggingPolicy::default(),
            clear_dt: true,
            remove_duplicates: false,
            remove_sequencing_duplicates: false,
            assume_sorted: false,
            program: None,
        }
    }
}

/// Outcome of a duplicate-marking run.
#[derive(Debug, Clone, Default)]
pub struct MarkDuplicatesSummary {
    pub records_read: u64,
    pub records_written: u64,
    pub records_removed: u64,
    /// Records written or removed with the duplicate flag.
    pub duplicate_records: u64,
    pub optical_duplicate_records: u64,
    pub fragment_ends: u64,
    pub pair_ends: u64,
    pub pair_sets: u64,
    pub fragment_sets: u64,
    /// Mates flagged as mapped whose partner never appeared.
    pub unmatched_mates: usize,
    /// Spill files written by the key collections.
    pub spill_files: usize,
    /// Most items held in memory at once by all spillable structures together.
    pub peak_resident: usize,
    /// One row per library that had records.
    pub metrics: Vec<DuplicationMetrics>,
    /// Duplicate-set size histograms by library name.
    pub histograms: BTreeMap<String, DuplicateSetHistogram>,
}

/// Marks duplicates in a coordinate-sorted BAM file.
pub struct MarkDuplicatesEngine {
    options: MarkDuplicatesOptions,
    parser: Box<dyn LocationParser>,
}

impl MarkDuplicatesEngine {
    #[must_use]
    pub fn new(options: MarkDuplicatesOptions, parser: Box<dyn LocationParser>) -> Self {
        Self { options, parser }
    }

    /// Reads `input` twice and writes the marked records to `output`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not coordinate sorted, contains a mapped record without a
    /// position, or if any file or spill operation fails.
    pub fn run(self, input: &Path, output: &Path) -> Result<MarkDuplicatesSummary> {
        let Self { options, parser } = self;
        let (mut reader, header) = create_bam_reader(input, options.threads)?;
        if !options.assume_sorted && !is_coordinate_sorted(&header) {
            bail!(
                "Input BAM must be coordinate sorted (SO:coordinate): {}\n\n\
                 To sort your BAM file, run:\n  samtools sort input.bam -o sorted.bam\n\
                 or pass --assume-sorted if the records are already in coordinate order.",
                input.display()
            );
        }

        let plan = MemoryPlan::new(options.max_records_in_ram);
        let tracker = ResidencyTracker::new();
        debug!("Memory plan for {} records: {plan:?}", options.max_records_in_ram);

        let libraries = LibraryIndex::from_header(&header);
        let pending = PendingMates::new(plan.pending_mates)
            .temp_dir(options.temp_dir.clone())
            .threads(options.threads)
            .tracker(tracker.clone());
        let mut signatures = SignatureBuilder::new(libraries.clone(), parser, options.scoring)
            .with_barcode_tags(options.barcode_tags)
            .with_pending_mates(pending);
        let mut pairs = key_collection("pair keys", &options, plan.keys, &tracker);
        let mut fragments = key_collection("fragment keys", &options, plan.keys, &tracker);
        let mut summary = MarkDuplicatesSummary::default();

        // Pass 1: build keys
        let timer = OperationTimer::new("Building duplication keys");
        let progress = ProgressTracker::new("Scanned records");
        for (index, result) in reader.record_bufs(&header).enumerate() {
            let record = result
                .with_context(|| format!("Failed to read record from {}", input.display()))?;
            let observation = signatures.observe(&record, index as u64)?;
            if let Some(fragment) = observation.fragment {
                fragments.add(fragment)?;
            }
            if let Some(pair) = observation.pair {
                pairs.add(pair)?;
            }
            progress.log_if_needed(1);
        }
        progress.log_final();
        summary.records_read = progress.count();
        summary.fragment_ends = fragments.len();
        summary.pair_ends = pairs.len();
        summary.unmatched_mates = signatures.pending_count();
        if summary.unmatched_mates > 0 {
            warn!(
                "{} mapped reads had a mapped mate that was never found; they were examined as fragments only",
                format_count(summary.unmatched_mates as u64)
            );
        }
        summary.spill_files = pairs.stats().chunks_written + fragments.stats().chunks_written;
        drop(signatures);
        timer.log_completion(summary.records_read);
        drop(reader);

        // Resolve duplicate sets
        let timer = OperationTimer::new("Resolving duplicate sets");
        let mut accumulator = DuplicateAccumulator::new(
            plan.decisions,
            options.temp_dir.clone(),
            options.threads,
            &tracker,
        );
        let pair_iter = pairs.into_sorted_iter()?;
        for group in GroupBy::new(pair_iter, ReadEnds::same_pair_key) {
            resolve_pairs(
                &group?,
                &options.optical_finder,
                options.tag_duplicate_set_members,
                &mut accumulator,
            )?;
        }
        let fragment_iter = fragments.into_sorted_iter()?;
        for group in GroupBy::new(fragment_iter, ReadEnds::same_fragment_key) {
            resolve_fragments(
                &group?,
                options.fragment_policy,
                &options.optical_finder,
                options.tag_duplicate_set_members,
                &mut accumulator,
            )?;
        }
        (summary.pair_sets, summary.fragment_sets) = accumulator.set_counts();
        info!(
            "Found {} duplicate and {} optical duplicate records in {} pair and {} fragment sets",
            format_count(accumulator.duplicate_count()),
            format_count(accumulator.optical_count()),
            format_count(summary.pair_sets),
            format_count(summary.fragment_sets)
        );
        timer.log_completion(summary.pair_ends + summary.fragment_ends);
        let mut marks = accumulator.finish()?;

        // Pass 2: write
        let timer = OperationTimer::new("Writing marked records");
        let (mut reader, header) = create_bam_reader(input, options.threads)?;
        let header = match &options.program {
            Some(program) => add_pg_record(header, &program.version, &program.command_line)?,
            None => header,
        };
        let mut writer =
            create_bam_writer(output, &header, options.threads, options.compression_level)?;
        let mut counter = LibraryCounter::new(&libraries);
        let progress = ProgressTracker::new("Wrote records");

        for (index, result) in reader.record_bufs(&header).enumerate() {
            let mut record = result
                .with_context(|| format!("Failed to read record from {}", input.display()))?;
            let decision = next_decision(&mut marks, &record, index as u64)?;
            counter.count(&record, &decision);
            if decision.duplicate {
                summary.duplicate_records += 1;
            }
            if decision.optical {
                summary.optical_duplicate_records += 1;
            }

            if (options.remove_duplicates && decision.duplicate)
                || (options.remove_sequencing_duplicates && decision.optical)
            {
                summary.records_removed += 1;
                continue;
            }

            apply_decision(&mut record, &decision, &options);
            writer
                .write_alignment_record(&header, &record)
                .with_context(|| format!("Failed to write record to {}", output.display()))?;
            summary.records_written += 1;
            progress.log_if_needed(1);
        }
        progress.log_final();
        finish_bam_writer(writer, output)?;
        timer.log_completion(summary.records_written);

        summary.metrics = counter.finish();
        summary.histograms = marks
            .histograms()
            .iter()
            .map(|(&id, h)| (libraries.library_name(id).to_string(), h.clone()))
            .collect();
        for (library, histogram) in &summary.histograms {
            debug!(
                "Library '{library}': largest duplicate set has {} members",
                histogram.max_set_size()
            );
        }
        summary.peak_resident = tracker.peak();
        Ok(summary)
    }
}

fn key_collection(
    name: &str,
    options: &MarkDuplicatesOptions,
    max_records_in_ram: usize,
    tracker: &ResidencyTracker,
) -> SortingCollection<ReadEnds> {
    SortingCollection::builder(name)
        .max_records_in_ram(max_records_in_ram)
        .temp_dir(options.temp_dir.clone())
        .threads(options.threads)
        .tracker(tracker.clone())
        .build()
}

/// The decision for one record; only primary mapped records can be duplicates.
fn next_decision(
    marks: &mut DuplicateMarks,
    record: &RecordBuf,
    index: u64,
) -> Result<OutputDecision> {
    let decision = marks.decision_for(index)?;
    let flags = record.flags();
    if flags.is_unmapped() || is_secondary_or_supplementary(record) {
        return Ok(OutputDecision::default());
    }
    Ok(decision)
}

/// Sets the duplicate flag and tags on a record being written.
fn apply_decision(record: &mut RecordBuf, decision: &OutputDecision, options: &MarkDuplicatesOptions) {
    record.flags_mut().set(Flags::DUPLICATE, decision.duplicate);

    let data = record.data_mut();
    if options.clear_dt {
        data.remove(&DUPLICATE_TYPE_TAG);
    }
    if decision.duplicate {
        let duplicate_type = match options.tagging_policy {
            TaggingPolicy::DontTag => None,
            TaggingPolicy::OpticalOnly => decision.optical.then_some(DUPLICATE_TYPE_SEQUENCING),
            TaggingPolicy::All if decision.optical => Some(DUPLICATE_TYPE_SEQUENCING),
            TaggingPolicy::All => Some(DUPLICATE_TYPE_LIBRARY),
        };
        if let Some(duplicate_type) = duplicate_type {
            data.insert(DUPLICATE_TYPE_TAG, Value::from(duplicate_type.to_string()));
        }
    }
    if let Some(tag) = &decision.set_tag {
        data.insert(
            DUPLICATE_SET_REPRESENTATIVE_TAG,
            Value::String(tag.representative.clone()),
        );
        data.insert(
            DUPLICATE_SET_SIZE_TAG,
            Value::from(i32::try_from(tag.set_size).unwrap_or(i32::MAX)),
        );
    }
}

/// Per-library metric counts gathered during the output pass.
///
/// Pair counts are kept per read and halved when finishing.
struct LibraryCounter<'a> {
    libraries: &'a LibraryIndex,
    rows: Vec<Option<DuplicationMetrics>>,
}

impl<'a> LibraryCounter<'a> {
    fn new(libraries: &'a LibraryIndex) -> Self {
        Self { libraries, rows: vec![None; libraries.len()] }
    }

    fn count(&mut self, record: &RecordBuf, decision: &OutputDecision) {
        let library = self.libraries.for_record(record).library;
        let name = self.libraries.library_name(library);
        let row =
            self.rows[usize::from(library)].get_or_insert_with(|| DuplicationMetrics::new(name));

        if record.flags().is_unmapped() {
            row.unmapped_reads += 1;
        } else if is_secondary_or_supplementary(record) {
            row.secondary_or_supplementary_rds += 1;
        } else if has_mapped_mate(record) {
            row.read_pairs_examined += 1;
            row.read_pair_duplicates += u64::from(decision.duplicate);
            row.read_pair_optical_duplicates += u64::from(decision.optical);
        } else {
            row.unpaired_reads_examined += 1;
            row.unpaired_read_duplicates += u64::from(decision.duplicate);
            row.unpaired_read_optical_duplicates += u64::from(decision.optical);
        }
    }

    /// Rows in header order, with the unknown library last.
    fn finish(self) -> Vec<DuplicationMetrics> {
        let mut rows: Vec<DuplicationMetrics> = Vec::new();
        let mut unknown = None;
        for (id, row) in self.rows.into_iter().enumerate() {
            let Some(mut row) = row else { continue };
            row.read_pairs_examined /= 2;
            row.read_pair_duplicates /= 2;
            row.read_pair_optical_duplicates /= 2;
            row.calculate_derived_fields();
            if id == 0 {
                unknown = Some(row);
            } else {
                rows.push(row);
            }
        }
        rows.extend(unknown);
        rows
    }
}

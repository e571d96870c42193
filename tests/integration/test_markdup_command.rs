//! End-to-end CLI tests for the markdup command.
//!
//! These tests run the actual `fgmarkdup markdup` binary and validate:
//! 1. Duplicate flags on pairs and fragments
//! 2. Metrics and histogram output
//! 3. Optical duplicates and DT tagging
//! 4. Removal modes
//! 5. Identical results when keys spill to disk
//! 6. Barcode-aware duplicate sets

use approx::assert_relative_eq;
use fgmarkdup_lib::sam::builder::{SamBuilder, Strand};
use noodles::sam::alignment::record::data::field::Tag;
use rstest::rstest;

use crate::helpers::{
    MarkdupRun, assert_dt_tag, assert_mates_agree, assert_string_tag, duplicate_names,
};

fn quals(q: u8) -> Vec<u8> {
    vec![q; 100]
}

/// Three pairs sharing both ends plus one pair whose mate maps elsewhere.
fn pair_builder() -> SamBuilder {
    let mut builder = SamBuilder::new();
    builder.add_pair().name("keep").start1(1000).start2(1300).quals1(&quals(38)).build();
    builder.add_pair().name("dupA").start1(1000).start2(1300).build();
    builder.add_pair().name("dupB").start1(1000).start2(1300).build();
    builder.add_pair().name("distinct").start1(1000).start2(1500).build();
    builder
}

/// Pairs on one tile: two close together, one far away.
fn optical_builder() -> SamBuilder {
    let mut builder = SamBuilder::new();
    builder
        .add_pair()
        .name("M1:7:FC:1:1101:1000:1000")
        .start1(2000)
        .start2(2250)
        .quals1(&quals(38))
        .build();
    builder.add_pair().name("M1:7:FC:1:1101:1040:1030").start1(2000).start2(2250).build();
    builder.add_pair().name("M1:7:FC:1:1101:9000:9000").start1(2000).start2(2250).build();
    builder
}

#[test]
fn test_markdup_marks_pairs() {
    let run = MarkdupRun::new(&pair_builder());
    run.run_ok(&[]);

    let (header, records) = run.records();
    assert_eq!(records.len(), 8, "Marking must not drop records");
    assert_eq!(duplicate_names(&records), vec!["dupA", "dupB"]);
    assert_mates_agree(&records);
    assert!(
        header.programs().as_ref().keys().any(|id| id.starts_with(b"fgmarkdup")),
        "Output should carry an @PG record"
    );

    let metrics = run.metrics();
    assert_eq!(metrics.len(), 1);
    let lib = &metrics[0];
    assert_eq!(lib.library, "lib1");
    assert_eq!(lib.read_pairs_examined, 4);
    assert_eq!(lib.read_pair_duplicates, 2);
    assert_eq!(lib.unpaired_reads_examined, 0);
    assert_relative_eq!(lib.percent_duplication, 0.5, epsilon = 1e-6);
    assert!(lib.estimated_library_size.is_some());
}

#[test]
fn test_markdup_fragments_and_unmapped_mates() {
    let mut builder = SamBuilder::new();
    builder.add_frag().name("fragHigh").start(500).quals(&quals(35)).build();
    builder.add_frag().name("fragLow").start(500).build();
    builder.add_frag().name("fragRev").start(500).strand(Strand::Minus).build();
    builder.add_pair().name("halfMapped").start1(800).unmapped2().build();
    builder.add_frag().name("halfDup").start(800).build();
    let run = MarkdupRun::new(&builder);
    run.run_ok(&[]);

    let (_, records) = run.records();
    assert_eq!(records.len(), 6);
    assert_eq!(duplicate_names(&records), vec!["fragLow", "halfDup"]);

    let lib = &run.metrics()[0];
    assert_eq!(lib.unpaired_reads_examined, 5);
    assert_eq!(lib.unpaired_read_duplicates, 2);
    assert_eq!(lib.unmapped_reads, 1);
    assert_eq!(lib.read_pairs_examined, 0);
}

#[rstest]
#[case::independent("independent", vec![])]
#[case::pairs_win("pairs-win", vec!["frag"])]
fn test_markdup_fragment_policy(#[case] policy: &str, #[case] expected: Vec<&str>) {
    let mut builder = SamBuilder::new();
    builder.add_pair().name("pair").start1(3000).start2(3300).build();
    builder.add_frag().name("frag").start(3000).quals(&quals(40)).build();
    let run = MarkdupRun::new(&builder);
    run.run_ok(&["--fragment-policy", policy]);

    let (_, records) = run.records();
    assert_eq!(duplicate_names(&records), expected);
}

#[test]
fn test_markdup_optical_duplicates_and_tags() {
    let run = MarkdupRun::new(&optical_builder());
    let histogram = run.path("roi.txt");
    run.run_ok(&[
        "--tagging-policy",
        "all",
        "--tag-duplicate-set-members",
        "--histogram",
        histogram.to_str().unwrap(),
    ]);

    let (_, records) = run.records();
    for record in &records {
        let name = record.name().map(ToString::to_string).unwrap_or_default();
        match name.as_str() {
            "M1:7:FC:1:1101:1000:1000" => assert_dt_tag(record, None),
            "M1:7:FC:1:1101:1040:1030" => assert_dt_tag(record, Some("SQ")),
            _ => assert_dt_tag(record, Some("LB")),
        }
        assert_string_tag(record, *b"DI", Some("M1:7:FC:1:1101:1000:1000"));
        let size = record.data().get(&Tag::new(b'D', b'S')).and_then(|v| v.as_int());
        assert_eq!(size, Some(3));
    }

    let lib = &run.metrics()[0];
    assert_eq!(lib.read_pair_duplicates, 2);
    assert_eq!(lib.read_pair_optical_duplicates, 1);

    let contents = std::fs::read_to_string(&histogram).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some("library\tcoverage_multiple\tunique_multiple"));
    assert_eq!(lines.count(), 100);
}

#[test]
fn test_markdup_optical_only_tagging() {
    let run = MarkdupRun::new(&optical_builder());
    run.run_ok(&["--tagging-policy", "optical-only"]);

    let (_, records) = run.records();
    let tagged = records.iter().filter(|r| r.data().get(&Tag::new(b'D', b'T')).is_some()).count();
    assert_eq!(tagged, 2, "Only the optical pair's two records are tagged");
}

#[test]
fn test_markdup_null_regex_disables_optical() {
    let run = MarkdupRun::new(&optical_builder());
    run.run_ok(&["--read-name-regex", "null"]);

    let lib = &run.metrics()[0];
    assert_eq!(lib.read_pair_duplicates, 2);
    assert_eq!(lib.read_pair_optical_duplicates, 0);
}

#[rstest]
#[case::mark("", 6, 4)]
#[case::remove_all("--remove-duplicates", 2, 0)]
#[case::remove_optical("--remove-sequencing-duplicates", 4, 2)]
fn test_markdup_removal(
    #[case] flag: &str,
    #[case] expected_records: usize,
    #[case] expected_flagged: usize,
) {
    let run = MarkdupRun::new(&optical_builder());
    let args: Vec<&str> = if flag.is_empty() { vec![] } else { vec![flag] };
    run.run_ok(&args);

    let (_, records) = run.records();
    assert_eq!(records.len(), expected_records);
    assert_eq!(records.iter().filter(|r| r.flags().is_duplicate()).count(), expected_flagged);
    // metrics describe the input, not what was written
    assert_eq!(run.metrics()[0].read_pair_duplicates, 2);
}

#[test]
fn test_markdup_existing_dt_is_cleared_or_kept() {
    let mut builder = SamBuilder::new();
    builder.add_frag().name("solo").start(100).duplicate().attr("DT", "LB").build();

    let run = MarkdupRun::new(&builder);
    run.run_ok(&[]);
    let (_, records) = run.records();
    assert!(!records[0].flags().is_duplicate(), "Stale duplicate flags are cleared");
    assert_dt_tag(&records[0], None);

    run.run_ok(&["--clear-dt", "false"]);
    let (_, records) = run.records();
    assert_dt_tag(&records[0], Some("LB"));
}

#[rstest]
#[case::single_thread("1")]
#[case::background_spill("3")]
fn test_markdup_spilling_matches_in_memory(#[case] threads: &str) {
    let mut builder = SamBuilder::new();
    for i in 0..60 {
        let start = 1000 + (i % 7) * 40;
        let q = 20 + u8::try_from(i % 13).unwrap();
        builder.add_pair().start1(start).start2(start + 350).quals1(&quals(q)).build();
        builder.add_frag().start(start + 3).build();
    }

    let reference = MarkdupRun::new(&builder);
    reference.run_ok(&[]);
    let (_, expected) = reference.records();

    let spilled = MarkdupRun::new(&builder);
    spilled.run_ok(&["--max-records-in-ram", "5", "--threads", threads]);
    let (_, actual) = spilled.records();

    assert_eq!(duplicate_names(&actual), duplicate_names(&expected));
    assert_eq!(spilled.metrics(), reference.metrics());
}

#[test]
fn test_markdup_cross_contig_pairs_with_small_budget() {
    let mut builder = SamBuilder::new();
    for i in 0..120 {
        let start = 100 + (i % 40) * 10;
        builder.add_pair().contig(0).start1(start).contig2(1).start2(start + 500).build();
    }

    let reference = MarkdupRun::new(&builder);
    reference.run_ok(&[]);
    let spilled = MarkdupRun::new(&builder);
    spilled.run_ok(&["--max-records-in-ram", "12"]);

    let (_, expected) = reference.records();
    let (_, actual) = spilled.records();
    assert_eq!(duplicate_names(&actual), duplicate_names(&expected));
    assert_mates_agree(&actual);
    let metrics = spilled.metrics();
    assert_eq!(metrics, reference.metrics());
    assert_eq!(metrics[0].read_pairs_examined, 120);
    assert_eq!(metrics[0].read_pair_duplicates, 80);
}

#[test]
fn test_markdup_barcode_tag_separates_molecules() {
    let mut builder = SamBuilder::new();
    builder
        .add_pair()
        .name("aKeep")
        .start1(700)
        .start2(900)
        .quals1(&quals(38))
        .attr("BC", "ACGT".to_string())
        .build();
    builder.add_pair().name("aDup").start1(700).start2(900).attr("BC", "ACGT".to_string()).build();
    builder.add_pair().name("other").start1(700).start2(900).attr("BC", "TTTT".to_string()).build();

    let plain = MarkdupRun::new(&builder);
    plain.run_ok(&[]);
    let (_, records) = plain.records();
    assert_eq!(duplicate_names(&records), vec!["aDup", "other"]);

    let barcoded = MarkdupRun::new(&builder);
    barcoded.run_ok(&["--barcode-tag", "BC"]);
    let (_, records) = barcoded.records();
    assert_eq!(duplicate_names(&records), vec!["aDup"]);
    assert_eq!(barcoded.metrics()[0].read_pair_duplicates, 1);
}

#[test]
fn test_markdup_libraries_reported_separately() {
    let mut builder = SamBuilder::new();
    builder.add_read_group("B", Some("lib2"));
    builder.add_read_group("C", None);
    builder.add_pair().name("a1").start1(100).start2(400).build();
    builder.add_pair().name("a2").start1(100).start2(400).build();
    builder.add_pair().name("b1").start1(100).start2(400).read_group("B").build();
    builder.add_pair().name("c1").start1(100).start2(400).read_group("C").build();
    let run = MarkdupRun::new(&builder);
    run.run_ok(&[]);

    let (_, records) = run.records();
    assert_eq!(duplicate_names(&records), vec!["a2"]);

    let libraries: Vec<String> = run.metrics().into_iter().map(|m| m.library).collect();
    assert_eq!(libraries, vec!["lib1", "lib2", "Unknown Library"]);
}

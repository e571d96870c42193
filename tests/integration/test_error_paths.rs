//! Failure modes of the markdup command: each must exit non-zero with a clear message and leave
//! no partial metrics behind.

use fgmarkdup_lib::sam::builder::SamBuilder;

use crate::helpers::MarkdupRun;

fn simple_builder() -> SamBuilder {
    let mut builder = SamBuilder::new();
    builder.add_frag().name("a").start(100).build();
    builder.add_frag().name("b").start(100).build();
    builder
}

fn stderr_of(run: &MarkdupRun, args: &[&str]) -> String {
    let output = run.run(args);
    assert!(!output.status.success(), "markdup unexpectedly succeeded with {args:?}");
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_unsorted_header_is_rejected() {
    let builder = {
        let mut b = SamBuilder::new().with_sort_order(Some("queryname"));
        b.add_frag().start(100).build();
        b
    };
    let run = MarkdupRun::new(&builder);
    let stderr = stderr_of(&run, &[]);
    assert!(stderr.contains("coordinate sorted"), "stderr: {stderr}");
    assert!(!run.metrics.exists());

    run.run_ok(&["--assume-sorted"]);
    assert!(run.metrics.exists());
}

#[test]
fn test_out_of_order_records_are_rejected() {
    let mut builder = SamBuilder::new();
    builder.add_frag().name("late").start(900).build();
    builder.add_frag().name("early").start(100).build();
    let run = MarkdupRun::new(&builder);
    // rewrite the input in insertion order, keeping the SO:coordinate header
    builder.write_bam(&run.input).unwrap();

    let stderr = stderr_of(&run, &[]);
    assert!(stderr.contains("not coordinate sorted"), "stderr: {stderr}");
    assert!(stderr.contains("early"), "stderr: {stderr}");
}

#[test]
fn test_stdin_input_is_rejected() {
    let run = MarkdupRun::new(&simple_builder());
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_fgmarkdup"))
        .args(["markdup", "-i", "-", "-o"])
        .arg(&run.output)
        .arg("-m")
        .arg(&run.metrics)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("standard input"));
}

#[test]
fn test_invalid_options_fail_before_io() {
    let run = MarkdupRun::new(&simple_builder());
    for (args, expected) in [
        (vec!["--max-records-in-ram", "0"], "max-records-in-ram"),
        (vec!["--compression-level", "20"], "compression-level"),
        (vec!["--read-name-field-counts", "2"], "read-name-field-counts"),
        (vec!["--read-name-regex", "(unclosed"], "regex"),
        (vec!["--threads", "0"], "threads"),
        (vec!["--tmp-dir", "/no/such/directory"], "does not exist"),
    ] {
        let stderr = stderr_of(&run, &args);
        assert!(stderr.contains(expected), "{args:?}: {stderr}");
        assert!(!run.output.exists(), "{args:?} should fail before writing output");
    }
}

#[test]
fn test_missing_input_is_rejected() {
    let run = MarkdupRun::new(&simple_builder());
    std::fs::remove_file(&run.input).unwrap();
    let stderr = stderr_of(&run, &[]);
    assert!(stderr.contains("does not exist"), "stderr: {stderr}");
}

//! Assertion helpers for duplicate tags on output records.

#![allow(dead_code)]

use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::alignment::record_buf::data::field::Value;

/// Asserts the record's string tag equals `expected`, or that the tag is absent for `None`.
///
/// # Panics
///
/// Panics on a mismatch.
pub fn assert_string_tag(record: &RecordBuf, tag: [u8; 2], expected: Option<&str>) {
    let actual = match record.data().get(&Tag::from(tag)) {
        Some(Value::String(s)) => Some(s.to_string()),
        Some(other) => panic!("Tag {tag:?} should be a string, got {other:?}"),
        None => None,
    };
    assert_eq!(
        actual.as_deref(),
        expected,
        "{}{} mismatch for record {:?}",
        tag[0] as char,
        tag[1] as char,
        record.name()
    );
}

/// Asserts the record's `DT` tag.
///
/// # Panics
///
/// Panics on a mismatch.
pub fn assert_dt_tag(record: &RecordBuf, expected: Option<&str>) {
    assert_string_tag(record, *b"DT", expected);
}

/// Asserts that both mates of every pair agree on the duplicate flag.
///
/// # Panics
///
/// Panics if two primary records with the same name disagree.
pub fn assert_mates_agree(records: &[RecordBuf]) {
    let primary: Vec<&RecordBuf> = records
        .iter()
        .filter(|r| !r.flags().is_secondary() && !r.flags().is_supplementary())
        .collect();
    for a in &primary {
        for b in &primary {
            if a.name() == b.name() {
                assert_eq!(
                    a.flags().is_duplicate(),
                    b.flags().is_duplicate(),
                    "Mates of {:?} disagree on the duplicate flag",
                    a.name()
                );
            }
        }
    }
}

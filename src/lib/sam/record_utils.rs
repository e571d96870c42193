//! Coordinate helpers for individual alignment records.
//!
//! Unclipped positions follow HTSJDK's `getUnclippedStart()` / `getUnclippedEnd()`: both soft and
//! hard clips are counted, and the result may fall before position 1.

use noodles::sam::alignment::record::Cigar as CigarTrait;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record_buf::RecordBuf;

/// Counts the reference bases consumed by a CIGAR.
#[must_use]
pub fn reference_length(cigar: &impl CigarTrait) -> usize {
    cigar
        .iter()
        .filter_map(Result::ok)
        .filter(|op| op.kind().consumes_reference())
        .map(|op| op.len())
        .sum()
}

/// Soft and hard clipping at the start of the record's CIGAR.
#[must_use]
pub fn leading_clipping(record: &RecordBuf) -> usize {
    record
        .cigar()
        .as_ref()
        .iter()
        .take_while(|op| matches!(op.kind(), Kind::SoftClip | Kind::HardClip))
        .map(|op| op.len())
        .sum()
}

/// Soft and hard clipping at the end of the record's CIGAR.
#[must_use]
pub fn trailing_clipping(record: &RecordBuf) -> usize {
    record
        .cigar()
        .as_ref()
        .iter()
        .rev()
        .take_while(|op| matches!(op.kind(), Kind::SoftClip | Kind::HardClip))
        .map(|op| op.len())
        .sum()
}

/// The 1-based inclusive alignment end, or `None` when the record has no alignment start.
#[must_use]
pub fn alignment_end(record: &RecordBuf) -> Option<usize> {
    let start = usize::from(record.alignment_start()?);
    Some(start + reference_length(&record.cigar()).saturating_sub(1))
}

fn to_coordinate(value: i64) -> i32 {
    i32::try_from(value).unwrap_or(if value < 0 { i32::MIN } else { i32::MAX })
}

/// Alignment start minus leading clips. `None` for unmapped or unplaced records.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn unclipped_start(record: &RecordBuf) -> Option<i32> {
    if record.flags().is_unmapped() {
        return None;
    }
    let start = usize::from(record.alignment_start()?);
    let leading = leading_clipping(record);
    Some(to_coordinate(start as i64 - leading as i64))
}

/// Alignment end plus trailing clips. `None` for unmapped or unplaced records.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn unclipped_end(record: &RecordBuf) -> Option<i32> {
    if record.flags().is_unmapped() {
        return None;
    }
    let end = alignment_end(record)?;
    Some(to_coordinate(end as i64 + trailing_clipping(record) as i64))
}

/// The unclipped 5' position: unclipped end for reverse-strand reads, unclipped start otherwise.
#[must_use]
pub fn unclipped_five_prime_position(record: &RecordBuf) -> Option<i32> {
    if record.flags().is_reverse_complemented() {
        unclipped_end(record)
    } else {
        unclipped_start(record)
    }
}

/// True for paired records whose mate is mapped.
#[must_use]
pub fn has_mapped_mate(record: &RecordBuf) -> bool {
    let flags = record.flags();
    flags.is_segmented() && !flags.is_mate_unmapped()
}

/// True for secondary or supplementary alignments.
#[must_use]
pub fn is_secondary_or_supplementary(record: &RecordBuf) -> bool {
    let flags = record.flags();
    flags.is_secondary() || flags.is_supplementary()
}

//! Duplication keys for fragments and read pairs.
//!
//! Every primary, mapped record yields a single-ended [`ReadEnds`]. When both mates of a pair have
//! been seen, a paired [`ReadEnds`] is also produced, with its two ends in canonical order so that a
//! pair and its mate-swapped twin have the same key.
//!
//! Coordinates are unclipped 5' positions: the unclipped start of a forward-strand read or the
//! unclipped end of a reverse-strand read.
//!
//! When [`BarcodeTags`] are configured, hashes of the tag values join the key, so reads at the same
//! position but with different molecular barcodes fall into different duplicate sets.

use std::cmp::Ordering;
use std::io::{self, Read, Write};

use bstr::{BString, ByteSlice};
use clap::ValueEnum;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::alignment::record_buf::data::field::Value;

use crate::errors::{MarkDupError, Result};
use crate::library::LibraryIndex;
use crate::optical::{LocationParser, PhysicalLocation};
use crate::pending::PendingMates;
use crate::sam::record_utils::{
    has_mapped_mate, is_secondary_or_supplementary, reference_length,
    unclipped_five_prime_position,
};
use crate::sort::{SpillRecord, read_exact_or_eof};

/// Minimum base quality counted by [`ScoringStrategy::SumOfBaseQualities`].
pub const MIN_SCORING_BASE_QUALITY: u8 = 15;

/// Fixed seeds so barcode hashes, and therefore key order, are the same on every run.
const BARCODE_HASHER: ahash::RandomState = ahash::RandomState::with_seeds(
    0x243F_6A88_85A3_08D3,
    0x1319_8A2E_0370_7344,
    0xA409_3822_299F_31D0,
    0x082E_FA98_EC4E_6C89,
);

/// SAM tags whose string values are added to the duplication key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarcodeTags {
    /// Molecular barcode shared by both reads of a pair (e.g. `BC`).
    pub barcode: Option<Tag>,
    /// Barcode read from first-of-pair and unpaired records only.
    pub read_one: Option<Tag>,
    /// Barcode read from second-of-pair records only.
    pub read_two: Option<Tag>,
}

impl BarcodeTags {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.barcode.is_none() && self.read_one.is_none() && self.read_two.is_none()
    }

    /// The read-one barcode of a first-of-pair or unpaired record, or the read-two barcode of a
    /// second-of-pair record.
    fn read_barcodes(&self, record: &RecordBuf) -> (u64, u64) {
        let flags = record.flags();
        if !flags.is_segmented() || flags.is_first_segment() {
            (barcode_hash(record, self.read_one), 0)
        } else {
            (0, barcode_hash(record, self.read_two))
        }
    }
}

/// Hash of a string tag value; `0` when the tag is unset or missing from the record.
fn barcode_hash(record: &RecordBuf, tag: Option<Tag>) -> u64 {
    match tag.and_then(|tag| record.data().get(&tag)) {
        Some(Value::String(value)) => BARCODE_HASHER.hash_one(value.as_bytes()),
        _ => 0,
    }
}

/// Strand configuration of a fragment or pair.
///
/// The discriminants are written to spill files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Orientation {
    F = 0,
    R = 1,
    FF = 2,
    FR = 3,
    RR = 4,
    RF = 5,
}

impl Orientation {
    /// Orientation of a pair from the strands of its first and second end.
    #[must_use]
    pub fn for_pair(first_negative: bool, second_negative: bool) -> Self {
        match (first_negative, second_negative) {
            (false, false) => Orientation::FF,
            (false, true) => Orientation::FR,
            (true, false) => Orientation::RF,
            (true, true) => Orientation::RR,
        }
    }

    #[must_use]
    pub fn for_fragment(negative: bool) -> Self {
        if negative { Orientation::R } else { Orientation::F }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Orientation::F),
            1 => Some(Orientation::R),
            2 => Some(Orientation::FF),
            3 => Some(Orientation::FR),
            4 => Some(Orientation::RR),
            5 => Some(Orientation::RF),
            _ => None,
        }
    }
}

/// How a record (or pair) is scored when choosing the representative of a duplicate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ScoringStrategy {
    /// Sum of base qualities of at least 15.
    #[default]
    SumOfBaseQualities,
    /// Reference bases covered by the alignment.
    TotalMappedReferenceLength,
}

impl ScoringStrategy {
    #[must_use]
    pub fn score(self, record: &RecordBuf) -> u32 {
        match self {
            ScoringStrategy::SumOfBaseQualities => record
                .quality_scores()
                .as_ref()
                .iter()
                .filter(|&&q| q >= MIN_SCORING_BASE_QUALITY)
                .map(|&q| u32::from(q))
                .fold(0u32, u32::saturating_add),
            ScoringStrategy::TotalMappedReferenceLength => {
                u32::try_from(reference_length(&record.cigar())).unwrap_or(u32::MAX)
            }
        }
    }
}

/// Duplication key of one fragment or read pair, plus what is needed to resolve its set.
///
/// Ordering (and equality) covers the key fields followed by the record ordinals, so sorts are
/// fully deterministic: library, barcode, read1 barcode, read2 barcode, read1 reference, read1
/// coordinate, orientation, read2 reference, read2 coordinate, read1 ordinal, read2 ordinal.
#[derive(Debug, Clone)]
pub struct ReadEnds {
    pub library: u16,
    pub read1_reference: i32,
    pub read1_coordinate: i32,
    pub orientation: Orientation,
    /// `-1` for fragments whose mate is unmapped or absent.
    pub read2_reference: i32,
    /// `-1` for fragment ends.
    pub read2_coordinate: i32,
    /// Ordinal of read1 within the input file.
    pub read1_index: u64,
    /// Ordinal of read2; equal to `read1_index` for fragment ends.
    pub read2_index: u64,
    pub score: u32,
    /// Strands of first-of-pair and second-of-pair, used to split optical clustering.
    pub optical_orientation: Orientation,
    pub read_group: u16,
    pub location: Option<PhysicalLocation>,
    pub read_name: BString,
    /// Hash of the molecular barcode; `0` without one.
    pub barcode: u64,
    /// Hash of first-of-pair's read barcode.
    pub read1_barcode: u64,
    /// Hash of second-of-pair's read barcode.
    pub read2_barcode: u64,
}

impl ReadEnds {
    /// True for pairs, and for fragment ends whose mate is mapped.
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.read2_reference != -1
    }

    /// True if the two ends share library, barcodes, read1 position and orientation.
    #[must_use]
    pub fn same_fragment_key(&self, other: &ReadEnds) -> bool {
        self.library == other.library
            && self.barcode == other.barcode
            && self.read1_barcode == other.read1_barcode
            && self.read2_barcode == other.read2_barcode
            && self.read1_reference == other.read1_reference
            && self.read1_coordinate == other.read1_coordinate
            && self.orientation == other.orientation
    }

    /// True if the two pairs share their full duplication key.
    #[must_use]
    pub fn same_pair_key(&self, other: &ReadEnds) -> bool {
        self.same_fragment_key(other)
            && self.read2_reference == other.read2_reference
            && self.read2_coordinate == other.read2_coordinate
    }

    #[allow(clippy::type_complexity)]
    fn sort_key(&self) -> (u16, u64, u64, u64, i32, i32, Orientation, i32, i32, u64, u64) {
        (
            self.library,
            self.barcode,
            self.read1_barcode,
            self.read2_barcode,
            self.read1_reference,
            self.read1_coordinate,
            self.orientation,
            self.read2_reference,
            self.read2_coordinate,
            self.read1_index,
            self.read2_index,
        )
    }
}

impl PartialEq for ReadEnds {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for ReadEnds {}

impl PartialOrd for ReadEnds {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadEnds {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Bytes before the optional location and the read name.
const FIXED_LEN: usize = 2 + 4 + 4 + 1 + 4 + 4 + 8 + 8 + 4 + 1 + 2 + 8 + 8 + 8 + 1;
const LOCATION_LEN: usize = 2 + 4 + 4 + 4;

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

impl SpillRecord for ReadEnds {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut fixed = [0u8; FIXED_LEN];
        let mut at = 0;
        let mut put = |bytes: &[u8]| {
            fixed[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        };
        put(&self.library.to_le_bytes());
        put(&self.read1_reference.to_le_bytes());
        put(&self.read1_coordinate.to_le_bytes());
        put(&[self.orientation.code()]);
        put(&self.read2_reference.to_le_bytes());
        put(&self.read2_coordinate.to_le_bytes());
        put(&self.read1_index.to_le_bytes());
        put(&self.read2_index.to_le_bytes());
        put(&self.score.to_le_bytes());
        put(&[self.optical_orientation.code()]);
        put(&self.read_group.to_le_bytes());
        put(&self.barcode.to_le_bytes());
        put(&self.read1_barcode.to_le_bytes());
        put(&self.read2_barcode.to_le_bytes());
        put(&[u8::from(self.location.is_some())]);
        writer.write_all(&fixed)?;

        if let Some(loc) = &self.location {
            writer.write_all(&loc.read_group.to_le_bytes())?;
            writer.write_all(&loc.tile.to_le_bytes())?;
            writer.write_all(&loc.x.to_le_bytes())?;
            writer.write_all(&loc.y.to_le_bytes())?;
        }

        let name_len = u32::try_from(self.read_name.len())
            .map_err(|_| invalid_data("read name too long"))?;
        writer.write_all(&name_len.to_le_bytes())?;
        writer.write_all(&self.read_name)
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut fixed = [0u8; FIXED_LEN];
        if !read_exact_or_eof(reader, &mut fixed)? {
            return Ok(None);
        }
        let mut cursor = Cursor { buf: &fixed, at: 0 };
        let library = u16::from_le_bytes(cursor.take());
        let read1_reference = i32::from_le_bytes(cursor.take());
        let read1_coordinate = i32::from_le_bytes(cursor.take());
        let orientation = Orientation::from_code(cursor.take::<1>()[0])
            .ok_or_else(|| invalid_data("bad orientation code"))?;
        let read2_reference = i32::from_le_bytes(cursor.take());
        let read2_coordinate = i32::from_le_bytes(cursor.take());
        let read1_index = u64::from_le_bytes(cursor.take());
        let read2_index = u64::from_le_bytes(cursor.take());
        let score = u32::from_le_bytes(cursor.take());
        let optical_orientation = Orientation::from_code(cursor.take::<1>()[0])
            .ok_or_else(|| invalid_data("bad optical orientation code"))?;
        let read_group = u16::from_le_bytes(cursor.take());
        let barcode = u64::from_le_bytes(cursor.take());
        let read1_barcode = u64::from_le_bytes(cursor.take());
        let read2_barcode = u64::from_le_bytes(cursor.take());
        let has_location = cursor.take::<1>()[0] != 0;

        let location = if has_location {
            let mut buf = [0u8; LOCATION_LEN];
            reader.read_exact(&mut buf)?;
            let mut cursor = Cursor { buf: &buf, at: 0 };
            Some(PhysicalLocation {
                read_group: u16::from_le_bytes(cursor.take()),
                tile: i32::from_le_bytes(cursor.take()),
                x: i32::from_le_bytes(cursor.take()),
                y: i32::from_le_bytes(cursor.take()),
            })
        } else {
            None
        };

        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let mut name = vec![0u8; u32::from_le_bytes(len) as usize];
        reader.read_exact(&mut name)?;

        Ok(Some(ReadEnds {
            library,
            read1_reference,
            read1_coordinate,
            orientation,
            read2_reference,
            read2_coordinate,
            read1_index,
            read2_index,
            score,
            optical_orientation,
            read_group,
            location,
            read_name: BString::from(name),
            barcode,
            read1_barcode,
            read2_barcode,
        }))
    }
}

/// Reads fixed-width fields from a byte buffer of known length.
struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl Cursor<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.at..self.at + N]);
        self.at += N;
        out
    }
}

/// What one input record contributed.
#[derive(Debug, Default)]
pub struct Observation {
    /// The record's own single-ended key.
    pub fragment: Option<ReadEnds>,
    /// The completed pair, when this record is the second mate seen.
    pub pair: Option<ReadEnds>,
}

/// Builds [`ReadEnds`] from a coordinate-sorted stream of records.
pub struct SignatureBuilder {
    libraries: LibraryIndex,
    parser: Box<dyn LocationParser>,
    scoring: ScoringStrategy,
    barcodes: BarcodeTags,
    pending: PendingMates,
    previous: Option<(usize, usize)>,
    reached_unplaced: bool,
}

impl SignatureBuilder {
    #[must_use]
    pub fn new(
        libraries: LibraryIndex,
        parser: Box<dyn LocationParser>,
        scoring: ScoringStrategy,
    ) -> Self {
        Self {
            libraries,
            parser,
            scoring,
            barcodes: BarcodeTags::default(),
            pending: PendingMates::default(),
            previous: None,
            reached_unplaced: false,
        }
    }

    /// Adds barcode hashes to every key.
    #[must_use]
    pub fn with_barcode_tags(mut self, barcodes: BarcodeTags) -> Self {
        self.barcodes = barcodes;
        self
    }

    /// Replaces the default pending-mate store, e.g. to set its budget and temp dir.
    #[must_use]
    pub fn with_pending_mates(mut self, pending: PendingMates) -> Self {
        self.pending = pending;
        self
    }

    #[must_use]
    pub fn libraries(&self) -> &LibraryIndex {
        &self.libraries
    }

    /// Mates still waiting for their partner, in memory or parked on disk.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn pending_mates(&self) -> &PendingMates {
        &self.pending
    }

    /// Processes the record at ordinal `index` of the input.
    ///
    /// # Errors
    ///
    /// Returns [`MarkDupError::UnsortedInput`] if the record precedes the previous placed record,
    /// [`MarkDupError::MissingPosition`] if a mapped record has no reference or start, or
    /// [`MarkDupError::Spill`] if a parked mate cannot be written or read back.
    pub fn observe(&mut self, record: &RecordBuf, index: u64) -> Result<Observation> {
        let flags = record.flags();
        if !flags.is_unmapped() {
            require_position(record)?;
        }
        self.check_order(record)?;

        if flags.is_unmapped() || is_secondary_or_supplementary(record) || self.reached_unplaced {
            return Ok(Observation::default());
        }

        let fragment = self.fragment_ends(record, index)?;
        self.pending.advance(fragment_reference(record), alignment_start(record))?;
        let mut pair = None;
        if has_mapped_mate(record) {
            let key = (fragment.read_group, fragment.read_name.clone());
            match self.pending.take(&key) {
                Some(first) => pair = Some(self.pair_from(first, record, index)?),
                None => {
                    let mate_reference = record.mate_reference_sequence_id().map_or(-1, to_reference);
                    let mate_start =
                        record.mate_alignment_start().map_or(-1, |p| to_coordinate(usize::from(p)));
                    self.pending.park(key, fragment.clone(), mate_reference, mate_start)?;
                }
            }
        }
        Ok(Observation { fragment: Some(fragment), pair })
    }

    /// Builds the single-ended key for a primary, mapped record.
    ///
    /// # Errors
    ///
    /// Returns [`MarkDupError::MissingPosition`] if the record has no reference or start.
    pub fn fragment_ends(&self, record: &RecordBuf, index: u64) -> Result<ReadEnds> {
        let info = self.libraries.for_record(record);
        let (reference, coordinate) = five_prime_key(record)?;
        let read2_reference = if has_mapped_mate(record) {
            record.mate_reference_sequence_id().map_or(-1, to_reference)
        } else {
            -1
        };
        let read_name = record.name().map(|n| BString::from(n.to_vec())).unwrap_or_default();
        let location = if self.parser.enabled() {
            self.parser.parse(read_name.as_bytes()).map(|loc| loc.with_read_group(info.read_group))
        } else {
            None
        };
        let orientation = Orientation::for_fragment(record.flags().is_reverse_complemented());
        let (read1_barcode, read2_barcode) = self.barcodes.read_barcodes(record);

        Ok(ReadEnds {
            library: info.library,
            read1_reference: reference,
            read1_coordinate: coordinate,
            orientation,
            read2_reference,
            read2_coordinate: -1,
            read1_index: index,
            read2_index: index,
            score: self.scoring.score(record),
            optical_orientation: orientation,
            read_group: info.read_group,
            location,
            read_name,
            barcode: barcode_hash(record, self.barcodes.barcode),
            read1_barcode,
            read2_barcode,
        })
    }

    /// Completes a pair from the first-seen mate's fragment key and the second mate's record.
    ///
    /// The end with the smaller `(reference, coordinate)` becomes read1. When both ends share a
    /// position the first-seen end stays read1 and `RF` is recorded as `FR`.
    ///
    /// # Errors
    ///
    /// Returns [`MarkDupError::MissingPosition`] if the record has no reference or start.
    pub fn pair_from(&self, first: ReadEnds, record: &RecordBuf, index: u64) -> Result<ReadEnds> {
        let mut pair = first;
        let (mate_reference, mate_coordinate) = five_prime_key(record)?;
        let mate_negative = record.flags().is_reverse_complemented();
        let first_negative = pair.orientation == Orientation::R;

        if record.flags().is_first_segment() {
            pair.optical_orientation = Orientation::for_pair(mate_negative, first_negative);
            pair.read1_barcode = barcode_hash(record, self.barcodes.read_one);
        } else {
            pair.optical_orientation = Orientation::for_pair(first_negative, mate_negative);
            pair.read2_barcode = barcode_hash(record, self.barcodes.read_two);
        }

        if (mate_reference, mate_coordinate) >= (pair.read1_reference, pair.read1_coordinate) {
            pair.read2_reference = mate_reference;
            pair.read2_coordinate = mate_coordinate;
            pair.read2_index = index;
            pair.orientation = Orientation::for_pair(first_negative, mate_negative);
            if pair.read2_reference == pair.read1_reference
                && pair.read2_coordinate == pair.read1_coordinate
                && pair.orientation == Orientation::RF
            {
                pair.orientation = Orientation::FR;
            }
        } else {
            pair.read2_reference = pair.read1_reference;
            pair.read2_coordinate = pair.read1_coordinate;
            pair.read2_index = pair.read1_index;
            pair.read1_reference = mate_reference;
            pair.read1_coordinate = mate_coordinate;
            pair.read1_index = index;
            pair.orientation = Orientation::for_pair(mate_negative, first_negative);
        }

        pair.score = pair.score.saturating_add(self.scoring.score(record));
        Ok(pair)
    }

    /// Fails if a placed record comes before the previous placed record.
    fn check_order(&mut self, record: &RecordBuf) -> Result<()> {
        let (Some(reference), Some(start)) =
            (record.reference_sequence_id(), record.alignment_start())
        else {
            self.reached_unplaced = true;
            return Ok(());
        };
        let current = (reference, usize::from(start));
        if let Some(previous) = self.previous {
            if current < previous {
                return Err(MarkDupError::UnsortedInput {
                    read_name: record_name(record),
                    reference: current.0,
                    position: current.1,
                    previous_reference: previous.0,
                    previous_position: previous.1,
                });
            }
        }
        self.previous = Some(current);
        Ok(())
    }
}

fn to_reference(reference: usize) -> i32 {
    i32::try_from(reference).unwrap_or(i32::MAX)
}

fn to_coordinate(position: usize) -> i32 {
    i32::try_from(position).unwrap_or(i32::MAX)
}

/// Reference index of a record already known to be placed.
fn fragment_reference(record: &RecordBuf) -> i32 {
    record.reference_sequence_id().map_or(-1, to_reference)
}

fn alignment_start(record: &RecordBuf) -> i32 {
    record.alignment_start().map_or(-1, |p| to_coordinate(usize::from(p)))
}

fn record_name(record: &RecordBuf) -> String {
    record.name().map(|n| n.to_str_lossy().into_owned()).unwrap_or_default()
}

fn require_position(record: &RecordBuf) -> Result<()> {
    let field = if record.reference_sequence_id().is_none() {
        "reference"
    } else if record.alignment_start().is_none() {
        "alignment start"
    } else {
        return Ok(());
    };
    Err(MarkDupError::MissingPosition { read_name: record_name(record), field })
}

fn five_prime_key(record: &RecordBuf) -> Result<(i32, i32)> {
    require_position(record)?;
    let reference = record.reference_sequence_id().map_or(-1, to_reference);
    let coordinate = unclipped_five_prime_position(record).ok_or_else(|| {
        MarkDupError::MissingPosition { read_name: record_name(record), field: "alignment start" }
    })?;
    Ok((reference, coordinate))
}

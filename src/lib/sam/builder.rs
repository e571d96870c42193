//! Builder for creating test SAM/BAM records and files.
//!
//! [`SamBuilder`] accumulates pairs and fragments with sensible defaults and writes them to a BAM
//! file, optionally in coordinate order with an `SO:coordinate` header.
//!
//! ```rust
//! use fgmarkdup_lib::sam::builder::{SamBuilder, Strand};
//!
//! let mut builder = SamBuilder::new();
//! let (r1, r2) = builder.add_pair().start1(100).start2(300).build();
//! assert!(r1.flags().is_first_segment());
//! assert!(r2.flags().is_reverse_complemented());
//!
//! let frag = builder.add_frag().name("frag1").start(150).strand(Strand::Minus).build();
//! assert_eq!(builder.len(), 3);
//! ```

use anyhow::Result;
use bstr::BString;
use noodles::core::Position;
use noodles::sam::Header;
use noodles::sam::alignment::io::Write as AlignmentWrite;
use noodles::sam::alignment::record::cigar::Op;
use noodles::sam::alignment::record::cigar::op::Kind;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record::{Flags, MappingQuality};
use noodles::sam::alignment::record_buf::data::field::Value as BufValue;
use noodles::sam::alignment::record_buf::{QualityScores, RecordBuf, Sequence};
use noodles::sam::header::record::value::Map;
use noodles::sam::header::record::value::map::header::tag as header_tag;
use noodles::sam::header::record::value::map::read_group::tag as rg_tag;
use noodles::sam::header::record::value::map::{ReadGroup, ReferenceSequence};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_READ_LENGTH: usize = 100;
pub const DEFAULT_BASE_QUALITY: u8 = 30;
pub const DEFAULT_MAPQ: u8 = 60;
pub const DEFAULT_READ_GROUP_ID: &str = "A";
pub const DEFAULT_LIBRARY: &str = "lib1";
pub const DEFAULT_REFERENCE_LENGTH: usize = 10_000_000;

/// Strand orientation for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    Plus,
    Minus,
}

impl Strand {
    #[must_use]
    pub fn is_negative(&self) -> bool {
        matches!(self, Strand::Minus)
    }
}

/// Accumulates test records and writes them to BAM files.
///
/// The header has references `chr1`, `chr2` and `chr3`, and a single read group `A` in library
/// `lib1` unless more read groups are added with [`SamBuilder::add_read_group`].
#[derive(Debug)]
pub struct SamBuilder {
    records: Vec<RecordBuf>,
    read_length: usize,
    base_quality: u8,
    sort_order: Option<String>,
    read_groups: Vec<(String, Option<String>)>,
    counter: AtomicU64,
}

impl Default for SamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SamBuilder {
    /// Creates a builder with 100bp reads at Q30 and a coordinate-sorted header.
    #[must_use]
    pub fn new() -> Self {
        Self::with_defaults(DEFAULT_READ_LENGTH, DEFAULT_BASE_QUALITY)
    }

    /// Creates a builder with the given default read length and base quality.
    #[must_use]
    pub fn with_defaults(read_length: usize, base_quality: u8) -> Self {
        Self {
            records: Vec::new(),
            read_length,
            base_quality,
            sort_order: Some("coordinate".to_string()),
            read_groups: vec![(
                DEFAULT_READ_GROUP_ID.to_string(),
                Some(DEFAULT_LIBRARY.to_string()),
            )],
            counter: AtomicU64::new(0),
        }
    }

    /// Sets the `SO` value written to the header, or removes it with `None`.
    #[must_use]
    pub fn with_sort_order(mut self, sort_order: Option<&str>) -> Self {
        self.sort_order = sort_order.map(str::to_string);
        self
    }

    /// Adds a read group, optionally with an `LB` library.
    pub fn add_read_group(&mut self, id: &str, library: Option<&str>) {
        self.read_groups.push((id.to_string(), library.map(str::to_string)));
    }

    /// Builds the header for the accumulated records.
    ///
    /// # Panics
    ///
    /// Panics if a header map cannot be built.
    #[must_use]
    pub fn header(&self) -> Header {
        let mut builder = Header::builder();

        if let Some(so) = &self.sort_order {
            let hd = Map::<noodles::sam::header::record::value::map::Header>::builder()
                .insert(header_tag::SORT_ORDER, BString::from(so.as_str()))
                .build()
                .unwrap();
            builder = builder.set_header(hd);
        }

        for name in ["chr1", "chr2", "chr3"] {
            let map =
                Map::<ReferenceSequence>::new(NonZeroUsize::new(DEFAULT_REFERENCE_LENGTH).unwrap());
            builder = builder.add_reference_sequence(BString::from(name), map);
        }

        for (id, library) in &self.read_groups {
            let rg = match library {
                Some(lb) => {
                    Map::<ReadGroup>::builder().insert(rg_tag::LIBRARY, lb.clone()).build().unwrap()
                }
                None => Map::<ReadGroup>::default(),
            };
            builder = builder.add_read_group(BString::from(id.as_str()), rg);
        }

        builder.build()
    }

    fn next_name(&self) -> String {
        format!("q{:04}", self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn default_bases(&self) -> String {
        const BASES: [char; 4] = ['A', 'C', 'G', 'T'];
        let seed = usize::try_from(self.counter.load(Ordering::SeqCst)).unwrap_or(0);
        (0..self.read_length).map(|i| BASES[(seed * 7 + i * 13) % 4]).collect()
    }

    /// The accumulated records in insertion order.
    #[must_use]
    pub fn records(&self) -> &[RecordBuf] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Adds a pre-built record.
    pub fn push_record(&mut self, record: RecordBuf) {
        self.records.push(record);
    }

    /// Starts building a read pair. R1 is on the plus strand and R2 on the minus strand by default.
    #[must_use]
    pub fn add_pair(&mut self) -> PairBuilder<'_> {
        PairBuilder::new(self)
    }

    /// Starts building an unpaired read.
    #[must_use]
    pub fn add_frag(&mut self) -> FragBuilder<'_> {
        FragBuilder::new(self)
    }

    /// Writes the records to a BAM file in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn write_bam(&self, path: &Path) -> Result<()> {
        self.write_records(path, self.records.iter())
    }

    /// Writes the records to a BAM file in coordinate order.
    ///
    /// Records are ordered by reference and alignment start with unplaced records last; ties keep
    /// insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn write_sorted_bam(&self, path: &Path) -> Result<()> {
        let mut sorted: Vec<&RecordBuf> = self.records.iter().collect();
        sorted.sort_by_key(|r| {
            (
                r.reference_sequence_id().unwrap_or(usize::MAX),
                r.alignment_start().map_or(usize::MAX, usize::from),
            )
        });
        self.write_records(path, sorted.into_iter())
    }

    fn write_records<'r>(
        &self,
        path: &Path,
        records: impl Iterator<Item = &'r RecordBuf>,
    ) -> Result<()> {
        let header = self.header();
        let file = std::fs::File::create(path)?;
        let mut writer = noodles::bam::io::Writer::new(file);
        writer.write_header(&header)?;
        for record in records {
            writer.write_alignment_record(&header, record)?;
        }
        writer.try_finish()?;
        Ok(())
    }
}

fn insert_attrs(record: &mut RecordBuf, read_group: &str, attrs: &[(String, BufValue)]) {
    record.data_mut().insert(Tag::READ_GROUP, BufValue::from(read_group.to_string()));
    for (tag_str, value) in attrs {
        if let [a, b] = tag_str.as_bytes() {
            record.data_mut().insert(Tag::new(*a, *b), value.clone());
        }
    }
}

/// Builder for a paired-end read pair.
pub struct PairBuilder<'a> {
    parent: &'a mut SamBuilder,
    name: Option<String>,
    bases1: Option<String>,
    bases2: Option<String>,
    quals1: Option<Vec<u8>>,
    quals2: Option<Vec<u8>>,
    contig: usize,
    contig2: Option<usize>,
    start1: Option<usize>,
    start2: Option<usize>,
    cigar1: Option<String>,
    cigar2: Option<String>,
    mapq: u8,
    strand1: Strand,
    strand2: Strand,
    read_group: Option<String>,
    duplicate: bool,
    attrs: Vec<(String, BufValue)>,
}

impl<'a> PairBuilder<'a> {
    fn new(parent: &'a mut SamBuilder) -> Self {
        Self {
            parent,
            name: None,
            bases1: None,
            bases2: None,
            quals1: None,
            quals2: None,
            contig: 0,
            contig2: None,
            start1: None,
            start2: None,
            cigar1: None,
            cigar2: None,
            mapq: DEFAULT_MAPQ,
            strand1: Strand::Plus,
            strand2: Strand::Minus,
            read_group: None,
            duplicate: false,
            attrs: Vec::new(),
        }
    }

    /// Sets the read name shared by both reads.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn bases1(mut self, bases: &str) -> Self {
        self.bases1 = Some(bases.to_string());
        self
    }

    #[must_use]
    pub fn bases2(mut self, bases: &str) -> Self {
        self.bases2 = Some(bases.to_string());
        self
    }

    /// Sets the R1 base qualities as raw phred scores.
    #[must_use]
    pub fn quals1(mut self, quals: &[u8]) -> Self {
        self.quals1 = Some(quals.to_vec());
        self
    }

    /// Sets the R2 base qualities as raw phred scores.
    #[must_use]
    pub fn quals2(mut self, quals: &[u8]) -> Self {
        self.quals2 = Some(quals.to_vec());
        self
    }

    /// Sets the reference index for both reads.
    #[must_use]
    pub fn contig(mut self, contig: usize) -> Self {
        self.contig = contig;
        self
    }

    /// Sets a different reference index for R2.
    #[must_use]
    pub fn contig2(mut self, contig: usize) -> Self {
        self.contig2 = Some(contig);
        self
    }

    /// Sets the 1-based alignment start of R1. R1 is unmapped unless this is set.
    #[must_use]
    pub fn start1(mut self, start: usize) -> Self {
        self.start1 = Some(start);
        self
    }

    /// Sets the 1-based alignment start of R2. R2 is unmapped unless this is set.
    #[must_use]
    pub fn start2(mut self, start: usize) -> Self {
        self.start2 = Some(start);
        self
    }

    #[must_use]
    pub fn cigar1(mut self, cigar: &str) -> Self {
        self.cigar1 = Some(cigar.to_string());
        self
    }

    #[must_use]
    pub fn cigar2(mut self, cigar: &str) -> Self {
        self.cigar2 = Some(cigar.to_string());
        self
    }

    #[must_use]
    pub fn mapq(mut self, mapq: u8) -> Self {
        self.mapq = mapq;
        self
    }

    #[must_use]
    pub fn strand1(mut self, strand: Strand) -> Self {
        self.strand1 = strand;
        self
    }

    #[must_use]
    pub fn strand2(mut self, strand: Strand) -> Self {
        self.strand2 = strand;
        self
    }

    #[must_use]
    pub fn unmapped2(mut self) -> Self {
        self.start2 = None;
        self
    }

    /// Sets the read group of both reads.
    #[must_use]
    pub fn read_group(mut self, id: &str) -> Self {
        self.read_group = Some(id.to_string());
        self
    }

    /// Sets the duplicate flag on both reads.
    #[must_use]
    pub fn duplicate(mut self) -> Self {
        self.duplicate = true;
        self
    }

    /// Adds a tag to both reads.
    #[must_use]
    pub fn attr<V: Into<BufValue>>(mut self, tag: &str, value: V) -> Self {
        self.attrs.push((tag.to_string(), value.into()));
        self
    }

    /// Builds the pair, adds both records to the parent and returns them.
    ///
    /// # Panics
    ///
    /// Panics if a start position is zero or the mapping quality is 255.
    #[must_use]
    pub fn build(self) -> (RecordBuf, RecordBuf) {
        let name = self.name.unwrap_or_else(|| self.parent.next_name());
        let bases1 = self.bases1.unwrap_or_else(|| self.parent.default_bases());
        let bases2 = self.bases2.unwrap_or_else(|| self.parent.default_bases());
        let quals1 = self.quals1.unwrap_or_else(|| vec![self.parent.base_quality; bases1.len()]);
        let quals2 = self.quals2.unwrap_or_else(|| vec![self.parent.base_quality; bases2.len()]);
        let cigar1 = self.cigar1.unwrap_or_else(|| format!("{}M", bases1.len()));
        let cigar2 = self.cigar2.unwrap_or_else(|| format!("{}M", bases2.len()));
        let contig2 = self.contig2.unwrap_or(self.contig);
        let read_group = self.read_group.unwrap_or_else(|| DEFAULT_READ_GROUP_ID.to_string());

        let ends = [
            (self.start1, self.contig, &bases1, quals1, &cigar1, self.strand1),
            (self.start2, contig2, &bases2, quals2, &cigar2, self.strand2),
        ];
        let mut records = Vec::with_capacity(2);
        for (i, (start, contig, bases, quals, cigar, strand)) in ends.iter().enumerate() {
            let (mate_start, mate_contig, mate_strand) = if i == 0 {
                (ends[1].0, ends[1].1, ends[1].5)
            } else {
                (ends[0].0, ends[0].1, ends[0].5)
            };

            let mut rec = RecordBuf::default();
            *rec.name_mut() = Some(BString::from(name.as_bytes()));
            *rec.sequence_mut() = Sequence::from(bases.as_bytes().to_vec());
            *rec.quality_scores_mut() = QualityScores::from(quals.clone());

            let mut flags = Flags::SEGMENTED;
            flags |= if i == 0 { Flags::FIRST_SEGMENT } else { Flags::LAST_SEGMENT };
            if start.is_none() {
                flags |= Flags::UNMAPPED;
            }
            if mate_start.is_none() {
                flags |= Flags::MATE_UNMAPPED;
            }
            if strand.is_negative() {
                flags |= Flags::REVERSE_COMPLEMENTED;
            }
            if mate_strand.is_negative() {
                flags |= Flags::MATE_REVERSE_COMPLEMENTED;
            }
            if self.duplicate {
                flags |= Flags::DUPLICATE;
            }
            *rec.flags_mut() = flags;

            if let Some(start) = start {
                *rec.reference_sequence_id_mut() = Some(*contig);
                *rec.alignment_start_mut() = Some(Position::try_from(*start).unwrap());
                *rec.cigar_mut() = parse_cigar(cigar).into_iter().collect();
                *rec.mapping_quality_mut() = Some(MappingQuality::try_from(self.mapq).unwrap());
            }
            if let Some(mate_start) = mate_start {
                *rec.mate_reference_sequence_id_mut() = Some(mate_contig);
                *rec.mate_alignment_start_mut() = Some(Position::try_from(mate_start).unwrap());
            }

            insert_attrs(&mut rec, &read_group, &self.attrs);
            records.push(rec);
        }

        let second = records.pop().unwrap();
        let first = records.pop().unwrap();
        self.parent.records.push(first.clone());
        self.parent.records.push(second.clone());
        (first, second)
    }
}

/// Builder for an unpaired read, or a secondary/supplementary alignment.
pub struct FragBuilder<'a> {
    parent: &'a mut SamBuilder,
    name: Option<String>,
    bases: Option<String>,
    quals: Option<Vec<u8>>,
    contig: usize,
    start: Option<usize>,
    cigar: Option<String>,
    mapq: u8,
    strand: Strand,
    extra_flags: Flags,
    read_group: Option<String>,
    attrs: Vec<(String, BufValue)>,
}

impl<'a> FragBuilder<'a> {
    fn new(parent: &'a mut SamBuilder) -> Self {
        Self {
            parent,
            name: None,
            bases: None,
            quals: None,
            contig: 0,
            start: None,
            cigar: None,
            mapq: DEFAULT_MAPQ,
            strand: Strand::Plus,
            extra_flags: Flags::empty(),
            read_group: None,
            attrs: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn bases(mut self, bases: &str) -> Self {
        self.bases = Some(bases.to_string());
        self
    }

    /// Sets the base qualities as raw phred scores.
    #[must_use]
    pub fn quals(mut self, quals: &[u8]) -> Self {
        self.quals = Some(quals.to_vec());
        self
    }

    #[must_use]
    pub fn contig(mut self, contig: usize) -> Self {
        self.contig = contig;
        self
    }

    /// Sets the 1-based alignment start. The read is unmapped unless this is set.
    #[must_use]
    pub fn start(mut self, start: usize) -> Self {
        self.start = Some(start);
        self
    }

    #[must_use]
    pub fn cigar(mut self, cigar: &str) -> Self {
        self.cigar = Some(cigar.to_string());
        self
    }

    #[must_use]
    pub fn mapq(mut self, mapq: u8) -> Self {
        self.mapq = mapq;
        self
    }

    #[must_use]
    pub fn strand(mut self, strand: Strand) -> Self {
        self.strand = strand;
        self
    }

    #[must_use]
    pub fn secondary(mut self) -> Self {
        self.extra_flags |= Flags::SECONDARY;
        self
    }

    #[must_use]
    pub fn supplementary(mut self) -> Self {
        self.extra_flags |= Flags::SUPPLEMENTARY;
        self
    }

    /// Sets the duplicate flag.
    #[must_use]
    pub fn duplicate(mut self) -> Self {
        self.extra_flags |= Flags::DUPLICATE;
        self
    }

    #[must_use]
    pub fn read_group(mut self, id: &str) -> Self {
        self.read_group = Some(id.to_string());
        self
    }

    #[must_use]
    pub fn attr<V: Into<BufValue>>(mut self, tag: &str, value: V) -> Self {
        self.attrs.push((tag.to_string(), value.into()));
        self
    }

    /// Builds the record, adds it to the parent and returns it.
    ///
    /// # Panics
    ///
    /// Panics if the start position is zero or the mapping quality is 255.
    #[must_use]
    pub fn build(self) -> RecordBuf {
        let name = self.name.unwrap_or_else(|| self.parent.next_name());
        let bases = self.bases.unwrap_or_else(|| self.parent.default_bases());
        let quals = self.quals.unwrap_or_else(|| vec![self.parent.base_quality; bases.len()]);
        let cigar = self.cigar.unwrap_or_else(|| format!("{}M", bases.len()));
        let read_group = self.read_group.unwrap_or_else(|| DEFAULT_READ_GROUP_ID.to_string());

        let mut rec = RecordBuf::default();
        *rec.name_mut() = Some(BString::from(name.as_bytes()));
        *rec.sequence_mut() = Sequence::from(bases.as_bytes().to_vec());
        *rec.quality_scores_mut() = QualityScores::from(quals);

        let mut flags = self.extra_flags;
        if self.start.is_none() {
            flags |= Flags::UNMAPPED;
        }
        if self.strand.is_negative() {
            flags |= Flags::REVERSE_COMPLEMENTED;
        }
        *rec.flags_mut() = flags;

        if let Some(start) = self.start {
            *rec.reference_sequence_id_mut() = Some(self.contig);
            *rec.alignment_start_mut() = Some(Position::try_from(start).unwrap());
            *rec.cigar_mut() = parse_cigar(&cigar).into_iter().collect();
            *rec.mapping_quality_mut() = Some(MappingQuality::try_from(self.mapq).unwrap());
        }

        insert_attrs(&mut rec, &read_group, &self.attrs);
        self.parent.records.push(rec.clone());
        rec
    }
}

/// Parses a CIGAR string such as `5S90M5H` into operations.
///
/// # Panics
///
/// Panics if the CIGAR string is malformed.
#[must_use]
pub fn parse_cigar(cigar_str: &str) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut num_str = String::new();

    for c in cigar_str.chars() {
        if c.is_ascii_digit() {
            num_str.push(c);
        } else {
            let len: usize = num_str.parse().expect("Invalid CIGAR: expected number");
            let kind = match c {
                'M' => Kind::Match,
                'I' => Kind::Insertion,
                'D' => Kind::Deletion,
                'N' => Kind::Skip,
                'S' => Kind::SoftClip,
                'H' => Kind::HardClip,
                'P' => Kind::Pad,
                '=' => Kind::SequenceMatch,
                'X' => Kind::SequenceMismatch,
                _ => panic!("Unknown CIGAR operation: {c}"),
            };
            ops.push(Op::new(kind, len));
            num_str.clear();
        }
    }

    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_defaults() {
        let mut builder = SamBuilder::new();
        let (r1, r2) = builder.add_pair().name("p1").start1(100).start2(250).build();

        assert_eq!(r1.name().map(|n| n.to_vec()), Some(b"p1".to_vec()));
        assert!(r1.flags().is_segmented() && r1.flags().is_first_segment());
        assert!(r2.flags().is_last_segment() && r2.flags().is_reverse_complemented());
        assert!(r1.flags().is_mate_reverse_complemented());
        assert_eq!(r1.mate_alignment_start(), Position::new(250));
        assert_eq!(r2.mate_alignment_start(), Position::new(100));
        assert_eq!(r1.sequence().len(), DEFAULT_READ_LENGTH);
        assert!(r1.data().get(&Tag::READ_GROUP).is_some());
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn test_pair_with_unmapped_mate() {
        let mut builder = SamBuilder::new();
        let (r1, r2) = builder.add_pair().start1(100).unmapped2().build();
        assert!(!r1.flags().is_unmapped() && r1.flags().is_mate_unmapped());
        assert!(r2.flags().is_unmapped());
        assert!(r2.reference_sequence_id().is_none());
    }

    #[test]
    fn test_frag_flags() {
        let mut builder = SamBuilder::new();
        let rec = builder.add_frag().start(10).supplementary().duplicate().build();
        assert!(rec.flags().is_supplementary());
        assert!(rec.flags().is_duplicate());
        assert!(!rec.flags().is_segmented());
    }

    #[test]
    fn test_header_contents() {
        let mut builder = SamBuilder::new();
        builder.add_read_group("B", None);
        let header = builder.header();
        assert_eq!(header.reference_sequences().len(), 3);
        assert_eq!(header.read_groups().len(), 2);
        let so = header.header().and_then(|hd| hd.other_fields().get(&header_tag::SORT_ORDER));
        assert_eq!(so.map(|v| v.to_vec()), Some(b"coordinate".to_vec()));

        let unsorted = SamBuilder::new().with_sort_order(None).header();
        assert!(unsorted.header().is_none());
    }

    #[test]
    fn test_parse_cigar() {
        let ops = parse_cigar("5S90M2I3D5H");
        assert_eq!(ops.len(), 5);
        assert_eq!(ops[0], Op::new(Kind::SoftClip, 5));
        assert_eq!(ops[4], Op::new(Kind::HardClip, 5));
    }

    #[test]
    fn test_write_sorted_bam_orders_records() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sorted.bam");
        let mut builder = SamBuilder::new();
        builder.add_frag().start(500).build();
        builder.add_frag().contig(1).start(5).build();
        builder.add_frag().start(20).build();
        builder.write_sorted_bam(&path).unwrap();

        let mut reader = noodles::bam::io::Reader::new(std::fs::File::open(&path).unwrap());
        let header = reader.read_header().unwrap();
        let starts: Vec<_> = reader
            .record_bufs(&header)
            .map(|r| {
                let r = r.unwrap();
                (r.reference_sequence_id().unwrap(), usize::from(r.alignment_start().unwrap()))
            })
            .collect();
        assert_eq!(starts, vec![(0, 20), (0, 500), (1, 5)]);
    }
}

//! Resolution of duplicate sets into per-record decisions.
//!
//! A duplicate set is a run of [`ReadEnds`] sharing a duplication key. The resolver picks the
//! member with the highest score as the representative (ties go to the earliest read in the input)
//! and marks every other member as a duplicate. The optical finder then flags the duplicates that
//! sit next to another member of the set on the flowcell.
//!
//! Decisions are recorded by record ordinal in a [`DuplicateAccumulator`], whose spillable
//! collections are replayed in ordinal order during the output pass through [`DuplicateMarks`].

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use bstr::BString;
use clap::ValueEnum;
use log::debug;

use crate::errors::Result;
use crate::optical::{OpticalDuplicateFinder, PhysicalLocation};
use crate::read_ends::{Orientation, ReadEnds};
use crate::sort::{ResidencyTracker, SortedIter, SortingCollection, SpillRecord, read_exact_or_eof};

/// How true fragments relate to pairs that share their 5' position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FragmentPolicy {
    /// Fragments form their own duplicate sets, separate from pairs.
    #[default]
    Independent,
    /// A fragment that shares its position with a mapped pair is always a duplicate.
    PairsWin,
}

/// The representative tag applied to every member of a duplicate set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateSetTag {
    /// Name of the set's representative read.
    pub representative: BString,
    pub set_size: u32,
}

/// The outcome for one member of a duplicate set, or for one record at output time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputDecision {
    pub duplicate: bool,
    /// Implies `duplicate`.
    pub optical: bool,
    pub set_tag: Option<DuplicateSetTag>,
}

/// A representative tag attached to one record ordinal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RepresentativeEntry {
    pub index: u64,
    pub set_size: u32,
    pub representative: BString,
}

impl SpillRecord for RepresentativeEntry {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let name_len = u32::try_from(self.representative.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "read name too long"))?;
        writer.write_all(&self.index.to_le_bytes())?;
        writer.write_all(&self.set_size.to_le_bytes())?;
        writer.write_all(&name_len.to_le_bytes())?;
        writer.write_all(&self.representative)
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut index = [0u8; 8];
        if !read_exact_or_eof(reader, &mut index)? {
            return Ok(None);
        }
        let mut set_size = [0u8; 4];
        reader.read_exact(&mut set_size)?;
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let mut name = vec![0u8; u32::from_le_bytes(len) as usize];
        reader.read_exact(&mut name)?;
        Ok(Some(Self {
            index: u64::from_le_bytes(index),
            set_size: u32::from_le_bytes(set_size),
            representative: BString::from(name),
        }))
    }
}

/// Distribution of duplicate-set sizes for one library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateSetHistogram {
    /// Number of sets of each size.
    pub set_sizes: BTreeMap<usize, u64>,
    /// Number of sets of each size after removing optical duplicates.
    pub non_optical_set_sizes: BTreeMap<usize, u64>,
    /// Number of sets with each count of optical duplicates plus one.
    pub optical_set_sizes: BTreeMap<usize, u64>,
}

impl DuplicateSetHistogram {
    fn record(&mut self, size: usize, optical: usize) {
        *self.set_sizes.entry(size).or_insert(0) += 1;
        *self.non_optical_set_sizes.entry(size - optical).or_insert(0) += 1;
        *self.optical_set_sizes.entry(optical + 1).or_insert(0) += 1;
    }

    /// Largest set recorded.
    #[must_use]
    pub fn max_set_size(&self) -> usize {
        self.set_sizes.keys().next_back().copied().unwrap_or(0)
    }
}

/// Collects the decisions made while resolving duplicate sets.
pub struct DuplicateAccumulator {
    duplicates: SortingCollection<u64>,
    optical: SortingCollection<u64>,
    representatives: SortingCollection<RepresentativeEntry>,
    histograms: BTreeMap<u16, DuplicateSetHistogram>,
    pair_sets: u64,
    fragment_sets: u64,
}

impl DuplicateAccumulator {
    /// `max_records_in_ram` is shared by the three decision collections, which all count into
    /// `tracker`.
    #[must_use]
    pub fn new(
        max_records_in_ram: usize,
        temp_dir: Option<PathBuf>,
        threads: usize,
        tracker: &ResidencyTracker,
    ) -> Self {
        let share = (max_records_in_ram / 3).max(1);
        Self {
            duplicates: SortingCollection::builder("duplicate ordinals")
                .max_records_in_ram(share)
                .temp_dir(temp_dir.clone())
                .threads(threads)
                .tracker(tracker.clone())
                .build(),
            optical: SortingCollection::builder("optical ordinals")
                .max_records_in_ram(share)
                .temp_dir(temp_dir.clone())
                .threads(threads)
                .tracker(tracker.clone())
                .build(),
            representatives: SortingCollection::builder("representative tags")
                .max_records_in_ram(share)
                .temp_dir(temp_dir)
                .threads(threads)
                .tracker(tracker.clone())
                .build(),
            histograms: BTreeMap::new(),
            pair_sets: 0,
            fragment_sets: 0,
        }
    }

    fn add_duplicate(&mut self, ends: &ReadEnds) -> Result<()> {
        self.duplicates.add(ends.read1_index)?;
        if ends.read2_index != ends.read1_index {
            self.duplicates.add(ends.read2_index)?;
        }
        Ok(())
    }

    fn add_optical(&mut self, ends: &ReadEnds) -> Result<()> {
        self.optical.add(ends.read1_index)?;
        if ends.read2_index != ends.read1_index {
            self.optical.add(ends.read2_index)?;
        }
        Ok(())
    }

    fn add_set_tag(&mut self, ends: &ReadEnds, tag: &DuplicateSetTag) -> Result<()> {
        let mut indices = vec![ends.read1_index];
        if ends.read2_index != ends.read1_index {
            indices.push(ends.read2_index);
        }
        for index in indices {
            self.representatives.add(RepresentativeEntry {
                index,
                set_size: tag.set_size,
                representative: tag.representative.clone(),
            })?;
        }
        Ok(())
    }

    fn record_set(&mut self, library: u16, size: usize, optical: usize) {
        self.histograms.entry(library).or_default().record(size, optical);
    }

    /// Number of duplicate record ordinals recorded so far.
    #[must_use]
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.len()
    }

    #[must_use]
    pub fn optical_count(&self) -> u64 {
        self.optical.len()
    }

    /// Number of pair and fragment duplicate sets of size > 1 resolved so far.
    #[must_use]
    pub fn set_counts(&self) -> (u64, u64) {
        (self.pair_sets, self.fragment_sets)
    }

    /// Upper bound on the items the three collections have held in memory at once.
    #[must_use]
    pub fn peak_resident(&self) -> usize {
        self.duplicates.peak_resident()
            + self.optical.peak_resident()
            + self.representatives.peak_resident()
    }

    /// Finishes accumulation, returning cursors over the recorded decisions in ordinal order.
    ///
    /// # Errors
    ///
    /// Returns an error if a spill file cannot be written or reopened.
    pub fn finish(self) -> Result<DuplicateMarks> {
        debug!(
            "Recorded {} duplicate and {} optical ordinals from {} pair and {} fragment sets",
            self.duplicates.len(),
            self.optical.len(),
            self.pair_sets,
            self.fragment_sets
        );
        Ok(DuplicateMarks {
            duplicates: OrdinalCursor::new(self.duplicates.into_sorted_iter()?),
            optical: OrdinalCursor::new(self.optical.into_sorted_iter()?),
            representatives: OrdinalCursor::new(self.representatives.into_sorted_iter()?),
            histograms: self.histograms,
        })
    }
}

/// Items keyed by record ordinal.
trait Ordinal {
    fn ordinal(&self) -> u64;
}

impl Ordinal for u64 {
    fn ordinal(&self) -> u64 {
        *self
    }
}

impl Ordinal for RepresentativeEntry {
    fn ordinal(&self) -> u64 {
        self.index
    }
}

/// Walks a sorted stream of ordinal-keyed items alongside the input records.
struct OrdinalCursor<T> {
    iter: SortedIter<T>,
    peeked: Option<T>,
}

impl<T: SpillRecord + Ordinal> OrdinalCursor<T> {
    fn new(iter: SortedIter<T>) -> Self {
        Self { iter, peeked: None }
    }

    /// Returns the item for `index`, if any; `index` must not decrease between calls.
    fn take(&mut self, index: u64) -> Result<Option<T>> {
        let mut found = None;
        loop {
            if self.peeked.is_none() {
                self.peeked = self.iter.next().transpose()?;
            }
            match self.peeked.take() {
                Some(item) if item.ordinal() < index => {}
                Some(item) if item.ordinal() == index => {
                    if found.is_none() {
                        found = Some(item);
                    }
                }
                other => {
                    self.peeked = other;
                    return Ok(found);
                }
            }
        }
    }
}

/// Recorded decisions, replayed in record order during the output pass.
pub struct DuplicateMarks {
    duplicates: OrdinalCursor<u64>,
    optical: OrdinalCursor<u64>,
    representatives: OrdinalCursor<RepresentativeEntry>,
    histograms: BTreeMap<u16, DuplicateSetHistogram>,
}

impl DuplicateMarks {
    /// Decision for the record at `index`; indices must be visited in increasing order.
    ///
    /// # Errors
    ///
    /// Returns an error if a spill file cannot be read.
    pub fn decision_for(&mut self, index: u64) -> Result<OutputDecision> {
        let duplicate = self.duplicates.take(index)?.is_some();
        let optical = self.optical.take(index)?.is_some();
        let set_tag = self.representatives.take(index)?.map(|entry| DuplicateSetTag {
            representative: entry.representative,
            set_size: entry.set_size,
        });
        Ok(OutputDecision { duplicate: duplicate || optical, optical, set_tag })
    }

    /// Duplicate-set size histograms by library id.
    #[must_use]
    pub fn histograms(&self) -> &BTreeMap<u16, DuplicateSetHistogram> {
        &self.histograms
    }
}

/// Index of the member to keep: highest score, then earliest read1 in the input.
fn representative_index(group: &[&ReadEnds]) -> usize {
    let mut best = 0;
    for (i, ends) in group.iter().enumerate().skip(1) {
        let current = group[best];
        if ends.score > current.score
            || (ends.score == current.score && ends.read1_index < current.read1_index)
        {
            best = i;
        }
    }
    best
}

/// Runs optical detection over `members`, splitting FR from RF pairs.
///
/// Returns one flag per member.
fn optical_flags(
    members: &[&ReadEnds],
    keeper: usize,
    finder: &OpticalDuplicateFinder,
) -> Vec<bool> {
    let has_fr = members.iter().any(|e| e.optical_orientation == Orientation::FR);
    let has_rf = members.iter().any(|e| e.optical_orientation == Orientation::RF);

    let partitions: Vec<Vec<usize>> = if has_fr && has_rf {
        let (fr, rest): (Vec<usize>, Vec<usize>) = (0..members.len())
            .partition(|&i| members[i].optical_orientation == Orientation::FR);
        vec![fr, rest]
    } else {
        vec![(0..members.len()).collect()]
    };

    let mut flags = vec![false; members.len()];
    for partition in partitions {
        let locations: Vec<Option<PhysicalLocation>> =
            partition.iter().map(|&i| members[i].location).collect();
        let scores: Vec<u32> = partition.iter().map(|&i| members[i].score).collect();
        let local_keeper = partition.iter().position(|&i| i == keeper);
        let partition_flags = finder.find_optical_duplicates(&locations, &scores, local_keeper);
        for (&i, flag) in partition.iter().zip(partition_flags) {
            flags[i] = flag;
        }
    }
    flags
}

/// Resolves a set of members that are compared with each other, recording the decisions.
fn resolve_set(
    members: &[&ReadEnds],
    finder: &OpticalDuplicateFinder,
    tag_members: bool,
    acc: &mut DuplicateAccumulator,
) -> Result<Vec<OutputDecision>> {
    if members.len() < 2 {
        return Ok(vec![OutputDecision::default(); members.len()]);
    }

    let keeper = representative_index(members);
    let optical = optical_flags(members, keeper, finder);
    let set_tag = tag_members.then(|| DuplicateSetTag {
        representative: members[keeper].read_name.clone(),
        set_size: u32::try_from(members.len()).unwrap_or(u32::MAX),
    });

    let mut decisions = Vec::with_capacity(members.len());
    for (i, ends) in members.iter().enumerate() {
        let duplicate = i != keeper;
        if duplicate {
            acc.add_duplicate(ends)?;
        }
        if optical[i] {
            acc.add_optical(ends)?;
        }
        if let Some(tag) = &set_tag {
            acc.add_set_tag(ends, tag)?;
        }
        decisions.push(OutputDecision { duplicate, optical: optical[i], set_tag: set_tag.clone() });
    }

    let optical_count = OpticalDuplicateFinder::count(&optical);
    acc.record_set(members[keeper].library, members.len(), optical_count);
    Ok(decisions)
}

/// Resolves a set of read pairs sharing their full duplication key.
///
/// Returns one decision per member, in the same order as `group`.
///
/// # Errors
///
/// Returns an error if a decision cannot be spilled.
pub fn resolve_pairs(
    group: &[ReadEnds],
    finder: &OpticalDuplicateFinder,
    tag_members: bool,
    acc: &mut DuplicateAccumulator,
) -> Result<Vec<OutputDecision>> {
    let members: Vec<&ReadEnds> = group.iter().collect();
    let decisions = resolve_set(&members, finder, tag_members, acc)?;
    if group.len() > 1 {
        acc.pair_sets += 1;
    }
    Ok(decisions)
}

/// Resolves a set of fragment ends sharing library, 5' position and strand.
///
/// Members that are one end of a mapped pair are decided in the pair pass and always get a default
/// decision here. How the remaining true fragments are treated depends on `policy`.
///
/// # Errors
///
/// Returns an error if a decision cannot be spilled.
pub fn resolve_fragments(
    group: &[ReadEnds],
    policy: FragmentPolicy,
    finder: &OpticalDuplicateFinder,
    tag_members: bool,
    acc: &mut DuplicateAccumulator,
) -> Result<Vec<OutputDecision>> {
    let mut decisions = vec![OutputDecision::default(); group.len()];
    let fragment_idx: Vec<usize> = (0..group.len()).filter(|&i| !group[i].is_paired()).collect();
    if fragment_idx.is_empty() {
        return Ok(decisions);
    }

    let has_pairs = fragment_idx.len() < group.len();
    if policy == FragmentPolicy::PairsWin && has_pairs {
        for &i in &fragment_idx {
            acc.add_duplicate(&group[i])?;
            decisions[i].duplicate = true;
        }
        acc.fragment_sets += 1;
        return Ok(decisions);
    }

    let members: Vec<&ReadEnds> = fragment_idx.iter().map(|&i| &group[i]).collect();
    let resolved = resolve_set(&members, finder, tag_members, acc)?;
    if members.len() > 1 {
        acc.fragment_sets += 1;
    }
    for (&i, decision) in fragment_idx.iter().zip(resolved) {
        decisions[i] = decision;
    }
    Ok(decisions)
}

//! Mates waiting for their partner during the key-building scan.
//!
//! A mate whose partner lies on the reference being scanned waits in an in-memory table. A mate
//! whose partner lies on a later reference is parked in a BGZF file for that reference instead.
//! When the scan enters a reference, its parked mates are sorted by partner start and moved into
//! the table only once the scan reaches that start. The table therefore holds mates near the scan
//! position, not every pair that spans two references.
//!
//! Partner starts come from the record's `PNEXT`, so parked mates rely on consistent mate fields.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use bstr::BString;
use log::debug;
use noodles::bgzf;
use tempfile::TempDir;

use crate::errors::{MarkDupError, Result};
use crate::read_ends::ReadEnds;
use crate::sort::{
    ChunkWriter, DEFAULT_MAX_RECORDS_IN_RAM, ResidencyTracker, SortedIter, SortingCollection,
    SpillRecord, read_exact_or_eof,
};

/// Most park files open for appending at once.
const MAX_OPEN_PARK_FILES: usize = 64;

/// Identifies the two mates of a pair: read-group ordinal and read name.
pub type MateKey = (u16, BString);

/// A mate parked until the scan reaches its partner's start.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ParkedMate {
    partner_start: i32,
    ends: ReadEnds,
}

impl SpillRecord for ParkedMate {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.partner_start.to_le_bytes())?;
        self.ends.write_to(writer)
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut start = [0u8; 4];
        if !read_exact_or_eof(reader, &mut start)? {
            return Ok(None);
        }
        let ends = ReadEnds::read_from(reader)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "truncated parked mate")
        })?;
        Ok(Some(ParkedMate { partner_start: i32::from_le_bytes(start), ends }))
    }
}

/// One append-only BGZF file per partner reference.
#[derive(Default)]
struct ParkFiles {
    base_dir: Option<PathBuf>,
    dir: Option<TempDir>,
    writers: AHashMap<i32, ChunkWriter>,
}

impl ParkFiles {
    fn path(&mut self, reference: i32) -> Result<PathBuf> {
        if self.dir.is_none() {
            let dir = match &self.base_dir {
                Some(base) => TempDir::new_in(base),
                None => TempDir::new(),
            };
            self.dir = Some(dir.map_err(|source| MarkDupError::Spill {
                operation: "create temp dir",
                path: self.base_dir.clone().unwrap_or_else(std::env::temp_dir),
                source,
            })?);
        }
        let dir = self.dir.as_ref().map(TempDir::path).unwrap_or_else(|| Path::new("."));
        Ok(dir.join(format!("mates_{reference}.bgz")))
    }

    fn append(&mut self, reference: i32, mate: &ParkedMate) -> Result<()> {
        if !self.writers.contains_key(&reference) {
            if self.writers.len() >= MAX_OPEN_PARK_FILES {
                // The furthest reference is needed last.
                let furthest = self.writers.keys().max().copied();
                if let Some(furthest) = furthest {
                    self.close(furthest)?;
                }
            }
            let path = self.path(reference)?;
            self.writers.insert(reference, ChunkWriter::append(&path)?);
        }
        match self.writers.get_mut(&reference) {
            Some(writer) => writer.write(mate),
            None => Ok(()),
        }
    }

    fn close(&mut self, reference: i32) -> Result<()> {
        match self.writers.remove(&reference) {
            Some(writer) => writer.finish(),
            None => Ok(()),
        }
    }

    /// Closes and hands over the park file for `reference`, if any mate was parked there.
    fn take(&mut self, reference: i32) -> Result<Option<PathBuf>> {
        if self.dir.is_none() {
            return Ok(None);
        }
        self.close(reference)?;
        let path = self.path(reference)?;
        Ok(path.exists().then_some(path))
    }
}

/// Mates seen without their partner, keyed by [`MateKey`].
pub struct PendingMates {
    table: AHashMap<MateKey, ReadEnds>,
    reference: Option<i32>,
    arrivals: Option<SortedIter<ParkedMate>>,
    next_arrival: Option<ParkedMate>,
    files: ParkFiles,
    parked: usize,
    arriving: usize,
    abandoned: usize,
    max_records_in_ram: usize,
    threads: usize,
    tracker: ResidencyTracker,
}

impl Default for PendingMates {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS_IN_RAM)
    }
}

impl PendingMates {
    /// Half of `max_records_in_ram` is left to the table; the other half bounds the sort of one
    /// reference's parked mates.
    #[must_use]
    pub fn new(max_records_in_ram: usize) -> Self {
        Self {
            table: AHashMap::new(),
            reference: None,
            arrivals: None,
            next_arrival: None,
            files: ParkFiles::default(),
            parked: 0,
            arriving: 0,
            abandoned: 0,
            max_records_in_ram: max_records_in_ram.max(1),
            threads: 1,
            tracker: ResidencyTracker::new(),
        }
    }

    #[must_use]
    pub fn temp_dir(mut self, path: Option<PathBuf>) -> Self {
        self.files.base_dir = path;
        self
    }

    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Counts table entries and sorted arrivals into `tracker`.
    #[must_use]
    pub fn tracker(mut self, tracker: ResidencyTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Mates held in memory.
    #[must_use]
    pub fn in_memory(&self) -> usize {
        self.table.len()
    }

    /// Mates parked on disk and not yet released into the table.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.parked
    }

    /// Every mate still without its partner, including those whose partner can no longer appear.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len() + self.parked + self.abandoned
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the scan to `start` on `reference`, releasing parked mates whose partner starts at or
    /// before it.
    ///
    /// # Errors
    /// Returns an error if parked mates cannot be read back or sorted.
    pub fn advance(&mut self, reference: i32, start: i32) -> Result<()> {
        if self.reference != Some(reference) {
            self.enter_reference(reference)?;
        }

        while self.next_arrival.as_ref().is_some_and(|mate| mate.partner_start <= start) {
            if let Some(mate) = self.next_arrival.take() {
                self.parked -= 1;
                self.arriving -= 1;
                self.insert(mate.ends);
            }
            self.next_arrival = self.pull_arrival()?;
        }
        Ok(())
    }

    /// Removes and returns the mate waiting under `key`.
    pub fn take(&mut self, key: &MateKey) -> Option<ReadEnds> {
        let ends = self.table.remove(key)?;
        self.tracker.release(1);
        Some(ends)
    }

    /// Stores `ends` until its partner at `partner_start` on `partner_reference` is observed.
    ///
    /// A partner on a reference the scan has already left can no longer appear, so the mate is
    /// only counted.
    ///
    /// # Errors
    /// Returns an error if the mate cannot be written to its park file.
    pub fn park(
        &mut self,
        key: MateKey,
        ends: ReadEnds,
        partner_reference: i32,
        partner_start: i32,
    ) -> Result<()> {
        match self.reference {
            Some(current) if partner_reference == current => {
                if let Some(previous) = self.table.insert(key, ends) {
                    debug!("Read '{}' seen more than twice; keeping the latest", previous.read_name);
                } else {
                    self.tracker.acquire(1);
                }
            }
            Some(current) if partner_reference > current => {
                self.files.append(partner_reference, &ParkedMate { partner_start, ends })?;
                self.parked += 1;
            }
            _ => self.abandoned += 1,
        }
        Ok(())
    }

    fn insert(&mut self, ends: ReadEnds) {
        let key = (ends.read_group, ends.read_name.clone());
        if self.table.insert(key, ends).is_none() {
            self.tracker.acquire(1);
        }
    }

    fn enter_reference(&mut self, reference: i32) -> Result<()> {
        // Whatever waits here has a partner on the reference being left.
        self.abandoned += self.table.len();
        self.tracker.release(self.table.len());
        self.table.clear();
        self.arrivals = None;
        self.next_arrival = None;
        self.parked -= self.arriving;
        self.abandoned += self.arriving;
        self.arriving = 0;
        self.reference = Some(reference);

        if let Some(path) = self.files.take(reference)? {
            let (arrivals, count) = self.sort_park_file(&path)?;
            self.arrivals = Some(arrivals);
            self.arriving = count;
            self.next_arrival = self.pull_arrival()?;
        }
        Ok(())
    }

    /// Sorts one reference's park file by partner start and deletes it. Returns the sorted mates
    /// and their count.
    fn sort_park_file(&self, path: &Path) -> Result<(SortedIter<ParkedMate>, usize)> {
        let read_error = |source| MarkDupError::Spill {
            operation: "read",
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(read_error)?;
        let mut reader = bgzf::io::Reader::new(BufReader::new(file));
        let mut collection = SortingCollection::builder("parked mates")
            .max_records_in_ram((self.max_records_in_ram / 2).max(1))
            .temp_dir(self.files.base_dir.clone())
            .threads(self.threads)
            .tracker(self.tracker.clone())
            .build();
        let mut count = 0;
        while let Some(mate) = ParkedMate::read_from(&mut reader).map_err(read_error)? {
            collection.add(mate)?;
            count += 1;
        }
        drop(reader);
        std::fs::remove_file(path).map_err(|source| MarkDupError::Spill {
            operation: "remove",
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Releasing {count} parked mates in partner order");
        Ok((collection.into_sorted_iter()?, count))
    }

    fn pull_arrival(&mut self) -> Result<Option<ParkedMate>> {
        match self.arrivals.as_mut().and_then(|arrivals| arrivals.next()) {
            Some(result) => result.map(Some),
            None => {
                self.arrivals = None;
                Ok(None)
            }
        }
    }
}

impl Drop for PendingMates {
    fn drop(&mut self) {
        self.tracker.release(self.table.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_ends::Orientation;

    fn ends(name: &str, reference: i32, coordinate: i32) -> ReadEnds {
        ReadEnds {
            library: 1,
            read1_reference: reference,
            read1_coordinate: coordinate,
            orientation: Orientation::F,
            read2_reference: reference + 1,
            read2_coordinate: -1,
            read1_index: u64::try_from(coordinate).unwrap(),
            read2_index: u64::try_from(coordinate).unwrap(),
            score: 30,
            optical_orientation: Orientation::F,
            read_group: 1,
            location: None,
            read_name: BString::from(name),
            barcode: 0,
            read1_barcode: 0,
            read2_barcode: 0,
        }
    }

    fn key(name: &str) -> MateKey {
        (1, BString::from(name))
    }

    #[test]
    fn test_same_reference_mates_wait_in_memory() {
        let mut pending = PendingMates::new(10);
        pending.advance(0, 100).unwrap();
        pending.park(key("a"), ends("a", 0, 100), 0, 300).unwrap();
        assert_eq!(pending.in_memory(), 1);
        assert_eq!(pending.parked(), 0);

        pending.advance(0, 300).unwrap();
        assert_eq!(pending.take(&key("a")).map(|e| e.read1_coordinate), Some(100));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_cross_reference_mates_are_released_in_partner_order() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ResidencyTracker::new();
        let mut pending = PendingMates::new(8)
            .temp_dir(Some(dir.path().to_path_buf()))
            .tracker(tracker.clone());

        // Partners on the next reference, in reverse order of their starts.
        pending.advance(0, 1).unwrap();
        for i in 0..5_000 {
            let name = format!("p{i}");
            pending.park(key(&name), ends(&name, 0, i + 1), 1, 5_000 - i).unwrap();
        }
        assert_eq!(pending.in_memory(), 0);
        assert_eq!(pending.parked(), 5_000);
        assert_eq!(pending.len(), 5_000);

        for start in 1..=5_000 {
            pending.advance(1, start).unwrap();
            assert!(pending.in_memory() <= 1);
            let name = format!("p{}", 5_000 - start);
            assert!(pending.take(&key(&name)).is_some(), "partner of {name} not released");
        }
        assert!(pending.is_empty());
        assert!(tracker.peak() <= 8, "resident peak {}", tracker.peak());
    }

    #[test]
    fn test_mates_left_behind_count_as_unmatched() {
        let mut pending = PendingMates::new(4);
        pending.advance(0, 10).unwrap();
        pending.park(key("same"), ends("same", 0, 10), 0, 50).unwrap();
        pending.park(key("next"), ends("next", 0, 10), 1, 20).unwrap();
        pending.park(key("far"), ends("far", 0, 10), 2, 20).unwrap();

        // Reference 1 is entered past the parked partner's start, then skipped over.
        pending.advance(1, 10).unwrap();
        assert_eq!(pending.len(), 3);
        pending.advance(2, 5).unwrap();
        assert_eq!(pending.len(), 3);
        pending.park(key("behind"), ends("behind", 2, 5), 0, 1).unwrap();
        assert_eq!(pending.len(), 4);

        pending.advance(2, 20).unwrap();
        assert!(pending.take(&key("far")).is_some());
        assert!(pending.take(&key("next")).is_none());
        assert_eq!(pending.len(), 3);
        assert_eq!(pending.parked(), 0);
    }

    #[test]
    fn test_unreleased_arrivals_are_unmatched_when_reference_ends() {
        let dir = tempfile::tempdir().unwrap();
        let mut pending = PendingMates::new(4).temp_dir(Some(dir.path().to_path_buf()));
        pending.advance(0, 1).unwrap();
        for i in 0..10 {
            let name = format!("m{i}");
            pending.park(key(&name), ends(&name, 0, 1), 1, 100 + i).unwrap();
        }

        pending.advance(1, 104).unwrap();
        assert_eq!(pending.in_memory(), 5);
        assert_eq!(pending.parked(), 5);

        pending.advance(2, 1).unwrap();
        assert_eq!(pending.in_memory(), 0);
        assert_eq!(pending.parked(), 0);
        assert_eq!(pending.len(), 10);
    }

    #[test]
    fn test_many_partner_references_share_few_open_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut pending = PendingMates::new(16).temp_dir(Some(dir.path().to_path_buf()));
        pending.advance(0, 1).unwrap();
        let references = i32::try_from(MAX_OPEN_PARK_FILES).unwrap() * 2;
        for round in 0..2 {
            for reference in 1..=references {
                let name = format!("r{reference}_{round}");
                pending.park(key(&name), ends(&name, 0, 1), reference, 1).unwrap();
            }
        }
        assert!(pending.files.writers.len() <= MAX_OPEN_PARK_FILES);

        for reference in 1..=references {
            pending.advance(reference, 1).unwrap();
            for round in 0..2 {
                let name = format!("r{reference}_{round}");
                assert!(pending.take(&key(&name)).is_some(), "{name} lost");
            }
        }
        assert!(pending.is_empty());
    }

    #[test]
    fn test_parked_mate_codec() {
        let mate = ParkedMate { partner_start: 77, ends: ends("x", 3, 12) };
        let mut buf = Vec::new();
        mate.write_to(&mut buf).unwrap();
        let mut reader = buf.as_slice();
        let back = ParkedMate::read_from(&mut reader).unwrap().unwrap();
        assert_eq!(back.partner_start, 77);
        assert_eq!(back.ends.read_name, mate.ends.read_name);
        assert!(ParkedMate::read_from(&mut reader).unwrap().is_none());
    }
}

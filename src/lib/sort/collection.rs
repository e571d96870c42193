//! Spill-to-disk sorting collection.
//!
//! Items are accumulated in memory until the record budget is reached, then sorted and written to
//! a BGZF-compressed spill file inside a collection-owned temporary directory.
//! [`SortingCollection::into_sorted_iter`] merges the spill files back in order.
//!
//! # Memory bound
//!
//! Every item in memory is counted against `max_records_in_ram`:
//!
//! - While adding, a single thread sorts and writes a full buffer inline. With more threads the
//!   sort+spill runs on a background worker fed through a rendezvous channel, so at most one batch
//!   is in flight while the next fills; each batch holds half the budget.
//! - While merging, each spill file is read in batches sized so that all files together stay
//!   within the budget. When there are too many files for that, groups of files are first merged
//!   into larger ones.

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, info};
use noodles::bgzf;
use noodles::bgzf::io::writer::CompressionLevel;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tempfile::TempDir;

use super::residency::{Residency, ResidencyTracker};
use super::{DEFAULT_MAX_RECORDS_IN_RAM, SortStats, SpillRecord};
use crate::errors::{MarkDupError, Result};

/// Buffer size for spill file readers and writers.
const MERGE_BUFFER_SIZE: usize = 64 * 1024;

/// Upper limit on items per batch when reading a spill file back.
const MAX_READ_BATCH_SIZE: usize = 1024;

/// Batches held per spill file with read-ahead: one being merged, one queued, one being read.
const READ_AHEAD_SLOTS: usize = 3;

/// Spill files are always merged at least this many at a time.
const MIN_FAN_IN: usize = 2;

/// Spill files trade compression for speed.
const TEMP_COMPRESSION_LEVEL: CompressionLevel = CompressionLevel::FAST;

fn spill_error(operation: &'static str, path: &Path, source: io::Error) -> MarkDupError {
    MarkDupError::Spill { operation, path: path.to_path_buf(), source }
}

/// Builder for [`SortingCollection`].
#[derive(Debug, Clone)]
pub struct SortingCollectionBuilder<T> {
    name: String,
    max_records_in_ram: usize,
    temp_dir: Option<PathBuf>,
    threads: usize,
    tracker: Option<ResidencyTracker>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SpillRecord> SortingCollectionBuilder<T> {
    /// Maximum number of items held in memory at once.
    #[must_use]
    pub fn max_records_in_ram(mut self, max_records: usize) -> Self {
        self.max_records_in_ram = max_records.max(1);
        self
    }

    /// Base directory for spill files; the system temp dir is used when unset.
    #[must_use]
    pub fn temp_dir(mut self, path: Option<PathBuf>) -> Self {
        self.temp_dir = path;
        self
    }

    /// Threads for sorting and spilling.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Also counts this collection's resident items into `tracker`.
    #[must_use]
    pub fn tracker(mut self, tracker: ResidencyTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    #[must_use]
    pub fn build(self) -> SortingCollection<T> {
        let background = self.threads > 1 && self.max_records_in_ram >= 2;
        let batch_capacity =
            if background { self.max_records_in_ram / 2 } else { self.max_records_in_ram };

        SortingCollection {
            name: self.name,
            max_records_in_ram: self.max_records_in_ram,
            batch_capacity,
            base_dir: self.temp_dir,
            threads: self.threads,
            background,
            buffer: Vec::new(),
            worker: None,
            chunk_files: Vec::new(),
            temp_dir: None,
            residency: Residency::new(self.tracker),
            stats: SortStats::default(),
        }
    }
}

/// Background sort+spill worker.
struct SpillWorker<T> {
    sender: Option<Sender<(Vec<T>, PathBuf)>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl<T: SpillRecord> SpillWorker<T> {
    fn spawn(threads: usize, residency: Residency) -> Self {
        let (tx, rx): (Sender<(Vec<T>, PathBuf)>, Receiver<(Vec<T>, PathBuf)>) = bounded(0);
        let handle = thread::spawn(move || {
            for (mut batch, path) in rx {
                sort_batch(&mut batch, threads);
                write_chunk(&batch, &path)?;
                residency.release(batch.len());
            }
            Ok(())
        });
        Self { sender: Some(tx), handle: Some(handle) }
    }

    /// Hands a batch to the worker, blocking until the previous batch is written.
    fn send(&mut self, batch: Vec<T>, path: PathBuf) -> Result<()> {
        let sent = self.sender.as_ref().is_some_and(|tx| tx.send((batch, path)).is_ok());
        if sent {
            Ok(())
        } else {
            // The worker only hangs up after an error; surface it.
            self.finish()?;
            Err(spill_error("hand off", Path::new(""), io::Error::other("spill worker exited")))
        }
    }

    /// Waits for every queued batch to be written.
    fn finish(&mut self) -> Result<()> {
        drop(self.sender.take());
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                spill_error("join", Path::new(""), io::Error::other("spill worker panicked"))
            })?,
            None => Ok(()),
        }
    }
}

impl<T> Drop for SpillWorker<T> {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A bounded-memory collection that yields its items in sorted order.
///
/// # Example
///
/// ```
/// use fgmarkdup_lib::sort::SortingCollection;
///
/// let mut collection = SortingCollection::<u64>::builder("example").max_records_in_ram(2).build();
/// for value in [5u64, 3, 9, 1] {
///     collection.add(value).unwrap();
/// }
/// let sorted: Vec<u64> = collection.into_sorted_iter().unwrap().map(|r| r.unwrap()).collect();
/// assert_eq!(sorted, vec![1, 3, 5, 9]);
/// ```
pub struct SortingCollection<T> {
    name: String,
    max_records_in_ram: usize,
    batch_capacity: usize,
    base_dir: Option<PathBuf>,
    threads: usize,
    background: bool,
    buffer: Vec<T>,
    worker: Option<SpillWorker<T>>,
    chunk_files: Vec<PathBuf>,
    temp_dir: Option<TempDir>,
    residency: Residency,
    stats: SortStats,
}

impl<T: SpillRecord> SortingCollection<T> {
    /// Starts a builder; `name` only appears in log messages.
    #[must_use]
    pub fn builder(name: &str) -> SortingCollectionBuilder<T> {
        SortingCollectionBuilder {
            name: name.to_string(),
            max_records_in_ram: DEFAULT_MAX_RECORDS_IN_RAM,
            temp_dir: None,
            threads: 1,
            tracker: None,
            _marker: PhantomData,
        }
    }

    /// Adds an item, spilling the buffer if it is full.
    ///
    /// # Errors
    /// Returns an error if a spill file cannot be created or written.
    pub fn add(&mut self, item: T) -> Result<()> {
        if self.buffer.capacity() == 0 {
            self.buffer.reserve_exact(self.batch_capacity.min(MAX_READ_BATCH_SIZE * 64));
        }
        self.buffer.push(item);
        self.residency.acquire(1);
        self.stats.total_records += 1;
        if self.buffer.len() >= self.batch_capacity {
            self.spill()?;
        }
        Ok(())
    }

    /// Number of items added so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.stats.total_records
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.total_records == 0
    }

    /// Largest number of items held in memory at once.
    #[must_use]
    pub fn peak_resident(&self) -> usize {
        self.residency.peak()
    }

    /// The configured record budget.
    #[must_use]
    pub fn max_records_in_ram(&self) -> usize {
        self.max_records_in_ram
    }

    #[must_use]
    pub fn stats(&self) -> SortStats {
        SortStats { peak_resident: self.residency.peak(), ..self.stats }
    }

    fn next_chunk_path(&mut self) -> Result<PathBuf> {
        if self.temp_dir.is_none() {
            self.temp_dir = Some(create_temp_dir(self.base_dir.as_deref())?);
        }
        let dir = self.temp_dir.as_ref().map(TempDir::path).unwrap_or_else(|| Path::new("."));
        let path = dir.join(format!("chunk_{:04}.bgz", self.stats.chunks_written));
        self.chunk_files.push(path.clone());
        self.stats.chunks_written += 1;
        Ok(path)
    }

    fn spill(&mut self) -> Result<()> {
        let path = self.next_chunk_path()?;
        let mut batch = std::mem::take(&mut self.buffer);
        debug!("{}: spilling {} items to {}", self.name, batch.len(), path.display());

        if self.background {
            let (threads, residency) = (self.threads, self.residency.clone());
            let worker = self.worker.get_or_insert_with(|| SpillWorker::spawn(threads, residency));
            worker.send(batch, path)?;
        } else {
            sort_batch(&mut batch, self.threads);
            write_chunk(&batch, &path)?;
            self.residency.release(batch.len());
        }
        Ok(())
    }

    /// Merges groups of spill files until no more than `plan.fan_in` remain.
    fn reduce_chunks(&mut self, plan: &MergePlan) -> Result<()> {
        while self.chunk_files.len() > plan.fan_in {
            let group: Vec<PathBuf> = self.chunk_files.drain(..plan.fan_in).collect();
            let batch_size = plan.batch_size(group.len(), 1);
            let sources = group
                .iter()
                .map(|path| Source::<T>::open(path, batch_size, false, &self.residency))
                .collect::<Result<Vec<_>>>()?;
            let mut merger = Merger::new(sources)?;

            let path = self.next_chunk_path()?;
            debug!("{}: merging {} spill files into {}", self.name, group.len(), path.display());
            let mut writer = ChunkWriter::create(&path)?;
            while let Some(item) = merger.next_item()? {
                writer.write(&item)?;
                self.residency.release(1);
            }
            writer.finish()?;
            drop(merger);

            for path in &group {
                std::fs::remove_file(path).map_err(|source| spill_error("remove", path, source))?;
            }
            self.stats.merge_passes += 1;
        }
        Ok(())
    }

    /// Consumes the collection and returns an iterator over all items in sorted order.
    ///
    /// # Errors
    /// Returns an error if a pending spill failed or a spill file cannot be written or opened.
    pub fn into_sorted_iter(mut self) -> Result<SortedIter<T>> {
        if let Some(mut worker) = self.worker.take() {
            worker.finish()?;
        }

        let mut residual = std::mem::take(&mut self.buffer);
        sort_batch(&mut residual, self.threads);
        let residency = self.residency.clone();

        if self.chunk_files.is_empty() {
            return Ok(SortedIter::in_memory(residual, residency, self.stats));
        }

        // Everything is merged from disk so the merge alone decides what is resident.
        if !residual.is_empty() {
            let path = self.next_chunk_path()?;
            write_chunk(&residual, &path)?;
            residency.release(residual.len());
        }
        drop(residual);

        let plan = MergePlan::new(self.max_records_in_ram, self.threads);
        self.reduce_chunks(&plan)?;

        let slots = if plan.read_ahead { READ_AHEAD_SLOTS } else { 1 };
        let batch_size = plan.batch_size(self.chunk_files.len(), slots);
        info!(
            "{}: merging {} spill files ({} merge passes, {} items per read)",
            self.name,
            self.chunk_files.len(),
            self.stats.merge_passes,
            batch_size
        );

        let sources = self
            .chunk_files
            .iter()
            .map(|path| Source::open(path, batch_size, plan.read_ahead, &residency))
            .collect::<Result<Vec<_>>>()?;
        let merger = Merger::new(sources)?;
        Ok(SortedIter::merging(merger, self.temp_dir.take(), residency, self.stats))
    }
}

impl<T> Drop for SortingCollection<T> {
    fn drop(&mut self) {
        // The worker releases its own batch once written.
        drop(self.worker.take());
        self.residency.release(self.buffer.len());
    }
}

/// How spill files are merged within the record budget.
#[derive(Debug, Clone, Copy)]
struct MergePlan {
    budget: usize,
    /// Most files merged at once.
    fan_in: usize,
    read_ahead: bool,
}

impl MergePlan {
    fn new(budget: usize, threads: usize) -> Self {
        let read_ahead = threads > 1 && budget / READ_AHEAD_SLOTS >= MIN_FAN_IN;
        let slots = if read_ahead { READ_AHEAD_SLOTS } else { 1 };
        Self { budget, fan_in: (budget / slots).max(MIN_FAN_IN), read_ahead }
    }

    /// Items per read when `files` files, each holding `slots` batches, share the budget.
    fn batch_size(&self, files: usize, slots: usize) -> usize {
        (self.budget / (files.max(1) * slots)).clamp(1, MAX_READ_BATCH_SIZE)
    }
}

/// Creates the collection's temporary directory.
fn create_temp_dir(base: Option<&Path>) -> Result<TempDir> {
    let dir = match base {
        Some(base) => TempDir::new_in(base),
        None => TempDir::new(),
    };
    dir.map_err(|source| MarkDupError::Spill {
        operation: "create temp dir",
        path: base.map_or_else(std::env::temp_dir, Path::to_path_buf),
        source,
    })
}

fn sort_batch<T: SpillRecord>(batch: &mut [T], threads: usize) {
    if threads > 1 {
        batch.par_sort_unstable();
    } else {
        batch.sort_unstable();
    }
}

/// Writes items to a BGZF-compressed spill file.
pub(crate) struct ChunkWriter {
    inner: bgzf::io::Writer<BufWriter<File>>,
    path: PathBuf,
}

impl ChunkWriter {
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|source| spill_error("create", path, source))?;
        Ok(Self::from_file(file, path))
    }

    /// Appends a new BGZF stream to `path`, creating the file if needed.
    pub(crate) fn append(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| spill_error("open", path, source))?;
        Ok(Self::from_file(file, path))
    }

    fn from_file(file: File, path: &Path) -> Self {
        let inner = bgzf::io::writer::Builder::default()
            .set_compression_level(TEMP_COMPRESSION_LEVEL)
            .build_from_writer(BufWriter::with_capacity(MERGE_BUFFER_SIZE, file));
        Self { inner, path: path.to_path_buf() }
    }

    pub(crate) fn write<T: SpillRecord>(&mut self, item: &T) -> Result<()> {
        item.write_to(&mut self.inner).map_err(|source| spill_error("write", &self.path, source))
    }

    /// Writes the BGZF EOF block and flushes the file.
    pub(crate) fn finish(self) -> Result<()> {
        let path = self.path;
        let mut file = self.inner.finish().map_err(|source| spill_error("write", &path, source))?;
        file.flush().map_err(|source| spill_error("write", &path, source))
    }
}

fn write_chunk<T: SpillRecord>(batch: &[T], path: &Path) -> Result<()> {
    let mut writer = ChunkWriter::create(path)?;
    for item in batch {
        writer.write(item)?;
    }
    writer.finish()
}

/// Reads a spill file back in batches, counting each batch as resident.
struct ChunkReader<T> {
    reader: bgzf::io::Reader<BufReader<File>>,
    path: PathBuf,
    batch_size: usize,
    residency: Residency,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SpillRecord> ChunkReader<T> {
    fn open(path: &Path, batch_size: usize, residency: Residency) -> Result<Self> {
        let file = File::open(path).map_err(|source| spill_error("open", path, source))?;
        Ok(Self {
            reader: bgzf::io::Reader::new(BufReader::with_capacity(MERGE_BUFFER_SIZE, file)),
            path: path.to_path_buf(),
            batch_size,
            residency,
            _marker: PhantomData,
        })
    }

    /// Reads up to `batch_size` items; an empty batch means end of file.
    fn read_batch(&mut self) -> Result<Vec<T>> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match T::read_from(&mut self.reader) {
                Ok(Some(item)) => batch.push(item),
                Ok(None) => break,
                Err(source) => return Err(spill_error("read", &self.path, source)),
            }
        }
        self.residency.acquire(batch.len());
        Ok(batch)
    }
}

/// Reads a spill file on a background thread, one batch ahead of the merge.
struct ReadAhead<T> {
    receiver: Option<Receiver<Result<Vec<T>>>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: SpillRecord> ReadAhead<T> {
    fn spawn(mut chunk: ChunkReader<T>) -> Self {
        let (tx, rx) = bounded(READ_AHEAD_SLOTS - 2);
        let handle = thread::spawn(move || {
            loop {
                let batch = chunk.read_batch();
                let done = !matches!(&batch, Ok(b) if !b.is_empty());
                if tx.send(batch).is_err() || done {
                    break;
                }
            }
        });
        Self { receiver: Some(rx), handle: Some(handle) }
    }

    fn next_batch(&mut self) -> Result<Vec<T>> {
        match self.receiver.as_ref().map(Receiver::recv) {
            Some(Ok(batch)) => batch,
            Some(Err(_)) | None => Ok(Vec::new()),
        }
    }
}

impl<T> Drop for ReadAhead<T> {
    fn drop(&mut self) {
        // Close the receiver first so a blocked send returns.
        drop(self.receiver.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One spill file feeding the merge.
enum Source<T> {
    File { reader: ChunkReader<T>, pending: VecDeque<T> },
    ReadAhead { reader: ReadAhead<T>, pending: VecDeque<T> },
}

impl<T: SpillRecord> Source<T> {
    fn open(path: &Path, batch_size: usize, read_ahead: bool, residency: &Residency) -> Result<Self> {
        let reader = ChunkReader::open(path, batch_size, residency.clone())?;
        Ok(if read_ahead {
            Source::ReadAhead { reader: ReadAhead::spawn(reader), pending: VecDeque::new() }
        } else {
            Source::File { reader, pending: VecDeque::new() }
        })
    }

    fn next_item(&mut self) -> Result<Option<T>> {
        match self {
            Source::File { reader, pending } => {
                if pending.is_empty() {
                    pending.extend(reader.read_batch()?);
                }
                Ok(pending.pop_front())
            }
            Source::ReadAhead { reader, pending } => {
                if pending.is_empty() {
                    pending.extend(reader.next_batch()?);
                }
                Ok(pending.pop_front())
            }
        }
    }
}

/// Entry in the merge heap; ties between equal items fall back to source order.
struct HeapEntry<T> {
    item: T,
    source: usize,
}

impl<T: Ord> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl<T: Ord> Eq for HeapEntry<T> {}

impl<T: Ord> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.item.cmp(&other.item).then_with(|| self.source.cmp(&other.source))
    }
}

/// K-way heap merge over sorted spill files.
struct Merger<T> {
    sources: Vec<Source<T>>,
    heap: BinaryHeap<Reverse<HeapEntry<T>>>,
}

impl<T: SpillRecord> Merger<T> {
    fn new(mut sources: Vec<Source<T>>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some(item) = source.next_item()? {
                heap.push(Reverse(HeapEntry { item, source: idx }));
            }
        }
        Ok(Self { sources, heap })
    }

    fn next_item(&mut self) -> Result<Option<T>> {
        let Some(Reverse(HeapEntry { item, source })) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(next) = self.sources[source].next_item()? {
            self.heap.push(Reverse(HeapEntry { item: next, source }));
        }
        Ok(Some(item))
    }
}

/// Sorted iterator over a [`SortingCollection`].
///
/// Owns the collection's temporary directory, which is removed when the iterator is dropped.
/// Items stop counting as resident once they are returned.
pub struct SortedIter<T> {
    state: IterState<T>,
    residency: Residency,
    stats: SortStats,
    failed: bool,
    // Declared last so open spill files are closed before the directory is removed.
    _temp_dir: Option<TempDir>,
}

enum IterState<T> {
    Memory(std::vec::IntoIter<T>),
    Merge(Merger<T>),
    Done,
}

impl<T: SpillRecord> SortedIter<T> {
    fn in_memory(items: Vec<T>, residency: Residency, stats: SortStats) -> Self {
        Self {
            state: IterState::Memory(items.into_iter()),
            residency,
            stats,
            failed: false,
            _temp_dir: None,
        }
    }

    fn merging(
        merger: Merger<T>,
        temp_dir: Option<TempDir>,
        residency: Residency,
        stats: SortStats,
    ) -> Self {
        Self { state: IterState::Merge(merger), residency, stats, failed: false, _temp_dir: temp_dir }
    }

    /// Counts from the collection that produced this iterator, with the peak updated by the merge.
    #[must_use]
    pub fn stats(&self) -> SortStats {
        SortStats { peak_resident: self.residency.peak(), ..self.stats }
    }

    fn next_merged(&mut self) -> Result<Option<T>> {
        let item = match &mut self.state {
            IterState::Memory(iter) => iter.next(),
            IterState::Merge(merger) => merger.next_item()?,
            IterState::Done => None,
        };
        if item.is_some() {
            self.residency.release(1);
        }
        Ok(item)
    }
}

impl<T: SpillRecord> Iterator for SortedIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_merged() {
            Ok(item) => item.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl<T> Drop for SortedIter<T> {
    fn drop(&mut self) {
        // Join read-ahead threads before releasing what is still buffered.
        self.state = IterState::Done;
        self.residency.release_all();
    }
}

//! Bounded-memory external sorting and grouping.
//!
//! [`SortingCollection`] buffers items up to a record budget, spills sorted batches to temporary
//! files and merges them back with a k-way heap merge. [`GroupBy`] turns the merged stream into
//! runs of equal-keyed items.
//!
//! # Architecture
//!
//! ```text
//! add() ──> buffer ──(full)──> sort ──> spill file ─┐
//!                                                    ├──> heap merge ──> GroupBy ──> groups
//!           residual buffer ──> sort ──> spill file ─┘
//! ```
//!
//! Items are spilled with the little-endian [`SpillRecord`] codec inside BGZF blocks. Resident
//! items are counted by a [`ResidencyTracker`] that several collections may share.

pub mod collection;
pub mod group;
pub mod residency;

pub(crate) use collection::ChunkWriter;
pub use collection::{SortedIter, SortingCollection, SortingCollectionBuilder};
pub use group::GroupBy;
pub use residency::ResidencyTracker;

use std::io::{self, Read, Write};

/// Default number of items held in memory before spilling.
pub const DEFAULT_MAX_RECORDS_IN_RAM: usize = 500_000;

/// An item that can be written to and read back from a spill file.
pub trait SpillRecord: Ord + Send + Sized + 'static {
    /// Writes the item.
    ///
    /// # Errors
    /// Returns any error from the underlying writer.
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()>;

    /// Reads the next item, returning `None` at a clean end of file.
    ///
    /// # Errors
    /// Returns an error on a truncated or unreadable item.
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<Self>>;
}

/// Fills `buf`, returning `false` if the reader is at end of file before any byte is read.
///
/// # Errors
/// Returns `UnexpectedEof` if the reader ends part way through `buf`.
pub fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated spill record"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl SpillRecord for u64 {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut buf = [0u8; 8];
        if read_exact_or_eof(reader, &mut buf)? {
            Ok(Some(u64::from_le_bytes(buf)))
        } else {
            Ok(None)
        }
    }
}

/// Counts from one sorting collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortStats {
    /// Items added.
    pub total_records: u64,
    /// Spill files written.
    pub chunks_written: usize,
    /// Largest number of items held in memory at once, while adding or merging.
    pub peak_resident: usize,
    /// Merges of spill files needed before the final merge.
    pub merge_passes: usize,
}

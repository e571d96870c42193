//! Read-group to library mapping.
//!
//! Libraries are numbered in header order starting from 1; id 0 is reserved for
//! [`UNKNOWN_LIBRARY`], used for records without a read group and for read groups with no `LB`.
//! Read groups get their own ordinal (also 1-based, 0 = none) so optical clustering can keep
//! read groups apart.

use ahash::AHashMap;
use noodles::sam::Header;
use noodles::sam::alignment::record::data::field::Tag;
use noodles::sam::alignment::record_buf::RecordBuf;
use noodles::sam::alignment::record_buf::data::field::Value;
use noodles::sam::header::record::value::map::read_group::tag as rg_tag;
use std::sync::Arc;

pub use fgmarkdup_metrics::UNKNOWN_LIBRARY;

/// Library and read-group ids of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadGroupInfo {
    /// Library id (0 = unknown library)
    pub library: u16,
    /// Read-group ordinal (0 = no read group)
    pub read_group: u16,
}

/// Lookup from `RG` tag value to library and read-group ids.
#[derive(Debug, Clone)]
pub struct LibraryIndex {
    lookup: AHashMap<Vec<u8>, ReadGroupInfo>,
    names: Vec<Arc<str>>,
}

impl LibraryIndex {
    /// Builds the index from the header's `@RG` lines.
    #[must_use]
    pub fn from_header(header: &Header) -> Self {
        let unknown: Arc<str> = Arc::from(UNKNOWN_LIBRARY);
        let mut names = vec![Arc::clone(&unknown)];
        let mut library_to_idx: AHashMap<Arc<str>, u16> = AHashMap::new();
        library_to_idx.insert(unknown, 0);
        let mut lookup = AHashMap::new();

        for (ordinal, (id, rg)) in header.read_groups().iter().enumerate() {
            let library = match rg.other_fields().get(&rg_tag::LIBRARY) {
                Some(lb) => Arc::from(lb.to_string()),
                None => Arc::clone(&names[0]),
            };
            let library = *library_to_idx.entry(library.clone()).or_insert_with(|| {
                names.push(library);
                u16::try_from(names.len() - 1).unwrap_or(u16::MAX)
            });
            let read_group = u16::try_from(ordinal + 1).unwrap_or(u16::MAX);
            lookup.insert(id.to_vec(), ReadGroupInfo { library, read_group });
        }

        Self { lookup, names }
    }

    /// Ids for a read-group id; unknown ids map to the unknown library and no read group.
    #[must_use]
    pub fn get(&self, read_group_id: &[u8]) -> ReadGroupInfo {
        self.lookup.get(read_group_id).copied().unwrap_or_default()
    }

    /// Ids for a record, based on its `RG` tag.
    #[must_use]
    pub fn for_record(&self, record: &RecordBuf) -> ReadGroupInfo {
        match record.data().get(&Tag::READ_GROUP) {
            Some(Value::String(rg)) => self.get(rg.as_ref()),
            _ => ReadGroupInfo::default(),
        }
    }

    /// The library name for an id, falling back to the unknown library.
    #[must_use]
    pub fn library_name(&self, library: u16) -> &str {
        self.names.get(usize::from(library)).unwrap_or(&self.names[0])
    }

    /// Number of distinct libraries, including the unknown library.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

//! SAM/BAM helpers: header sort-order checks, record coordinate utilities and a test builder.

pub mod builder;
pub mod record_utils;

pub use builder::{FragBuilder, PairBuilder, SamBuilder, Strand, parse_cigar};
pub use record_utils::{
    alignment_end, has_mapped_mate, is_secondary_or_supplementary, leading_clipping,
    reference_length, trailing_clipping, unclipped_end, unclipped_five_prime_position,
    unclipped_start,
};

use noodles::sam::Header;
use noodles::sam::header::record::value::map::header::tag as header_tag;

/// Returns true if the header's `SO` tag equals `sort_order`.
#[must_use]
pub fn is_sorted(header: &Header, sort_order: &[u8]) -> bool {
    header.header().is_some_and(|hd| {
        hd.other_fields()
            .get(&header_tag::SORT_ORDER)
            .is_some_and(|so| <_ as AsRef<[u8]>>::as_ref(so) == sort_order)
    })
}

/// Returns true if the header declares `SO:coordinate`.
#[must_use]
pub fn is_coordinate_sorted(header: &Header) -> bool {
    is_sorted(header, b"coordinate")
}

//! Optical duplicate detection.
//!
//! - [`location`] recovers a read's flowcell position from its name
//! - [`finder`] clusters the members of a duplicate set by that position

pub mod finder;
pub mod location;

pub use finder::{DistanceMetric, OpticalDuplicateFinder};
pub use location::{
    CoordinateWidth, DelimitedFieldsParser, LocationParser, NoLocationParser, PhysicalLocation,
    RegexParser, build_location_parser,
};

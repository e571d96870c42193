//! Integration tests for the fgmarkdup binary.
//!
//! These tests run the built `fgmarkdup` executable end to end against BAM files produced by
//! [`fgmarkdup_lib::sam::builder::SamBuilder`].

mod helpers;
mod test_error_paths;
mod test_markdup_command;

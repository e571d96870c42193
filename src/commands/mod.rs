//! CLI command implementations for fgmarkdup.
//!
//! - [`markdup`] - Mark or remove duplicates in a coordinate-sorted BAM
//! - [`common`] - Option groups shared by commands
//! - [`command`] - The [`command::Command`] trait dispatched from `main`

#![allow(
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::uninlined_format_args
)]

pub mod command;
pub mod common;
pub mod markdup;

//! Input validation utilities
//!
//! Validation functions for command-line parameters and file paths. Every function returns a
//! structured [`MarkDupError`] naming the offending parameter, so options can be checked before any
//! file is opened.

use crate::bam_io::is_stdin_path;
use crate::errors::{MarkDupError, Result};
use noodles::sam::alignment::record::data::field::Tag;
use std::fmt::Display;
use std::path::Path;

/// Largest BGZF compression level accepted.
pub const MAX_COMPRESSION_LEVEL: u32 = 12;

fn invalid(parameter: &str, reason: String) -> MarkDupError {
    MarkDupError::InvalidParameter { parameter: parameter.to_string(), reason }
}

/// Validate that a file exists
///
/// # Errors
/// Returns an error if the file does not exist
///
/// # Example
/// ```
/// use fgmarkdup_lib::validation::validate_file_exists;
///
/// let result = validate_file_exists("/nonexistent/file.bam", "Input file");
/// assert!(result.is_err());
/// ```
pub fn validate_file_exists<P: AsRef<Path>>(path: P, description: &str) -> Result<()> {
    let path_ref = path.as_ref();
    if !path_ref.exists() {
        return Err(MarkDupError::InvalidFileFormat {
            file_type: description.to_string(),
            path: path_ref.display().to_string(),
            reason: "File does not exist".to_string(),
        });
    }
    Ok(())
}

/// Validate that the input can be read twice.
///
/// Duplicate marking makes one pass to find duplicates and a second to write them, so standard
/// input cannot be used.
///
/// # Errors
/// Returns an error if `path` refers to standard input
pub fn validate_rereadable_input<P: AsRef<Path>>(path: P) -> Result<()> {
    if is_stdin_path(&path) {
        return Err(invalid("input", "Input must be a file; standard input cannot be re-read".into()));
    }
    Ok(())
}

/// Validate that two paths differ.
///
/// # Errors
/// Returns an error if the output would overwrite the input
pub fn validate_distinct_paths<P: AsRef<Path>, Q: AsRef<Path>>(input: P, output: Q) -> Result<()> {
    let (input, output) = (input.as_ref(), output.as_ref());
    let same = match (input.canonicalize(), output.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => input == output,
    };
    if same {
        return Err(invalid(
            "output",
            format!("Output must differ from the input: {}", output.display()),
        ));
    }
    Ok(())
}

/// Validate that a value is positive (> 0)
///
/// # Errors
/// Returns an error if the value is not positive
///
/// # Example
/// ```
/// use fgmarkdup_lib::validation::validate_positive;
///
/// validate_positive(10, "max-records-in-ram").unwrap();
///
/// let result = validate_positive(0, "max-records-in-ram");
/// assert!(result.is_err());
/// ```
#[allow(clippy::needless_pass_by_value)]
pub fn validate_positive<T: Ord + Display + Default>(value: T, name: &str) -> Result<()> {
    if value <= T::default() {
        return Err(invalid(name, format!("Must be positive (> 0), got: {value}")));
    }
    Ok(())
}

/// Validate a BGZF compression level
///
/// # Errors
/// Returns an error if the level is above [`MAX_COMPRESSION_LEVEL`]
pub fn validate_compression_level(level: u32) -> Result<()> {
    if level > MAX_COMPRESSION_LEVEL {
        return Err(invalid(
            "compression-level",
            format!("Must be between 0 and {MAX_COMPRESSION_LEVEL}, got: {level}"),
        ));
    }
    Ok(())
}

/// Validate a read-name delimiter and return it as a byte
///
/// # Errors
/// Returns an error unless the delimiter is a single ASCII character
///
/// # Example
/// ```
/// use fgmarkdup_lib::validation::validate_delimiter;
///
/// assert_eq!(validate_delimiter(':').unwrap(), b':');
/// assert!(validate_delimiter('é').is_err());
/// ```
pub fn validate_delimiter(delimiter: char) -> Result<u8> {
    u8::try_from(delimiter).ok().filter(u8::is_ascii).ok_or_else(|| {
        invalid(
            "read-name-delimiter",
            format!("Must be a single ASCII character, got: '{delimiter}'"),
        )
    })
}

/// Validate a two-character SAM tag name
///
/// # Errors
/// Returns an error unless the name is an ASCII letter followed by an ASCII letter or digit
///
/// # Example
/// ```
/// use fgmarkdup_lib::validation::validate_tag;
///
/// assert!(validate_tag("BC", "barcode-tag").is_ok());
/// assert!(validate_tag("B", "barcode-tag").is_err());
/// ```
pub fn validate_tag(name: &str, parameter: &str) -> Result<Tag> {
    match name.as_bytes() {
        &[a, b] if a.is_ascii_alphabetic() && b.is_ascii_alphanumeric() => Ok(Tag::new(a, b)),
        _ => Err(invalid(
            parameter,
            format!("Must be a two-character SAM tag such as BC, got: '{name}'"),
        )),
    }
}

/// Validate the accepted numbers of delimited fields in a read name
///
/// # Errors
/// Returns an error if no count is given or any count is below three (tile, x and y)
pub fn validate_field_counts(counts: &[usize]) -> Result<()> {
    if counts.is_empty() {
        return Err(invalid("read-name-field-counts", "At least one count is required".into()));
    }
    if let Some(bad) = counts.iter().find(|&&c| c < 3) {
        return Err(invalid(
            "read-name-field-counts",
            format!("Each count must be at least 3 (tile, x, y), got: {bad}"),
        ));
    }
    Ok(())
}

//! Custom error types for duplicate marking.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for fgmarkdup operations
pub type Result<T> = std::result::Result<T, MarkDupError>;

/// Error type for fgmarkdup operations
#[derive(Error, Debug)]
pub enum MarkDupError {
    /// Invalid parameter value provided
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// The parameter name
        parameter: String,
        /// Explanation of why it's invalid
        reason: String,
    },

    /// File format error
    #[error("Invalid {file_type} file '{path}': {reason}")]
    InvalidFileFormat {
        /// Type of file (e.g., "BAM")
        file_type: String,
        /// Path to the file
        path: String,
        /// Explanation of the problem
        reason: String,
    },

    /// A record appeared out of coordinate order
    #[error(
        "Input is not coordinate sorted: record '{read_name}' at {reference}:{position} follows \
         {previous_reference}:{previous_position}"
    )]
    UnsortedInput {
        /// Name of the offending record
        read_name: String,
        /// Reference index of the offending record
        reference: usize,
        /// 1-based position of the offending record
        position: usize,
        /// Reference index of the preceding mapped record
        previous_reference: usize,
        /// 1-based position of the preceding mapped record
        previous_position: usize,
    },

    /// A record flagged as mapped has no reference or alignment start
    #[error("Record '{read_name}' is flagged as mapped but has no {field}")]
    MissingPosition {
        /// Name of the offending record
        read_name: String,
        /// The missing field
        field: &'static str,
    },

    /// Reading or writing a temporary spill file failed
    #[error("Failed to {operation} spill file '{}'", .path.display())]
    Spill {
        /// What was being done ("write", "read", "create")
        operation: &'static str,
        /// The spill file or directory
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_parameter() {
        let error = MarkDupError::InvalidParameter {
            parameter: "optical-pixel-distance".to_string(),
            reason: "must be >= 0".to_string(),
        };
        let msg = format!("{error}");
        assert!(msg.contains("Invalid parameter 'optical-pixel-distance'"));
        assert!(msg.contains("must be >= 0"));
    }

    #[test]
    fn test_invalid_file_format() {
        let error = MarkDupError::InvalidFileFormat {
            file_type: "BAM".to_string(),
            path: "/path/to/file.bam".to_string(),
            reason: "not coordinate sorted".to_string(),
        };
        let msg = format!("{error}");
        assert!(msg.contains("Invalid BAM file"));
        assert!(msg.contains("not coordinate sorted"));
    }

    #[test]
    fn test_unsorted_input_names_record() {
        let error = MarkDupError::UnsortedInput {
            read_name: "q17".to_string(),
            reference: 0,
            position: 90,
            previous_reference: 0,
            previous_position: 100,
        };
        let msg = format!("{error}");
        assert!(msg.contains("'q17'"));
        assert!(msg.contains("0:90 follows 0:100"));
    }

    #[test]
    fn test_spill_error_keeps_source() {
        use std::error::Error as _;
        let error = MarkDupError::Spill {
            operation: "write",
            path: PathBuf::from("/tmp/spill_0001"),
            source: std::io::Error::other("disk full"),
        };
        assert!(format!("{error}").contains("Failed to write spill file '/tmp/spill_0001'"));
        assert_eq!(error.source().map(ToString::to_string), Some("disk full".to_string()));
    }
}

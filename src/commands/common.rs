//! Common CLI options shared across commands.
//!
//! This module provides shared argument structures that can be composed into
//! command structs using `#[command(flatten)]`.

use std::path::PathBuf;

use clap::Args;

use fgmarkdup_lib::optical::{
    CoordinateWidth, DistanceMetric, LocationParser, OpticalDuplicateFinder, build_location_parser,
};
use fgmarkdup_lib::sort::DEFAULT_MAX_RECORDS_IN_RAM;
use fgmarkdup_lib::validation::{
    validate_compression_level, validate_delimiter, validate_distinct_paths,
    validate_field_counts, validate_file_exists, validate_positive, validate_rereadable_input,
};

/// Input/output options for commands that read a BAM and write a BAM.
#[derive(Debug, Clone, Args)]
pub struct BamIoOptions {
    /// Input BAM file (coordinate sorted; read twice, so standard input is not supported)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// Output BAM file
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
}

impl BamIoOptions {
    /// Validates that the input is an existing file distinct from the output.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is standard input, does not exist, or is the output path.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_rereadable_input(&self.input)?;
        validate_file_exists(&self.input, "Input BAM")?;
        validate_distinct_paths(&self.input, &self.output)?;
        Ok(())
    }
}

/// Number of threads used for BGZF compression, sorting and spilling.
#[derive(Debug, Clone, Args)]
pub struct ThreadingOptions {
    /// Number of threads.
    ///
    /// With more than one thread, BGZF blocks are (de)compressed in parallel, in-memory batches
    /// are sorted with rayon and spill files are written and read on background threads.
    #[arg(long = "threads", default_value_t = 1)]
    pub threads: usize,
}

impl ThreadingOptions {
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self { threads }
    }

    /// Validates the thread count.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread count is zero.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_positive(self.threads, "threads")?;
        Ok(())
    }

    /// Returns a log message describing the threading configuration.
    #[must_use]
    pub fn log_message(&self) -> String {
        if self.threads <= 1 {
            "Single-threaded mode".to_string()
        } else {
            format!("Using {} threads", self.threads)
        }
    }
}

impl Default for ThreadingOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Options for output compression.
///
/// Controls BGZF compression level for BAM output files.
#[derive(Debug, Clone, Args)]
pub struct CompressionOptions {
    /// Compression level for output BAM (0-12).
    ///
    /// Level 1 is fastest with larger files.
    /// Level 12 produces smallest files but is slowest.
    #[arg(long, default_value_t = 1)]
    pub compression_level: u32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self { compression_level: 1 }
    }
}

impl CompressionOptions {
    /// # Errors
    ///
    /// Returns an error if the level is out of range.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_compression_level(self.compression_level)?;
        Ok(())
    }
}

/// Options bounding memory during the external sort of duplication keys.
#[derive(Debug, Clone, Args)]
pub struct SpillOptions {
    /// Maximum number of duplication keys held in memory per collection before spilling to disk.
    #[arg(long = "max-records-in-ram", default_value_t = DEFAULT_MAX_RECORDS_IN_RAM)]
    pub max_records_in_ram: usize,

    /// Directory for temporary spill files (defaults to the system temporary directory).
    #[arg(long = "tmp-dir")]
    pub tmp_dir: Option<PathBuf>,
}

impl Default for SpillOptions {
    fn default() -> Self {
        Self { max_records_in_ram: DEFAULT_MAX_RECORDS_IN_RAM, tmp_dir: None }
    }
}

impl SpillOptions {
    /// # Errors
    ///
    /// Returns an error if the record budget is zero or the temporary directory does not exist.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_positive(self.max_records_in_ram, "max-records-in-ram")?;
        if let Some(dir) = &self.tmp_dir {
            validate_file_exists(dir, "Temporary directory")?;
        }
        Ok(())
    }
}

/// Options controlling read-name parsing and optical duplicate clustering.
#[derive(Debug, Clone, Args)]
pub struct OpticalOptions {
    /// Maximum distance in pixels between two reads for them to be optical duplicates.
    #[arg(long = "optical-pixel-distance", default_value_t = 100)]
    pub optical_pixel_distance: u32,

    /// How distances between reads on the flowcell are measured.
    #[arg(long = "optical-distance-metric", value_enum, default_value_t = DistanceMetric::default())]
    pub optical_distance_metric: DistanceMetric,

    /// Delimiter between fields of the read name.
    #[arg(long = "read-name-delimiter", default_value_t = ':')]
    pub read_name_delimiter: char,

    /// Accepted numbers of delimited fields in a read name; tile, x and y are the last three.
    #[arg(long = "read-name-field-counts", value_delimiter = ',', default_values_t = [5, 7])]
    pub read_name_field_counts: Vec<usize>,

    /// Regular expression with three capture groups (tile, x, y) used instead of the delimiter.
    ///
    /// Pass `null` to disable optical duplicate detection.
    #[arg(long = "read-name-regex")]
    pub read_name_regex: Option<String>,

    /// Storage width of parsed x/y coordinates; `narrow` wraps values to 16 bits.
    #[arg(long = "coordinate-width", value_enum, default_value_t = CoordinateWidth::default())]
    pub coordinate_width: CoordinateWidth,

    /// Duplicate sets larger than this are not checked for optical duplicates.
    #[arg(long = "max-optical-set-size", default_value_t = 300_000)]
    pub max_optical_set_size: usize,
}

impl Default for OpticalOptions {
    fn default() -> Self {
        Self {
            optical_pixel_distance: 100,
            optical_distance_metric: DistanceMetric::default(),
            read_name_delimiter: ':',
            read_name_field_counts: vec![5, 7],
            read_name_regex: None,
            coordinate_width: CoordinateWidth::default(),
            max_optical_set_size: 300_000,
        }
    }
}

impl OpticalOptions {
    /// Validates the options, including compiling the regex.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-ASCII delimiter, bad field counts or an invalid regex.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_positive(self.max_optical_set_size, "max-optical-set-size")?;
        self.parser()?;
        Ok(())
    }

    /// Builds the read-name location parser.
    ///
    /// # Errors
    ///
    /// Returns an error if the options do not describe a valid parser.
    pub fn parser(&self) -> anyhow::Result<Box<dyn LocationParser>> {
        let delimiter = validate_delimiter(self.read_name_delimiter)?;
        if self.read_name_regex.is_none() {
            validate_field_counts(&self.read_name_field_counts)?;
        }
        Ok(build_location_parser(
            self.read_name_regex.as_deref(),
            delimiter,
            &self.read_name_field_counts,
            self.coordinate_width,
        )?)
    }

    #[must_use]
    pub fn finder(&self) -> OpticalDuplicateFinder {
        OpticalDuplicateFinder::new(
            self.optical_pixel_distance,
            self.optical_distance_metric,
            self.max_optical_set_size,
        )
    }
}

//! Per-library duplication metrics and library complexity estimation.
//!
//! The library size estimate follows the Lander-Waterman relationship
//!
//! ```text
//! C / X = 1 - exp(-N / X)
//! ```
//!
//! where `X` is the number of distinct molecules in the library, `N` the number of read pairs
//! examined and `C` the number of distinct read pairs observed.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Metric, format_float};

/// Library name used for reads whose read group is missing or has no `LB`.
pub const UNKNOWN_LIBRARY: &str = "Unknown Library";

/// Number of bisection steps taken when solving for the library size.
const BISECTION_ITERATIONS: usize = 40;

/// Largest sequencing multiple reported in the ROI histogram.
const MAX_ROI_MULTIPLE: u32 = 100;

fn serialize_fixed<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_float(*value))
}

fn deserialize_fixed<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

/// Duplication metrics for a single library.
///
/// Pair counts are in units of pairs (both ends of a pair count once), while unpaired counts are
/// in units of reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicationMetrics {
    /// The library these metrics describe.
    pub library: String,

    /// Mapped primary reads that were unpaired or whose mate was unmapped.
    pub unpaired_reads_examined: u64,

    /// Mapped primary read pairs where both ends were mapped.
    pub read_pairs_examined: u64,

    /// Secondary and supplementary records seen (never marked on their own).
    pub secondary_or_supplementary_rds: u64,

    /// Unmapped records seen.
    pub unmapped_reads: u64,

    /// Unpaired reads marked as duplicates.
    pub unpaired_read_duplicates: u64,

    /// Read pairs marked as duplicates.
    pub read_pair_duplicates: u64,

    /// Duplicate read pairs that were also optical duplicates.
    pub read_pair_optical_duplicates: u64,

    /// Unpaired duplicate reads that were also optical duplicates.
    pub unpaired_read_optical_duplicates: u64,

    /// Fraction of examined reads that were marked as duplicates.
    #[serde(serialize_with = "serialize_fixed", deserialize_with = "deserialize_fixed")]
    pub percent_duplication: f64,

    /// Estimated number of unique molecules in the library, when estimable.
    pub estimated_library_size: Option<u64>,
}

impl DuplicationMetrics {
    /// Creates an empty metrics row for the given library.
    #[must_use]
    pub fn new(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            unpaired_reads_examined: 0,
            read_pairs_examined: 0,
            secondary_or_supplementary_rds: 0,
            unmapped_reads: 0,
            unpaired_read_duplicates: 0,
            read_pair_duplicates: 0,
            read_pair_optical_duplicates: 0,
            unpaired_read_optical_duplicates: 0,
            percent_duplication: 0.0,
            estimated_library_size: None,
        }
    }

    /// Fills in `percent_duplication` and `estimated_library_size` from the raw counts.
    ///
    /// Optical duplicates are removed from the pair count before estimating the library size,
    /// since they do not reflect the complexity of the library itself.
    #[allow(clippy::cast_precision_loss)]
    pub fn calculate_derived_fields(&mut self) {
        self.estimated_library_size = estimate_library_size(
            self.read_pairs_examined.saturating_sub(self.read_pair_optical_duplicates),
            self.read_pairs_examined.saturating_sub(self.read_pair_duplicates),
        );

        let examined = self.unpaired_reads_examined + self.read_pairs_examined * 2;
        self.percent_duplication = if examined == 0 {
            0.0
        } else {
            (self.unpaired_read_duplicates + self.read_pair_duplicates * 2) as f64
                / examined as f64
        };
    }

    /// Computes the return-on-investment curve for sequencing this library deeper.
    ///
    /// Returns an empty vector when the library size cannot be estimated.
    #[must_use]
    pub fn roi_histogram(&self) -> Vec<RoiHistogramMetric> {
        let Some(library_size) = self.estimated_library_size else {
            return Vec::new();
        };
        let unique_pairs = self.read_pairs_examined.saturating_sub(self.read_pair_duplicates);
        if unique_pairs == 0 || library_size == 0 {
            return Vec::new();
        }

        (1..=MAX_ROI_MULTIPLE)
            .map(|multiple| RoiHistogramMetric {
                library: self.library.clone(),
                coverage_multiple: multiple,
                unique_multiple: estimate_roi(
                    library_size,
                    f64::from(multiple),
                    self.read_pairs_examined,
                    unique_pairs,
                ),
            })
            .collect()
    }
}

impl Default for DuplicationMetrics {
    fn default() -> Self {
        Self::new(UNKNOWN_LIBRARY)
    }
}

impl Metric for DuplicationMetrics {
    fn metric_name() -> &'static str {
        "duplication"
    }
}

/// One point on a library's return-on-investment curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RoiHistogramMetric {
    /// The library this point belongs to.
    pub library: String,

    /// Multiple of the sequencing actually performed.
    pub coverage_multiple: u32,

    /// Multiple of the unique pairs observed that would be seen at that depth.
    #[serde(serialize_with = "serialize_fixed", deserialize_with = "deserialize_fixed")]
    pub unique_multiple: f64,
}

impl Metric for RoiHistogramMetric {
    fn metric_name() -> &'static str {
        "ROI histogram"
    }
}

fn lander_waterman(x: f64, c: f64, n: f64) -> f64 {
    c / x - 1.0 + (-n / x).exp()
}

/// Estimates the number of unique molecules in a library.
///
/// # Arguments
/// * `read_pairs` - number of read pairs observed
/// * `unique_read_pairs` - number of distinct read pairs observed
///
/// Returns `None` when there are no pairs or no duplicates, as the estimate is unbounded.
///
/// # Example
/// ```
/// use fgmarkdup_metrics::estimate_library_size;
/// assert_eq!(estimate_library_size(100, 100), None);
/// assert!(estimate_library_size(1_000, 900).unwrap() > 900);
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn estimate_library_size(read_pairs: u64, unique_read_pairs: u64) -> Option<u64> {
    if read_pairs == 0 || unique_read_pairs >= read_pairs || unique_read_pairs == 0 {
        return None;
    }

    let n = read_pairs as f64;
    let c = unique_read_pairs as f64;
    let mut lower = 1.0_f64;
    let mut upper = 100.0_f64;

    if lander_waterman(lower * c, c, n) < 0.0 {
        return None;
    }

    while lander_waterman(upper * c, c, n) > 0.0 {
        upper *= 10.0;
    }

    for _ in 0..BISECTION_ITERATIONS {
        let r = (lower + upper) / 2.0;
        let u = lander_waterman(r * c, c, n);
        if u == 0.0 {
            break;
        } else if u > 0.0 {
            lower = r;
        } else {
            upper = r;
        }
    }

    Some((c * (lower + upper) / 2.0) as u64)
}

/// Estimates the multiple of unique pairs that would be observed if `x` times as many pairs
/// were sequenced from a library of `library_size` molecules.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn estimate_roi(library_size: u64, x: f64, pairs: u64, unique_pairs: u64) -> f64 {
    let size = library_size as f64;
    size * (1.0 - (-(x * pairs as f64) / size).exp()) / unique_pairs as f64
}

//! Extraction of flowcell locations (tile, x, y) from read names.
//!
//! The default [`DelimitedFieldsParser`] handles Illumina-style names such as
//! `M00123:42:000000000-ABCDE:1:1101:15589:1331` by taking the last three `:`-separated fields.
//! Other conventions can be handled with a [`RegexParser`], and optical detection can be turned
//! off entirely with [`NoLocationParser`].

use std::sync::atomic::{AtomicBool, Ordering};

use bstr::ByteSlice;
use clap::ValueEnum;
use log::warn;
use regex::bytes::Regex;

use crate::errors::{MarkDupError, Result};

/// A cluster's position on the flowcell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PhysicalLocation {
    /// Read-group ordinal of the read; locations in different read groups are never compared.
    pub read_group: u16,
    pub tile: i32,
    pub x: i32,
    pub y: i32,
}

impl PhysicalLocation {
    #[must_use]
    pub fn new(tile: i32, x: i32, y: i32) -> Self {
        Self { read_group: 0, tile, x, y }
    }

    /// Returns this location tagged with a read-group ordinal.
    #[must_use]
    pub fn with_read_group(mut self, read_group: u16) -> Self {
        self.read_group = read_group;
        self
    }
}

/// Storage width of x/y coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CoordinateWidth {
    /// 16-bit coordinates; larger values wrap around (two's complement truncation).
    Narrow,
    /// 32-bit coordinates.
    #[default]
    Wide,
}

impl CoordinateWidth {
    /// Stores `value` at this width.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn store(self, value: i64) -> i32 {
        match self {
            CoordinateWidth::Narrow => i32::from(value as i16),
            CoordinateWidth::Wide => value as i32,
        }
    }
}

/// Extracts a [`PhysicalLocation`] from a read name.
pub trait LocationParser: Send + Sync {
    /// Parses the location, or returns `None` if the name carries none.
    fn parse(&self, read_name: &[u8]) -> Option<PhysicalLocation>;

    /// False when this parser never produces locations.
    fn enabled(&self) -> bool {
        true
    }
}

/// Parses an optionally negative integer from the leading digits of `field`.
///
/// Parsing stops at the first non-digit; `None` is returned if no digit is seen or the digits do
/// not fit in an `i64`.
#[must_use]
pub fn rapid_parse_int(field: &[u8]) -> Option<i64> {
    let (negative, digits) = match field.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, field),
    };
    let mut value: i64 = 0;
    let mut seen = false;
    for &b in digits.iter().take_while(|b| b.is_ascii_digit()) {
        value = value.checked_mul(10)?.checked_add(i64::from(b - b'0'))?;
        seen = true;
    }
    match (seen, negative) {
        (false, _) => None,
        (true, true) => value.checked_neg(),
        (true, false) => Some(value),
    }
}

/// Splits `name` on `delimiter`, returning the total field count and the last three fields.
///
/// Returns `None` when the name has fewer than three fields.
#[must_use]
pub fn last_three_fields(name: &[u8], delimiter: u8) -> Option<(usize, [&[u8]; 3])> {
    let field_count = name.iter().filter(|&&b| b == delimiter).count() + 1;
    if field_count < 3 {
        return None;
    }
    let mut fields = name.rsplitn(4, |&b| b == delimiter);
    let y = fields.next()?;
    let x = fields.next()?;
    let tile = fields.next()?;
    Some((field_count, [tile, x, y]))
}

/// Shared warn-once state for parsers.
#[derive(Debug, Default)]
struct WarnOnce(AtomicBool);

impl WarnOnce {
    fn warn(&self, describe: impl FnOnce() -> String) {
        if !self.0.swap(true, Ordering::Relaxed) {
            warn!("{}", describe());
            warn!("This message will not be repeated for other read names that fail to parse.");
        }
    }
}

/// Takes tile/x/y from the last three delimited fields of names with an accepted field count.
#[derive(Debug)]
pub struct DelimitedFieldsParser {
    delimiter: u8,
    field_counts: Vec<usize>,
    width: CoordinateWidth,
    warned: WarnOnce,
}

impl DelimitedFieldsParser {
    /// Default delimiter between read-name fields.
    pub const DEFAULT_DELIMITER: u8 = b':';

    /// Field counts of the common Illumina read-name layouts.
    pub const DEFAULT_FIELD_COUNTS: [usize; 2] = [5, 7];

    #[must_use]
    pub fn new(delimiter: u8, field_counts: Vec<usize>, width: CoordinateWidth) -> Self {
        Self { delimiter, field_counts, width, warned: WarnOnce::default() }
    }
}

impl Default for DelimitedFieldsParser {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_DELIMITER,
            Self::DEFAULT_FIELD_COUNTS.to_vec(),
            CoordinateWidth::default(),
        )
    }
}

impl LocationParser for DelimitedFieldsParser {
    #[allow(clippy::cast_possible_truncation)]
    fn parse(&self, read_name: &[u8]) -> Option<PhysicalLocation> {
        let parsed = last_three_fields(read_name, self.delimiter)
            .filter(|(count, _)| self.field_counts.contains(count))
            .and_then(|(_, [tile, x, y])| {
                Some((rapid_parse_int(tile)?, rapid_parse_int(x)?, rapid_parse_int(y)?))
            });
        match parsed {
            Some((tile, x, y)) => {
                Some(PhysicalLocation::new(tile as i32, self.width.store(x), self.width.store(y)))
            }
            None => {
                self.warned.warn(|| {
                    format!(
                        "Could not parse a tile/x/y location from read name '{}' using the last \
                         three '{}'-delimited fields; optical duplicates will not be detected for \
                         such reads",
                        read_name.as_bstr(),
                        char::from(self.delimiter)
                    )
                });
                None
            }
        }
    }
}

/// Takes tile/x/y from the three capture groups of a regular expression matching the whole name.
#[derive(Debug)]
pub struct RegexParser {
    regex: Regex,
    pattern: String,
    width: CoordinateWidth,
    warned: WarnOnce,
}

impl RegexParser {
    /// Compiles `pattern`, which must have exactly three capture groups.
    ///
    /// # Errors
    ///
    /// Returns [`MarkDupError::InvalidParameter`] if the pattern does not compile or has the wrong
    /// number of capture groups.
    pub fn new(pattern: &str, width: CoordinateWidth) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            MarkDupError::InvalidParameter {
                parameter: "read-name-regex".to_string(),
                reason: e.to_string(),
            }
        })?;
        let groups = regex.captures_len() - 1;
        if groups != 3 {
            return Err(MarkDupError::InvalidParameter {
                parameter: "read-name-regex".to_string(),
                reason: format!("expected 3 capture groups (tile, x, y) but found {groups}"),
            });
        }
        Ok(Self { regex, pattern: pattern.to_string(), width, warned: WarnOnce::default() })
    }
}

impl LocationParser for RegexParser {
    #[allow(clippy::cast_possible_truncation)]
    fn parse(&self, read_name: &[u8]) -> Option<PhysicalLocation> {
        let parsed = self.regex.captures(read_name).and_then(|caps| {
            let field = |i: usize| -> Option<i64> {
                caps.get(i).and_then(|m| m.as_bytes().to_str().ok()?.parse().ok())
            };
            Some((field(1)?, field(2)?, field(3)?))
        });
        if parsed.is_none() {
            self.warned.warn(|| {
                format!(
                    "Read name regex '{}' did not match read name '{}'",
                    self.pattern,
                    read_name.as_bstr()
                )
            });
        }
        parsed.map(|(tile, x, y)| {
            PhysicalLocation::new(tile as i32, self.width.store(x), self.width.store(y))
        })
    }
}

/// Never produces a location, disabling optical duplicate detection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLocationParser;

impl LocationParser for NoLocationParser {
    fn parse(&self, _read_name: &[u8]) -> Option<PhysicalLocation> {
        None
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// Builds the parser selected by the read-name options.
///
/// A regex of `null` (any case) disables location parsing; any other regex replaces the delimited
/// field parser.
///
/// # Errors
///
/// Returns an error if the regex is invalid, or if the field counts are empty or below three.
pub fn build_location_parser(
    regex: Option<&str>,
    delimiter: u8,
    field_counts: &[usize],
    width: CoordinateWidth,
) -> Result<Box<dyn LocationParser>> {
    match regex {
        Some(r) if r.eq_ignore_ascii_case("null") => Ok(Box::new(NoLocationParser)),
        Some(r) => Ok(Box::new(RegexParser::new(r, width)?)),
        None => {
            if field_counts.is_empty() || field_counts.iter().any(|&n| n < 3) {
                return Err(MarkDupError::InvalidParameter {
                    parameter: "read-name-field-counts".to_string(),
                    reason: "at least one field count is required and each must be >= 3"
                        .to_string(),
                });
            }
            Ok(Box::new(DelimitedFieldsParser::new(delimiter, field_counts.to_vec(), width)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"123".as_slice(), Some(123))]
    #[case(b"-42".as_slice(), Some(-42))]
    #[case(b"15589#0/1".as_slice(), Some(15589))]
    #[case(b"0".as_slice(), Some(0))]
    #[case(b"".as_slice(), None)]
    #[case(b"-".as_slice(), None)]
    #[case(b"abc".as_slice(), None)]
    #[case(b"9223372036854775807".as_slice(), Some(i64::MAX))]
    #[case(b"-9223372036854775807".as_slice(), Some(-i64::MAX))]
    #[case(b"-9223372036854775808".as_slice(), None)]
    #[case(b"99999999999999999999".as_slice(), None)]
    fn test_rapid_parse_int(#[case] input: &[u8], #[case] expected: Option<i64>) {
        assert_eq!(rapid_parse_int(input), expected);
    }

    #[test]
    fn test_last_three_fields() {
        let (count, fields) = last_three_fields(b"RUNID:7:1203:2886:82292", b':').unwrap();
        assert_eq!(count, 5);
        assert_eq!(fields, [b"1203".as_slice(), b"2886".as_slice(), b"82292".as_slice()]);

        let (count, _) = last_three_fields(b"a:b:c", b':').unwrap();
        assert_eq!(count, 3);
        assert!(last_three_fields(b"a:b", b':').is_none());
    }

    #[rstest]
    #[case(b"RUNID:7:1203:2886:82292".as_slice(), Some((1203, 2886, 82292)))]
    #[case(b"M1:42:FC:1:1101:15589:1331".as_slice(), Some((1101, 15589, 1331)))]
    #[case(b"RUNID:7:1203:2886:82292#0/1".as_slice(), Some((1203, 2886, 82292)))]
    #[case(b"1203:2886:82292".as_slice(), None)]
    #[case(b"a:b:c:d:e:f".as_slice(), None)]
    #[case(b"RUNID:7:tile:2886:82292".as_slice(), None)]
    #[case(b"read_without_colons".as_slice(), None)]
    #[case(b"RUN:7:1101:-9223372036854775808:5".as_slice(), None)]
    #[case(b"RUN:7:1101:5:123456789012345678901234".as_slice(), None)]
    fn test_delimited_parser(#[case] name: &[u8], #[case] expected: Option<(i32, i32, i32)>) {
        let parser = DelimitedFieldsParser::default();
        let actual = parser.parse(name).map(|l| (l.tile, l.x, l.y));
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_delimited_parser_custom_delimiter_and_counts() {
        let parser = DelimitedFieldsParser::new(b'_', vec![4], CoordinateWidth::Wide);
        let loc = parser.parse(b"run_11_200_300").unwrap();
        assert_eq!((loc.tile, loc.x, loc.y), (11, 200, 300));
        assert!(parser.parse(b"x_run_11_200_300").is_none());
    }

    #[test]
    fn test_narrow_width_wraps() {
        assert_eq!(CoordinateWidth::Narrow.store(32_767), 32_767);
        assert_eq!(CoordinateWidth::Narrow.store(32_768), -32_768);
        assert_eq!(CoordinateWidth::Narrow.store(70_000), 4_464);
        assert_eq!(CoordinateWidth::Wide.store(70_000), 70_000);

        let parser = DelimitedFieldsParser::new(b':', vec![5], CoordinateWidth::Narrow);
        let loc = parser.parse(b"R:1:1101:70000:100").unwrap();
        assert_eq!(loc.x, 4_464);
        assert_eq!(loc.y, 100);
    }

    #[test]
    fn test_regex_parser() {
        let parser = RegexParser::new(r"[^_]+_(\d+)_(\d+)_(\d+)", CoordinateWidth::Wide).unwrap();
        let loc = parser.parse(b"read_1101_15589_1331").unwrap();
        assert_eq!((loc.tile, loc.x, loc.y), (1101, 15589, 1331));
        assert!(parser.parse(b"read_1101_15589").is_none());
        assert!(parser.parse(b"prefix read_1101_15589_1331 suffix").is_none());
    }

    #[rstest]
    #[case(r"(\d+)_(\d+)")]
    #[case(r"(\d+)_(\d+)_(\d+)_(\d+)")]
    #[case(r"(\d+")]
    fn test_regex_parser_rejects_bad_patterns(#[case] pattern: &str) {
        let err = RegexParser::new(pattern, CoordinateWidth::Wide).unwrap_err();
        assert!(matches!(err, MarkDupError::InvalidParameter { .. }));
    }

    #[test]
    fn test_build_location_parser() {
        let none = build_location_parser(Some("NULL"), b':', &[5, 7], CoordinateWidth::Wide);
        let none = none.unwrap();
        assert!(!none.enabled());
        assert!(none.parse(b"RUNID:7:1203:2886:82292").is_none());

        let default = build_location_parser(None, b':', &[5, 7], CoordinateWidth::Wide).unwrap();
        assert!(default.enabled());
        assert!(default.parse(b"RUNID:7:1203:2886:82292").is_some());

        assert!(build_location_parser(None, b':', &[], CoordinateWidth::Wide).is_err());
        assert!(build_location_parser(None, b':', &[2], CoordinateWidth::Wide).is_err());
    }
}

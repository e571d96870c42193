//! Adds fgmarkdup's @PG record to output headers.
//!
//! The new record is chained (via `PP`) to the last program already present, and its ID is made
//! unique by appending `.1`, `.2`, ... when `fgmarkdup` is already taken.

use anyhow::Result;
use bstr::BString;
use noodles::sam::Header;
use noodles::sam::header::record::value::Map;
use noodles::sam::header::record::value::map::Program;
use noodles::sam::header::record::value::map::program::tag;
use std::collections::HashSet;

/// Program name and base @PG ID written to output headers.
pub const PROGRAM_NAME: &str = "fgmarkdup";

/// Returns the ID of the program at the end of the `PP` chain, if there is one.
///
/// The end of the chain is the program that no other program names as its predecessor.
#[must_use]
pub fn get_last_program_id(header: &Header) -> Option<String> {
    let programs = header.programs();
    let program_map = programs.as_ref();

    let referenced: HashSet<&[u8]> = program_map
        .values()
        .filter_map(|pg| pg.other_fields().get(&tag::PREVIOUS_PROGRAM_ID))
        .map(|pp| pp.as_ref())
        .collect();

    program_map
        .keys()
        .find(|id| !referenced.contains(id.as_slice()))
        .or_else(|| program_map.keys().next())
        .map(|id| String::from_utf8_lossy(id).to_string())
}

/// Returns `base_id` if unused, otherwise the first free `base_id.N`.
#[must_use]
pub fn make_unique_program_id(header: &Header, base_id: &str) -> String {
    let programs = header.programs();
    let program_map = programs.as_ref();
    if !program_map.contains_key(base_id.as_bytes()) {
        return base_id.to_string();
    }
    (1..)
        .map(|i| format!("{base_id}.{i}"))
        .find(|candidate| !program_map.contains_key(candidate.as_bytes()))
        .unwrap_or_else(|| base_id.to_string())
}

/// Builds a @PG record with name, version, command line and optional `PP`.
///
/// # Errors
///
/// Returns an error if the program record cannot be built.
pub fn build_program_record(
    version: &str,
    command_line: &str,
    previous_program: Option<&str>,
) -> Result<Map<Program>> {
    let mut builder = Map::<Program>::builder()
        .insert(tag::NAME, PROGRAM_NAME)
        .insert(tag::VERSION, version)
        .insert(tag::COMMAND_LINE, command_line);

    if let Some(pp) = previous_program {
        builder = builder.insert(tag::PREVIOUS_PROGRAM_ID, pp);
    }

    Ok(builder.build()?)
}

/// Adds an fgmarkdup @PG record to `header`, chained to the previous last program.
///
/// # Errors
///
/// Returns an error if the program record cannot be added to the header.
pub fn add_pg_record(mut header: Header, version: &str, command_line: &str) -> Result<Header> {
    let previous_program = get_last_program_id(&header);
    let unique_id = make_unique_program_id(&header, PROGRAM_NAME);
    let pg_record = build_program_record(version, command_line, previous_program.as_deref())?;
    header.programs_mut().add(BString::from(unique_id), pg_record)?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use noodles::sam::header::record::value::map::program::tag::Standard;
    use noodles::sam::header::record::value::map::tag::Other;

    fn field(pg: &Map<Program>, key: Other<Standard>) -> Option<&[u8]> {
        pg.other_fields().get(&key).map(|value| value.as_slice())
    }

    #[test]
    fn test_get_last_program_id_empty() {
        assert_eq!(get_last_program_id(&Header::default()), None);
    }

    #[test]
    fn test_get_last_program_id_follows_chain() {
        let mut header = Header::default();
        header.programs_mut().add(BString::from("bwa"), Map::<Program>::default()).unwrap();
        let sort =
            Map::<Program>::builder().insert(tag::PREVIOUS_PROGRAM_ID, "bwa").build().unwrap();
        header.programs_mut().add(BString::from("samtools"), sort).unwrap();

        assert_eq!(get_last_program_id(&header), Some("samtools".to_string()));
    }

    #[test]
    fn test_make_unique_program_id() {
        let mut header = Header::default();
        assert_eq!(make_unique_program_id(&header, PROGRAM_NAME), "fgmarkdup");

        header.programs_mut().add(BString::from("fgmarkdup"), Map::<Program>::default()).unwrap();
        assert_eq!(make_unique_program_id(&header, PROGRAM_NAME), "fgmarkdup.1");

        header.programs_mut().add(BString::from("fgmarkdup.1"), Map::<Program>::default()).unwrap();
        assert_eq!(make_unique_program_id(&header, PROGRAM_NAME), "fgmarkdup.2");
    }

    #[test]
    fn test_add_pg_record_empty_header() {
        let header = add_pg_record(Header::default(), "0.1.0", "fgmarkdup markdup -i x").unwrap();
        let programs = header.programs();
        let pg = programs.as_ref().get(b"fgmarkdup".as_slice()).unwrap();

        assert_eq!(field(pg, tag::NAME), Some(b"fgmarkdup".as_slice()));
        assert_eq!(field(pg, tag::VERSION), Some(b"0.1.0".as_slice()));
        assert_eq!(field(pg, tag::COMMAND_LINE), Some(b"fgmarkdup markdup -i x".as_slice()));
        assert!(field(pg, tag::PREVIOUS_PROGRAM_ID).is_none());
    }

    #[test]
    fn test_add_pg_record_chains_to_aligner() {
        let mut header = Header::default();
        let bwa = Map::<Program>::builder().insert(tag::NAME, "bwa").build().unwrap();
        header.programs_mut().add(BString::from("bwa"), bwa).unwrap();

        let header = add_pg_record(header, "0.1.0", "fgmarkdup markdup").unwrap();
        let programs = header.programs();
        let pg = programs.as_ref().get(b"fgmarkdup".as_slice()).unwrap();
        assert_eq!(field(pg, tag::PREVIOUS_PROGRAM_ID), Some(b"bwa".as_slice()));
    }
}

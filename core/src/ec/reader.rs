//! Reading pseudoalignments.
//!
//! The pseudoalignment format has one line per read. The first whitespace-separated field is the
//! read name, and the remaining fields are the zero-based indices of the references the read is
//! compatible with. Reads with no compatible references are unaligned.

use std::{fmt, io, num::ParseIntError};

use crate::Input;

use super::{EcError, EcIndex};

impl EcIndex {
    /// Reads pseudoalignments from an input, decompressing gzip input if needed.
    pub fn from_input(input: &Input, n_refs: usize) -> io::Result<Self> {
        input
            .open_decoded()
            .and_then(|reader| Self::from_reader(reader, n_refs))
    }

    /// Reads pseudoalignments from a reader.
    pub fn from_reader<R>(reader: R, n_refs: usize) -> io::Result<Self>
    where
        R: io::BufRead,
    {
        let mut index = Self::new(n_refs);

        for (i, line) in reader.lines().enumerate() {
            let line = line?;

            parse_line(&line)
                .and_then(|refs| index.add_read(refs).map_err(ParseAlignmentError::from))
                .map_err(|kind| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        LineError {
                            line: i + 1,
                            kind,
                        },
                    )
                })?;
        }

        log::debug!(
            "Read {} aligned and {} unaligned reads into {} equivalence classes",
            index.total_reads(),
            index.unaligned(),
            index.len()
        );

        Ok(index)
    }
}

fn parse_line(line: &str) -> Result<Vec<u32>, ParseAlignmentError> {
    let mut fields = line.split_ascii_whitespace();

    if fields.next().is_none() {
        return Ok(Vec::new());
    }

    fields
        .map(|field| {
            field
                .parse::<u32>()
                .map_err(|e| ParseAlignmentError::InvalidIndex {
                    field: field.to_string(),
                    source: e,
                })
        })
        .collect()
}

/// An error associated with parsing a single pseudoalignment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParseAlignmentError {
    /// A reference index is not a non-negative integer.
    InvalidIndex {
        /// The offending field.
        field: String,
        /// The underlying parse error.
        source: ParseIntError,
    },
    /// The alignment is inconsistent with the reference.
    Reference(EcError),
}

impl From<EcError> for ParseAlignmentError {
    fn from(e: EcError) -> Self {
        Self::Reference(e)
    }
}

impl fmt::Display for ParseAlignmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseAlignmentError::InvalidIndex { field, source } => {
                write!(f, "invalid reference index '{field}': {source}")
            }
            ParseAlignmentError::Reference(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ParseAlignmentError {}

#[derive(Debug)]
struct LineError {
    line: usize,
    kind: ParseAlignmentError,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pseudoalignment line {}: {}", self.line, self.kind)
    }
}

impl std::error::Error for LineError {}

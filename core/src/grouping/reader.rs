//! Reading group indicators.
//!
//! The indicator format has one line per reference sequence, in reference order. Each line holds
//! one tab-separated group name per grouping, so that a file with `k` columns describes `k`
//! groupings over the same references. Blank lines are ignored.

use std::{fs::File, io, path::Path};

use super::{BetaBinomialConstants, Grouping, GroupingError, Reference};

impl Reference {
    /// Reads group indicators from a path.
    pub fn from_path<P>(path: P, constants: BetaBinomialConstants) -> io::Result<Self>
    where
        P: AsRef<Path>,
    {
        File::open(path)
            .map(io::BufReader::new)
            .and_then(|reader| Self::from_reader(reader, constants))
    }

    /// Reads group indicators from a reader.
    pub fn from_reader<R>(mut reader: R, constants: BetaBinomialConstants) -> io::Result<Self>
    where
        R: io::Read,
    {
        let mut s = String::new();
        let _ = reader.read_to_string(&mut s)?;

        Self::from_str(&s, constants).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn from_str(s: &str, constants: BetaBinomialConstants) -> Result<Self, GroupingError> {
        let mut columns: Vec<Vec<&str>> = Vec::new();

        for (i, line) in s.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let fields = line.split('\t').map(str::trim).collect::<Vec<_>>();

            if columns.is_empty() {
                columns = vec![Vec::new(); fields.len()];
            } else if fields.len() != columns.len() {
                return Err(GroupingError::ColumnMismatch {
                    line: i + 1,
                    expected: columns.len(),
                    found: fields.len(),
                });
            }

            columns
                .iter_mut()
                .zip(fields)
                .for_each(|(column, field)| column.push(field));
        }

        let groupings = columns
            .into_iter()
            .map(|column| Grouping::new(column, constants))
            .collect::<Result<Vec<_>, _>>()?;

        Reference::new(groupings)
    }
}

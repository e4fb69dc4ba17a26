//! Log-likelihoods of equivalence classes under a grouping.
//!
//! The [`LikelihoodMatrix`] holds one row per group and one column per EC, and is built by looking
//! up each EC's per-group hit count in a [`LikelihoodTable`]. All values are natural logarithms.

use std::{fmt, io};

use rayon::prelude::*;

use crate::{ec::EcHits, grouping::Grouping, Matrix};

pub mod table;
pub use table::LikelihoodTable;

/// Dense `[groups × ECs]` log-likelihood matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct LikelihoodMatrix(Matrix<f64>);

impl LikelihoodMatrix {
    /// Builds the matrix for a list of ECs.
    ///
    /// Every hit count must be at most the size of its group; the first violating EC is reported.
    pub fn build(
        grouping: &Grouping,
        table: &LikelihoodTable,
        ecs: &[EcHits],
    ) -> Result<Self, LikelihoodError> {
        let n_groups = grouping.n_groups();
        if table.n_groups() != n_groups {
            return Err(LikelihoodError::GroupCountMismatch {
                expected: n_groups,
                found: table.n_groups(),
            });
        }

        let sizes = grouping.sizes();
        let invalid = ecs.par_iter().enumerate().find_map_first(|(ec, ec_hits)| {
            if ec_hits.hits.len() != n_groups {
                return Some(LikelihoodError::GroupCountMismatch {
                    expected: n_groups,
                    found: ec_hits.hits.len(),
                });
            }

            ec_hits
                .hits
                .iter()
                .zip(sizes)
                .enumerate()
                .find(|&(_, (&hits, &size))| hits as usize > size)
                .map(|(group, (&hits, &size))| LikelihoodError::HitsExceedSize {
                    ec,
                    group,
                    hits,
                    size,
                })
        });
        if let Some(error) = invalid {
            return Err(error);
        }

        let n_ecs = ecs.len();
        let mut matrix = Matrix::from_element(table.sentinel(), n_groups, n_ecs);

        matrix
            .as_mut_slice()
            .par_chunks_mut(n_ecs.max(1))
            .enumerate()
            .for_each(|(group, row)| {
                let lookup = table.row(group);
                row.iter_mut()
                    .zip(ecs)
                    .for_each(|(x, ec_hits)| *x = lookup[ec_hits.hits[group] as usize]);
            });

        Ok(Self(matrix))
    }

    /// Returns the underlying `[groups × ECs]` matrix.
    pub fn inner(&self) -> &Matrix<f64> {
        &self.0
    }

    /// Returns the number of ECs.
    pub fn n_ecs(&self) -> usize {
        self.0.cols()
    }

    /// Returns the number of groups.
    pub fn n_groups(&self) -> usize {
        self.0.rows()
    }

    /// Writes the matrix with one line per EC: the read count followed by one log-likelihood per
    /// group, tab-separated.
    pub fn write<W>(&self, writer: &mut W, read_counts: &[u64], precision: usize) -> io::Result<()>
    where
        W: io::Write,
    {
        if read_counts.len() != self.n_ecs() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot write {} read counts for {} ECs",
                    read_counts.len(),
                    self.n_ecs()
                ),
            ));
        }

        for (ec, count) in read_counts.iter().enumerate() {
            write!(writer, "{count}")?;
            for x in self.0.iter_col(ec) {
                write!(writer, "\t{x:.precision$}")?;
            }
            writeln!(writer)?;
        }

        Ok(())
    }
}

impl From<LikelihoodMatrix> for Matrix<f64> {
    fn from(matrix: LikelihoodMatrix) -> Self {
        matrix.0
    }
}

/// An error associated with building the likelihood matrix.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LikelihoodError {
    /// An EC has more hits in a group than the group has members.
    HitsExceedSize {
        /// Index of the EC.
        ec: usize,
        /// Index of the group.
        group: usize,
        /// Hits of the EC in the group.
        hits: u32,
        /// Size of the group.
        size: usize,
    },
    /// An input disagrees with the grouping on the number of groups.
    GroupCountMismatch {
        /// Number of groups in the grouping.
        expected: usize,
        /// Number of groups in the input.
        found: usize,
    },
}

impl fmt::Display for LikelihoodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LikelihoodError::HitsExceedSize {
                ec,
                group,
                hits,
                size,
            } => write!(
                f,
                "equivalence class {ec} has {hits} hits in group {group} of size {size}"
            ),
            LikelihoodError::GroupCountMismatch { expected, found } => {
                write!(f, "expected {expected} groups, found {found}")
            }
        }
    }
}

impl std::error::Error for LikelihoodError {}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::grouping::BetaBinomialConstants;

    use super::table::DEFAULT_HIT_PROBABILITY;

    fn grouping() -> Grouping {
        Grouping::new(
            ["a", "a", "b", "b", "b", "c"],
            BetaBinomialConstants::default(),
        )
        .unwrap()
    }

    fn ecs() -> Vec<EcHits> {
        vec![
            EcHits::new(vec![1, 0, 0], 10),
            EcHits::new(vec![0, 2, 1], 5),
            EcHits::new(vec![2, 1, 0], 3),
            EcHits::new(vec![0, 0, 1], 2),
        ]
    }

    #[test]
    fn test_build_looks_up_table() -> Result<(), LikelihoodError> {
        let grouping = grouping();
        let table = LikelihoodTable::new(&grouping, DEFAULT_HIT_PROBABILITY);
        let matrix = LikelihoodMatrix::build(&grouping, &table, &ecs())?;

        assert_eq!(matrix.n_groups(), 3);
        assert_eq!(matrix.n_ecs(), 4);

        for (ec, ec_hits) in ecs().iter().enumerate() {
            for (group, &hits) in ec_hits.hits.iter().enumerate() {
                assert_eq!(
                    matrix.inner()[[group, ec]],
                    table.get(group, hits).unwrap()
                );
            }
        }

        Ok(())
    }

    #[test]
    fn test_build_deterministic() -> Result<(), LikelihoodError> {
        let grouping = grouping();
        let table = LikelihoodTable::new(&grouping, DEFAULT_HIT_PROBABILITY);

        let first = LikelihoodMatrix::build(&grouping, &table, &ecs())?;
        let second = LikelihoodMatrix::build(&grouping, &table, &ecs())?;

        let bits = |m: &LikelihoodMatrix| {
            m.inner()
                .as_slice()
                .iter()
                .map(|x| x.to_bits())
                .collect::<Vec<_>>()
        };
        assert_eq!(bits(&first), bits(&second));

        Ok(())
    }

    #[test]
    fn test_build_hits_exceed_size() {
        let grouping = grouping();
        let table = LikelihoodTable::new(&grouping, DEFAULT_HIT_PROBABILITY);
        let mut ecs = ecs();
        ecs.push(EcHits::new(vec![0, 0, 0], 1));
        ecs.push(EcHits::new(vec![3, 0, 0], 1));
        ecs.push(EcHits::new(vec![0, 0, 2], 1));

        assert_eq!(
            LikelihoodMatrix::build(&grouping, &table, &ecs),
            Err(LikelihoodError::HitsExceedSize {
                ec: 5,
                group: 0,
                hits: 3,
                size: 2
            })
        );
    }

    #[test]
    fn test_build_wrong_group_count() {
        let grouping = grouping();
        let table = LikelihoodTable::new(&grouping, DEFAULT_HIT_PROBABILITY);

        assert_eq!(
            LikelihoodMatrix::build(&grouping, &table, &[EcHits::new(vec![1, 0], 1)]),
            Err(LikelihoodError::GroupCountMismatch {
                expected: 3,
                found: 2
            })
        );
    }

    #[test]
    fn test_write() -> io::Result<()> {
        let grouping = Grouping::new(["a"], BetaBinomialConstants::default()).unwrap();
        let table = LikelihoodTable::new(&grouping, 0.5);
        let matrix = LikelihoodMatrix::build(
            &grouping,
            &table,
            &[EcHits::new(vec![1], 7), EcHits::new(vec![0], 2)],
        )
        .unwrap();

        let mut dest = Vec::new();
        matrix.write(&mut dest, &[7, 2], 3)?;

        assert_eq!(dest, b"7\t-0.693\n2\t-0.693\n");

        Ok(())
    }

    #[test]
    fn test_write_mismatched_read_counts() {
        let grouping = grouping();
        let table = LikelihoodTable::new(&grouping, DEFAULT_HIT_PROBABILITY);
        let matrix = LikelihoodMatrix::build(&grouping, &table, &ecs()).unwrap();

        let mut dest = Vec::new();
        let error = matrix.write(&mut dest, &[10, 5, 3], 3).unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);
        assert!(dest.is_empty());
    }
}

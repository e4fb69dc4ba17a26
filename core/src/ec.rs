//! Equivalence classes of pseudoaligned reads.
//!
//! Reads whose compatible references are identical are merged into a single equivalence class
//! (EC) with a read count. The index is grouping-independent; per-group hit counts are derived
//! for each grouping with [`EcIndex::hits`].

use std::fmt;

use indexmap::IndexMap;
use rayon::prelude::*;

use crate::grouping::Grouping;

pub mod reader;

/// Per-group hit counts and observed read count for a single EC under one grouping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EcHits {
    /// Number of the EC's compatible references belonging to each group.
    pub hits: Vec<u32>,
    /// Number of reads merged into the EC.
    pub read_count: u64,
}

impl EcHits {
    /// Creates new hit counts for an EC.
    pub fn new(hits: Vec<u32>, read_count: u64) -> Self {
        Self { hits, read_count }
    }
}

/// Deduplicated equivalence classes of a single sample, in order of first appearance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EcIndex {
    n_refs: usize,
    ecs: IndexMap<Vec<u32>, u64>,
    unaligned: u64,
}

impl EcIndex {
    /// Creates an empty index for a reference of `n_refs` sequences.
    pub fn new(n_refs: usize) -> Self {
        Self {
            n_refs,
            ecs: IndexMap::new(),
            unaligned: 0,
        }
    }

    /// Adds a single read compatible with the provided references.
    ///
    /// Duplicate references are ignored, and a read with no compatible references is counted as
    /// unaligned.
    pub fn add_read<I>(&mut self, refs: I) -> Result<(), EcError>
    where
        I: IntoIterator<Item = u32>,
    {
        self.add_reads(refs, 1)
    }

    /// Adds `count` reads compatible with the provided references.
    pub fn add_reads<I>(&mut self, refs: I, count: u64) -> Result<(), EcError>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut refs = refs.into_iter().collect::<Vec<_>>();

        if let Some(&reference) = refs.iter().find(|&&r| r as usize >= self.n_refs) {
            return Err(EcError::ReferenceOutOfRange {
                reference,
                n_refs: self.n_refs,
            });
        }

        if refs.is_empty() {
            self.unaligned += count;
            return Ok(());
        }

        refs.sort_unstable();
        refs.dedup();

        *self.ecs.entry(refs).or_insert(0) += count;

        Ok(())
    }

    /// Returns per-group hit counts for every EC under the provided grouping.
    pub fn hits(&self, grouping: &Grouping) -> Result<Vec<EcHits>, EcError> {
        if grouping.n_refs() != self.n_refs {
            return Err(EcError::ReferenceCountMismatch {
                index: self.n_refs,
                grouping: grouping.n_refs(),
            });
        }

        let n_groups = grouping.n_groups();
        let ecs = self.ecs.iter().collect::<Vec<_>>();

        Ok(ecs
            .par_iter()
            .map(|&(refs, &read_count)| {
                let mut hits = vec![0; n_groups];
                refs.iter()
                    .filter_map(|&r| grouping.group_of(r as usize))
                    .for_each(|group| hits[group.0] += 1);
                EcHits::new(hits, read_count)
            })
            .collect())
    }

    /// Returns `true` if no reads have been added.
    pub fn is_empty(&self) -> bool {
        self.ecs.is_empty()
    }

    /// Returns the number of distinct ECs.
    pub fn len(&self) -> usize {
        self.ecs.len()
    }

    /// Returns the natural logarithm of the read count of each EC.
    pub fn log_read_counts(&self) -> Vec<f64> {
        self.ecs.values().map(|&count| (count as f64).ln()).collect()
    }

    /// Returns the number of reference sequences.
    pub fn n_refs(&self) -> usize {
        self.n_refs
    }

    /// Returns the read count of each EC, in EC order.
    pub fn read_counts(&self) -> Vec<u64> {
        self.ecs.values().copied().collect()
    }

    /// Returns the references compatible with each EC.
    pub fn refs(&self) -> impl Iterator<Item = &[u32]> {
        self.ecs.keys().map(Vec::as_slice)
    }

    /// Returns the total number of aligned reads.
    pub fn total_reads(&self) -> u64 {
        self.ecs.values().sum()
    }

    /// Returns the number of reads that were compatible with no reference.
    pub fn unaligned(&self) -> u64 {
        self.unaligned
    }
}

/// An error associated with equivalence classes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EcError {
    /// A read is compatible with a reference index outside the reference.
    ReferenceOutOfRange {
        /// The offending reference index.
        reference: u32,
        /// Number of references.
        n_refs: usize,
    },
    /// The index and a grouping disagree on the number of references.
    ReferenceCountMismatch {
        /// Number of references known to the index.
        index: usize,
        /// Number of references covered by the grouping.
        grouping: usize,
    },
}

impl fmt::Display for EcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcError::ReferenceOutOfRange { reference, n_refs } => write!(
                f,
                "reference index {reference} out of range for {n_refs} references"
            ),
            EcError::ReferenceCountMismatch { index, grouping } => write!(
                f,
                "pseudoalignments cover {index} references, but grouping covers {grouping}"
            ),
        }
    }
}

impl std::error::Error for EcError {}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::grouping::BetaBinomialConstants;

    #[test]
    fn test_merge_identical_ecs() -> Result<(), EcError> {
        let mut index = EcIndex::new(4);
        index.add_read([2, 0])?;
        index.add_read([1])?;
        index.add_read([0, 2])?;
        index.add_read([0, 2, 2])?;
        index.add_read(Vec::new())?;

        assert_eq!(index.len(), 2);
        assert_eq!(index.read_counts(), vec![3, 1]);
        assert_eq!(index.total_reads(), 4);
        assert_eq!(index.unaligned(), 1);
        assert_eq!(index.refs().next(), Some(&[0, 2][..]));

        Ok(())
    }

    #[test]
    fn test_reference_out_of_range() {
        let mut index = EcIndex::new(2);

        assert_eq!(
            index.add_read([0, 2]),
            Err(EcError::ReferenceOutOfRange {
                reference: 2,
                n_refs: 2
            })
        );
        assert!(index.is_empty());
    }

    #[test]
    fn test_hits() -> Result<(), EcError> {
        let grouping = Grouping::new(
            ["a", "a", "b", "b", "b", "c"],
            BetaBinomialConstants::default(),
        )
        .unwrap();

        let mut index = EcIndex::new(6);
        index.add_reads([0], 10)?;
        index.add_reads([2, 3, 5], 5)?;
        index.add_reads([0, 1, 4], 3)?;

        assert_eq!(
            index.hits(&grouping)?,
            vec![
                EcHits::new(vec![1, 0, 0], 10),
                EcHits::new(vec![0, 2, 1], 5),
                EcHits::new(vec![2, 1, 0], 3),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_hits_reference_count_mismatch() {
        let grouping = Grouping::new(["a", "b"], BetaBinomialConstants::default()).unwrap();

        assert_eq!(
            EcIndex::new(3).hits(&grouping),
            Err(EcError::ReferenceCountMismatch {
                index: 3,
                grouping: 2
            })
        );
    }

    #[test]
    fn test_log_read_counts() -> Result<(), EcError> {
        let mut index = EcIndex::new(2);
        index.add_reads([0], 1)?;
        index.add_reads([1], 4)?;

        assert_approx_eq!(index.log_read_counts(), vec![0.0, 4f64.ln()], epsilon = 1e-12);

        Ok(())
    }
}

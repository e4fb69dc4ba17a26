//! Partitions of reference sequences into lineages.
//!
//! A [`Grouping`] assigns every reference sequence to exactly one group. Each group carries the
//! parameters of the beta-binomial distribution used to score how many of its members a read is
//! compatible with. A [`Reference`] holds one or more groupings over the same references.

use std::fmt;

use indexmap::IndexSet;

pub mod reader;

/// A dense numeric id for a group within a grouping.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GroupId(pub usize);

/// Global shape constants from which per-group beta-binomial parameters are derived.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BetaBinomialConstants {
    /// Expected fraction of a group's references that a read from the group aligns to.
    pub mean_fraction: f64,
    /// Dispersion term added to the beta-binomial precision.
    pub dispersion: f64,
}

impl Default for BetaBinomialConstants {
    fn default() -> Self {
        Self {
            mean_fraction: 0.65,
            dispersion: 0.01,
        }
    }
}

/// Beta-binomial parameters for a single group.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BetaBinomialParams {
    /// The alpha shape parameter.
    pub alpha: f64,
    /// The beta shape parameter.
    pub beta: f64,
}

impl BetaBinomialParams {
    /// Derives parameters for a group with `size` references.
    pub fn from_size(size: usize, constants: BetaBinomialConstants) -> Self {
        let n = size as f64;
        let e = constants.mean_fraction * n;
        let phi = 1.0 / (n - e + constants.dispersion);
        let beta = phi * (n - e);
        let alpha = e * beta / (n - e);

        Self { alpha, beta }
    }
}

/// A partition of reference sequences into named groups.
#[derive(Clone, Debug, PartialEq)]
pub struct Grouping {
    names: IndexSet<String>,
    group_of: Vec<GroupId>,
    sizes: Vec<usize>,
    bb_params: Vec<BetaBinomialParams>,
}

impl Grouping {
    /// Creates a grouping from the group name of each reference, in reference order.
    ///
    /// Group ids are assigned in order of first appearance.
    pub fn new<I, S>(indicators: I, constants: BetaBinomialConstants) -> Result<Self, GroupingError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names = IndexSet::new();
        let mut sizes = Vec::new();

        let group_of = indicators
            .into_iter()
            .map(|name| {
                let (id, inserted) = names.insert_full(name.as_ref().to_string());
                if inserted {
                    sizes.push(0);
                }
                sizes[id] += 1;
                GroupId(id)
            })
            .collect::<Vec<_>>();

        if group_of.is_empty() {
            return Err(GroupingError::Empty);
        }

        let bb_params = sizes
            .iter()
            .map(|&size| BetaBinomialParams::from_size(size, constants))
            .collect();

        Ok(Self {
            names,
            group_of,
            sizes,
            bb_params,
        })
    }

    /// Returns the beta-binomial parameters of each group, in group order.
    pub fn bb_params(&self) -> &[BetaBinomialParams] {
        &self.bb_params
    }

    /// Returns the group of a reference, or `None` if the reference is out of range.
    pub fn group_of(&self, reference: usize) -> Option<GroupId> {
        self.group_of.get(reference).copied()
    }

    /// Returns the size of the largest group.
    pub fn max_size(&self) -> usize {
        self.sizes.iter().copied().max().unwrap_or(0)
    }

    /// Returns the number of groups.
    pub fn n_groups(&self) -> usize {
        self.names.len()
    }

    /// Returns the number of reference sequences.
    pub fn n_refs(&self) -> usize {
        self.group_of.len()
    }

    /// Returns the name of a group, if it exists.
    pub fn name(&self, id: GroupId) -> Option<&str> {
        self.names.get_index(id.0).map(String::as_str)
    }

    /// Returns an iterator over group names, in group order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Returns the number of references in each group, in group order.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}

/// One or more groupings over the same set of reference sequences.
#[derive(Clone, Debug, PartialEq)]
pub struct Reference {
    n_refs: usize,
    groupings: Vec<Grouping>,
}

impl Reference {
    /// Creates a reference from groupings that must all cover the same references.
    pub fn new(groupings: Vec<Grouping>) -> Result<Self, GroupingError> {
        let n_refs = groupings
            .first()
            .map(Grouping::n_refs)
            .ok_or(GroupingError::Empty)?;

        let reference = Self { n_refs, groupings };
        reference.verify()?;

        Ok(reference)
    }

    /// Returns a single grouping, if it exists.
    pub fn grouping(&self, index: usize) -> Option<&Grouping> {
        self.groupings.get(index)
    }

    /// Returns all groupings, in input order.
    pub fn groupings(&self) -> &[Grouping] {
        &self.groupings
    }

    /// Returns the number of groupings.
    pub fn n_groupings(&self) -> usize {
        self.groupings.len()
    }

    /// Returns the number of reference sequences.
    pub fn n_refs(&self) -> usize {
        self.n_refs
    }

    /// Checks that every grouping covers exactly the same references.
    pub fn verify(&self) -> Result<(), GroupingError> {
        match self
            .groupings
            .iter()
            .enumerate()
            .find(|(_, grouping)| grouping.n_refs() != self.n_refs)
        {
            Some((index, grouping)) => Err(GroupingError::ReferenceCountMismatch {
                grouping: index,
                expected: self.n_refs,
                found: grouping.n_refs(),
            }),
            None => Ok(()),
        }
    }
}

/// An error associated with constructing groupings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GroupingError {
    /// No references or no groupings were provided.
    Empty,
    /// An indicator line has a different number of columns than the first line.
    ColumnMismatch {
        /// One-based line number.
        line: usize,
        /// Number of columns on the first line.
        expected: usize,
        /// Number of columns on this line.
        found: usize,
    },
    /// A grouping does not cover the same number of references as the others.
    ReferenceCountMismatch {
        /// Index of the offending grouping.
        grouping: usize,
        /// Number of references in the first grouping.
        expected: usize,
        /// Number of references in the offending grouping.
        found: usize,
    },
}

impl fmt::Display for GroupingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupingError::Empty => f.write_str("no reference group indicators provided"),
            GroupingError::ColumnMismatch {
                line,
                expected,
                found,
            } => write!(
                f,
                "group indicator line {line} has {found} columns, expected {expected}"
            ),
            GroupingError::ReferenceCountMismatch {
                grouping,
                expected,
                found,
            } => write!(
                f,
                "grouping {grouping} covers {found} references, expected {expected}"
            ),
        }
    }
}

impl std::error::Error for GroupingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouping_ids_in_order_of_appearance() {
        let grouping =
            Grouping::new(["b", "a", "b", "c", "a", "b"], BetaBinomialConstants::default())
                .unwrap();

        assert_eq!(grouping.n_groups(), 3);
        assert_eq!(grouping.n_refs(), 6);
        assert_eq!(grouping.names().collect::<Vec<_>>(), vec!["b", "a", "c"]);
        assert_eq!(grouping.sizes(), &[3, 2, 1]);
        assert_eq!(grouping.group_of(3), Some(GroupId(2)));
        assert_eq!(grouping.group_of(6), None);
        assert_eq!(grouping.max_size(), 3);
    }

    #[test]
    fn test_every_group_nonempty() {
        let grouping =
            Grouping::new(["x", "y", "y", "z"], BetaBinomialConstants::default()).unwrap();

        assert!(grouping.sizes().iter().all(|&size| size >= 1));
        assert_eq!(grouping.sizes().iter().sum::<usize>(), grouping.n_refs());
    }

    #[test]
    fn test_empty_grouping() {
        assert_eq!(
            Grouping::new(Vec::<String>::new(), BetaBinomialConstants::default()),
            Err(GroupingError::Empty)
        );
    }

    #[test]
    fn test_bb_params_from_size() {
        let constants = BetaBinomialConstants::default();
        let params = BetaBinomialParams::from_size(1, constants);

        // n = 1: e = 0.65, phi = 1 / 0.36, beta = 0.35 / 0.36, alpha = 0.65 * beta / 0.35
        let beta = 0.35 / 0.36;
        assert_approx_eq!(params.beta, beta, epsilon = 1e-12);
        assert_approx_eq!(params.alpha, 0.65 * beta / 0.35, epsilon = 1e-12);
    }

    #[test]
    fn test_bb_params_mean_matches_mean_fraction() {
        let constants = BetaBinomialConstants::default();
        let params = BetaBinomialParams::from_size(10, constants);

        let mean = params.alpha / (params.alpha + params.beta);
        assert_approx_eq!(mean, constants.mean_fraction, epsilon = 1e-12);
    }

    #[test]
    fn test_reference_mismatched_groupings() {
        let constants = BetaBinomialConstants::default();
        let first = Grouping::new(["a", "b", "a"], constants).unwrap();
        let second = Grouping::new(["a", "b"], constants).unwrap();

        assert_eq!(
            Reference::new(vec![first, second]),
            Err(GroupingError::ReferenceCountMismatch {
                grouping: 1,
                expected: 3,
                found: 2
            })
        );
    }
}

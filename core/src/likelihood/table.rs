//! Precomputed beta-binomial log-likelihoods.

use rayon::prelude::*;

use crate::{
    grouping::{BetaBinomialParams, Grouping},
    utils::{ln_beta, ln_binomial},
    Matrix,
};

/// Probability that a read aligning to a group truly originates from it.
pub const DEFAULT_HIT_PROBABILITY: f64 = 0.99;

/// Returns the beta-binomial log-density of `k` hits out of `n`, scaled relative to `k = n`.
///
/// The normalizing term is `B(n + alpha, beta)` rather than `B(alpha, beta)`, so that a read
/// compatible with every member of a group always scores zero.
pub fn ln_beta_binomial_scaled(k: u64, n: u64, params: BetaBinomialParams) -> f64 {
    let BetaBinomialParams { alpha, beta } = params;
    let (k_f, n_f) = (k as f64, n as f64);

    ln_binomial(n, k) + ln_beta(k_f + alpha, n_f - k_f + beta) - ln_beta(n_f + alpha, beta)
}

/// Log-likelihood lookup indexed by group and observed hit count.
///
/// There is one row per group and `max_size + 1` columns. Column zero, and every column beyond a
/// group's own size, holds the log-probability of observing no hits.
#[derive(Clone, Debug, PartialEq)]
pub struct LikelihoodTable {
    table: Matrix<f64>,
    sentinel: f64,
}

impl LikelihoodTable {
    /// Builds the table for a grouping, computing rows in parallel.
    pub fn new(grouping: &Grouping, hit_probability: f64) -> Self {
        let sentinel = (1.0 - hit_probability).ln();
        let ln_hit = hit_probability.ln();

        let n_groups = grouping.n_groups();
        let cols = grouping.max_size() + 1;
        let mut table = Matrix::from_element(sentinel, n_groups, cols);

        table
            .as_mut_slice()
            .par_chunks_mut(cols)
            .zip(grouping.sizes().par_iter().zip(grouping.bb_params()))
            .for_each(|(row, (&size, &params))| {
                row.iter_mut()
                    .enumerate()
                    .skip(1)
                    .take(size)
                    .for_each(|(k, x)| {
                        *x = ln_beta_binomial_scaled(k as u64, size as u64, params) + ln_hit
                    });
            });

        Self { table, sentinel }
    }

    /// Returns the log-likelihood of `hits` hits in `group`, or `None` if out of bounds.
    pub fn get(&self, group: usize, hits: u32) -> Option<f64> {
        self.table.get(group, hits as usize).copied()
    }

    /// Returns the number of groups.
    pub fn n_groups(&self) -> usize {
        self.table.rows()
    }

    /// Returns the row of a single group.
    pub fn row(&self, group: usize) -> &[f64] {
        self.table.row(group)
    }

    /// Returns the log-probability used for groups with no hits.
    pub fn sentinel(&self) -> f64 {
        self.sentinel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::grouping::BetaBinomialConstants;

    fn grouping() -> Grouping {
        Grouping::new(
            ["a", "a", "b", "b", "b", "c"],
            BetaBinomialConstants::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_hits_is_sentinel() {
        let table = LikelihoodTable::new(&grouping(), DEFAULT_HIT_PROBABILITY);

        for group in 0..table.n_groups() {
            assert_approx_eq!(table.get(group, 0).unwrap(), 0.01f64.ln(), epsilon = 1e-12);
        }
        assert_eq!(table.sentinel(), table.get(0, 0).unwrap());
    }

    #[test]
    fn test_beyond_size_is_sentinel() {
        let table = LikelihoodTable::new(&grouping(), DEFAULT_HIT_PROBABILITY);

        assert_eq!(table.row(0).len(), 4);
        assert_eq!(table.get(0, 3), Some(table.sentinel()));
        assert_eq!(table.get(2, 2), Some(table.sentinel()));
        assert_eq!(table.get(2, 3), Some(table.sentinel()));
        assert_eq!(table.get(0, 4), None);
    }

    #[test]
    fn test_valid_hits_finite() {
        let grouping = grouping();
        let table = LikelihoodTable::new(&grouping, DEFAULT_HIT_PROBABILITY);

        for (group, &size) in grouping.sizes().iter().enumerate() {
            for k in 1..=size as u32 {
                assert!(table.get(group, k).unwrap().is_finite());
            }
        }
    }

    #[test]
    fn test_full_hits_scores_hit_probability() {
        let table = LikelihoodTable::new(&grouping(), DEFAULT_HIT_PROBABILITY);

        assert_approx_eq!(table.get(0, 2).unwrap(), 0.99f64.ln(), epsilon = 1e-12);
        assert_approx_eq!(table.get(1, 3).unwrap(), 0.99f64.ln(), epsilon = 1e-12);
        assert_approx_eq!(table.get(2, 1).unwrap(), 0.99f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_hand_computed_entry() {
        // n = 2, alpha = 2, beta = 1, k = 1:
        // C(2, 1) B(3, 2) / B(4, 1) = 2 * (1 / 12) / (1 / 4) = 2 / 3
        let params = BetaBinomialParams {
            alpha: 2.0,
            beta: 1.0,
        };

        assert_approx_eq!(
            ln_beta_binomial_scaled(1, 2, params),
            (2f64 / 3.0).ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_table_matches_closed_form() {
        let grouping = grouping();
        let table = LikelihoodTable::new(&grouping, DEFAULT_HIT_PROBABILITY);

        // Second group has three members
        let params = grouping.bb_params()[1];
        let expected = ln_binomial(3, 1) + ln_beta(1.0 + params.alpha, 2.0 + params.beta)
            - ln_beta(3.0 + params.alpha, params.beta)
            + 0.99f64.ln();

        assert_approx_eq!(table.get(1, 1).unwrap(), expected, epsilon = 1e-12);
    }
}

//! Estimation of mixture weights from a log-likelihood matrix.
//!
//! An [`Optimizer`] turns a [`Problem`] into posterior log-responsibilities of each group for each
//! equivalence class, from which relative abundances follow by [`mixture_components`]. The
//! optimizer call is collective: every rank of a [`Communicator`] must make it, and only the
//! coordinator provides the problem and receives the fit.

use std::{fmt, ops::Range, sync::Arc};

use rayon::prelude::*;

use crate::{
    collective::{CollectiveError, Communicator},
    likelihood::LikelihoodMatrix,
    utils::ln_sum_exp,
    Matrix,
};

/// Number of EC columns handled by a single parallel task.
const CHUNK_SIZE: usize = 4096;

/// Convergence settings of the optimizer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OptimizerConfig {
    /// Largest absolute change in any mixture weight for which iteration stops.
    pub tolerance: f64,
    /// Upper bound on the number of iterations.
    pub max_iters: usize,
    /// Skip optimization entirely, only building the likelihoods.
    pub no_fit_model: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iters: 5000,
            no_fit_model: false,
        }
    }
}

/// The inputs of a single optimization.
#[derive(Clone, Debug, PartialEq)]
pub struct Problem {
    /// Log-likelihood of each EC under each group.
    pub log_likelihoods: Arc<LikelihoodMatrix>,
    /// Log-weight of each EC; `-inf` marks an EC that contributes nothing.
    pub log_weights: Vec<f64>,
    /// Dirichlet prior concentration of each group.
    pub prior_alphas: Vec<f64>,
}

impl Problem {
    /// Creates a new problem.
    pub fn new(
        log_likelihoods: Arc<LikelihoodMatrix>,
        log_weights: Vec<f64>,
        prior_alphas: Vec<f64>,
    ) -> Self {
        Self {
            log_likelihoods,
            log_weights,
            prior_alphas,
        }
    }

    /// Creates a problem with a flat prior, where every concentration is one.
    pub fn with_flat_prior(log_likelihoods: Arc<LikelihoodMatrix>, log_weights: Vec<f64>) -> Self {
        let prior_alphas = vec![1.0; log_likelihoods.n_groups()];
        Self::new(log_likelihoods, log_weights, prior_alphas)
    }

    /// Returns the number of ECs.
    pub fn n_ecs(&self) -> usize {
        self.log_likelihoods.n_ecs()
    }

    /// Returns the number of groups.
    pub fn n_groups(&self) -> usize {
        self.log_likelihoods.n_groups()
    }

    fn validate(&self) -> Result<(), OptimizeError> {
        if self.n_groups() == 0 {
            return Err(OptimizeError::NoGroups);
        }

        if self.log_weights.len() != self.n_ecs() {
            return Err(OptimizeError::DimensionMismatch {
                what: "log-weights",
                expected: self.n_ecs(),
                found: self.log_weights.len(),
            });
        }

        if self.prior_alphas.len() != self.n_groups() {
            return Err(OptimizeError::DimensionMismatch {
                what: "prior concentrations",
                expected: self.n_groups(),
                found: self.prior_alphas.len(),
            });
        }

        Ok(())
    }
}

/// The result of an optimization.
#[derive(Clone, Debug, PartialEq)]
pub struct Fit {
    /// Posterior log-responsibility of each group (rows) for each EC (columns).
    pub log_responsibilities: Matrix<f64>,
    /// Number of iterations performed.
    pub iterations: usize,
    /// Whether the tolerance was reached before the iteration cap.
    pub converged: bool,
}

impl Fit {
    /// Returns the relative abundance of each group.
    pub fn abundances(&self, log_weights: &[f64]) -> Vec<f64> {
        mixture_components(&self.log_responsibilities, log_weights)
    }
}

/// A collective mixture-weight optimizer.
pub trait Optimizer: Sync {
    /// Optimizes a problem.
    ///
    /// The coordinator must pass `Some` problem and receives `Some` fit; every other rank passes
    /// `None` and receives `None`. Reaching the iteration cap is not an error.
    fn optimize(
        &self,
        comm: &dyn Communicator,
        problem: Option<Arc<Problem>>,
        config: &OptimizerConfig,
    ) -> Result<Option<Fit>, OptimizeError>;

    /// Optimizes a problem as the coordinator, returning the relative abundance of each group.
    ///
    /// Reaching the iteration cap is logged as a warning.
    fn abundances(
        &self,
        comm: &dyn Communicator,
        problem: Arc<Problem>,
        config: &OptimizerConfig,
    ) -> Result<Vec<f64>, OptimizeError> {
        let fit = self
            .optimize(comm, Some(Arc::clone(&problem)), config)?
            .ok_or(OptimizeError::MissingFit)?;

        if !fit.converged {
            log::warn!(
                "Optimizer reached iteration cap of {} without converging, using last estimate",
                fit.iterations
            );
        }

        Ok(fit.abundances(&problem.log_weights))
    }
}

impl<T> Optimizer for &T
where
    T: Optimizer,
{
    fn optimize(
        &self,
        comm: &dyn Communicator,
        problem: Option<Arc<Problem>>,
        config: &OptimizerConfig,
    ) -> Result<Option<Fit>, OptimizeError> {
        (**self).optimize(comm, problem, config)
    }
}

/// Expectation-maximization of mixture weights under a Dirichlet prior.
///
/// The EC columns are split evenly across ranks, and the expected group counts of each rank are
/// combined by a collective sum, so that all ranks take identical convergence decisions. Within a
/// rank, columns are processed in parallel in fixed-size chunks summed in order, so results do not
/// depend on the number of threads.
#[derive(Clone, Copy, Debug, Default)]
pub struct Em;

impl Optimizer for Em {
    fn optimize(
        &self,
        comm: &dyn Communicator,
        problem: Option<Arc<Problem>>,
        config: &OptimizerConfig,
    ) -> Result<Option<Fit>, OptimizeError> {
        let problem = comm.broadcast_problem(problem)?;
        problem.validate()?;

        let n_groups = problem.n_groups();
        let log_weights = &problem.log_weights;
        let likelihoods = problem.log_likelihoods.inner();
        let columns = local_columns(problem.n_ecs(), comm.rank(), comm.size());

        let mut total = [columns
            .clone()
            .map(|e| log_weights[e].exp())
            .sum::<f64>()];
        comm.all_reduce_sum(&mut total)?;
        let total = total[0];
        if !(total.is_finite() && total > 0.0) {
            return Err(OptimizeError::NoWeight);
        }

        let mut theta = vec![1.0 / n_groups as f64; n_groups];
        let mut iterations = 0;
        let mut converged = false;

        while iterations < config.max_iters {
            iterations += 1;

            let log_theta = theta.iter().map(|x| x.ln()).collect::<Vec<_>>();
            let mut counts = expected_counts(likelihoods, log_weights, &log_theta, columns.clone());
            comm.all_reduce_sum(&mut counts)?;

            let next = maximize(&counts, &problem.prior_alphas)
                .ok_or(OptimizeError::NonFinite { iteration: iterations })?;

            let change = theta
                .iter()
                .zip(next.iter())
                .map(|(old, new)| (old - new).abs())
                .fold(0.0, f64::max);
            theta = next;

            log::trace!(
                "Rank {} EM iteration {iterations}: max change {change:.3e}",
                comm.rank()
            );

            if change < config.tolerance {
                converged = true;
                break;
            }
        }

        if !comm.is_coordinator() {
            return Ok(None);
        }

        let log_theta = theta.iter().map(|x| x.ln()).collect::<Vec<_>>();
        let log_responsibilities = responsibilities(likelihoods, &log_theta);

        Ok(Some(Fit {
            log_responsibilities,
            iterations,
            converged,
        }))
    }
}

/// Returns the range of EC columns handled by a rank.
fn local_columns(n_ecs: usize, rank: usize, size: usize) -> Range<usize> {
    let per_rank = n_ecs / size;
    let remainder = n_ecs % size;

    let start = rank * per_rank + rank.min(remainder);
    let len = per_rank + usize::from(rank < remainder);

    start..start + len
}

/// Returns the posterior log-normalizer and per-group terms of a single EC.
fn ec_terms<'a>(
    likelihoods: &'a Matrix<f64>,
    log_theta: &'a [f64],
    ec: usize,
) -> impl Iterator<Item = f64> + Clone + 'a {
    log_theta
        .iter()
        .zip(likelihoods.iter_col(ec))
        .map(|(t, l)| t + l)
}

fn expected_counts(
    likelihoods: &Matrix<f64>,
    log_weights: &[f64],
    log_theta: &[f64],
    columns: Range<usize>,
) -> Vec<f64> {
    let n_groups = log_theta.len();

    let chunks = columns
        .clone()
        .step_by(CHUNK_SIZE)
        .map(|start| start..(start + CHUNK_SIZE).min(columns.end))
        .collect::<Vec<_>>();

    let partials = chunks
        .into_par_iter()
        .map(|chunk| {
            let mut counts = vec![0.0; n_groups];

            for ec in chunk.filter(|&ec| log_weights[ec] > f64::NEG_INFINITY) {
                let terms = ec_terms(likelihoods, log_theta, ec);
                let log_norm = ln_sum_exp(terms.clone());

                if log_norm == f64::NEG_INFINITY {
                    continue;
                }

                counts
                    .iter_mut()
                    .zip(terms)
                    .for_each(|(count, term)| *count += (log_weights[ec] + term - log_norm).exp());
            }

            counts
        })
        .collect::<Vec<_>>();

    partials
        .into_iter()
        .fold(vec![0.0; n_groups], |mut acc, partial| {
            acc.iter_mut().zip(partial).for_each(|(a, x)| *a += x);
            acc
        })
}

/// Returns the posterior mode of the mixture weights given expected group counts.
fn maximize(counts: &[f64], prior_alphas: &[f64]) -> Option<Vec<f64>> {
    let unnormalized = counts
        .iter()
        .zip(prior_alphas)
        .map(|(count, alpha)| (count + alpha - 1.0).max(0.0))
        .collect::<Vec<_>>();

    let sum = unnormalized.iter().sum::<f64>();
    if !(sum.is_finite() && sum > 0.0) {
        return None;
    }

    Some(unnormalized.into_iter().map(|x| x / sum).collect())
}

fn responsibilities(likelihoods: &Matrix<f64>, log_theta: &[f64]) -> Matrix<f64> {
    let (n_groups, n_ecs) = (likelihoods.rows(), likelihoods.cols());

    let columns = (0..n_ecs)
        .into_par_iter()
        .map(|ec| {
            let terms = ec_terms(likelihoods, log_theta, ec);
            let log_norm = ln_sum_exp(terms.clone());

            if log_norm == f64::NEG_INFINITY {
                vec![f64::NEG_INFINITY; n_groups]
            } else {
                terms.map(|term| term - log_norm).collect()
            }
        })
        .collect::<Vec<Vec<f64>>>();

    let mut matrix = Matrix::from_element(f64::NEG_INFINITY, n_groups, n_ecs);
    for (ec, column) in columns.into_iter().enumerate() {
        for (group, x) in column.into_iter().enumerate() {
            matrix[[group, ec]] = x;
        }
    }
    matrix
}

/// Returns the relative abundance of each group from log-responsibilities and EC log-weights.
///
/// Each abundance is the weighted share of all ECs attributed to the group, computed in log space.
/// ECs with log-weight `-inf` contribute nothing.
pub fn mixture_components(log_responsibilities: &Matrix<f64>, log_weights: &[f64]) -> Vec<f64> {
    let log_total = ln_sum_exp(log_weights.iter().copied());

    (0..log_responsibilities.rows())
        .into_par_iter()
        .map(|group| {
            let log_share = ln_sum_exp(
                log_responsibilities
                    .row(group)
                    .iter()
                    .zip(log_weights)
                    .map(|(r, w)| r + w),
            );
            (log_share - log_total).exp()
        })
        .collect()
}

/// An error associated with optimization.
#[derive(Clone, Debug, PartialEq)]
pub enum OptimizeError {
    /// The problem has no groups.
    NoGroups,
    /// An input does not match the dimensions of the likelihood matrix.
    DimensionMismatch {
        /// The mismatched input.
        what: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        found: usize,
    },
    /// The total weight of all ECs is zero.
    NoWeight,
    /// The mixture weights stopped being finite and normalizable.
    NonFinite {
        /// The iteration at which the weights broke down.
        iteration: usize,
    },
    /// The optimizer returned no fit to the coordinator.
    MissingFit,
    /// A collective operation failed.
    Collective(CollectiveError),
}

impl OptimizeError {
    /// Returns `true` if the error leaves the ranks out of step, so that the run cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OptimizeError::Collective(_) | OptimizeError::MissingFit)
    }
}

impl From<CollectiveError> for OptimizeError {
    fn from(e: CollectiveError) -> Self {
        Self::Collective(e)
    }
}

impl fmt::Display for OptimizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizeError::NoGroups => f.write_str("cannot optimize with no groups"),
            OptimizeError::DimensionMismatch {
                what,
                expected,
                found,
            } => write!(f, "expected {expected} {what}, found {found}"),
            OptimizeError::NoWeight => f.write_str("total weight of equivalence classes is zero"),
            OptimizeError::NonFinite { iteration } => write!(
                f,
                "mixture weights could not be normalized in iteration {iteration}"
            ),
            OptimizeError::MissingFit => f.write_str("optimizer returned no fit to the coordinator"),
            OptimizeError::Collective(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for OptimizeError {}

#[cfg(test)]
pub(crate) mod tests {
    use std::{num::NonZeroUsize, thread};

    use super::*;

    use crate::{
        collective::{LocalGroup, Solo},
        ec::EcHits,
        grouping::{BetaBinomialConstants, Grouping},
        likelihood::LikelihoodTable,
    };

    pub(crate) fn scenario() -> (Arc<LikelihoodMatrix>, Vec<f64>) {
        let grouping = Grouping::new(
            ["a", "a", "b", "b", "b", "c"],
            BetaBinomialConstants::default(),
        )
        .unwrap();
        let table = LikelihoodTable::new(&grouping, 0.99);
        let ecs = vec![
            EcHits::new(vec![1, 0, 0], 10),
            EcHits::new(vec![0, 2, 1], 5),
            EcHits::new(vec![2, 1, 0], 3),
            EcHits::new(vec![0, 0, 1], 2),
        ];
        let log_weights = ecs
            .iter()
            .map(|ec| (ec.read_count as f64).ln())
            .collect();

        let matrix = LikelihoodMatrix::build(&grouping, &table, &ecs).unwrap();
        (Arc::new(matrix), log_weights)
    }

    fn config() -> OptimizerConfig {
        OptimizerConfig {
            tolerance: 1e-6,
            max_iters: 1000,
            no_fit_model: false,
        }
    }

    fn solve(log_weights: Vec<f64>) -> (Fit, Vec<f64>) {
        let (matrix, _) = scenario();
        let problem = Arc::new(Problem::with_flat_prior(matrix, log_weights.clone()));
        let fit = Em
            .optimize(&Solo, Some(problem), &config())
            .unwrap()
            .unwrap();
        let abundances = fit.abundances(&log_weights);
        (fit, abundances)
    }

    #[test]
    fn test_local_columns_partition() {
        let ranges = (0..3).map(|rank| local_columns(10, rank, 3)).collect::<Vec<_>>();

        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        assert_eq!(local_columns(2, 2, 3), 2..2);
    }

    #[test]
    fn test_scenario_abundances() {
        let (_, log_weights) = scenario();
        let (fit, abundances) = solve(log_weights);

        assert!(fit.converged);
        assert_eq!(abundances.len(), 3);
        assert_approx_eq!(abundances.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(abundances.iter().all(|&x| x >= 0.0));
        assert!(abundances[0] > abundances[1]);
        assert!(abundances[0] > abundances[2]);
    }

    #[test]
    fn test_responsibilities_normalized() {
        let (_, log_weights) = scenario();
        let (fit, _) = solve(log_weights);

        for ec in 0..fit.log_responsibilities.cols() {
            let log_norm = ln_sum_exp(fit.log_responsibilities.iter_col(ec).copied());
            assert_approx_eq!(log_norm, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_zero_weight_ec_tolerated() {
        let (_, mut log_weights) = scenario();
        log_weights[1] = f64::NEG_INFINITY;
        let (_, abundances) = solve(log_weights);

        assert!(abundances.iter().all(|x| x.is_finite()));
        assert_approx_eq!(abundances.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_iteration_cap_is_not_error() {
        let (matrix, log_weights) = scenario();
        let problem = Arc::new(Problem::with_flat_prior(matrix, log_weights));
        let config = OptimizerConfig {
            max_iters: 1,
            ..config()
        };

        let fit = Em.optimize(&Solo, Some(problem), &config).unwrap().unwrap();

        assert_eq!(fit.iterations, 1);
        assert!(!fit.converged);
    }

    #[test]
    fn test_no_weight() {
        let (matrix, _) = scenario();
        let problem = Arc::new(Problem::with_flat_prior(
            matrix,
            vec![f64::NEG_INFINITY; 4],
        ));

        assert_eq!(
            Em.optimize(&Solo, Some(problem), &config()),
            Err(OptimizeError::NoWeight)
        );
    }

    #[test]
    fn test_dimension_mismatch() {
        let (matrix, _) = scenario();
        let problem = Arc::new(Problem::with_flat_prior(matrix, vec![0.0; 3]));

        let error = Em.optimize(&Solo, Some(problem), &config()).unwrap_err();

        assert!(matches!(
            error,
            OptimizeError::DimensionMismatch {
                expected: 4,
                found: 3,
                ..
            }
        ));
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_local_group_matches_solo() {
        let (matrix, log_weights) = scenario();
        let problem = Arc::new(Problem::with_flat_prior(matrix, log_weights.clone()));
        let (solo_fit, solo_abundances) = solve(log_weights.clone());

        let fits = thread::scope(|scope| {
            let handles = LocalGroup::new(NonZeroUsize::new(3).unwrap())
                .into_iter()
                .map(|member| {
                    let problem = member.is_coordinator().then(|| Arc::clone(&problem));
                    scope.spawn(move || Em.optimize(&member, problem, &config()))
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap().unwrap())
                .collect::<Vec<_>>()
        });

        assert!(fits[1].is_none());
        assert!(fits[2].is_none());

        let fit = fits[0].as_ref().unwrap();
        assert!(fit.converged && solo_fit.converged);
        assert_approx_eq!(fit.abundances(&log_weights), solo_abundances, epsilon = 1e-9);
    }

    #[test]
    fn test_mixture_components_sum_to_one() {
        let log_responsibilities = Matrix::new(
            vec![
                0.5f64.ln(),
                0.0,
                f64::NEG_INFINITY,
                0.5f64.ln(),
                f64::NEG_INFINITY,
                0.0,
            ],
            2,
            3,
        )
        .unwrap();
        let log_weights = [2f64.ln(), 1f64.ln(), f64::NEG_INFINITY];

        let components = mixture_components(&log_responsibilities, &log_weights);

        assert_approx_eq!(components, vec![2.0 / 3.0, 1.0 / 3.0], epsilon = 1e-12);
    }
}

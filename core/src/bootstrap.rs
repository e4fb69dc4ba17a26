//! Bootstrap resampling of equivalence class counts.
//!
//! The observed reads are resampled with replacement, which perturbs the weight of each EC while
//! leaving the likelihood matrix untouched. Re-estimating abundances for each resampled weight
//! vector gives a distribution reflecting sampling uncertainty. Randomness is only ever consumed
//! by the coordinator.

use std::{fmt, sync::Arc};

use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    SeedableRng,
};
use rayon::prelude::*;

use crate::{
    collective::Communicator,
    likelihood::LikelihoodMatrix,
    optimize::{OptimizeError, Optimizer, OptimizerConfig, Problem},
};

/// Source of the random number generator seed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Seed {
    /// A fixed seed, giving reproducible results.
    Fixed(u64),
    /// A seed drawn from system entropy.
    #[default]
    Entropy,
}

impl Seed {
    fn rng(self) -> StdRng {
        match self {
            Seed::Fixed(seed) => StdRng::seed_from_u64(seed),
            Seed::Entropy => StdRng::from_entropy(),
        }
    }
}

impl From<Option<u64>> for Seed {
    fn from(seed: Option<u64>) -> Self {
        seed.map(Self::Fixed).unwrap_or(Self::Entropy)
    }
}

/// Settings of the bootstrap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BootstrapConfig {
    /// Number of resampling rounds.
    pub iters: usize,
    /// Number of reads drawn per round, defaulting to the number of observed reads.
    pub count: Option<u64>,
    /// Seed of the random number generator.
    pub seed: Seed,
}

/// Drives bootstrap resampling and re-estimation for a single sample.
#[derive(Clone, Debug)]
pub struct BootstrapEngine {
    config: BootstrapConfig,
    rng: StdRng,
    distribution: Option<WeightedIndex<u64>>,
    n_ecs: usize,
    count: u64,
    results: Vec<Vec<f64>>,
}

impl BootstrapEngine {
    /// Creates a new engine, seeding its random number generator.
    pub fn new(config: BootstrapConfig) -> Self {
        Self {
            config,
            rng: config.seed.rng(),
            distribution: None,
            n_ecs: 0,
            count: 0,
            results: Vec::new(),
        }
    }

    /// Returns the number of reads drawn per round.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Prepares resampling from the observed read count of each EC.
    ///
    /// Previous results are cleared. The random number generator keeps its state.
    pub fn init(&mut self, read_counts: &[u64]) -> Result<(), BootstrapError> {
        self.results.clear();

        let distribution =
            WeightedIndex::new(read_counts.iter().copied()).map_err(|_| BootstrapError::NoReads)?;
        let total = read_counts.iter().sum::<u64>();

        self.distribution = Some(distribution);
        self.n_ecs = read_counts.len();
        self.count = self.config.count.unwrap_or(total);

        log::debug!(
            "Bootstrap drawing {} reads from {} equivalence classes per round",
            self.count,
            self.n_ecs
        );

        Ok(())
    }

    /// Returns the number of resampling rounds.
    pub fn iters(&self) -> usize {
        self.config.iters
    }

    /// Returns the log-weight of each EC after a single round of resampling.
    ///
    /// ECs that were never drawn have log-weight `-inf`.
    pub fn resample(&mut self) -> Result<Vec<f64>, BootstrapError> {
        let counts = self.resample_counts()?;

        Ok(counts.par_iter().map(|&count| (count as f64).ln()).collect())
    }

    /// Returns the number of times each EC is drawn in a single round of resampling.
    pub fn resample_counts(&mut self) -> Result<Vec<u64>, BootstrapError> {
        let distribution = self.distribution.as_ref().ok_or(BootstrapError::Uninitialized)?;

        let mut counts = vec![0; self.n_ecs];
        distribution
            .sample_iter(&mut self.rng)
            .take(self.count as usize)
            .for_each(|ec| counts[ec] += 1);

        Ok(counts)
    }

    /// Returns the abundances of every round of the last run.
    ///
    /// The first entry is the point estimate, followed by one entry per resampling round.
    pub fn results(&self) -> &[Vec<f64>] {
        &self.results
    }

    /// Estimates abundances from the observed weights, and then once for every resampling round.
    ///
    /// Must only be called on the coordinator. Every other rank must make one collective
    /// optimizer call for each of the `iters + 1` rounds.
    pub fn run<O>(
        &mut self,
        optimizer: &O,
        comm: &dyn Communicator,
        log_likelihoods: Arc<LikelihoodMatrix>,
        log_weights: &[f64],
        prior_alphas: &[f64],
        config: &OptimizerConfig,
    ) -> Result<&[Vec<f64>], BootstrapRunError>
    where
        O: Optimizer + ?Sized,
    {
        self.results.clear();

        let problem = Problem::new(
            Arc::clone(&log_likelihoods),
            log_weights.to_vec(),
            prior_alphas.to_vec(),
        );
        let point = optimizer.abundances(comm, Arc::new(problem), config)?;
        self.results.push(point);

        let iters = self.iters();
        for i in 1..=iters {
            log::info!("Bootstrap iteration {i}/{iters}");

            let resampled = self.resample()?;
            let problem = Problem::new(
                Arc::clone(&log_likelihoods),
                resampled,
                prior_alphas.to_vec(),
            );
            let abundances = optimizer.abundances(comm, Arc::new(problem), config)?;
            self.results.push(abundances);
        }

        Ok(&self.results)
    }
}

/// An error associated with bootstrap resampling.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BootstrapError {
    /// There are no reads to resample from.
    NoReads,
    /// Resampling was attempted before initialization.
    Uninitialized,
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::NoReads => f.write_str("no reads to resample for bootstrap"),
            BootstrapError::Uninitialized => {
                f.write_str("bootstrap resampling attempted before initialization")
            }
        }
    }
}

impl std::error::Error for BootstrapError {}

/// An error associated with a bootstrap run.
#[derive(Clone, Debug, PartialEq)]
pub enum BootstrapRunError {
    /// Resampling failed.
    Bootstrap(BootstrapError),
    /// Optimization failed.
    Optimize(OptimizeError),
}

impl From<BootstrapError> for BootstrapRunError {
    fn from(e: BootstrapError) -> Self {
        Self::Bootstrap(e)
    }
}

impl From<OptimizeError> for BootstrapRunError {
    fn from(e: OptimizeError) -> Self {
        Self::Optimize(e)
    }
}

impl fmt::Display for BootstrapRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapRunError::Bootstrap(e) => write!(f, "{e}"),
            BootstrapRunError::Optimize(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BootstrapRunError {}

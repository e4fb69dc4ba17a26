//! Orchestration of abundance estimation across groupings and ranks.
//!
//! The coordinator owns the input data, builds the likelihoods of each grouping, drives the
//! bootstrap and hands results to a [`Sink`]. Every other rank only joins the collective calls
//! of the optimizer, in the same order and the same number of times as the coordinator.

use std::{fmt, io, num::NonZeroUsize, sync::Arc};

use crate::{
    bootstrap::{BootstrapConfig, BootstrapEngine, BootstrapError, BootstrapRunError},
    collective::{CollectiveError, Communicator},
    ec::{EcError, EcIndex},
    grouping::{BetaBinomialConstants, Grouping, Reference},
    likelihood::{
        table::DEFAULT_HIT_PROBABILITY, LikelihoodError, LikelihoodMatrix, LikelihoodTable,
    },
    optimize::{OptimizeError, Optimizer, OptimizerConfig, Problem},
};

/// Settings of an estimation run, shared by all ranks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RunConfig {
    /// Number of threads used by each rank.
    pub threads: NonZeroUsize,
    /// Optimizer settings.
    pub optimizer: OptimizerConfig,
    /// Constants from which beta-binomial parameters are derived.
    pub bb_constants: BetaBinomialConstants,
    /// Probability that a read aligning to a group truly originates from it.
    pub hit_probability: f64,
    /// Bootstrap settings, if resampling is requested.
    pub bootstrap: Option<BootstrapConfig>,
    /// Whether to hand the likelihood matrix of each grouping to the sink.
    pub write_likelihood: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threads: NonZeroUsize::MIN,
            optimizer: OptimizerConfig::default(),
            bb_constants: BetaBinomialConstants::default(),
            hit_probability: DEFAULT_HIT_PROBABILITY,
            bootstrap: None,
            write_likelihood: false,
        }
    }
}

/// The reads of a single sample, optionally able to resample them.
#[derive(Clone, Debug)]
pub struct Sample {
    ecs: EcIndex,
    bootstrap: Option<BootstrapEngine>,
}

impl Sample {
    /// Creates a new sample, able to resample its reads if bootstrap settings are provided.
    pub fn new(ecs: EcIndex, bootstrap: Option<BootstrapConfig>) -> Self {
        Self {
            ecs,
            bootstrap: bootstrap.map(BootstrapEngine::new),
        }
    }

    /// Returns the equivalence classes of the sample.
    pub fn ecs(&self) -> &EcIndex {
        &self.ecs
    }

    /// Returns the number of optimizer calls needed to estimate abundances for one grouping.
    pub fn rounds(&self) -> usize {
        1 + self.bootstrap.as_ref().map_or(0, BootstrapEngine::iters)
    }
}

/// Everything the coordinator needs to estimate abundances.
#[derive(Clone, Debug)]
pub struct Dataset {
    /// Groupings of the reference sequences.
    pub reference: Reference,
    /// Reads aligned against the reference sequences.
    pub sample: Sample,
}

impl Dataset {
    /// Creates a new dataset.
    pub fn new(reference: Reference, sample: Sample) -> Self {
        Self { reference, sample }
    }
}

/// Estimated abundances for a single grouping.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupingResult {
    /// Index of the grouping.
    pub index: usize,
    /// Total number of groupings in the run.
    pub n_groupings: usize,
    /// Group names, in group order.
    pub names: Vec<String>,
    /// Number of aligned reads.
    pub total_reads: u64,
    /// The point estimate followed by one estimate per bootstrap round.
    pub abundances: Vec<Vec<f64>>,
}

impl GroupingResult {
    /// Returns the number of bootstrap rounds.
    pub fn iters(&self) -> usize {
        self.abundances.len().saturating_sub(1)
    }

    /// Returns the abundances estimated without resampling.
    pub fn point_estimate(&self) -> &[f64] {
        self.abundances.first().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Destination of estimation results.
pub trait Sink: Send {
    /// Writes the estimated abundances of a grouping.
    fn write_abundances(&mut self, result: &GroupingResult) -> io::Result<()>;

    /// Writes the likelihood matrix of a grouping.
    fn write_likelihood(
        &mut self,
        index: usize,
        n_groupings: usize,
        matrix: &LikelihoodMatrix,
        read_counts: &[u64],
    ) -> io::Result<()>;
}

impl Sink for Vec<GroupingResult> {
    fn write_abundances(&mut self, result: &GroupingResult) -> io::Result<()> {
        self.push(result.clone());
        Ok(())
    }

    fn write_likelihood(
        &mut self,
        _index: usize,
        _n_groupings: usize,
        _matrix: &LikelihoodMatrix,
        _read_counts: &[u64],
    ) -> io::Result<()> {
        Ok(())
    }
}

/// What became of a single grouping.
#[derive(Clone, Debug, PartialEq)]
pub enum GroupingOutcome {
    /// Abundances were estimated and written.
    Estimated,
    /// Optimization was disabled.
    Skipped,
    /// Optimization failed; later groupings were still processed.
    Failed(OptimizeError),
}

/// Runs estimation for one rank, using a dedicated thread pool.
#[derive(Debug)]
pub struct Estimator<O> {
    config: RunConfig,
    optimizer: O,
    pool: rayon::ThreadPool,
}

impl<O> Estimator<O>
where
    O: Optimizer,
{
    /// Creates a new estimator.
    pub fn new(config: RunConfig, optimizer: O) -> Result<Self, EstimateError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads.get())
            .build()
            .map_err(|e| EstimateError::ThreadPool(e.to_string()))?;

        Ok(Self {
            config,
            optimizer,
            pool,
        })
    }

    /// Returns the configuration of the run.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs estimation as the coordinator.
    ///
    /// Any fatal error signals every other rank to abort before returning.
    pub fn run<S>(
        &self,
        comm: &dyn Communicator,
        dataset: Dataset,
        sink: &mut S,
    ) -> Result<Vec<GroupingOutcome>, EstimateError>
    where
        S: Sink,
    {
        if !comm.is_coordinator() {
            return Err(EstimateError::NotCoordinator { rank: comm.rank() });
        }

        self.pool
            .install(|| self.coordinate(comm, dataset, sink))
            .map_err(|e| {
                comm.abort();
                e
            })
    }

    /// Joins the collective calls of a run as a non-coordinating rank.
    pub fn participate(&self, comm: &dyn Communicator) -> Result<(), EstimateError> {
        self.pool.install(|| self.follow(comm)).map_err(|e| {
            comm.abort();
            e
        })
    }

    fn coordinate<S>(
        &self,
        comm: &dyn Communicator,
        dataset: Dataset,
        sink: &mut S,
    ) -> Result<Vec<GroupingOutcome>, EstimateError>
    where
        S: Sink,
    {
        let Dataset {
            reference,
            mut sample,
        } = dataset;

        let n_groupings = comm.broadcast_count(Some(reference.n_groupings()))?;
        let mut outcomes = Vec::with_capacity(n_groupings);

        for (index, grouping) in reference.groupings().iter().enumerate() {
            log::info!(
                "Processing grouping {}/{n_groupings} with {} groups",
                index + 1,
                grouping.n_groups()
            );
            comm.broadcast_count(Some(grouping.n_groups()))?;

            let rounds = if self.config.optimizer.no_fit_model {
                0
            } else {
                sample.rounds()
            };
            comm.broadcast_count(Some(rounds))?;

            let matrix = Arc::new(self.build_likelihood(grouping, &sample.ecs)?);

            if self.config.write_likelihood {
                sink.write_likelihood(index, n_groupings, &matrix, &sample.ecs.read_counts())?;
            }

            if self.config.optimizer.no_fit_model {
                log::info!("Skipping estimation of relative abundances");
                outcomes.push(GroupingOutcome::Skipped);
                continue;
            }

            log::info!("Estimating relative abundances");
            match self.estimate(comm, &mut sample, matrix) {
                Ok(abundances) => {
                    let result = GroupingResult {
                        index,
                        n_groupings,
                        names: grouping.names().map(String::from).collect(),
                        total_reads: sample.ecs.total_reads(),
                        abundances,
                    };
                    sink.write_abundances(&result)?;
                    outcomes.push(GroupingOutcome::Estimated);
                }
                Err(EstimateError::Optimize(e)) if !e.is_fatal() => {
                    log::error!("Estimation failed for grouping {}: {e}", index + 1);
                    outcomes.push(GroupingOutcome::Failed(e));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(outcomes)
    }

    fn follow(&self, comm: &dyn Communicator) -> Result<(), EstimateError> {
        let n_groupings = comm.broadcast_count(None)?;

        for index in 0..n_groupings {
            let n_groups = comm.broadcast_count(None)?;
            let rounds = comm.broadcast_count(None)?;
            log::trace!(
                "Rank {} joining grouping {} with {n_groups} groups for {rounds} rounds",
                comm.rank(),
                index + 1
            );

            for _ in 0..rounds {
                match self.optimizer.optimize(comm, None, &self.config.optimizer) {
                    Ok(_) => (),
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        log::trace!("Rank {} leaving failed grouping: {e}", comm.rank());
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn build_likelihood(
        &self,
        grouping: &Grouping,
        ecs: &EcIndex,
    ) -> Result<LikelihoodMatrix, EstimateError> {
        log::info!("Building log-likelihood array");

        let hits = ecs.hits(grouping)?;
        let table = LikelihoodTable::new(grouping, self.config.hit_probability);
        let matrix = LikelihoodMatrix::build(grouping, &table, &hits)?;

        log::debug!(
            "Built {}x{} log-likelihood array",
            matrix.n_groups(),
            matrix.n_ecs()
        );

        Ok(matrix)
    }

    fn estimate(
        &self,
        comm: &dyn Communicator,
        sample: &mut Sample,
        matrix: Arc<LikelihoodMatrix>,
    ) -> Result<Vec<Vec<f64>>, EstimateError> {
        let log_weights = sample.ecs.log_read_counts();
        let prior_alphas = vec![1.0; matrix.n_groups()];
        let config = &self.config.optimizer;

        match sample.bootstrap.as_mut() {
            Some(engine) => {
                engine.init(&sample.ecs.read_counts())?;
                let results = engine.run(
                    &self.optimizer,
                    comm,
                    matrix,
                    &log_weights,
                    &prior_alphas,
                    config,
                )?;
                Ok(results.to_vec())
            }
            None => {
                let problem = Problem::new(matrix, log_weights, prior_alphas);
                let abundances = self.optimizer.abundances(comm, Arc::new(problem), config)?;
                Ok(vec![abundances])
            }
        }
    }
}

/// An error associated with an estimation run.
#[derive(Debug)]
pub enum EstimateError {
    /// The thread pool could not be created.
    ThreadPool(String),
    /// A coordinator-only operation was attempted on another rank.
    NotCoordinator {
        /// Rank of the caller.
        rank: usize,
    },
    /// The reads are inconsistent with a grouping.
    Ec(EcError),
    /// The likelihood matrix could not be built.
    Likelihood(LikelihoodError),
    /// Resampling failed.
    Bootstrap(BootstrapError),
    /// Optimization failed.
    Optimize(OptimizeError),
    /// A collective call failed.
    Collective(CollectiveError),
    /// Results could not be written.
    Io(io::Error),
}

impl EstimateError {
    /// Returns `true` if the error ends the whole run, rather than a single grouping.
    pub fn is_fatal(&self) -> bool {
        match self {
            EstimateError::Optimize(e) => e.is_fatal(),
            _ => true,
        }
    }
}

impl fmt::Display for EstimateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimateError::ThreadPool(e) => write!(f, "failed to create thread pool: {e}"),
            EstimateError::NotCoordinator { rank } => {
                write!(f, "rank {rank} cannot coordinate estimation")
            }
            EstimateError::Ec(e) => write!(f, "{e}"),
            EstimateError::Likelihood(e) => write!(f, "{e}"),
            EstimateError::Bootstrap(e) => write!(f, "{e}"),
            EstimateError::Optimize(e) => write!(f, "{e}"),
            EstimateError::Collective(e) => write!(f, "{e}"),
            EstimateError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EstimateError {}

impl From<EcError> for EstimateError {
    fn from(e: EcError) -> Self {
        Self::Ec(e)
    }
}

impl From<LikelihoodError> for EstimateError {
    fn from(e: LikelihoodError) -> Self {
        Self::Likelihood(e)
    }
}

impl From<BootstrapError> for EstimateError {
    fn from(e: BootstrapError) -> Self {
        Self::Bootstrap(e)
    }
}

impl From<BootstrapRunError> for EstimateError {
    fn from(e: BootstrapRunError) -> Self {
        match e {
            BootstrapRunError::Bootstrap(e) => Self::Bootstrap(e),
            BootstrapRunError::Optimize(e) => Self::Optimize(e),
        }
    }
}

impl From<OptimizeError> for EstimateError {
    fn from(e: OptimizeError) -> Self {
        match e {
            OptimizeError::Collective(e) => Self::Collective(e),
            e => Self::Optimize(e),
        }
    }
}

impl From<CollectiveError> for EstimateError {
    fn from(e: CollectiveError) -> Self {
        Self::Collective(e)
    }
}

impl From<io::Error> for EstimateError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

use std::{num::NonZeroUsize, path::PathBuf, thread};

use anyhow::{anyhow, Context, Error};

use clap::CommandFactory;
use lineage_core::{
    bootstrap::BootstrapConfig,
    collective::{LocalGroup, Solo},
    estimate::{Dataset, GroupingOutcome, RunConfig, Sample},
    grouping::BetaBinomialConstants,
    optimize::{Em, OptimizerConfig},
    report::Writer,
    Communicator, EcIndex, Estimator, Input, Reference,
};

use super::Estimate;

pub struct Runner {
    config: RunConfig,
    indicators: PathBuf,
    alignment: Input,
    processes: NonZeroUsize,
    writer: Writer,
}

impl Runner {
    pub fn run(self) -> Result<(), Error> {
        let outcomes = if self.processes.get() == 1 {
            self.coordinate(&Solo)?
        } else {
            self.run_group()?
        };

        let failed = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, GroupingOutcome::Failed(_)))
            .count();

        if failed > 0 {
            Err(anyhow!(
                "Estimation failed for {failed} of {} groupings",
                outcomes.len()
            ))
        } else {
            Ok(())
        }
    }

    fn run_group(&self) -> Result<Vec<GroupingOutcome>, Error> {
        log::debug!("Running with {} cooperating processes", self.processes);

        let mut members = LocalGroup::new(self.processes).into_iter();
        let coordinator = members
            .next()
            .ok_or_else(|| anyhow!("Collective group has no coordinator"))?;
        let config = self.config;

        thread::scope(|scope| {
            let handles = members
                .map(|member| {
                    scope.spawn(move || Estimator::new(config, Em)?.participate(&member))
                })
                .collect::<Vec<_>>();

            let outcomes = self.coordinate(&coordinator);

            for (i, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(Ok(())) => (),
                    Ok(Err(e)) => log::debug!("Process {} stopped: {e}", i + 1),
                    Err(_) => return Err(anyhow!("Process {} panicked", i + 1)),
                }
            }

            outcomes
        })
    }

    fn coordinate(&self, comm: &dyn Communicator) -> Result<Vec<GroupingOutcome>, Error> {
        let estimator = abort_on_error(comm, Estimator::new(self.config, Em))?;
        let dataset = abort_on_error(comm, self.read())?;

        let mut writer = self.writer.clone();

        Ok(estimator.run(comm, dataset, &mut writer)?)
    }

    fn read(&self) -> Result<Dataset, Error> {
        log::info!(
            "Reading group indicators from '{}'",
            self.indicators.display()
        );
        let reference = Reference::from_path(&self.indicators, self.config.bb_constants)
            .with_context(|| {
                format!(
                    "Failed to read group indicators from '{}'",
                    self.indicators.display()
                )
            })?;
        log::info!(
            "Read {} groupings over {} reference sequences",
            reference.n_groupings(),
            reference.n_refs()
        );

        let source = self
            .alignment
            .as_path()
            .map(|path| format!("'{}'", path.display()))
            .unwrap_or_else(|| String::from("stdin"));
        log::info!("Reading pseudoalignments from {source}");
        let ecs = EcIndex::from_input(&self.alignment, reference.n_refs())
            .with_context(|| format!("Failed to read pseudoalignments from {source}"))?;
        log::info!("Read {} unique alignments", ecs.len());

        Ok(Dataset::new(reference, Sample::new(ecs, self.config.bootstrap)))
    }
}

/// Signals every other rank to abort if the coordinator fails before estimation starts.
fn abort_on_error<T, E>(comm: &dyn Communicator, result: Result<T, E>) -> Result<T, E> {
    result.map_err(|e| {
        comm.abort();
        e
    })
}

impl TryFrom<&Estimate> for Runner {
    type Error = Error;

    fn try_from(args: &Estimate) -> Result<Self, Self::Error> {
        let alignment = Input::new(args.alignment.clone()).map_err(|_| {
            clap::Error::new(clap::error::ErrorKind::MissingRequiredArgument)
                .with_cmd(&Estimate::command())
        })?;

        let bootstrap = args
            .iters
            .filter(|&iters| iters > 0)
            .map(|iters| BootstrapConfig {
                iters,
                count: args.bootstrap_count,
                seed: args.seed.into(),
            });

        let config = RunConfig {
            threads: args.threads,
            optimizer: OptimizerConfig {
                tolerance: args.tolerance,
                max_iters: args.max_iters,
                no_fit_model: args.no_fit_model,
            },
            bb_constants: BetaBinomialConstants {
                mean_fraction: args.mean_fraction,
                dispersion: args.dispersion,
            },
            bootstrap,
            write_likelihood: args.write_likelihood,
            ..Default::default()
        };

        Ok(Self {
            config,
            indicators: args.indicators.clone(),
            alignment,
            processes: args.processes,
            writer: Writer::new(args.output.clone(), args.precision),
        })
    }
}

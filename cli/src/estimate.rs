use std::{num::NonZeroUsize, path::PathBuf};

use anyhow::Error;

use clap::Parser;

mod runner;
use runner::Runner;

/// Estimate relative abundances of reference lineages.
#[derive(Debug, Parser)]
pub struct Estimate {
    /// Group indicators.
    ///
    /// One line per reference sequence, in the order used by the pseudoalignments, holding the
    /// name of the group the sequence belongs to. Several groupings may be provided as additional
    /// tab-separated columns, in which case abundances are estimated for each grouping in turn.
    #[arg(short = 'i', long, value_name = "FILE")]
    indicators: PathBuf,

    /// Pseudoalignments.
    ///
    /// One line per read, holding the read name followed by the zero-based indices of the
    /// reference sequences the read is compatible with, separated by whitespace. Gzipped input is
    /// detected automatically. If no file is provided, stdin will be used.
    #[arg(short = 'a', long, value_name = "FILE")]
    alignment: Option<PathBuf>,

    /// Output prefix.
    ///
    /// Abundances are written to '<PREFIX>_abundances.txt', or to '<PREFIX>_<INDEX>_abundances.txt'
    /// when more than one grouping is provided. If no prefix is provided, output is written to
    /// stdout.
    #[arg(short = 'o', long, value_name = "PREFIX")]
    output: Option<PathBuf>,

    /// Number of threads to use per process.
    #[arg(short = 't', long, default_value_t = NonZeroUsize::new(4).unwrap(), value_name = "INT")]
    threads: NonZeroUsize,

    /// Number of cooperating processes sharing the optimization.
    ///
    /// Only the first process reads input, draws random numbers and writes output.
    #[arg(long, default_value_t = NonZeroUsize::MIN, value_name = "INT")]
    processes: NonZeroUsize,

    /// Number of bootstrap iterations.
    ///
    /// If provided, reads are resampled with replacement this many times, and abundances are
    /// re-estimated for each resampling to quantify uncertainty.
    #[arg(long, value_name = "INT")]
    iters: Option<usize>,

    /// Number of reads drawn per bootstrap iteration.
    ///
    /// Defaults to the number of aligned reads.
    #[arg(long, requires = "iters", value_name = "INT")]
    bootstrap_count: Option<u64>,

    /// Seed for bootstrap resampling.
    ///
    /// If not provided, the seed is drawn from system entropy and results are not reproducible.
    #[arg(long, requires = "iters", value_name = "INT")]
    seed: Option<u64>,

    /// Optimizer tolerance.
    ///
    /// Optimization stops when no relative abundance changes by more than this between
    /// iterations.
    #[arg(long, default_value_t = 1e-6, value_name = "FLOAT")]
    tolerance: f64,

    /// Maximum number of optimizer iterations.
    #[arg(long, default_value_t = 5000, value_name = "INT")]
    max_iters: usize,

    /// Expected fraction of a group's references that a read from the group aligns to.
    #[arg(long, default_value_t = 0.65, value_name = "FLOAT")]
    mean_fraction: f64,

    /// Dispersion term of the beta-binomial distribution.
    #[arg(long, default_value_t = 0.01, value_name = "FLOAT")]
    dispersion: f64,

    /// Skip estimation of relative abundances.
    ///
    /// Useful together with '--write-likelihood'.
    #[arg(long)]
    no_fit_model: bool,

    /// Write the log-likelihood matrix of each grouping.
    ///
    /// The matrix is written to '<PREFIX>_likelihoods.txt' (or stdout), with one line per
    /// equivalence class, holding its read count and one log-likelihood per group.
    #[arg(long)]
    write_likelihood: bool,

    /// Output precision.
    #[arg(long, default_value_t = 6, value_name = "INT")]
    precision: usize,
}

impl Estimate {
    pub fn run(self) -> Result<(), Error> {
        Runner::try_from(&self)?.run()
    }
}

#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Estimation of lineage abundances from pseudoalignments.
//!
//! This serves as the core library implementation for the `lineage` CLI, but can also be used as
//! a free-standing library.
//!
//! # Overview
//!
//! Reference sequences are partitioned into groups by one or more [`Grouping`]s. Reads are
//! pseudoaligned to the references, and reads compatible with the same references are merged into
//! equivalence classes in an [`EcIndex`]. For each grouping, the number of an equivalence class's
//! compatible references falling in each group is scored under a beta-binomial model, giving a
//! [`LikelihoodMatrix`]. An [`Optimizer`] then estimates the mixture weights of the groups, which
//! are the relative abundances. Optionally, the reads are resampled to quantify the uncertainty of
//! the estimate with a [`BootstrapEngine`].
//!
//! The [`Estimator`] orchestrates all of this across groupings, and can share the work of the
//! optimizer between several ranks connected by a [`Communicator`].
//!
//! # Example
//!
//! ```
//! use lineage_core::{
//!     collective::Solo,
//!     estimate::{Dataset, Estimator, GroupingResult, RunConfig, Sample},
//!     grouping::{BetaBinomialConstants, Grouping, Reference},
//!     optimize::Em,
//!     EcIndex,
//! };
//!
//! let constants = BetaBinomialConstants::default();
//! let grouping = Grouping::new(["a", "a", "b"], constants)?;
//! let reference = Reference::new(vec![grouping])?;
//!
//! let mut ecs = EcIndex::new(3);
//! ecs.add_reads([0, 1], 8)?;
//! ecs.add_reads([2], 2)?;
//!
//! let estimator = Estimator::new(RunConfig::default(), Em)?;
//! let dataset = Dataset::new(reference, Sample::new(ecs, None));
//!
//! let mut results: Vec<GroupingResult> = Vec::new();
//! estimator.run(&Solo, dataset, &mut results)?;
//!
//! let abundances = results[0].point_estimate();
//! assert!(abundances[0] > abundances[1]);
//! assert!((abundances.iter().sum::<f64>() - 1.0).abs() < 1e-9);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#[cfg(test)]
#[macro_use]
pub(crate) mod approx;

pub mod bootstrap;
pub use bootstrap::{BootstrapEngine, Seed};

pub mod collective;
pub use collective::Communicator;

pub mod ec;
pub use ec::EcIndex;

pub mod estimate;
pub use estimate::Estimator;

pub mod grouping;
pub use grouping::{Grouping, Reference};

pub mod input;
pub use input::Input;

pub mod likelihood;
pub use likelihood::{LikelihoodMatrix, LikelihoodTable};

pub mod matrix;
pub use matrix::Matrix;

pub mod optimize;
pub use optimize::Optimizer;

pub mod report;

pub mod utils;

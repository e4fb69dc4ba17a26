//! Writing estimation results.

use std::{
    fs::File,
    io::{self, Write},
    path::PathBuf,
};

use crate::{
    estimate::{GroupingResult, Sink},
    likelihood::LikelihoodMatrix,
};

/// Default number of decimals of written values.
pub const DEFAULT_PRECISION: usize = 6;

/// Writes the abundance report of a single grouping.
///
/// The report starts with metadata lines prefixed by `#`, followed by one line per group holding
/// the group name, the point estimate and one value per bootstrap round, separated by tabs.
pub fn write_abundances<W>(
    writer: &mut W,
    result: &GroupingResult,
    precision: usize,
) -> io::Result<()>
where
    W: io::Write,
{
    if let Some(abundances) = result
        .abundances
        .iter()
        .find(|abundances| abundances.len() != result.names.len())
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "cannot write {} abundances for {} groups",
                abundances.len(),
                result.names.len()
            ),
        ));
    }

    writeln!(writer, "#version:\t{}", env!("CARGO_PKG_VERSION"))?;
    writeln!(writer, "#total_hits:\t{}", result.total_reads)?;
    writeln!(writer, "#bootstrap_iters:\t{}", result.iters())?;

    if result.iters() > 0 {
        writeln!(writer, "#c_id\tmean_theta\tbootstrap_mean_thetas")?;
    } else {
        writeln!(writer, "#c_id\tmean_theta")?;
    }

    for (group, name) in result.names.iter().enumerate() {
        write!(writer, "{name}")?;
        for abundances in result.abundances.iter() {
            write!(writer, "\t{:.precision$}", abundances[group])?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

/// A [`Sink`] writing results to files sharing a prefix, or to stdout.
#[derive(Clone, Debug)]
pub struct Writer {
    prefix: Option<PathBuf>,
    precision: usize,
}

impl Writer {
    /// Creates a new writer.
    ///
    /// Without a prefix, everything is written to stdout.
    pub fn new(prefix: Option<PathBuf>, precision: usize) -> Self {
        Self { prefix, precision }
    }

    /// Returns the path written for a grouping, or `None` if writing to stdout.
    ///
    /// With a single grouping, the path is `<prefix>_<suffix>`; otherwise, the zero-based index of
    /// the grouping is included as `<prefix>_<index>_<suffix>`.
    pub fn path(&self, index: usize, n_groupings: usize, suffix: &str) -> Option<PathBuf> {
        self.prefix.as_ref().map(|prefix| {
            let mut name = prefix.clone().into_os_string();
            if n_groupings > 1 {
                name.push(format!("_{index}"));
            }
            name.push(format!("_{suffix}"));
            PathBuf::from(name)
        })
    }

    fn create(
        &self,
        index: usize,
        n_groupings: usize,
        suffix: &str,
    ) -> io::Result<Box<dyn Write>> {
        match self.path(index, n_groupings, suffix) {
            Some(path) => {
                log::debug!("Writing to {}", path.display());

                let file = File::create(&path).map_err(|e| {
                    io::Error::new(e.kind(), format!("failed to create {}: {e}", path.display()))
                })?;
                Ok(Box::new(io::BufWriter::new(file)))
            }
            None => Ok(Box::new(io::stdout().lock())),
        }
    }
}

impl Sink for Writer {
    fn write_abundances(&mut self, result: &GroupingResult) -> io::Result<()> {
        let mut writer = self.create(result.index, result.n_groupings, "abundances.txt")?;
        write_abundances(&mut writer, result, self.precision)?;
        writer.flush()
    }

    fn write_likelihood(
        &mut self,
        index: usize,
        n_groupings: usize,
        matrix: &LikelihoodMatrix,
        read_counts: &[u64],
    ) -> io::Result<()> {
        let mut writer = self.create(index, n_groupings, "likelihoods.txt")?;
        matrix.write(&mut writer, read_counts, self.precision)?;
        writer.flush()
    }
}

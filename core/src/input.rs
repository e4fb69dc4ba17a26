//! Input sources for group indicators and pseudoalignments.

use std::{
    env,
    fs::File,
    io::{self, IsTerminal as _},
    path::{Path, PathBuf},
};

use flate2::bufread::MultiGzDecoder;

/// An input source for reading.
#[derive(Debug)]
pub enum Input {
    /// A path from which to read a file.
    Path(PathBuf),
    /// Stdin.
    Stdin,
}

impl Input {
    /// By default, creating an `Input` without a path checks that input is available via stdin,
    /// instead of hanging.
    ///
    /// In some contexts, e.g. testing, this can cause issues, and so it may be disabled by setting
    /// this environment variable, or by using [`Input::new_unchecked`].
    pub const ENV_KEY_DISABLE_CHECK: &'static str = "LINEAGE_ALLOW_STDIN";

    /// Creates a new input source.
    pub fn new(input: Option<PathBuf>) -> io::Result<Self> {
        let check = env::var(Self::ENV_KEY_DISABLE_CHECK).is_err();

        if input.is_none() && io::stdin().is_terminal() && check {
            Err(io::Error::new(
                io::ErrorKind::Other,
                "received no input via file or stdin",
            ))
        } else {
            Ok(Self::new_unchecked(input))
        }
    }

    /// Creates a new input source without checking that any data is available.
    pub fn new_unchecked(input: Option<PathBuf>) -> Self {
        if let Some(path) = input {
            Self::Path(path)
        } else {
            Self::Stdin
        }
    }

    /// Open the input for reading.
    pub fn open(&self) -> io::Result<Reader> {
        match self {
            Input::Path(path) => File::open(path).map(io::BufReader::new).map(Reader::File),
            Input::Stdin => Ok(Reader::Stdin(io::stdin().lock())),
        }
    }

    /// Open the input for reading, transparently decompressing gzip data.
    pub fn open_decoded(&self) -> io::Result<Box<dyn io::BufRead>> {
        match self.open()? {
            Reader::File(reader) => decode(reader),
            Reader::Stdin(reader) => decode(reader),
        }
    }

    /// Returns the provided path if provided, otherwise `None`.
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Input::Path(path) => Some(path.as_ref()),
            Input::Stdin => None,
        }
    }
}

/// A reader from either a file or stdin.
#[derive(Debug)]
pub enum Reader {
    /// A reader from a file.
    File(io::BufReader<File>),
    /// A reader stdin.
    Stdin(io::StdinLock<'static>),
}

/// A compression method detected from the leading bytes of a stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionMethod {
    /// Gzip, including BGZF.
    Gzip,
}

impl CompressionMethod {
    /// Detects the compression method without consuming any data.
    pub fn detect<R>(reader: &mut R) -> io::Result<Option<Self>>
    where
        R: io::BufRead,
    {
        const GZIP_MAGIC_NUMBER: [u8; 2] = [0x1f, 0x8b];

        let src = reader.fill_buf()?;

        if let Some(buf) = src.get(..GZIP_MAGIC_NUMBER.len()) {
            if buf == GZIP_MAGIC_NUMBER {
                return Ok(Some(CompressionMethod::Gzip));
            }
        }

        Ok(None)
    }
}

/// Wraps a reader in a gzip decoder if the stream is gzip-compressed.
pub fn decode<R>(mut reader: R) -> io::Result<Box<dyn io::BufRead>>
where
    R: 'static + io::BufRead,
{
    Ok(match CompressionMethod::detect(&mut reader)? {
        Some(CompressionMethod::Gzip) => {
            Box::new(io::BufReader::new(MultiGzDecoder::new(reader)))
        }
        None => Box::new(reader),
    })
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead as _, Write as _};

    use flate2::{write::GzEncoder, Compression};

    use super::*;

    #[test]
    fn test_detect_gzip() -> io::Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"read0 0 1\n")?;
        let compressed = encoder.finish()?;

        assert_eq!(
            CompressionMethod::detect(&mut &compressed[..])?,
            Some(CompressionMethod::Gzip)
        );
        assert_eq!(CompressionMethod::detect(&mut &b"read0 0 1\n"[..])?, None);

        Ok(())
    }

    #[test]
    fn test_decode_gzip() -> io::Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"read0 0 1\nread1 2\n")?;
        let compressed = encoder.finish()?;

        let lines = decode(io::Cursor::new(compressed))?
            .lines()
            .collect::<io::Result<Vec<_>>>()?;

        assert_eq!(lines, vec!["read0 0 1", "read1 2"]);

        Ok(())
    }

    #[test]
    fn test_decode_plain() -> io::Result<()> {
        let lines = decode(io::Cursor::new(b"read0 3\n".to_vec()))?
            .lines()
            .collect::<io::Result<Vec<_>>>()?;

        assert_eq!(lines, vec!["read0 3"]);

        Ok(())
    }
}

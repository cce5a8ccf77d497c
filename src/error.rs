// error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading data or computing statistics.
///
/// A failure is scoped to the operation that raised it: one statistic
/// failing never invalidates the others computed from the same dataset.
#[derive(Debug, Error)]
pub enum PopDiffError {
    /// Malformed or inconsistent input (missing sequences, missing strata,
    /// unaligned loci, bad locus names).
    #[error("Schema error: {0}")]
    Schema(String),

    /// Degenerate data produced a non-numeric result.
    #[error("Undefined statistic: {0}")]
    UndefinedStatistic(String),

    /// Fewer than two populations, an empty population, or too few samples
    /// for the requested partition.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Strata table error: {0}")]
    Csv(#[from] csv::Error),
}

impl PopDiffError {
    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        PopDiffError::Schema(msg.into())
    }

    pub(crate) fn undefined(msg: impl Into<String>) -> Self {
        PopDiffError::UndefinedStatistic(msg.into())
    }

    pub(crate) fn insufficient(msg: impl Into<String>) -> Self {
        PopDiffError::InsufficientData(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PopDiffError::Io {
            path: path.into(),
            source,
        }
    }

    /// Same variant and message. I/O and CSV sources keep only their text.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            PopDiffError::Schema(msg) => PopDiffError::Schema(msg.clone()),
            PopDiffError::UndefinedStatistic(msg) => PopDiffError::UndefinedStatistic(msg.clone()),
            PopDiffError::InsufficientData(msg) => PopDiffError::InsufficientData(msg.clone()),
            PopDiffError::Io { path, source } => PopDiffError::Io {
                path: path.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            PopDiffError::Csv(e) => PopDiffError::Csv(csv::Error::from(std::io::Error::other(e.to_string()))),
        }
    }
}

pub type Result<T, E = PopDiffError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_keeps_variant_and_message() {
        let err = PopDiffError::schema("locus 'COI' is not aligned");
        assert!(matches!(err.duplicate(), PopDiffError::Schema(ref m) if m == "locus 'COI' is not aligned"));

        let err = PopDiffError::undefined("Ht is zero");
        assert!(matches!(err.duplicate(), PopDiffError::UndefinedStatistic(_)));

        let err = PopDiffError::io(
            "missing.fa",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        match err.duplicate() {
            PopDiffError::Io { path, source } => {
                assert_eq!(path, PathBuf::from("missing.fa"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}

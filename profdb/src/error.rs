use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use ulid::Ulid;

#[non_exhaustive]
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] Arc<std::io::Error>),

    #[error("object store error: {0}")]
    ObjectStoreError(#[from] Arc<object_store::Error>),

    #[error("invalid block meta: {0}")]
    InvalidMeta(#[from] Arc<serde_json::Error>),

    #[error("invalid concurrency level ({0}), concurrency level must be > 0")]
    InvalidConcurrency(usize),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timeout: {msg}")]
    Timeout { msg: String },

    #[error(
        "invalid minTime for block {id}, compacted block minTime {min_time} \
         is before source minTime {source_min_time}"
    )]
    InvalidBlockMinTime {
        id: Ulid,
        min_time: i64,
        source_min_time: i64,
    },

    #[error(
        "invalid maxTime for block {id}, compacted block maxTime {max_time} \
         is after source maxTime {source_max_time}"
    )]
    InvalidBlockMaxTime {
        id: Ulid,
        max_time: i64,
        source_max_time: i64,
    },

    #[error(
        "compacted block(s) do not contain minTime {min_time} and maxTime {max_time} \
         from the source blocks"
    )]
    TimeRangeNotCovered { min_time: i64, max_time: i64 },

    #[error("compaction job {key}: {source}")]
    CompactionJob {
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("compaction job panicked: {msg}")]
    CompactionJobPanic { msg: String },

    #[error("{0}")]
    CompactionFailed(MultiError),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

impl From<object_store::Error> for Error {
    fn from(value: object_store::Error) -> Self {
        Self::ObjectStoreError(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidMeta(Arc::new(value))
    }
}

impl Error {
    /// Wraps a job error with the group key of the job that produced it.
    pub(crate) fn for_job(key: &str, source: Error) -> Self {
        Self::CompactionJob {
            key: key.to_string(),
            source: Box::new(source),
        }
    }
}

/// Aggregate of the job errors collected during one compaction pass.
#[derive(Clone, Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn new(errors: Vec<Error>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error(s) occurred: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

/// Represents errors that can occur while loading the compactor configuration.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Unknown configuration file format: {0}")]
    UnknownFormat(PathBuf),

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(#[from] Box<figment::Error>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_error_display_joins_all_errors() {
        let err = MultiError::new(vec![
            Error::Cancelled,
            Error::Timeout {
                msg: "mark block".to_string(),
            },
        ]);

        let rendered = err.to_string();
        assert!(rendered.starts_with("2 error(s) occurred: "));
        assert!(rendered.contains("operation cancelled"));
        assert!(rendered.contains("timeout: mark block"));
    }

    #[test]
    fn test_job_error_carries_group_key() {
        let err = Error::for_job("0@12345", Error::Cancelled);
        assert_eq!(
            err.to_string(),
            "compaction job 0@12345: operation cancelled"
        );
    }
}

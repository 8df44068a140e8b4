use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::common::Phase;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Everything that can abort a job.
///
/// None of these are retried: a failing task fails its whole job, and the
/// error travels back to the submitter through the job's completion handle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cannot read input file {path:?}")]
    InputIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("intermediate file {path:?} failed")]
    IntermediateIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed record in {path:?} at line {line}")]
    Codec {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode record")]
    Encode {
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot prepare data directory {path:?}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write output file {path:?}")]
    OutputIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("{phase} task {index} ended without reporting completion")]
    TaskAborted { phase: Phase, index: usize },

    #[error("job {job} ended without delivering a result")]
    JobAborted { job: String },
}

use crate::types::JobId;
use std::{io, path::PathBuf, result};
use thiserror::Error;

/// A `JobConfig` that must not be started.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("command must be provided")]
    MissingCommand,
    #[error("cpu must be greater than 0")]
    InvalidCpu,
    #[error("memory bytes must be greater than 0")]
    InvalidMemBytes,
    #[error("io bytes per second must be greater than 0")]
    InvalidIoBytesPerSecond,
}

#[derive(Error, Debug)]
pub enum CgroupError {
    #[error("cgroup {path} already exists")]
    AlreadyExists { path: PathBuf },
    #[error("failed to create cgroup {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {value:?} to {path}: {source}")]
    Control {
        path: PathBuf,
        value: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to open {path} to attach the job process: {source}")]
    Attach {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove cgroup {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid job config: {0}")]
    Validation(#[from] ValidationError),
    #[error("failed to set up job isolation: {0}")]
    Setup(#[from] CgroupError),
    #[error("failed to launch job process: {0}")]
    Spawn(#[source] io::Error),
    #[error("job already started")]
    AlreadyStarted,
    #[error("job already stopped")]
    AlreadyStopped,
    #[error("job not started")]
    NotStarted,
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("not authorized to access job {0}")]
    NotAuthorized(JobId),
}

/// A job that was registered but could not be started.
///
/// The job stays registered, so its id can still be used to query the failure through `status`.
#[derive(Error, Debug)]
#[error("job {job_id} failed to start: {source}")]
pub struct CreateError {
    pub job_id: JobId,
    #[source]
    pub source: JobError,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputError {
    #[error("cannot write to closed output")]
    Closed,
    #[error("offset {offset} is past the end of the output ({len} bytes)")]
    OffsetOutOfBounds { offset: usize, len: usize },
    #[error("end of output")]
    EndOfStream,
    #[error("output reader is closed")]
    ReaderClosed,
    #[error("output reader has no buffer to read from")]
    BufferMissing,
}

pub type Result<T> = result::Result<T, JobError>;

//! Run commands as jobs: isolated from the host, resource limited, with output that any number of
//! readers can follow from the first byte.
pub mod config;
pub mod error;
pub mod isolation;
pub mod job;
pub mod output;
pub mod registry;
pub mod types;

pub use config::{JobConfig, WorkerConfig, STOP_GRACE_PERIOD};
pub use error::{CgroupError, CreateError, JobError, OutputError, ValidationError};
pub use isolation::{CgroupConfig, CgroupManager, Isolation};
pub use job::{Job, JobState, JobStatus};
pub use output::{OutputBuffer, OutputReader, STREAM_CHUNK_SIZE};
pub use registry::{AuthorizationPolicy, JobRegistry};

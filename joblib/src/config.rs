use crate::error::ValidationError;
use crate::registry::AuthorizationPolicy;
use crate::types::{Args, Program};
use std::time::Duration;

/// How long `Job::stop` waits after SIGTERM before killing the job's process group.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Everything needed to launch one job. Immutable once the job is created.
#[derive(Clone, Debug, PartialEq)]
pub struct JobConfig {
    pub command: Program,
    pub args: Args,
    /// Fraction of a CPU core, e.g. `0.5` for half a core.
    pub cpu: f64,
    /// Memory ceiling in bytes.
    pub mem_bytes: i64,
    /// Read and write ceiling on the root device, in bytes per second.
    pub io_bytes_per_second: i64,
    /// `MAJ:MIN` of the device the io limit applies to. Falls back to the worker default.
    pub root_device: Option<String>,
}

impl JobConfig {
    pub fn new(command: impl Into<Program>, args: Args) -> Self {
        Self {
            command: command.into(),
            args,
            cpu: 0.5,
            mem_bytes: 1_000_000_000,
            io_bytes_per_second: 100_000_000,
            root_device: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.command.is_empty() {
            return Err(ValidationError::MissingCommand);
        }
        // NaN fails this comparison too
        if !(self.cpu > 0.0 && self.cpu.is_finite()) {
            return Err(ValidationError::InvalidCpu);
        }
        if self.mem_bytes <= 0 {
            return Err(ValidationError::InvalidMemBytes);
        }
        if self.io_bytes_per_second <= 0 {
            return Err(ValidationError::InvalidIoBytesPerSecond);
        }
        Ok(())
    }
}

/// Settings shared by every job a `JobRegistry` creates.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub stop_grace_period: Duration,
    pub authorization: AuthorizationPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stop_grace_period: STOP_GRACE_PERIOD,
            authorization: AuthorizationPolicy::default(),
        }
    }
}

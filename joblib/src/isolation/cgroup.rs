use crate::config::JobConfig;
use crate::error::CgroupError;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Length of one CPU accounting period, in microseconds.
pub const CPU_PERIOD: u64 = 100_000;
/// Smallest quota the kernel accepts for `cpu.max`.
const MIN_CPU_QUOTA: u64 = 1_000;

const PROCS_FILE: &str = "cgroup.procs";
const SUBTREE_CONTROL_FILE: &str = "cgroup.subtree_control";
const DELETE_RETRIES: u32 = 50;
const DELETE_RETRY_DELAY: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CgroupConfig {
    /// Mount point of the cgroup v2 hierarchy. Job groups are created directly beneath it.
    pub root: PathBuf,
    /// `MAJ:MIN` used for io limits when a job doesn't name its own device.
    pub default_device: Option<String>,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys/fs/cgroup"),
            default_device: None,
        }
    }
}

/// A resource controller interface file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Controller {
    CpuMax,
    MemoryMax,
    IoMax,
}

impl Controller {
    pub fn file_name(self) -> &'static str {
        match self {
            Controller::CpuMax => "cpu.max",
            Controller::MemoryMax => "memory.max",
            Controller::IoMax => "io.max",
        }
    }
}

/// Creates, configures and removes one cgroup v2 group per job.
#[derive(Clone, Debug)]
pub struct CgroupManager {
    config: CgroupConfig,
}

impl CgroupManager {
    pub fn new(config: CgroupConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn group_path(&self, name: &str) -> PathBuf {
        self.config.root.join(name)
    }

    /// Best-effort delegation of the cpu, memory and io controllers to child groups.
    ///
    /// Each controller is enabled on its own so one unavailable controller doesn't block the others.
    pub fn enable_controllers(&self) {
        let path = self.config.root.join(SUBTREE_CONTROL_FILE);
        for controller in ["+cpu", "+memory", "+io"] {
            match fs::write(&path, controller) {
                Ok(()) => debug!(path = %path.display(), controller, "enabled cgroup controller"),
                Err(err) => warn!(
                    path = %path.display(),
                    controller,
                    error = %err,
                    "could not enable cgroup controller"
                ),
            }
        }
    }

    pub fn create_cgroup(&self, name: &str) -> Result<PathBuf, CgroupError> {
        let path = self.group_path(name);
        match fs::create_dir(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "created cgroup");
                Ok(path)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(CgroupError::AlreadyExists { path })
            }
            Err(source) => Err(CgroupError::Create { path, source }),
        }
    }

    pub fn add_resource_control(
        &self,
        name: &str,
        controller: Controller,
        value: &str,
    ) -> Result<(), CgroupError> {
        let path = self.group_path(name).join(controller.file_name());
        fs::write(&path, value).map_err(|source| CgroupError::Control {
            path: path.clone(),
            value: value.to_owned(),
            source,
        })?;
        debug!(path = %path.display(), value, "set cgroup limit");
        Ok(())
    }

    /// Write the cpu, memory and io limits of `config` into the group.
    ///
    /// The io limit needs a device. Without one, or if the kernel rejects it, the job runs without an io limit.
    pub fn apply_limits(&self, name: &str, config: &JobConfig) -> Result<(), CgroupError> {
        self.add_resource_control(name, Controller::CpuMax, &cpu_max(config.cpu))?;
        self.add_resource_control(
            name,
            Controller::MemoryMax,
            &config.mem_bytes.to_string(),
        )?;

        let device = config
            .root_device
            .as_deref()
            .or(self.config.default_device.as_deref());
        match device {
            Some(device) => {
                let value = io_max(device, config.io_bytes_per_second);
                if let Err(err) = self.add_resource_control(name, Controller::IoMax, &value) {
                    warn!(cgroup = name, error = %err, "io limit not applied");
                }
            }
            None => debug!(cgroup = name, "no root device configured, skipping io limit"),
        }
        Ok(())
    }

    /// Open the group's `cgroup.procs` so a process can move itself in before it execs.
    pub fn attach_process(&self, name: &str) -> Result<File, CgroupError> {
        let path = self.group_path(name).join(PROCS_FILE);
        OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|source| CgroupError::Attach { path, source })
    }

    /// Remove the group, retrying while the kernel still reports it busy.
    ///
    /// A group that is already gone counts as deleted. This blocks, so async callers should move it
    /// onto a blocking thread.
    pub fn delete_cgroup(&self, name: &str) -> Result<(), CgroupError> {
        let path = self.group_path(name);
        let mut attempt = 0;
        loop {
            match fs::remove_dir(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed cgroup");
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    info!(path = %path.display(), "cgroup already removed");
                    return Ok(());
                }
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) && attempt < DELETE_RETRIES => {
                    attempt += 1;
                    thread::sleep(DELETE_RETRY_DELAY);
                }
                Err(source) => return Err(CgroupError::Delete { path, source }),
            }
        }
    }
}

fn cpu_max(cpu: f64) -> String {
    let quota = ((cpu * CPU_PERIOD as f64) as u64).max(MIN_CPU_QUOTA);
    format!("{} {}", quota, CPU_PERIOD)
}

fn io_max(device: &str, bytes_per_second: i64) -> String {
    format!("{} rbps={} wbps={}", device, bytes_per_second, bytes_per_second)
}

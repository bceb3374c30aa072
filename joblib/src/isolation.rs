//! Namespaces and cgroup limits around a job's process tree.
mod cgroup;
mod namespaces;

pub use cgroup::{CgroupConfig, CgroupManager, Controller, CPU_PERIOD};
pub use namespaces::{mount_private_proc, unmount_private_proc};

use crate::config::JobConfig;
use crate::error::CgroupError;
use crate::types::JobId;
use namespaces::NamespaceLauncher;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, error};

/// How job processes are confined.
#[derive(Clone, Debug)]
pub enum Isolation {
    /// Own cgroup with cpu, memory and io limits, plus fresh user, mount, PID, network, UTS and IPC namespaces.
    Linux(CgroupManager),
    /// Own session only. For hosts without cgroup delegation.
    Unconfined,
}

impl Isolation {
    pub fn linux(config: CgroupConfig) -> Self {
        Isolation::Linux(CgroupManager::new(config))
    }

    pub fn unconfined() -> Self {
        Isolation::Unconfined
    }

    /// Set up the OS resources for `job_id` and arrange for `command` to enter them when spawned.
    ///
    /// On error nothing is left behind. On success the returned `Sandbox` owns the resources.
    pub fn prepare(
        &self,
        job_id: JobId,
        config: &JobConfig,
        command: &mut Command,
    ) -> Result<Sandbox, CgroupError> {
        let manager = match self {
            Isolation::Linux(manager) => manager,
            Isolation::Unconfined => {
                // SAFETY: setsid is async-signal-safe.
                unsafe { command.pre_exec(namespaces::enter_session) };
                return Ok(Sandbox::empty());
            }
        };

        let name = job_id.to_string();
        manager.create_cgroup(&name)?;
        let sandbox = Sandbox::cgroup(manager.clone(), name.clone());

        manager.apply_limits(&name, config)?;
        let cgroup_procs = manager.attach_process(&name)?;

        let launcher = NamespaceLauncher::new(cgroup_procs, job_id.to_simple().to_string());
        // SAFETY: the launcher only makes raw syscalls over data prepared here, before the fork.
        unsafe { command.pre_exec(move || launcher.enter()) };

        debug!(job_id = %job_id, cgroup = %name, "prepared job isolation");
        Ok(sandbox)
    }
}

/// OS resources held for one job, released exactly once.
///
/// Dropping an unreleased sandbox releases it, so an early return during setup rolls back by itself.
#[derive(Debug)]
pub struct Sandbox {
    cgroup: Option<(CgroupManager, String)>,
    released: AtomicBool,
}

impl Sandbox {
    fn empty() -> Self {
        Self {
            cgroup: None,
            released: AtomicBool::new(false),
        }
    }

    fn cgroup(manager: CgroupManager, name: String) -> Self {
        Self {
            cgroup: Some((manager, name)),
            released: AtomicBool::new(false),
        }
    }

    /// Name of the job's cgroup, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.cgroup.as_ref().map(|(_, name)| name.as_str())
    }

    /// Remove the job's cgroup. Calls after the first do nothing. Blocks while the group drains.
    pub fn release(&self) -> Result<(), CgroupError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match &self.cgroup {
            Some((manager, name)) => manager.delete_cgroup(name),
            None => Ok(()),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            error!(error = %err, "failed to release job sandbox");
        }
    }
}

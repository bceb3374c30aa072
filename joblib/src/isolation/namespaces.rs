//! Runs between `fork` and `exec` of a job process to place it in fresh namespaces.
//!
//! Everything here executes in a forked child of a multi-threaded process, so the launcher only
//! makes raw syscalls over data prepared before the fork. No allocation, no locks, no logging.

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, fork, sethostname, setsid, ForkResult, Gid, Pid, Uid};
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

const PROC_MOUNT: &str = "/proc";
const MAX_CLOSED_FD: libc::c_long = 65_536;

/// State carried into the child to enter a job's namespaces and cgroup.
#[derive(Debug)]
pub struct NamespaceLauncher {
    cgroup_procs: File,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
    hostname: String,
}

impl NamespaceLauncher {
    /// `cgroup_procs` is the job group's `cgroup.procs`, opened for writing.
    pub fn new(cgroup_procs: File, hostname: String) -> Self {
        Self {
            cgroup_procs,
            uid_map: id_map(Uid::current().as_raw()),
            gid_map: id_map(Gid::current().as_raw()),
            hostname,
        }
    }

    /// Called in the forked child. Returns only in the process that should `exec` the job command.
    ///
    /// The calling process moves into the job's cgroup and a new session, unshares the namespaces,
    /// then forks once more: the new PID namespace only applies to children. The grandchild becomes
    /// PID 1 of the namespace and returns here; the intermediate process stays behind as its supervisor
    /// and never returns.
    pub fn enter(&self) -> io::Result<()> {
        setsid().map_err(io::Error::from)?;
        // "0" means the writing process itself
        write_all(self.cgroup_procs.as_raw_fd(), b"0")?;

        unshare(CloneFlags::CLONE_NEWUSER).map_err(io::Error::from)?;
        write_file("/proc/self/setgroups", b"deny")?;
        write_file("/proc/self/uid_map", &self.uid_map)?;
        write_file("/proc/self/gid_map", &self.gid_map)?;

        unshare(
            CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWNET
                | CloneFlags::CLONE_NEWUTS
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWPID,
        )
        .map_err(io::Error::from)?;

        // SAFETY: the child only runs async-signal-safe syscalls before exec or _exit.
        match unsafe { fork() }.map_err(io::Error::from)? {
            ForkResult::Parent { child } => supervise_namespace_init(child),
            ForkResult::Child => self.init_namespace(),
        }
    }

    /// Runs as PID 1 of the new namespace, just before exec.
    fn init_namespace(&self) -> io::Result<()> {
        // SAFETY: prctl with PR_SET_PDEATHSIG only reads its integer arguments.
        if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) } == -1 {
            return Err(io::Error::last_os_error());
        }

        mount_private_proc(PROC_MOUNT)?;
        if let Err(err) = sethostname(&self.hostname) {
            let _ = unmount_private_proc(PROC_MOUNT);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Enter a new session without any namespaces. Used when isolation is disabled.
pub fn enter_session() -> io::Result<()> {
    setsid().map(drop).map_err(io::Error::from)
}

/// Detach the mount tree from the host and mount a `proc` that only shows this PID namespace.
pub fn mount_private_proc(target: &str) -> io::Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )?;
    Ok(())
}

pub fn unmount_private_proc(target: &str) -> io::Result<()> {
    umount2(target, MntFlags::MNT_DETACH)?;
    Ok(())
}

/// Wait for the namespace's PID 1 and exit with its status.
///
/// A fatal signal is reported the way shells do, as `128 + signal`.
fn supervise_namespace_init(init: Pid) -> ! {
    close_inherited_fds();
    for terminate in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP] {
        // SAFETY: SIG_IGN installs no handler code.
        let _ = unsafe { signal(terminate, SigHandler::SigIgn) };
    }

    loop {
        match waitpid(init, None) {
            Ok(WaitStatus::Exited(_, code)) => exit(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => exit(128 + sig as i32),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => exit(1),
        }
    }
}

fn exit(code: i32) -> ! {
    // SAFETY: _exit skips atexit handlers and stdio flushing, which belong to the parent.
    unsafe { libc::_exit(code) }
}

/// Close everything but stdio so the parent sees `exec` of the grandchild as the end of the spawn.
fn close_inherited_fds() {
    // SAFETY: sysconf has no side effects.
    let max = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n > 0 => n.min(MAX_CLOSED_FD),
        _ => MAX_CLOSED_FD,
    };
    for fd in 3..max as RawFd {
        let _ = unistd::close(fd);
    }
}

fn write_file(path: &str, contents: &[u8]) -> io::Result<()> {
    let fd = open(path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    let written = write_all(fd, contents);
    let _ = unistd::close(fd);
    written
}

fn write_all(fd: RawFd, mut contents: &[u8]) -> io::Result<()> {
    while !contents.is_empty() {
        match unistd::write(fd, contents) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => contents = &contents[n..],
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Map root inside the namespace onto `id` outside it.
fn id_map(id: u32) -> Vec<u8> {
    format!("0 {} 1", id).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_namespace_root_to_the_current_user() {
        assert_eq!(id_map(1000), b"0 1000 1");
        assert_eq!(id_map(0), b"0 0 1");
    }

    #[test]
    fn write_all_writes_every_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map");
        std::fs::write(&path, "").unwrap();

        let path = path.to_str().unwrap();
        write_file(path, b"0 1000 1").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"0 1000 1");
    }

    #[test]
    fn write_file_needs_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        assert!(write_file(path.to_str().unwrap(), b"deny").is_err());
    }
}

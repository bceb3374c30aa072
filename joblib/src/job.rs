mod state;

pub use state::{JobState, JobStatus, Transition};

use crate::config::{JobConfig, STOP_GRACE_PERIOD};
use crate::error::{JobError, Result};
use crate::isolation::{Isolation, Sandbox};
use crate::output::{OutputBuffer, OutputReader};
use crate::types::JobId;
use bytes::BytesMut;
use futures::future;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long the reaper waits for output still buffered in the pipes once the process has exited.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One supervised execution of a command.
///
/// `Job` is a cheap handle: clones share the same process, status and output.
#[derive(Clone, Debug)]
pub struct Job {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    id: JobId,
    config: JobConfig,
    isolation: Isolation,
    grace_period: Duration,
    output: Arc<OutputBuffer>,
    status: Mutex<StatusFields>,
    /// Flipped to `true` by the reaper once the job is fully cleaned up.
    finished: watch::Sender<bool>,
}

#[derive(Debug)]
struct StatusFields {
    state: JobState,
    exit_code: i32,
    faults: Vec<String>,
    /// Set while a `start` call is setting up and spawning the process.
    launching: bool,
    /// The job's process group. Kept until the reaper has drained the output, so processes the job left
    /// behind can still be killed after it exits.
    pgid: Option<Pid>,
}

impl StatusFields {
    fn snapshot(&self) -> JobStatus {
        JobStatus {
            state: self.state,
            exit_code: self.exit_code,
            exit_reason: self.faults.join("; "),
        }
    }
}

impl Job {
    pub fn new(config: JobConfig, isolation: Isolation) -> Self {
        Self::with_stop_grace_period(config, isolation, STOP_GRACE_PERIOD)
    }

    /// Like `new`, but `stop` waits `grace_period` after SIGTERM before killing the job.
    pub fn with_stop_grace_period(
        config: JobConfig,
        isolation: Isolation,
        grace_period: Duration,
    ) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                config,
                isolation,
                grace_period,
                output: Arc::new(OutputBuffer::new()),
                status: Mutex::new(StatusFields {
                    state: JobState::NotStarted,
                    exit_code: -1,
                    faults: Vec::new(),
                    launching: false,
                    pgid: None,
                }),
                finished,
            }),
        }
    }

    pub fn id(&self) -> JobId {
        self.shared.id
    }

    pub fn config(&self) -> &JobConfig {
        &self.shared.config
    }

    /// Launch the process and return as soon as it runs.
    ///
    /// Cgroup setup and the fork run on the blocking pool and finish even if this future is dropped.
    /// If anything fails the job stays `NotStarted`, every OS resource set up so far is released, and
    /// the failure is recorded in the job's `exit_reason`.
    pub async fn start(&self) -> Result<()> {
        if let Err(err) = self.shared.config.validate() {
            self.lock_status().faults.push(err.to_string());
            return Err(err.into());
        }

        let job = self.clone();
        task::spawn_blocking(move || job.launch())
            .await
            .unwrap_or_else(|err| Err(JobError::Spawn(io::Error::new(io::ErrorKind::Other, err))))
    }

    pub fn status(&self) -> JobStatus {
        self.lock_status().snapshot()
    }

    /// A new reader over the job's combined stdout and stderr, starting at the first byte.
    pub fn stream(&self) -> OutputReader {
        OutputReader::new(&self.shared.output)
    }

    /// Send SIGTERM to the job's process group, escalating to SIGKILL after the grace period.
    ///
    /// Resolves once the job is fully cleaned up, with its final status.
    pub async fn stop(&self) -> Result<JobStatus> {
        self.terminate()?;
        info!(job_id = %self.shared.id, grace_period = ?self.shared.grace_period, "stopping job");

        if time::timeout(self.shared.grace_period, self.wait_finished())
            .await
            .is_err()
        {
            self.kill();
            self.wait_finished().await;
        }
        Ok(self.status())
    }

    /// Resolve once a started job is fully cleaned up. Returns immediately for a job that never started.
    pub async fn wait(&self) -> JobStatus {
        let started = self.lock_status().state != JobState::NotStarted;
        if started {
            self.wait_finished().await;
        }
        self.status()
    }

    /// Claim the job, set up its isolation and spawn it. The status lock is only held around the claim
    /// and the final bookkeeping, so `status` never waits on cgroupfs or fork.
    fn launch(self) -> Result<()> {
        {
            let mut status = self.lock_status();
            if status.state != JobState::NotStarted || status.launching {
                return Err(JobError::AlreadyStarted);
            }
            status.launching = true;
        }

        let spawned = self.spawn_process();
        let mut status = self.lock_status();
        status.launching = false;
        let (mut child, sandbox) = match spawned {
            Ok(spawned) => spawned,
            Err((err, faults)) => {
                status.faults.extend(faults);
                return Err(err);
            }
        };

        // the process leads its own group, so its pid is also the group id
        status.pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        let pumps: Vec<_> = [
            child.stdout.take().map(|out| self.pump(out)),
            child.stderr.take().map(|err| self.pump(err)),
        ]
        .into_iter()
        .flatten()
        .collect();

        if let Some(next) = status.state.apply(Transition::Launched) {
            status.state = next;
        }
        drop(status);

        info!(
            job_id = %self.shared.id,
            pid = ?child.id(),
            cgroup = ?sandbox.name(),
            command = %self.shared.config.command,
            "job started"
        );
        tokio::spawn(self.reap(child, pumps, sandbox));
        Ok(())
    }

    /// On failure, returns the error together with the faults to record for it.
    fn spawn_process(&self) -> std::result::Result<(Child, Sandbox), (JobError, Vec<String>)> {
        let shared = &self.shared;
        let mut command = Command::new(&shared.config.command);
        command
            .args(&shared.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let sandbox = match shared
            .isolation
            .prepare(shared.id, &shared.config, &mut command)
        {
            Ok(sandbox) => sandbox,
            Err(err) => {
                error!(job_id = %shared.id, error = %err, "failed to set up job isolation");
                let fault = err.to_string();
                return Err((err.into(), vec![fault]));
            }
        };

        match command.spawn() {
            Ok(child) => Ok((child, sandbox)),
            Err(err) => {
                error!(job_id = %shared.id, command = %shared.config.command, error = %err, "failed to launch job");
                let mut faults = Vec::new();
                if let Err(release_err) = sandbox.release() {
                    faults.push(release_err.to_string());
                }
                faults.push(format!("failed to launch {}: {}", shared.config.command, err));
                Err((JobError::Spawn(err), faults))
            }
        }
    }

    fn terminate(&self) -> Result<()> {
        let status = self.lock_status();
        match status.state {
            JobState::NotStarted => Err(JobError::NotStarted),
            JobState::Completed | JobState::Terminated => Err(JobError::AlreadyStopped),
            JobState::Running => {
                if let Some(pgid) = status.pgid {
                    signal_group(self.shared.id, pgid, Signal::SIGTERM);
                }
                Ok(())
            }
        }
    }

    /// SIGKILL the whole process group once the grace period is over.
    fn kill(&self) {
        let mut status = self.lock_status();
        // the process may have exited between the timeout and taking the lock
        if let Some(next) = status.state.apply(Transition::Killed) {
            warn!(job_id = %self.shared.id, "job ignored SIGTERM, killing it");
            status.state = next;
            status.faults.push(format!(
                "still running {:?} after SIGTERM",
                self.shared.grace_period
            ));
        } else if status.pgid.is_some() {
            warn!(job_id = %self.shared.id, "job exited but left processes holding its output, killing them");
        }
        if let Some(pgid) = status.pgid {
            signal_group(self.shared.id, pgid, Signal::SIGKILL);
        }
    }

    async fn wait_finished(&self) {
        let mut finished = self.shared.finished.subscribe();
        // the sender lives in `shared`, so it can't be dropped while we wait
        let _ = finished.wait_for(|finished| *finished).await;
    }

    /// Copy everything read from `source` into the job's output.
    fn pump<R>(&self, mut source: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let job_id = self.shared.id;
        let output = self.shared.output.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                match source.read_buf(&mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if let Err(err) = output.write(&buf) {
                            warn!(job_id = %job_id, error = %err, "dropping job output");
                            break;
                        }
                        buf.clear();
                    }
                    Err(err) => {
                        warn!(job_id = %job_id, error = %err, "failed to read job output");
                        break;
                    }
                }
            }
        })
    }

    /// Supervise the process until it exits, then record the outcome and release everything it held.
    async fn reap(self, mut child: Child, mut pumps: Vec<JoinHandle<()>>, sandbox: Sandbox) {
        let job_id = self.shared.id;
        let exit = child.wait().await;
        {
            let mut status = self.lock_status();
            record_exit(&mut status, exit);
            if let Some(next) = status.state.apply(Transition::Exited) {
                status.state = next;
            }
            info!(job_id = %job_id, state = %status.state, exit_code = status.exit_code, "job exited");
        }

        let drained = time::timeout(PUMP_DRAIN_TIMEOUT, future::join_all(pumps.iter_mut())).await;
        if drained.is_err() {
            // a descendant still holds the pipe open
            warn!(job_id = %job_id, "output still open after exit, closing it");
            for pump in &pumps {
                pump.abort();
            }
        }

        {
            let mut status = self.lock_status();
            // the group id may be reused once its last member is gone
            status.pgid = None;
            if let Err(err) = self.shared.output.close() {
                status.faults.push(format!("error closing output: {}", err));
            }
        }
        debug!(job_id = %job_id, output_bytes = self.shared.output.len(), "job output closed");

        let released = task::spawn_blocking(move || sandbox.release()).await;
        let fault = match released {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("error releasing cgroup: {}", err)),
            Err(err) => Some(format!("error releasing cgroup: {}", err)),
        };
        if let Some(fault) = fault {
            error!(job_id = %job_id, fault = %fault, "job cleanup failed");
            self.lock_status().faults.push(fault);
        }

        self.shared.finished.send_replace(true);
        debug!(job_id = %job_id, "job finished");
    }

    fn lock_status(&self) -> MutexGuard<'_, StatusFields> {
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn record_exit(status: &mut StatusFields, exit: io::Result<ExitStatus>) {
    match exit {
        Ok(exit) => {
            if let Some(code) = exit.code() {
                status.exit_code = code;
                if code != 0 {
                    status.faults.push(format!("exit status {}", code));
                }
            } else if let Some(signal) = exit.signal() {
                let name = Signal::try_from(signal)
                    .map(|signal| signal.as_str().to_owned())
                    .unwrap_or_else(|_| signal.to_string());
                status.faults.push(format!("terminated by signal {}", name));
            }
        }
        Err(err) => status
            .faults
            .push(format!("error waiting for process: {}", err)),
    }
}

fn signal_group(job_id: JobId, pgid: Pid, signal: Signal) {
    match killpg(pgid, signal) {
        Ok(()) => debug!(job_id = %job_id, signal = signal.as_str(), "signalled job"),
        Err(err) => warn!(job_id = %job_id, signal = signal.as_str(), error = %err, "failed to signal job"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::isolation::CgroupConfig;
    use std::time::Instant;

    fn shell(script: &str) -> JobConfig {
        JobConfig::new("sh", vec!["-c".into(), script.into()])
    }

    fn job(script: &str) -> Job {
        Job::new(shell(script), Isolation::unconfined())
    }

    async fn output(job: &Job) -> String {
        String::from_utf8(job.stream().read_to_end().await.unwrap()).unwrap()
    }

    async fn read_until(job: &Job, done: impl Fn(&str) -> bool) -> String {
        let mut reader = job.stream();
        let mut buf = [0u8; 64];
        let mut seen = String::new();
        while !done(&seen) {
            let n = reader.read(&mut buf).await.unwrap();
            assert_ne!(n, 0, "job exited early: {:?}", seen);
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        seen
    }

    /// Zombies count as dead: nothing may reap them in a test environment.
    fn is_alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => match stat.rsplit(')').next() {
                Some(rest) => !rest.trim_start().starts_with('Z'),
                None => false,
            },
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn completed_job_keeps_its_output() {
        let job = job("echo hello");
        job.start().await.unwrap();

        let status = job.wait().await;
        assert_eq!(
            status,
            JobStatus {
                state: JobState::Completed,
                exit_code: 0,
                exit_reason: String::new(),
            }
        );
        assert_eq!(output(&job).await, "hello\n");
    }

    #[tokio::test]
    async fn running_job_has_no_exit_code() {
        let job = job("sleep 5");
        job.start().await.unwrap();

        let status = job.status();
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.exit_code, -1);

        let status = job.stop().await.unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.exit_code, -1);
        assert_eq!(status.exit_reason, "terminated by signal SIGTERM");
    }

    #[tokio::test]
    async fn non_zero_exit_is_recorded() {
        let job = job("exit 3");
        job.start().await.unwrap();

        let status = job.wait().await;
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.exit_code, 3);
        assert_eq!(status.exit_reason, "exit status 3");
    }

    #[tokio::test]
    async fn stderr_is_captured_with_stdout() {
        let job = job("echo out; echo err >&2");
        job.start().await.unwrap();
        job.wait().await;

        let output = output(&job).await;
        assert!(output.contains("out\n"), "{:?}", output);
        assert!(output.contains("err\n"), "{:?}", output);
    }

    #[tokio::test]
    async fn stopped_job_cannot_be_stopped_again() {
        let job = job("sleep 5");
        job.start().await.unwrap();
        job.stop().await.unwrap();

        assert!(matches!(job.stop().await, Err(JobError::AlreadyStopped)));

        let finished = self::job("true");
        finished.start().await.unwrap();
        finished.wait().await;
        assert!(matches!(finished.stop().await, Err(JobError::AlreadyStopped)));
    }

    #[tokio::test]
    async fn stop_kills_a_job_that_ignores_sigterm() {
        let job = Job::with_stop_grace_period(
            shell("trap '' TERM; echo ready; while true; do sleep 0.1; done"),
            Isolation::unconfined(),
            Duration::from_millis(200),
        );
        job.start().await.unwrap();

        // don't stop before the trap is installed
        read_until(&job, |seen| seen.contains("ready")).await;

        let status = time::timeout(Duration::from_secs(5), job.stop())
            .await
            .expect("stop did not escalate")
            .unwrap();
        assert_eq!(status.state, JobState::Terminated);
        assert_eq!(status.exit_code, -1);
        assert!(status.exit_reason.contains("SIGKILL"), "{}", status.exit_reason);
        assert!(job.stream().read_to_end().await.is_ok());
    }

    #[tokio::test]
    async fn stop_kills_processes_left_behind_by_the_job() {
        let job = Job::with_stop_grace_period(
            shell(
                "trap 'exit 0' TERM; \
                 (trap '' TERM; echo ready; exec sleep 30) & \
                 echo \"pid $!\"; \
                 while true; do sleep 0.05; done",
            ),
            Isolation::unconfined(),
            Duration::from_millis(300),
        );
        job.start().await.unwrap();

        let seen = read_until(&job, |seen| {
            seen.contains("ready\n") && seen.contains("pid ") && seen.ends_with('\n')
        })
        .await;
        let orphan: i32 = seen
            .lines()
            .find_map(|line| line.strip_prefix("pid "))
            .unwrap()
            .parse()
            .unwrap();

        let stopping = Instant::now();
        let status = time::timeout(Duration::from_secs(5), job.stop())
            .await
            .expect("stop did not return")
            .unwrap();
        // the shell itself honoured SIGTERM, only the straggler needed SIGKILL
        assert_eq!(
            status,
            JobStatus {
                state: JobState::Completed,
                exit_code: 0,
                exit_reason: String::new(),
            }
        );
        assert!(stopping.elapsed() < PUMP_DRAIN_TIMEOUT, "{:?}", stopping.elapsed());

        let deadline = Instant::now() + Duration::from_secs(1);
        while is_alive(orphan) && Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!is_alive(orphan), "pid {} survived stop", orphan);
    }

    #[tokio::test]
    async fn exit_is_visible_while_output_is_still_open() {
        let job = job("sleep 30 & exit 3");
        job.start().await.unwrap();
        let pgid = job.lock_status().pgid.unwrap();

        // the background sleep keeps the pipes open, so the output can't close yet
        let started = Instant::now();
        let status = loop {
            let status = job.status();
            if status.state != JobState::Running {
                break status;
            }
            assert!(started.elapsed() < PUMP_DRAIN_TIMEOUT / 2, "exit not recorded");
            time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.exit_code, 3);
        assert!(matches!(job.stop().await, Err(JobError::AlreadyStopped)));

        let _ = killpg(pgid, Signal::SIGKILL);
        let status = job.wait().await;
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.exit_code, 3);
        assert_eq!(status.exit_reason, "exit status 3");
    }

    #[tokio::test]
    async fn concurrent_starts_launch_once() {
        let job = job("sleep 5");
        let (first, second) = tokio::join!(job.start(), job.start());

        let launched = [&first, &second].iter().filter(|res| res.is_ok()).count();
        assert_eq!(launched, 1, "{:?} {:?}", first, second);
        assert!(matches!(
            first.err().or(second.err()),
            Some(JobError::AlreadyStarted)
        ));
        assert_eq!(job.status().state, JobState::Running);
        job.stop().await.unwrap();
    }

    #[tokio::test]
    async fn job_starts_only_once() {
        let job = job("sleep 5");
        job.start().await.unwrap();
        assert!(matches!(job.start().await, Err(JobError::AlreadyStarted)));

        job.stop().await.unwrap();
        assert!(matches!(job.start().await, Err(JobError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_launch() {
        let job = Job::new(JobConfig::new("", vec![]), Isolation::unconfined());
        assert!(matches!(
            job.start().await,
            Err(JobError::Validation(ValidationError::MissingCommand))
        ));

        let status = job.wait().await;
        assert_eq!(status.state, JobState::NotStarted);
        assert_eq!(status.exit_code, -1);
        assert_eq!(status.exit_reason, "command must be provided");
    }

    #[tokio::test]
    async fn launch_failure_leaves_job_not_started() {
        let job = Job::new(
            JobConfig::new("/nonexistent/command", vec![]),
            Isolation::unconfined(),
        );
        assert!(matches!(job.start().await, Err(JobError::Spawn(_))));

        let status = job.status();
        assert_eq!(status.state, JobState::NotStarted);
        assert!(status.exit_reason.contains("/nonexistent/command"));
    }

    #[tokio::test]
    async fn stop_before_start_is_rejected() {
        let job = job("true");
        assert!(matches!(job.stop().await, Err(JobError::NotStarted)));
    }

    #[tokio::test]
    async fn every_stream_replays_the_whole_output() {
        let job = job("echo one; sleep 0.1; echo two");
        let early = job.stream();
        job.start().await.unwrap();
        job.wait().await;

        let late = job.stream();
        for mut reader in [early, late] {
            assert_eq!(reader.read_to_end().await.unwrap(), b"one\ntwo\n");
        }
    }

    fn isolated(script: &str) -> Job {
        Job::new(shell(script), Isolation::linux(CgroupConfig::default()))
    }

    #[tokio::test]
    #[ignore = "needs root and a cgroup v2 hierarchy"]
    async fn isolated_job_is_pid_one() {
        let job = isolated("echo $$");
        job.start().await.unwrap();
        assert_eq!(job.wait().await.exit_code, 0);
        assert_eq!(output(&job).await, "1\n");
    }

    #[tokio::test]
    #[ignore = "needs root and a cgroup v2 hierarchy"]
    async fn isolated_job_sees_only_its_own_processes() {
        let job = isolated("ls /proc | grep -c '^[0-9]'");
        job.start().await.unwrap();
        job.wait().await;
        // the shell, ls and grep
        assert!(output(&job).await.trim().parse::<u32>().unwrap() <= 3);
    }

    #[tokio::test]
    #[ignore = "needs root and a cgroup v2 hierarchy"]
    async fn isolated_job_has_no_network() {
        let job = isolated("ping -c 1 -W 1 8.8.8.8");
        job.start().await.unwrap();
        assert_ne!(job.wait().await.exit_code, 0);
    }

    #[tokio::test]
    #[ignore = "needs root and a cgroup v2 hierarchy"]
    async fn isolated_job_has_its_own_hostname() {
        let job = isolated("hostname");
        job.start().await.unwrap();
        job.wait().await;
        assert_eq!(
            output(&job).await.trim(),
            job.id().to_simple().to_string()
        );
    }

    #[tokio::test]
    #[ignore = "needs root and a cgroup v2 hierarchy"]
    async fn isolated_job_runs_in_its_own_cgroup() {
        let job = isolated("cat /proc/self/cgroup");
        job.start().await.unwrap();
        let cgroup = CgroupConfig::default().root.join(job.id().to_string());
        assert_eq!(job.wait().await.exit_code, 0);

        assert!(output(&job).await.contains(&job.id().to_string()));
        assert!(!cgroup.exists());
    }
}

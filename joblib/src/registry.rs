use crate::config::{JobConfig, WorkerConfig};
use crate::error::{CreateError, JobError, Result};
use crate::isolation::Isolation;
use crate::job::{Job, JobStatus};
use crate::output::OutputReader;
use crate::types::{Identity, JobId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// What a caller learns about a job that belongs to someone else.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthorizationPolicy {
    /// Report `NotAuthorized`, confirming that the job exists.
    RevealExistence,
    /// Report `NotFound`, exactly as for an unknown id.
    #[default]
    HideExistence,
}

#[derive(Debug)]
struct Entry {
    owner: Identity,
    job: Job,
}

/// Every job created through this worker, each visible only to the identity that created it.
///
/// Jobs are never removed.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, Entry>>,
    isolation: Isolation,
    config: WorkerConfig,
}

impl JobRegistry {
    pub fn new(isolation: Isolation, config: WorkerConfig) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            isolation,
            config,
        }
    }

    /// Register a job for `owner` and start it.
    ///
    /// The job is registered even if it fails to start, so the id in the error can still be passed to `status`.
    pub async fn create(
        &self,
        owner: &str,
        config: JobConfig,
    ) -> std::result::Result<JobId, CreateError> {
        let job = Job::with_stop_grace_period(
            config,
            self.isolation.clone(),
            self.config.stop_grace_period,
        );
        let job_id = job.id();
        let jobs = {
            let mut jobs = self.lock_jobs();
            jobs.insert(
                job_id,
                Entry {
                    owner: owner.to_owned(),
                    job: job.clone(),
                },
            );
            jobs.len()
        };
        info!(job_id = %job_id, owner, command = %job.config().command, jobs, "job created");

        job.start()
            .await
            .map_err(|source| CreateError { job_id, source })?;
        Ok(job_id)
    }

    /// Look up `job_id` on behalf of `identity`.
    pub fn authorize(&self, job_id: JobId, identity: &str) -> Result<Job> {
        let jobs = self.lock_jobs();
        let entry = jobs.get(&job_id).ok_or(JobError::NotFound(job_id))?;
        if entry.owner != identity {
            // dont leak info unless configured to
            warn!(job_id = %job_id, identity, "rejected access to job owned by another identity");
            return Err(match self.config.authorization {
                AuthorizationPolicy::RevealExistence => JobError::NotAuthorized(job_id),
                AuthorizationPolicy::HideExistence => JobError::NotFound(job_id),
            });
        }
        Ok(entry.job.clone())
    }

    pub fn status(&self, job_id: JobId, identity: &str) -> Result<JobStatus> {
        Ok(self.authorize(job_id, identity)?.status())
    }

    pub fn stream(&self, job_id: JobId, identity: &str) -> Result<OutputReader> {
        Ok(self.authorize(job_id, identity)?.stream())
    }

    /// Stop the job, waiting out its grace period if needed. Other callers are not blocked meanwhile.
    pub async fn stop(&self, job_id: JobId, identity: &str) -> Result<JobStatus> {
        let job = self.authorize(job_id, identity)?;
        job.stop().await
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, Entry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use std::time::Duration;
    use uuid::Uuid;

    fn registry(authorization: AuthorizationPolicy) -> JobRegistry {
        JobRegistry::new(
            Isolation::unconfined(),
            WorkerConfig {
                stop_grace_period: Duration::from_secs(2),
                authorization,
            },
        )
    }

    fn shell(script: &str) -> JobConfig {
        JobConfig::new("sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn owner_can_use_their_job() {
        let registry = registry(AuthorizationPolicy::default());
        let job_id = registry.create("alice", shell("echo hi; sleep 5")).await.unwrap();

        assert_eq!(
            registry.status(job_id, "alice").unwrap().state,
            JobState::Running
        );

        let mut reader = registry.stream(job_id, "alice").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).await, Ok(3));
        assert_eq!(&buf, b"hi\n");

        let status = registry.stop(job_id, "alice").await.unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert!(matches!(
            registry.stop(job_id, "alice").await,
            Err(JobError::AlreadyStopped)
        ));
    }

    #[tokio::test]
    async fn other_identities_are_told_the_job_does_not_exist() {
        let registry = registry(AuthorizationPolicy::HideExistence);
        let job_id = registry.create("alice", shell("sleep 5")).await.unwrap();

        assert!(matches!(
            registry.status(job_id, "mallory"),
            Err(JobError::NotFound(id)) if id == job_id
        ));
        assert!(matches!(
            registry.stream(job_id, "mallory"),
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            registry.stop(job_id, "mallory").await,
            Err(JobError::NotFound(_))
        ));

        // and nothing happened to it
        assert_eq!(
            registry.status(job_id, "alice").unwrap().state,
            JobState::Running
        );
        registry.stop(job_id, "alice").await.unwrap();
    }

    #[tokio::test]
    async fn other_identities_can_be_told_they_are_not_authorized() {
        let registry = registry(AuthorizationPolicy::RevealExistence);
        let job_id = registry.create("alice", shell("true")).await.unwrap();

        assert!(matches!(
            registry.status(job_id, "mallory"),
            Err(JobError::NotAuthorized(id)) if id == job_id
        ));
        assert!(matches!(
            registry.stop(job_id, "mallory").await,
            Err(JobError::NotAuthorized(_))
        ));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let registry = registry(AuthorizationPolicy::RevealExistence);
        let job_id = Uuid::new_v4();
        assert!(matches!(
            registry.status(job_id, "alice"),
            Err(JobError::NotFound(id)) if id == job_id
        ));
    }

    #[tokio::test]
    async fn failed_start_stays_queryable() {
        let registry = registry(AuthorizationPolicy::default());
        let mut config = shell("true");
        config.mem_bytes = 0;

        let err = registry.create("alice", config).await.unwrap_err();
        assert!(matches!(err.source, JobError::Validation(_)));
        assert_eq!(registry.lock_jobs().len(), 1);

        let status = registry.status(err.job_id, "alice").unwrap();
        assert_eq!(status.state, JobState::NotStarted);
        assert_eq!(status.exit_reason, "memory bytes must be greater than 0");
    }

    #[tokio::test]
    async fn stop_does_not_block_other_callers() {
        let registry = std::sync::Arc::new(registry(AuthorizationPolicy::default()));
        let stubborn = registry
            .create("alice", shell("trap '' TERM; sleep 10"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopping = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.stop(stubborn, "alice").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the stop above is waiting out its grace period
        let other = registry.create("bob", shell("true")).await.unwrap();
        assert!(registry.status(other, "bob").is_ok());
        assert!(!stopping.is_finished());

        let status = stopping.await.unwrap().unwrap();
        assert_eq!(status.state, JobState::Terminated);
    }
}

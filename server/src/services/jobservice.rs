use crate::UserExtension;
use futures::Stream;
use joblib::types::{Identity, JobId};
use joblib::{
    CreateError, JobConfig, JobError, JobRegistry, JobState, JobStatus, STREAM_CHUNK_SIZE,
};
use protobuf::job_worker_server::JobWorker;
use protobuf::{JobCreateRequest, JobRequest, JobResponse, JobStatusResponse, OutputResponse};
use std::pin::Pin;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};
use tracing::{info, warn};
use uuid::Uuid;

// tonic wraps this in Arc anyway internally, so we don't need Arc
#[derive(Debug)]
pub struct JobWorkerService {
    registry: JobRegistry,
}

impl JobWorkerService {
    pub fn new(registry: JobRegistry) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl JobWorker for JobWorkerService {
    type StreamStream = Pin<Box<dyn Stream<Item = Result<OutputResponse, Status>> + Send>>;

    async fn start(&self, req: Request<JobCreateRequest>) -> Result<Response<JobResponse>, Status> {
        let identity = identity(&req)?;
        let JobCreateRequest {
            cpu,
            mem_bytes,
            io_bytes_per_second,
            command,
            args,
            root_device,
        } = req.into_inner();

        let config = JobConfig {
            command,
            args,
            cpu,
            mem_bytes,
            io_bytes_per_second,
            root_device: Some(root_device).filter(|device| !device.is_empty()),
        };

        match self.registry.create(&identity, config).await {
            Ok(job_id) => Ok(Response::new(JobResponse {
                id: job_id.to_string(),
            })),
            Err(CreateError { job_id, source }) => {
                warn!(job_id = %job_id, identity = %identity, error = %source, "job failed to start");
                // the job stays registered, so the id is reported for a later status call
                Err(match source {
                    JobError::Validation(err) => {
                        Status::invalid_argument(format!("job {}: {}", job_id, err))
                    }
                    err => Status::internal(format!("job {}: {}", job_id, err)),
                })
            }
        }
    }

    async fn status(
        &self,
        req: Request<JobRequest>,
    ) -> Result<Response<JobStatusResponse>, Status> {
        let identity = identity(&req)?;
        let job_id = parse_job_id(&req.get_ref().id)?;

        let status = self
            .registry
            .status(job_id, &identity)
            .map_err(to_status)?;
        Ok(Response::new(to_response(status)))
    }

    async fn stream(
        &self,
        req: Request<JobRequest>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        let identity = identity(&req)?;
        let job_id = parse_job_id(&req.get_ref().id)?;

        let reader = self
            .registry
            .stream(job_id, &identity)
            .map_err(to_status)?;
        info!(job_id = %job_id, identity = %identity, "streaming job output");

        let response_stream = reader.into_stream(STREAM_CHUNK_SIZE).map(|chunk| {
            chunk
                .map(|content| OutputResponse {
                    content: content.to_vec(),
                })
                .map_err(|err| Status::internal(err.to_string()))
        });
        Ok(Response::new(
            Box::pin(response_stream) as Self::StreamStream
        ))
    }

    async fn stop(&self, req: Request<JobRequest>) -> Result<Response<JobStatusResponse>, Status> {
        let identity = identity(&req)?;
        let job_id = parse_job_id(&req.get_ref().id)?;

        let status = self
            .registry
            .stop(job_id, &identity)
            .await
            .map_err(to_status)?;
        info!(job_id = %job_id, identity = %identity, state = %status.state, "job stopped");
        Ok(Response::new(to_response(status)))
    }
}

fn identity<T>(req: &Request<T>) -> Result<Identity, Status> {
    req.extensions()
        .get::<UserExtension>()
        .map(|ext| ext.identity.clone())
        .ok_or_else(|| Status::unauthenticated("Request missing client identity"))
}

fn parse_job_id(id: &str) -> Result<JobId, Status> {
    Uuid::parse_str(id).map_err(|err| Status::invalid_argument(format!("bad job id {:?}: {}", id, err)))
}

fn to_status(err: JobError) -> Status {
    match err {
        JobError::NotFound(_) => Status::not_found(err.to_string()),
        JobError::NotAuthorized(_) => Status::permission_denied(err.to_string()),
        JobError::Validation(_) => Status::invalid_argument(err.to_string()),
        JobError::AlreadyStarted | JobError::AlreadyStopped | JobError::NotStarted => {
            Status::failed_precondition(err.to_string())
        }
        JobError::Setup(_) | JobError::Spawn(_) => Status::internal(err.to_string()),
    }
}

fn to_response(status: JobStatus) -> JobStatusResponse {
    let state = match status.state {
        JobState::NotStarted => protobuf::Status::NotStarted,
        JobState::Running => protobuf::Status::Running,
        JobState::Completed => protobuf::Status::Completed,
        JobState::Terminated => protobuf::Status::Terminated,
    };
    JobStatusResponse {
        status: state.into(),
        exit_code: status.exit_code,
        exit_reason: status.exit_reason,
    }
}

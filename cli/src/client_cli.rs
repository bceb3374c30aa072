use crate::arg_parser::ArgParser;
use protobuf::{
    job_worker_client::JobWorkerClient, JobCreateRequest, JobRequest, JobStatusResponse,
    OutputResponse,
};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::{Request, Status};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect: {0}")]
    Connect(#[from] tonic::transport::Error),
    #[error("invalid server address {0:?}")]
    InvalidServer(String),
    #[error("{}: {}", .0.code(), .0.message())]
    Rpc(#[from] Status),
    #[error("failed to write output: {0}")]
    Output(#[source] io::Error),
}

pub struct ClientCli {
    inner: JobWorkerClient<Channel>,
}

impl ClientCli {
    /// Open a mutual TLS channel to the server named in `args`.
    pub async fn connect(args: &ArgParser) -> Result<Self, CliError> {
        let ca_cert = read(&args.ca_cert).await?;
        let cert = read(&args.cert).await?;
        let key = read(&args.key).await?;

        let tls = ClientTlsConfig::new()
            .domain_name(args.domain.clone())
            .ca_certificate(Certificate::from_pem(ca_cert))
            .identity(Identity::from_pem(cert, key));

        let channel = Channel::from_shared(args.server.clone())
            .map_err(|_| CliError::InvalidServer(args.server.clone()))?
            .tls_config(tls)?
            .connect()
            .await?;
        debug!(server = %args.server, "connected");

        Ok(Self {
            inner: JobWorkerClient::new(channel),
        })
    }

    pub async fn start_job(&mut self, request: JobCreateRequest) -> Result<(), CliError> {
        let response = self.inner.start(Request::new(request)).await?;
        println!("Started job id: {}", response.into_inner().id);
        Ok(())
    }

    pub async fn stop_job(&mut self, job_id: Uuid) -> Result<(), CliError> {
        let response = self.inner.stop(job_request(job_id)).await?;
        println!("{}", format_status(&response.into_inner()));
        Ok(())
    }

    pub async fn query_status(&mut self, job_id: Uuid) -> Result<(), CliError> {
        let response = self.inner.status(job_request(job_id)).await?;
        println!("{}", format_status(&response.into_inner()));
        Ok(())
    }

    /// Copy the job's output to stdout until the job ends or ctrl-c is pressed.
    pub async fn stream_output(&mut self, job_id: Uuid) -> Result<(), CliError> {
        let mut stream = self.inner.stream(job_request(job_id)).await?.into_inner();
        let mut stdout = tokio::io::stdout();
        loop {
            let message = tokio::select! {
                message = stream.message() => message?,
                _ = tokio::signal::ctrl_c() => {
                    debug!(job_id = %job_id, "interrupted, closing stream");
                    None
                }
            };
            match message {
                Some(OutputResponse { content }) => {
                    stdout.write_all(&content).await.map_err(CliError::Output)?;
                    stdout.flush().await.map_err(CliError::Output)?;
                }
                None => return Ok(()),
            }
        }
    }
}

fn job_request(job_id: Uuid) -> Request<JobRequest> {
    Request::new(JobRequest {
        id: job_id.to_string(),
    })
}

fn format_status(response: &JobStatusResponse) -> String {
    let state = match protobuf::Status::from_i32(response.status) {
        Some(protobuf::Status::NotStarted) => "not started",
        Some(protobuf::Status::Running) => "running",
        Some(protobuf::Status::Completed) => "completed",
        Some(protobuf::Status::Terminated) => "terminated",
        Some(protobuf::Status::Unspecified) | None => "unknown",
    };
    let mut formatted = format!("Status: {}", state);
    if response.exit_code != -1 {
        formatted.push_str(&format!("\nExit code: {}", response.exit_code));
    }
    if !response.exit_reason.is_empty() {
        formatted.push_str(&format!("\nReason: {}", response.exit_reason));
    }
    formatted
}

async fn read(path: &Path) -> Result<Vec<u8>, CliError> {
    tokio::fs::read(path).await.map_err(|source| CliError::ReadFile {
        path: path.to_owned(),
        source,
    })
}

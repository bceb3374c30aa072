mod config;
mod interceptors;
mod services;

pub use cert::UserExtension;
use clap::Parser;
use config::ServerArgs;
use interceptors::cert;
use joblib::{CgroupManager, Isolation, JobRegistry};
use protobuf::job_worker_server::JobWorkerServer;
use services::jobservice::JobWorkerService;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    serve(ServerArgs::parse()).await
}

async fn serve(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tls_config = args.tls_config().await?;

    let cgroups = CgroupManager::new(args.cgroup_config());
    cgroups.enable_controllers();
    info!(addr = %args.addr, cgroup_root = %cgroups.root().display(), "listening");
    let registry = JobRegistry::new(Isolation::Linux(cgroups), args.worker_config());

    let job_worker_server =
        JobWorkerServer::with_interceptor(JobWorkerService::new(registry), cert::extract_subject_cn);

    Server::builder()
        .tls_config(tls_config)?
        .add_service(job_worker_server)
        .serve_with_shutdown(args.addr, shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c, serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

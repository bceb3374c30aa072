mod arg_parser;
mod client_cli;

use arg_parser::{ArgParser, SubCommand};
use client_cli::ClientCli;
use protobuf::JobCreateRequest;

use clap::Parser;
use std::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = ArgParser::parse();
    let mut client = ClientCli::connect(&args).await?;

    match args.sub_command {
        SubCommand::Start {
            cpu,
            mem_bytes,
            io_bytes_per_second,
            root_device,
            command,
            args,
        } => {
            let request = JobCreateRequest {
                cpu,
                mem_bytes,
                io_bytes_per_second,
                command,
                args,
                root_device: root_device.unwrap_or_default(),
            };
            client.start_job(request).await?;
        }
        SubCommand::Stop { job_id } => {
            client.stop_job(job_id).await?;
        }
        SubCommand::Status { job_id } => {
            client.query_status(job_id).await?;
        }
        SubCommand::Stream { job_id } => {
            client.stream_output(job_id).await?;
        }
    }

    Ok(())
}

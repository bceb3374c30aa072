use clap::{AppSettings, Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// Connect to a gRPC job worker
#[derive(Debug, Parser)]
pub struct ArgParser {
    /// The address of the server
    #[clap(
        short = 's',
        long = "server",
        env = "JOBWORKER_SERVER",
        default_value = "https://[::1]:50051"
    )]
    pub server: String,
    /// Name the server certificate is checked against
    #[clap(long, env = "JOBWORKER_DOMAIN", default_value = "localhost")]
    pub domain: String,
    /// CA certificate that signed the server certificate (PEM)
    #[clap(long, env = "JOBWORKER_CA_CERT", parse(from_os_str))]
    pub ca_cert: PathBuf,
    /// Client certificate; its subject common name is your identity (PEM)
    #[clap(long, env = "JOBWORKER_CERT", parse(from_os_str))]
    pub cert: PathBuf,
    /// Client private key (PEM)
    #[clap(long, env = "JOBWORKER_KEY", parse(from_os_str))]
    pub key: PathBuf,
    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum SubCommand {
    /// start a new job
    #[clap(setting = AppSettings::TrailingVarArg)]
    Start {
        /// fraction of a cpu core the job may use
        #[clap(long, default_value = "0.5")]
        cpu: f64,

        /// memory limit in bytes
        #[clap(long, default_value = "1000000000")]
        mem_bytes: i64,

        /// read and write limit on the root device, in bytes per second
        #[clap(long = "io", default_value = "100000000")]
        io_bytes_per_second: i64,

        /// MAJ:MIN of the device to limit io on, instead of the server default
        #[clap(long)]
        root_device: Option<String>,

        /// name of the command to run
        command: String,

        /// a list of args to the command
        #[clap(multiple_values = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// stop a job, waiting until it has exited
    Stop {
        /// Uuid v4 string
        job_id: Uuid,
    },
    /// get a job's status
    Status {
        /// Uuid v4 string
        job_id: Uuid,
    },
    /// stream a job's output from the beginning until it ends
    Stream {
        /// Uuid v4 string
        job_id: Uuid,
    },
}

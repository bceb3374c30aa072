use clap::Parser;
use joblib::{AuthorizationPolicy, CgroupConfig, WorkerConfig};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

/// Run commands on this host on behalf of mutually authenticated clients
#[derive(Debug, Parser)]
pub struct ServerArgs {
    /// Address to listen on
    #[clap(long, env = "JOBWORKER_ADDR", default_value = "[::1]:50051")]
    pub addr: SocketAddr,
    /// CA certificate that client certificates must be signed by (PEM)
    #[clap(long, env = "JOBWORKER_CA_CERT", parse(from_os_str))]
    pub ca_cert: PathBuf,
    /// Server certificate (PEM)
    #[clap(long, env = "JOBWORKER_CERT", parse(from_os_str))]
    pub cert: PathBuf,
    /// Server private key (PEM)
    #[clap(long, env = "JOBWORKER_KEY", parse(from_os_str))]
    pub key: PathBuf,
    /// Root of the cgroup v2 hierarchy to create job groups in
    #[clap(
        long,
        env = "JOBWORKER_CGROUP_ROOT",
        default_value = "/sys/fs/cgroup",
        parse(from_os_str)
    )]
    pub cgroup_root: PathBuf,
    /// MAJ:MIN of the device io limits apply to when a request doesn't name one
    #[clap(long, env = "JOBWORKER_ROOT_DEVICE")]
    pub root_device: Option<String>,
    /// Seconds a stopped job gets to exit after SIGTERM before it is killed
    #[clap(long, env = "JOBWORKER_STOP_GRACE_SECS", default_value = "10")]
    pub stop_grace_secs: u64,
    /// Answer "permission denied" instead of "not found" for jobs owned by someone else
    #[clap(long)]
    pub reveal_job_existence: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ServerArgs {
    pub fn cgroup_config(&self) -> CgroupConfig {
        CgroupConfig {
            root: self.cgroup_root.clone(),
            default_device: self.root_device.clone(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            stop_grace_period: Duration::from_secs(self.stop_grace_secs),
            authorization: if self.reveal_job_existence {
                AuthorizationPolicy::RevealExistence
            } else {
                AuthorizationPolicy::HideExistence
            },
        }
    }

    /// Server identity plus the CA used to verify client certificates.
    pub async fn tls_config(&self) -> Result<ServerTlsConfig, ConfigError> {
        let cert = read(&self.cert).await?;
        let key = read(&self.key).await?;
        let ca_cert = read(&self.ca_cert).await?;
        Ok(ServerTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .client_ca_root(Certificate::from_pem(ca_cert)))
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, ConfigError> {
    tokio::fs::read(path).await.map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TLS_ARGS: [&str; 7] = [
        "jobworker-server",
        "--ca-cert",
        "ca.pem",
        "--cert",
        "server.pem",
        "--key",
        "server.key",
    ];

    #[test]
    fn defaults() {
        let args = ServerArgs::try_parse_from(TLS_ARGS).unwrap();
        assert_eq!(args.addr, "[::1]:50051".parse().unwrap());
        assert_eq!(args.cgroup_config(), CgroupConfig::default());

        let worker = args.worker_config();
        assert_eq!(worker.stop_grace_period, Duration::from_secs(10));
        assert_eq!(worker.authorization, AuthorizationPolicy::HideExistence);
    }

    #[test]
    fn overrides() {
        let args = ServerArgs::try_parse_from(TLS_ARGS.iter().copied().chain([
            "--addr",
            "0.0.0.0:9000",
            "--cgroup-root",
            "/sys/fs/cgroup/jobs",
            "--root-device",
            "8:0",
            "--stop-grace-secs",
            "3",
            "--reveal-job-existence",
        ]))
        .unwrap();

        assert_eq!(args.addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(
            args.cgroup_config(),
            CgroupConfig {
                root: "/sys/fs/cgroup/jobs".into(),
                default_device: Some("8:0".into()),
            }
        );
        let worker = args.worker_config();
        assert_eq!(worker.stop_grace_period, Duration::from_secs(3));
        assert_eq!(worker.authorization, AuthorizationPolicy::RevealExistence);
    }

    #[test]
    fn tls_material_is_required() {
        assert!(ServerArgs::try_parse_from(["jobworker-server"]).is_err());
    }

    #[tokio::test]
    async fn missing_tls_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("server.pem");
        let args = ServerArgs::try_parse_from([
            "jobworker-server",
            "--ca-cert",
            "ca.pem",
            "--cert",
            missing.to_str().unwrap(),
            "--key",
            "server.key",
        ])
        .unwrap();

        let err = args.tls_config().await.unwrap_err();
        assert!(err.to_string().contains(missing.to_str().unwrap()));
    }
}

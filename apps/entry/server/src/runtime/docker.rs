use std::{path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::{AttachContainerOptions, AttachContainerResults, LogOutput},
    exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults},
    Docker, API_DEFAULT_VERSION,
};
use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use super::{AttachStreams, AttachWaiter, ContainerRuntime, ExecSpec, ExecStreams, RuntimeError};

const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Where the docker daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for DockerEndpoint {
    type Err = RuntimeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Some(path) = value.strip_prefix("unix://") {
            return Ok(DockerEndpoint::Unix(PathBuf::from(path)));
        }
        if value.starts_with("tcp://") || value.starts_with("http://") || value.starts_with("https://") {
            return Ok(DockerEndpoint::Tcp(value.to_string()));
        }
        Err(RuntimeError::Endpoint(value.to_string()))
    }
}

/// `ContainerRuntime` backed by the docker engine API.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Builds a client for `endpoint`. With `cert_path` set, TCP endpoints use
    /// TLS with `key.pem`, `cert.pem` and `ca.pem` from that directory.
    pub fn connect(
        endpoint: &DockerEndpoint,
        cert_path: Option<&PathBuf>,
    ) -> Result<Self, RuntimeError> {
        let docker = match (endpoint, cert_path) {
            (DockerEndpoint::Unix(path), _) => {
                let path = path.to_string_lossy();
                Docker::connect_with_unix(&path, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            (DockerEndpoint::Tcp(addr), Some(certs)) => Docker::connect_with_ssl(
                addr,
                &certs.join("key.pem"),
                &certs.join("cert.pem"),
                &certs.join("ca.pem"),
                REQUEST_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            )?,
            (DockerEndpoint::Tcp(addr), None) => {
                Docker::connect_with_http(addr, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
        };
        Ok(Self::new(docker))
    }

    /// Keeps trying until the daemon answers a ping.
    pub async fn connect_with_retry(
        endpoint: &DockerEndpoint,
        cert_path: Option<&PathBuf>,
        retry_every: Duration,
    ) -> Self {
        loop {
            match Self::connect(endpoint, cert_path) {
                Ok(runtime) => match runtime.docker.ping().await {
                    Ok(_) => {
                        info!(endpoint = ?endpoint, "connected to docker daemon");
                        return runtime;
                    }
                    Err(err) => error!(error = %err, "docker daemon did not answer ping"),
                },
                Err(err) => error!(error = %err, "initialize docker client error"),
            }
            tokio::time::sleep(retry_every).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_exec(&self, container_id: &str, spec: ExecSpec) -> Result<String, RuntimeError> {
        let options = CreateExecOptions {
            attach_stdin: Some(spec.attach_stdio),
            attach_stdout: Some(spec.attach_stdio),
            attach_stderr: Some(spec.attach_stdio),
            tty: Some(spec.tty),
            cmd: Some(spec.cmd),
            env: (!spec.env.is_empty()).then_some(spec.env),
            ..Default::default()
        };
        let created = self.docker.create_exec(container_id, options).await?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str, streams: ExecStreams<'_>) -> Result<(), RuntimeError> {
        let options = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let StartExecResults::Attached {
            mut output,
            mut input,
        } = self.docker.start_exec(exec_id, Some(options)).await?
        else {
            return Err(RuntimeError::Detached(exec_id.to_string()));
        };

        let ExecStreams {
            stdin,
            stdout,
            stderr,
        } = streams;

        let input_pump = async {
            let copied = tokio::io::copy(stdin, &mut input).await;
            let _ = input.shutdown().await;
            copied
        };
        let output_pump = async {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.write_all(&message).await?;
                    }
                    LogOutput::StdErr { message } => stderr.write_all(&message).await?,
                    LogOutput::StdIn { .. } => {}
                }
            }
            Ok::<(), RuntimeError>(())
        };
        tokio::pin!(input_pump);
        tokio::pin!(output_pump);

        let mut input_done = false;
        loop {
            tokio::select! {
                result = &mut output_pump => return result,
                copied = &mut input_pump, if !input_done => {
                    input_done = true;
                    match copied {
                        Ok(bytes) => debug!(exec_id, bytes, "exec stdin closed"),
                        Err(err) => debug!(exec_id, error = %err, "exec stdin copy ended"),
                    }
                }
            }
        }
    }

    async fn resize_exec(
        &self,
        exec_id: &str,
        height: u16,
        width: u16,
    ) -> Result<(), RuntimeError> {
        self.docker
            .resize_exec(exec_id, ResizeExecOptions { height, width })
            .await?;
        Ok(())
    }

    async fn attach(
        &self,
        container_id: &str,
        streams: AttachStreams,
    ) -> Result<AttachWaiter, RuntimeError> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { mut output, .. } =
            self.docker.attach_container(container_id, Some(options)).await?;

        let container = container_id.to_string();
        let pump = tokio::spawn(async move {
            let AttachStreams {
                mut stdout,
                mut stderr,
            } = streams;
            while let Some(chunk) = output.next().await {
                let written = match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        forward(&mut stdout, &message).await
                    }
                    Ok(LogOutput::StdErr { message }) => forward(&mut stderr, &message).await,
                    Ok(LogOutput::StdIn { .. }) => Ok(()),
                    Err(err) => {
                        warn!(container_id = %container, error = %err, "attach stream failed");
                        break;
                    }
                };
                if let Err(err) = written {
                    debug!(container_id = %container, error = %err, "attach output pipe closed");
                    break;
                }
            }
            stdout.close();
            stderr.close();
        });

        Ok(AttachWaiter::new(pump))
    }
}

async fn forward<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_endpoints() {
        assert_eq!(
            "unix:///var/run/docker.sock".parse::<DockerEndpoint>().unwrap(),
            DockerEndpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            "tcp://10.18.5.24:443".parse::<DockerEndpoint>().unwrap(),
            DockerEndpoint::Tcp("tcp://10.18.5.24:443".to_string())
        );
        assert!("ftp://nowhere".parse::<DockerEndpoint>().is_err());
    }

    #[test]
    fn shell_spec_forces_term_type() {
        let spec = ExecSpec::shell("xterm-256color");
        assert_eq!(spec.cmd, ["env", "TERM=xterm-256color", "/bin/bash"]);
        assert!(spec.tty && spec.attach_stdio);
    }
}

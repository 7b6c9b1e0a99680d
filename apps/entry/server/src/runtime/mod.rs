//! Container runtime seam consumed by the session bridge.

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::pipe::{PipeReader, PipeWriter};

mod docker;

pub use docker::{DockerEndpoint, DockerRuntime};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("stream i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("exec {0} did not attach its streams")]
    Detached(String),
    #[error("unsupported docker endpoint: {0}")]
    Endpoint(String),
    #[error("{0}")]
    Other(String),
}

/// Parameters of the interactive command started inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub attach_stdio: bool,
}

impl ExecSpec {
    /// Login shell with `TERM` forced to the client's terminal type.
    pub fn shell(term_type: &str) -> Self {
        Self {
            cmd: vec![
                "env".to_string(),
                format!("TERM={term_type}"),
                "/bin/bash".to_string(),
            ],
            env: Vec::new(),
            tty: true,
            attach_stdio: true,
        }
    }
}

/// Pipe ends handed to `start_exec`. The bridge keeps ownership and closes
/// them once the exec returns.
pub struct ExecStreams<'a> {
    pub stdin: &'a mut PipeReader,
    pub stdout: &'a mut PipeWriter,
    pub stderr: &'a mut PipeWriter,
}

/// Output sinks for a passive attach. They are owned by the attach pump and
/// closed when the waiter closes.
pub struct AttachStreams {
    pub stdout: PipeWriter,
    pub stderr: PipeWriter,
}

/// Handle on a running non-blocking attach.
#[derive(Debug)]
pub struct AttachWaiter {
    pump: JoinHandle<()>,
}

impl AttachWaiter {
    pub fn new(pump: JoinHandle<()>) -> Self {
        Self { pump }
    }

    /// Stops the attach and waits for the pump to release its output pipes.
    pub async fn close(self) {
        self.pump.abort();
        let _ = self.pump.await;
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_exec(&self, container_id: &str, spec: ExecSpec) -> Result<String, RuntimeError>;

    /// Runs the exec, streaming until the command exits or its I/O closes.
    async fn start_exec(&self, exec_id: &str, streams: ExecStreams<'_>) -> Result<(), RuntimeError>;

    async fn resize_exec(&self, exec_id: &str, height: u16, width: u16)
        -> Result<(), RuntimeError>;

    async fn attach(
        &self,
        container_id: &str,
        streams: AttachStreams,
    ) -> Result<AttachWaiter, RuntimeError>;
}

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use tracing::warn;

use crate::{bridge::BridgeConfig, runtime::DockerEndpoint};

pub const DEFAULT_PORT: u16 = 8070;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub docker_endpoint: DockerEndpoint,
    pub docker_cert_path: Option<PathBuf>,
    pub docker_retry: Duration,
    pub handshake_timeout: Duration,
    pub console_auth_url: Option<String>,
    pub shutdown_grace: Duration,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "entry-server",
    author,
    version,
    about = "WebSocket gateway into container terminals"
)]
pub struct Cli {
    /// Port to listen on. Unparsable values fall back to 8070.
    #[arg(long, env = "PORT", default_value = "8070")]
    pub port: String,

    /// Interface the listener binds to.
    #[arg(long, env = "ENTRY_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// Docker daemon endpoint (unix://, tcp://, http:// or https://).
    #[arg(
        long,
        env = "ENTRY_DOCKER_ENDPOINT",
        default_value = "unix:///var/run/docker.sock"
    )]
    pub docker_endpoint: String,

    /// Directory holding key.pem, cert.pem and ca.pem for TLS to the daemon.
    #[arg(long, env = "DOCKER_CERT_PATH")]
    pub docker_cert_path: Option<PathBuf>,

    /// Delay between attempts to reach the docker daemon at startup.
    #[arg(long, env = "ENTRY_DOCKER_RETRY_SECS", default_value_t = 10)]
    pub docker_retry_secs: u64,

    /// Maximum time web clients have to send their container selector.
    #[arg(long, env = "ENTRY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    #[arg(long, env = "ENTRY_HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    /// Wait before relaying client input into a fresh exec.
    #[arg(long, env = "ENTRY_ATTACH_DELAY_MS", default_value_t = 1000)]
    pub attach_delay_ms: u64,

    /// How long a finished session waits for the client's close reply.
    #[arg(long, env = "ENTRY_CLOSE_GRACE_SECS", default_value_t = 5)]
    pub close_grace_secs: u64,

    /// Console endpoint used to validate access-token roles.
    #[arg(long, env = "ENTRY_CONSOLE_AUTH_URL")]
    pub console_auth_url: Option<String>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "ENTRY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let port = parse_port(&cli.port);
        let host: IpAddr = cli
            .bind_host
            .parse()
            .with_context(|| format!("invalid bind host: {}", cli.bind_host))?;
        let docker_endpoint: DockerEndpoint = cli
            .docker_endpoint
            .parse()
            .with_context(|| format!("invalid docker endpoint: {}", cli.docker_endpoint))?;

        Ok(ServerConfig {
            listen_addr: SocketAddr::new(host, port),
            docker_endpoint,
            docker_cert_path: cli.docker_cert_path,
            docker_retry: Duration::from_secs(cli.docker_retry_secs),
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            console_auth_url: cli.console_auth_url.filter(|url| !url.is_empty()),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            bridge: BridgeConfig {
                heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs.max(1)),
                attach_delay: Duration::from_millis(cli.attach_delay_ms),
                close_grace: Duration::from_secs(cli.close_grace_secs),
                ..BridgeConfig::default()
            },
        })
    }
}

fn parse_port(raw: &str) -> u16 {
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => {
            warn!(value = raw, default = DEFAULT_PORT, "invalid PORT, using default");
            DEFAULT_PORT
        }
    }
}

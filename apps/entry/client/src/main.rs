use std::io::Write;

use anyhow::Result;
use clap::Parser;
use entry_client::{
    terminal::{local_window_size, watch_resizes, RawModeGuard},
    EntryClient, SessionEnd,
};
use tracing_subscriber::EnvFilter;

const FAILURE_MSG: &str = "Server stops the connection. Ask admin for help.";

#[derive(Debug, Parser)]
#[command(
    name = "entry-cli",
    version,
    about = "Open an interactive shell in a container through an Entry gateway"
)]
struct Cli {
    /// Gateway host.
    host: String,

    /// Gateway port.
    port: u16,

    /// Target container id.
    container_id: String,

    /// Terminal type exported to the remote shell.
    #[arg(long, env = "TERM", default_value = "xterm")]
    term_type: String,
}

#[tokio::main]
async fn main() {
    // logs stay off unless RUST_LOG asks for them, raw mode makes them unreadable
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(SessionEnd::Closed(message)) => {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(b"\r\n");
            let _ = stdout.write_all(&message);
            let _ = stdout.write_all(b"\r\n");
            let _ = stdout.flush();
            0
        }
        Ok(SessionEnd::Disconnected) => {
            println!("\r\n{FAILURE_MSG}");
            1
        }
        Err(err) => {
            tracing::debug!(error = %err, "session failed");
            println!("\r\n{FAILURE_MSG}");
            1
        }
    };
    // stdin is read on a blocking thread the runtime would otherwise wait for
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<SessionEnd> {
    let client = EntryClient::connect(&cli.host, cli.port, &cli.container_id, &cli.term_type).await?;
    let resizes = watch_resizes()?;
    let _raw = RawModeGuard::enable()?;
    let end = client
        .invoke_shell(
            tokio::io::stdin(),
            tokio::io::stdout(),
            tokio::io::stderr(),
            local_window_size(),
            resizes,
        )
        .await?;
    Ok(end)
}

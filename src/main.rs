mod agent;
mod command;
mod impersonate;
mod process;

use agent::{Agent, AgentConfig};
use anyhow::Context as _;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = AgentConfig::default();
    info!("Guest agent starting");
    info!("  command socket: {}", config.socket_path.display());
    info!(
        "  privileged: {}",
        impersonate::unix::process_is_privileged()
    );

    // a stale socket left by a previous run blocks bind
    match tokio::fs::remove_file(&config.socket_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("removing stale socket"),
    }
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("binding {}", config.socket_path.display()))?;

    let (agent, mut completions) = Agent::new(&config);

    // Program outcomes go back to the host over its notification channel;
    // this process records them in the log as well.
    tokio::spawn(async move {
        while let Some(done) = completions.recv().await {
            info!(
                request = %done.request_name,
                pid = done.pid,
                status = done.status,
                exit_code = done.exit_code,
                "program completed"
            );
        }
        error!("completion channel closed");
    });

    Arc::new(agent).serve(listener).await
}

//! agentssh - standalone SSH server for a workspace
//!
//! Serves shells, commands, SFTP and forwarding to any client on the
//! configured address until interrupted.

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use agentssh::{paths, ConfigFile, Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agentssh=info".parse()?),
        )
        .init();

    paths::log_paths();
    let file = ConfigFile::load(paths::config_path()).context("failed to load config")?;
    let listen_addr = paths::listen_addr_override().unwrap_or_else(|| file.listen_addr.clone());

    let server = Server::new(file.into_config())?;
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to listen on {listen_addr}"))?;
    info!(addr = %listen_addr, "starting agentssh");

    tokio::select! {
        res = server.serve(listener) => {
            if let Err(e) = res {
                warn!(error = %e, "listener stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted, closing"),
    }

    server.close().await?;
    Ok(())
}

//! remodesk: provision a remote-access desktop on an ephemeral cloud host.
//!
//! The sequence runs top-to-bottom exactly once. On success the process
//! blocks forever to keep its background children (tunnel client, noVNC,
//! Xorg, VNC server) alive; the only exit is external termination.

use anyhow::Result;
use clap::Parser;
use tokio::time::{Duration, sleep};
use tracing_subscriber::EnvFilter;

use remodesk::config::{Cli, SessionConfig};
use remodesk::provision::{self, Host};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SessionConfig::from_cli(Cli::parse())?;
    let mut host = Host::new();

    provision::run(&mut host, &config).await?;

    // Keepalive: the tunnel, web client, Xorg and VNC server are children of
    // this process; block until the hosting session terminates us.
    loop {
        sleep(Duration::from_secs(1)).await;
    }
}

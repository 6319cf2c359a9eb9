//! Remote desktop provisioning: the VNC stack, the desktop environment,
//! user-requested extras, the VNC security policy, and the noVNC web client
//! the tunnel forwards to.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Child;
use tracing::info;

use crate::config::SessionConfig;
use crate::{accel, exec, fetch, gpu};

const LIBJPEG_TURBO_VERSION: &str = "2.0.3";
const VIRTUALGL_VERSION: &str = "2.6.2";
const TURBOVNC_VERSION: &str = "2.2.3";

const SECURITY_CONF: &str = "/etc/turbovncserver-security.conf";

/// Disables remote, proxied and unencrypted connection modes; the only way
/// in is the local websocket the tunnel fronts.
const SECURITY_POLICY: &str = "no-remote-connections\nno-httpd\nno-x11-tcp-connections\n";

const NOVNC_REPO: &str = "https://github.com/novnc/noVNC.git";
const NOVNC_DIR: &str = "noVNC";

/// Address noVNC fronts: TurboVNC binds display :1 (port 5901) on a fresh
/// host.
const VNC_DISPLAY_ADDR: &str = "localhost:5901";

fn libjpeg_turbo_url() -> String {
    format!(
        "https://svwh.dl.sourceforge.net/project/libjpeg-turbo/{v}/libjpeg-turbo-official_{v}_amd64.deb",
        v = LIBJPEG_TURBO_VERSION
    )
}

fn virtualgl_url() -> String {
    format!(
        "https://svwh.dl.sourceforge.net/project/virtualgl/{v}/virtualgl_{v}_amd64.deb",
        v = VIRTUALGL_VERSION
    )
}

fn turbovnc_url() -> String {
    format!(
        "https://svwh.dl.sourceforge.net/project/turbovnc/{v}/turbovnc_{v}_amd64.deb",
        v = TURBOVNC_VERSION
    )
}

/// Full desktop-provisioning sequence. Re-detects the accelerator at the
/// end and configures GPU acceleration when one is present.
pub async fn provision(client: &reqwest::Client, config: &SessionConfig) -> Result<()> {
    install_vnc_stack(client).await?;
    install_desktop_environment().await?;
    install_extra_packages(&config.install).await?;

    write_security_policy(Path::new(SECURITY_CONF)).context("writing VNC security policy")?;

    info!("Installing GPU driver...");
    if gpu::detect().await.is_some() {
        accel::configure(client).await?;
    }

    Ok(())
}

/// Download the three fixed-version archives and install each through apt,
/// which resolves their dependencies from the package cache.
async fn install_vnc_stack(client: &reqwest::Client) -> Result<()> {
    info!("Installing VNC packages...");
    let debs = [
        (libjpeg_turbo_url(), "libjpeg-turbo.deb"),
        (virtualgl_url(), "virtualgl.deb"),
        (turbovnc_url(), "turbovnc.deb"),
    ];
    for (url, file) in &debs {
        fetch::download(client, url, Path::new(file)).await?;
    }
    for (_, file) in &debs {
        exec::apt_get(&["install", "-y", &format!("./{file}")]).await?;
    }
    Ok(())
}

async fn install_desktop_environment() -> Result<()> {
    info!("Installing desktop environment...");
    exec::apt_get(&["install", "-y", "xfce4", "xfce4-terminal", "fonts-noto"]).await
}

/// Install each user-requested package by name. An unknown name makes apt
/// fail, which aborts the run; there is no partial-install recovery.
async fn install_extra_packages(packages: &[String]) -> Result<()> {
    if packages.is_empty() {
        return Ok(());
    }
    info!("Installing extra packages...");
    for package in packages {
        exec::apt_get(&["install", "-y", package])
            .await
            .with_context(|| format!("installing requested package '{package}'"))?;
    }
    Ok(())
}

fn write_security_policy(path: &Path) -> Result<()> {
    std::fs::write(path, SECURITY_POLICY)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Clone the noVNC web client (skipped when already present) and start it
/// fronting the VNC display. Fire-and-forget: the child serves until the
/// hosting session dies.
pub async fn serve_web_client() -> Result<Child> {
    info!("Setting up noVNC...");
    if !Path::new(NOVNC_DIR).exists() {
        exec::run("git", &["clone", NOVNC_REPO]).await?;
    }
    exec::spawn("noVNC/utils/launch.sh", &["--vnc", VNC_DISPLAY_ADDR])
}

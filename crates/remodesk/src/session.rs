//! Desktop session launch.
//!
//! Runs under the unprivileged account: generates per-session VNC
//! credentials, starts the VNC server, disables the screen lock, applies
//! terminal appearance preferences, runs the optional post-setup command,
//! and emits the final connection URL.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::{Rng, distr::Alphanumeric};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::exec;

const VNC_PASSWD_TOOL: &str = "/opt/TurboVNC/bin/vncpasswd";
const VNC_SERVER: &str = "/opt/TurboVNC/bin/vncserver";

/// Fixed profile id of the default GNOME Terminal profile.
const TERMINAL_PROFILE: &str =
    "org.gnome.Terminal.Legacy.Profile:/org/gnome/terminal/legacy/profiles:/:b1dcc9dd-5262-4d8d-a863-c897e6d979b9/";

/// Socket Xorg creates once display :1 is up.
const DISPLAY_SOCKET: &str = "/tmp/.X11-unix/X1";
const DISPLAY_DEADLINE: Duration = Duration::from_secs(20);
const DISPLAY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Grace period after the display socket appears, for the settings daemon.
const SESSION_GRACE: Duration = Duration::from_secs(2);

const PASSWORD_LEN: usize = 8;

/// Start the desktop session and return the connection URL that was logged.
pub async fn launch(config: &SessionConfig, tunnel_url: &str) -> Result<String> {
    let username = config.username.as_str();
    let home = config.home_dir();

    let password = generate_password();
    let viewonly_password = generate_password();

    write_credentials(config, &password, &viewonly_password).await?;

    info!("Starting VNC server...");
    exec::run_as_user(username, VNC_SERVER, &[], &[], None)
        .await
        .context("starting VNC server")?;

    disable_screen_lock(config).await?;
    apply_terminal_preferences(config).await;

    if let Some(command) = &config.post_command {
        info!("Running command: {command}");
        let script = format!("cd \"$HOME\"; {command}");
        // Best-effort: a broken user command must not take down the session.
        if let Err(err) = exec::run_as_user(username, "bash", &["-c", &script], &[], None).await {
            warn!("Post-setup command failed: {err:#}");
        }
    }

    let url = connection_url(tunnel_url, &password);
    info!("Ready! Click here to connect: {url}");
    Ok(url)
}

/// Encode the two passwords with the VNC server's own tool (run as the
/// account) and store them in the per-user credential file, owner-readable
/// only.
async fn write_credentials(
    config: &SessionConfig,
    password: &str,
    viewonly_password: &str,
) -> Result<()> {
    let username = config.username.as_str();
    let vnc_dir = format!("{}/.vnc", config.home_dir());
    std::fs::create_dir_all(&vnc_dir).with_context(|| format!("creating {vnc_dir}"))?;

    let input = format!("{password}\n{viewonly_password}");
    let encoded = exec::run_as_user(username, VNC_PASSWD_TOOL, &["-f"], &[], Some(&input))
        .await
        .context("encoding VNC passwords")?;

    let passwd_path = format!("{vnc_dir}/passwd");
    std::fs::write(&passwd_path, &encoded).with_context(|| format!("writing {passwd_path}"))?;
    exec::run("chown", &["-R", &format!("{username}:{username}"), &vnc_dir]).await?;
    std::fs::set_permissions(&passwd_path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("restricting {passwd_path}"))?;
    Ok(())
}

/// Nobody wants a screensaver on an ephemeral remote desktop.
async fn disable_screen_lock(config: &SessionConfig) -> Result<()> {
    let username = config.username.as_str();
    let path = format!("{}/.xscreensaver", config.home_dir());
    std::fs::write(&path, "mode: off\n").with_context(|| format!("writing {path}"))?;
    exec::run("chown", &[&format!("{username}:{username}"), &path]).await
}

/// Wait for the desktop session, then set the terminal font. Cosmetic:
/// failures are logged, never fatal.
async fn apply_terminal_preferences(config: &SessionConfig) {
    if !wait_for_display().await {
        warn!("Desktop session did not come up in time, skipping terminal preferences");
        return;
    }

    for (key, value) in [("use-system-font", "false"), ("font", "Noto Mono 10")] {
        let result = exec::run_as_user(
            &config.username,
            "gsettings",
            &["set", TERMINAL_PROFILE, key, value],
            &[("DISPLAY", ":1")],
            None,
        )
        .await;
        if let Err(err) = result {
            warn!("Setting terminal preference {key} failed: {err:#}");
        }
    }
}

/// Poll for the display socket instead of sleeping a guessed duration.
async fn wait_for_display() -> bool {
    let deadline = Instant::now() + DISPLAY_DEADLINE;
    while !Path::new(DISPLAY_SOCKET).exists() {
        if Instant::now() >= deadline {
            return false;
        }
        sleep(DISPLAY_POLL_INTERVAL).await;
    }
    sleep(SESSION_GRACE).await;
    true
}

/// Random 8-character alphanumeric password. Strictly alphanumeric so it
/// can be embedded in the connection URL without encoding.
pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Compose the clickable connection URL: autoconnect, remote resize, and
/// the full-access password as a query parameter.
pub fn connection_url(tunnel_url: &str, password: &str) -> String {
    format!("{tunnel_url}/vnc.html?autoconnect=1&resize=remote&password={password}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_eight_alphanumeric_chars() {
        let password = generate_password();
        assert_eq!(password.len(), 8);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn consecutive_passwords_differ() {
        // 62^8 possibilities; a collision here means the generator is broken.
        assert_ne!(generate_password(), generate_password());
    }

    #[test]
    fn connection_url_has_exactly_one_of_each_parameter() {
        let url = connection_url("https://abc.ngrok.io", "s3cretpw");
        assert_eq!(url.matches("autoconnect=1").count(), 1);
        assert_eq!(url.matches("resize=remote").count(), 1);
        assert_eq!(url.matches("password=").count(), 1);
    }

    #[test]
    fn connection_url_embeds_the_session_password() {
        let password = generate_password();
        let url = connection_url("https://abc.ngrok.io", &password);
        assert!(url.starts_with("https://abc.ngrok.io/vnc.html?"));
        assert!(url.ends_with(&format!("&password={password}")));
    }
}

//! Base system provisioning.
//!
//! Brings a minimized cloud image up to a full system, creates the
//! unprivileged desktop account with passwordless sudo, and installs the
//! tunnel client. Every step is fatal on failure and idempotent on re-runs:
//! a second invocation against the same host skips user creation and does
//! not duplicate the sudoers or shell-startup entries.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::info;

use crate::config::SessionConfig;
use crate::{exec, fetch};

const NGROK_ARCHIVE_URL: &str =
    "https://bin.equinox.io/c/4VmDzA7iaHb/ngrok-stable-linux-amd64.zip";
const NGROK_ARCHIVE: &str = "ngrok.zip";
const NGROK_BINARY: &str = "ngrok";
const NGROK_CREDENTIALS: &str = "/root/.ngrok2/ngrok.yml";
const SUDOERS: &str = "/etc/sudoers";

/// Run the full base-system sequence. The unprivileged account exists with
/// passwordless sudo before this returns, which later user-scoped steps
/// rely on.
pub async fn provision(client: &reqwest::Client, config: &SessionConfig) -> Result<()> {
    info!("Updating packages...");
    exec::apt_get(&["update"]).await?;
    exec::apt_get(&["-y", "dist-upgrade"]).await?;

    info!("Unminimizing server...");
    exec::run_with_stdin("unminimize", &[], "y\n").await?;

    info!("Downloading and installing ngrok...");
    fetch::download(client, NGROK_ARCHIVE_URL, Path::new(NGROK_ARCHIVE)).await?;
    extract_ngrok(Path::new(NGROK_ARCHIVE), Path::new(NGROK_BINARY))?;

    ensure_user(config).await?;

    if !Path::new(NGROK_CREDENTIALS).exists() {
        exec::run("./ngrok", &["authtoken", &config.token]).await?;
    }

    Ok(())
}

/// Create the unprivileged account (no password, empty GECOS) and grant it
/// passwordless sudo. Safe to call on a host where the account already
/// exists.
async fn ensure_user(config: &SessionConfig) -> Result<()> {
    let username = config.username.as_str();
    let home = config.home_dir();

    if user_exists(username).await {
        info!("User '{username}' already exists, skipping creation");
    } else {
        info!("Creating user '{username}'");
        exec::run("useradd", &["-m", "-s", "/bin/bash", "-c", "", username]).await?;
    }

    append_once(
        Path::new(SUDOERS),
        &format!("{username} ALL=(ALL) NOPASSWD: ALL"),
    )
    .context("updating sudoers")?;

    let bashrc = format!("{home}/.bashrc");
    let existed = Path::new(&bashrc).exists();
    append_once(Path::new(&bashrc), &format!("cd {home}"))
        .with_context(|| format!("updating {bashrc}"))?;
    if !existed {
        // useradd -m seeds .bashrc from /etc/skel; only a freshly created
        // file needs its ownership fixed.
        exec::run("chown", &[&format!("{username}:{username}"), &bashrc]).await?;
    }

    Ok(())
}

async fn user_exists(username: &str) -> bool {
    Command::new("id")
        .args(["-u", username])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Extract the single `ngrok` binary from the release archive and mark it
/// executable.
fn extract_ngrok(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("opening {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("reading ngrok archive")?;
    let mut entry = zip
        .by_name("ngrok")
        .context("ngrok binary missing from archive")?;
    let mut out = std::fs::File::create(dest)
        .with_context(|| format!("creating {}", dest.display()))?;
    std::io::copy(&mut entry, &mut out).context("extracting ngrok")?;
    drop(out);
    fetch::mark_executable(dest)
}

/// Append `line` to `path` unless the file already contains it. Returns
/// whether the line was appended.
fn append_once(path: &Path, line: &str) -> Result<bool> {
    let current = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };
    if current.lines().any(|existing| existing.trim() == line) {
        return Ok(false);
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {} for append", path.display()))?;
    // A file without a final newline would merge the entry onto its last
    // line, which for sudoers invalidates the whole file.
    if !current.is_empty() && !current.ends_with('\n') {
        file.write_all(b"\n")
            .with_context(|| format!("appending to {}", path.display()))?;
    }
    writeln!(file, "{line}").with_context(|| format!("appending to {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_once_creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sudoers");

        assert!(append_once(&path, "alice ALL=(ALL) NOPASSWD: ALL").unwrap());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "alice ALL=(ALL) NOPASSWD: ALL\n");
    }

    #[test]
    fn append_once_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bashrc");
        std::fs::write(&path, "export PATH=$PATH\ncd /home/alice\n").unwrap();

        assert!(!append_once(&path, "cd /home/alice").unwrap());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("cd /home/alice").count(), 1);
    }

    #[test]
    fn append_once_starts_a_fresh_line_in_unterminated_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sudoers");
        std::fs::write(&path, "root ALL=(ALL:ALL) ALL").unwrap();

        assert!(append_once(&path, "alice ALL=(ALL) NOPASSWD: ALL").unwrap());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "root ALL=(ALL:ALL) ALL\nalice ALL=(ALL) NOPASSWD: ALL\n"
        );
    }

    #[test]
    fn append_once_adds_missing_line_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bashrc");
        std::fs::write(&path, "export PATH=$PATH\n").unwrap();

        assert!(append_once(&path, "cd /home/alice").unwrap());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with("cd /home/alice\n"));
        assert!(contents.starts_with("export PATH=$PATH\n"));
    }
}

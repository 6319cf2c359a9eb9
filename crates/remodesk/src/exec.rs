//! Subprocess helpers.
//!
//! Every provisioning step is a shell-out to an external tool. Synchronous
//! steps run through [`run`]/[`run_env`] and propagate a non-zero exit as a
//! fatal [`ProvisionError::CommandFailed`] carrying the tool's stderr.
//! Background services (tunnel client, Xorg, noVNC) go through [`spawn`].
//!
//! Steps that must run under the unprivileged account use [`run_as_user`],
//! an explicit privilege-drop primitive (`runuser -u <user> --`) instead of
//! a generated script executed as that user.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::ProvisionError;

/// Run a command to completion, failing on non-zero exit.
pub async fn run(program: &str, args: &[&str]) -> Result<()> {
    run_env(program, args, &[]).await
}

/// Run a command with extra environment variables.
pub async fn run_env(program: &str, args: &[&str], env: &[(&str, &str)]) -> Result<()> {
    debug!("Running: {program} {args:?}");
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in env {
        command.env(key, value);
    }
    let output = command
        .output()
        .await
        .with_context(|| format!("running {program}"))?;
    check_status(program, args, &output)?;
    Ok(())
}

/// Run a command feeding `input` to its stdin (e.g. answering an
/// interactive confirmation prompt).
pub async fn run_with_stdin(program: &str, args: &[&str], input: &str) -> Result<()> {
    debug!("Running (with stdin): {program} {args:?}");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning {program}"))?;

    let mut stdin = child.stdin.take().context("child stdin unavailable")?;
    stdin
        .write_all(input.as_bytes())
        .await
        .context("writing child stdin")?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("waiting for {program}"))?;
    check_status(program, args, &output)?;
    Ok(())
}

/// Spawn a long-lived background process. The child keeps running when the
/// handle is dropped; callers that need liveness checks hold on to it.
pub fn spawn(program: &str, args: &[&str]) -> Result<Child> {
    debug!("Spawning: {program} {args:?}");
    Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("spawning {program}"))
}

/// Run a command as another OS user via `runuser`, optionally feeding stdin,
/// and return its stdout.
///
/// `runuser` resets the environment from the target account's passwd entry,
/// so overrides are passed through an explicit `env` prefix.
pub async fn run_as_user(
    username: &str,
    program: &str,
    args: &[&str],
    env: &[(&str, &str)],
    stdin: Option<&str>,
) -> Result<Vec<u8>> {
    let mut command = Command::new("runuser");
    command.args(["-u", username, "--"]);
    if !env.is_empty() {
        command.arg("env");
        for (key, value) in env {
            command.arg(format!("{key}={value}"));
        }
    }
    command.arg(program);
    command.args(args);
    command.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    debug!("Running as {username}: {program} {args:?}");
    let mut child = command
        .spawn()
        .with_context(|| format!("running {program} as {username}"))?;

    if let Some(input) = stdin {
        let mut pipe = child.stdin.take().context("child stdin unavailable")?;
        pipe.write_all(input.as_bytes())
            .await
            .context("writing child stdin")?;
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("waiting for {program}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProvisionError::CommandFailed {
            command: format!("{program} {args:?} (as {username})"),
            detail: format!("{} -- {}", output.status, stderr.trim()),
        }
        .into());
    }
    Ok(output.stdout)
}

/// Run apt-get non-interactively.
pub async fn apt_get(args: &[&str]) -> Result<()> {
    run_env("apt-get", args, &[("DEBIAN_FRONTEND", "noninteractive")]).await
}

fn check_status(
    program: &str,
    args: &[&str],
    output: &std::process::Output,
) -> Result<(), ProvisionError> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(ProvisionError::CommandFailed {
        command: format!("{program} {args:?}"),
        detail: format!("{} -- {}", output.status, stderr.trim()),
    })
}

//! Session configuration and preflight validation.
//!
//! All settings are collected once from the command line (or environment)
//! and validated before any step mutates the host. The resulting
//! [`SessionConfig`] is immutable and passed explicitly to every component.

use clap::Parser;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ProvisionError;

/// Command-line interface for a provisioning run.
#[derive(Debug, Parser)]
#[command(
    name = "remodesk",
    about = "Provision a remote-access desktop on an ephemeral cloud host"
)]
pub struct Cli {
    /// Tunnel routing region: a two-letter code such as "eu", "us" or "jp".
    #[arg(long, env = "REMODESK_REGION", default_value = "eu")]
    pub region: String,

    /// ngrok auth token, copied from https://dashboard.ngrok.com/auth.
    #[arg(long, env = "REMODESK_TOKEN")]
    pub token: String,

    /// Unprivileged account the desktop session runs under.
    #[arg(long, env = "REMODESK_USERNAME", default_value = "remodesk")]
    pub username: String,

    /// Extra apt package to install alongside the desktop (repeatable).
    #[arg(long = "install", value_name = "PACKAGE")]
    pub install: Vec<String>,

    /// GPU product name that must never be provisioned (repeatable).
    #[arg(long = "gpu-blacklist", value_name = "MODEL")]
    pub gpu_blacklist: Vec<String>,

    /// Shell command to run in the user's home once the desktop is up.
    /// Failures are logged but do not abort the run.
    #[arg(long, value_name = "SHELL")]
    pub command: Option<String>,
}

/// Validated, immutable configuration for one provisioning run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tunnel routing region, lowercased.
    pub region: String,
    /// ngrok auth token.
    pub token: String,
    /// Unprivileged account name.
    pub username: String,
    /// Extra apt packages requested by the user.
    pub install: Vec<String>,
    /// Accelerator models that veto provisioning.
    pub gpu_blacklist: Vec<String>,
    /// Optional best-effort post-setup command.
    pub post_command: Option<String>,
}

static REGION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z]{2}$").unwrap());
static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w{49}$").unwrap());

impl SessionConfig {
    /// Validate the raw CLI input and build the session configuration.
    ///
    /// Fails fast with a user-facing message; nothing has been mutated yet
    /// when either check rejects.
    pub fn from_cli(cli: Cli) -> Result<Self, ProvisionError> {
        if !REGION_RE.is_match(&cli.region) {
            return Err(ProvisionError::InvalidRegion(cli.region));
        }
        if !TOKEN_RE.is_match(&cli.token) {
            return Err(ProvisionError::InvalidToken);
        }

        Ok(Self {
            region: cli.region.to_ascii_lowercase(),
            token: cli.token,
            username: cli.username,
            install: cli.install,
            gpu_blacklist: cli.gpu_blacklist,
            post_command: cli.command,
        })
    }

    /// Home directory of the unprivileged account.
    pub fn home_dir(&self) -> String {
        format!("/home/{}", self.username)
    }
}

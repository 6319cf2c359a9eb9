//! Error taxonomy for a provisioning run.
//!
//! Almost every failure is fatal for the whole run: there is no retry and no
//! cleanup of partially applied steps. The only tolerated failures are GPU
//! detection (a missing diagnostic tool means "no GPU") and the user-supplied
//! post-setup command.

use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Rejected before any mutation: the tunnel region must be a two-letter
    /// alphabetic code.
    #[error(
        "invalid region code {0:?}: expected a two-letter code (e.g. \"eu\", \"us\", \"jp\")"
    )]
    InvalidRegion(String),

    /// Rejected before any mutation: ngrok auth tokens are 49 alphanumeric
    /// characters.
    #[error(
        "invalid tunnel auth token: expected 49 alphanumeric characters \
         (copy it from https://dashboard.ngrok.com/auth)"
    )]
    InvalidToken,

    /// Hard stop before any package is installed: the detected accelerator
    /// model is not supported.
    #[error("GPU type {0:?} is in the blacklist; refusing to provision")]
    BlacklistedGpu(String),

    #[error("failed to download {url}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("command {command} failed: {detail}")]
    CommandFailed { command: String, detail: String },

    /// The tunnel client died before its diagnostic API came up.
    #[error("tunnel client exited during startup ({0}); see the runtime log for details")]
    TunnelExited(ExitStatus),

    /// The diagnostic API answered but listed no usable tunnel.
    #[error("tunnel list did not contain an https-capable tunnel")]
    TunnelUrlMissing,
}

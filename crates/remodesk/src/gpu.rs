//! GPU detection and blacklist enforcement.
//!
//! Detection goes through `nvidia-smi`. A missing or failing tool is not an
//! error: some hosts simply have no accelerator (or no diagnostic tooling),
//! and provisioning proceeds without GPU acceleration. A detected model that
//! appears in the configured blacklist is a hard stop before any package is
//! installed.

use anyhow::Result;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::ProvisionError;

/// Query the attached accelerator's product name, if any.
pub async fn detect() -> Option<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if name.is_empty() {
                warn!("No GPU detected. Attempting anyways...");
                None
            } else {
                info!("Detected GPU: {name}");
                Some(name)
            }
        }
        _ => {
            warn!("No GPU detected. Attempting anyways...");
            None
        }
    }
}

/// Veto provisioning when the detected model is blacklisted.
pub fn enforce_blacklist(name: Option<&str>, blacklist: &[String]) -> Result<(), ProvisionError> {
    if let Some(name) = name
        && blacklist.iter().any(|entry| entry == name)
    {
        return Err(ProvisionError::BlacklistedGpu(name.to_string()));
    }
    Ok(())
}

/// Version of the loaded NVIDIA kernel module. Only meaningful (and only
/// called) after [`detect`] reported an accelerator; failure here is fatal.
pub async fn driver_version() -> Result<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=driver_version", "--format=csv,noheader"])
        .output()
        .await
        .map_err(|err| ProvisionError::CommandFailed {
            command: "nvidia-smi --query-gpu=driver_version".to_string(),
            detail: err.to_string(),
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProvisionError::CommandFailed {
            command: "nvidia-smi --query-gpu=driver_version".to_string(),
            detail: format!("{} -- {}", output.status, stderr.trim()),
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blacklist(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_gpu_passes_any_blacklist() {
        assert!(enforce_blacklist(None, &blacklist(&["Tesla K80"])).is_ok());
    }

    #[test]
    fn listed_model_is_a_hard_stop() {
        let err =
            enforce_blacklist(Some("Tesla K80"), &blacklist(&["Tesla K80"])).unwrap_err();
        assert!(matches!(err, ProvisionError::BlacklistedGpu(name) if name == "Tesla K80"));
    }

    #[test]
    fn unlisted_model_proceeds() {
        assert!(enforce_blacklist(Some("Tesla T4"), &blacklist(&["Tesla K80"])).is_ok());
    }

    #[test]
    fn empty_blacklist_never_vetoes() {
        assert!(enforce_blacklist(Some("Tesla K80"), &[]).is_ok());
    }

    #[test]
    fn match_is_exact_not_substring() {
        assert!(enforce_blacklist(Some("Tesla K80 24GB"), &blacklist(&["Tesla K80"])).is_ok());
    }
}

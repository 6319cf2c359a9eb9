//! HTTP download helper for fixed-version package archives.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::error::ProvisionError;

/// Stream `url` to `dest`. A failed request logs the URL and re-raises as a
/// fatal [`ProvisionError::Download`].
pub async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    info!("Downloading {url}");
    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|source| {
            error!("Failed to download {url}");
            ProvisionError::Download {
                url: url.to_string(),
                source,
            }
        })?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;
    loop {
        let chunk = response.chunk().await.map_err(|source| {
            error!("Failed to download {url}");
            ProvisionError::Download {
                url: url.to_string(),
                source,
            }
        })?;
        match chunk {
            Some(bytes) => file
                .write_all(&bytes)
                .await
                .with_context(|| format!("writing {}", dest.display()))?,
            None => break,
        }
    }
    file.flush()
        .await
        .with_context(|| format!("flushing {}", dest.display()))?;
    Ok(())
}

/// Mark a downloaded binary or installer executable.
pub fn mark_executable(path: &Path) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .with_context(|| format!("marking {} executable", path.display()))
}

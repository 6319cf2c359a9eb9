//! Tunnel management.
//!
//! Launches the ngrok client as a background process forwarding the local
//! noVNC port, waits for its local diagnostic API to come up (polling with a
//! deadline rather than sleeping a guessed duration), and extracts the
//! public https URL from the reported tunnel list.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Child;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::exec;

/// Local port the tunnel forwards: the noVNC web client.
pub const LOCAL_PORT: u16 = 6080;

/// ngrok's local diagnostic API.
const API_URL: &str = "http://127.0.0.1:4040/api/tunnels";

const READY_DEADLINE: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One entry of the diagnostic API's tunnel list.
#[derive(Debug, Deserialize)]
pub struct Tunnel {
    pub public_url: String,
    #[serde(default)]
    pub proto: String,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    tunnels: Vec<Tunnel>,
}

/// A running tunnel: the client process and its discovered public URL.
/// Never torn down explicitly; it lives until the hosting session dies.
pub struct TunnelHandle {
    pub public_url: String,
    #[allow(dead_code)]
    child: Child,
}

/// Launch the tunnel client and resolve its public URL.
pub async fn open(client: &reqwest::Client, region: &str) -> Result<TunnelHandle> {
    info!("Creating ngrok tunnel...");
    let port = LOCAL_PORT.to_string();
    let mut child = exec::spawn("./ngrok", &["http", "-region", region, &port])?;

    wait_ready(client, &mut child).await?;

    let list: TunnelList = client
        .get(API_URL)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .context("querying tunnel list")?
        .json()
        .await
        .context("decoding tunnel list")?;
    let public_url = select_public_url(&list.tunnels)?;
    info!("Tunnel ready at {public_url}");

    Ok(TunnelHandle { public_url, child })
}

/// Poll the diagnostic API until it answers, failing early if the client
/// process already exited.
async fn wait_ready(client: &reqwest::Client, child: &mut Child) -> Result<()> {
    let deadline = Instant::now() + READY_DEADLINE;
    loop {
        if let Some(status) = child.try_wait().context("checking tunnel client")? {
            return Err(ProvisionError::TunnelExited(status).into());
        }

        match client.get(API_URL).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("Tunnel API ready");
                return Ok(());
            }
            Ok(resp) => debug!("Tunnel API not ready: {}", resp.status()),
            Err(err) => debug!("Tunnel API not reachable yet: {err}"),
        }

        if Instant::now() >= deadline {
            anyhow::bail!(
                "tunnel client did not become ready within {}s",
                READY_DEADLINE.as_secs()
            );
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Pick the https-capable tunnel and normalize its scheme.
///
/// ngrok opens one tunnel per transport. Prefer the entry that declares
/// `proto: "https"`; older clients omit the field but list the http(s)
/// tunnel second, so fall back to that position.
pub fn select_public_url(tunnels: &[Tunnel]) -> Result<String, ProvisionError> {
    let chosen = tunnels
        .iter()
        .find(|t| t.proto == "https")
        .or_else(|| tunnels.get(1))
        .ok_or(ProvisionError::TunnelUrlMissing)?;
    Ok(secure_scheme(&chosen.public_url))
}

fn secure_scheme(url: &str) -> String {
    match url.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel(url: &str, proto: &str) -> Tunnel {
        Tunnel {
            public_url: url.to_string(),
            proto: proto.to_string(),
        }
    }

    #[test]
    fn prefers_https_proto_regardless_of_order() {
        let tunnels = [
            tunnel("https://abc.ngrok.io", "https"),
            tunnel("tcp://0.tcp.ngrok.io:1234", "tcp"),
        ];
        assert_eq!(select_public_url(&tunnels).unwrap(), "https://abc.ngrok.io");
    }

    #[test]
    fn falls_back_to_second_entry_without_proto() {
        let tunnels = [
            tunnel("tcp://0.tcp.ngrok.io:1234", ""),
            tunnel("http://abc.ngrok.io", ""),
        ];
        assert_eq!(select_public_url(&tunnels).unwrap(), "https://abc.ngrok.io");
    }

    #[test]
    fn rewrites_http_scheme_to_https() {
        let tunnels = [tunnel("http://abc.ngrok.io", "https")];
        assert_eq!(select_public_url(&tunnels).unwrap(), "https://abc.ngrok.io");
    }

    #[test]
    fn single_tunnel_without_proto_is_an_error() {
        let tunnels = [tunnel("tcp://0.tcp.ngrok.io:1234", "")];
        assert!(matches!(
            select_public_url(&tunnels),
            Err(ProvisionError::TunnelUrlMissing)
        ));
    }

    #[test]
    fn empty_list_is_an_error() {
        assert!(matches!(
            select_public_url(&[]),
            Err(ProvisionError::TunnelUrlMissing)
        ));
    }

    #[test]
    fn decodes_diagnostic_api_payload() {
        let payload = r#"{
            "tunnels": [
                {"name": "command_line (http)", "public_url": "http://abc.ngrok.io", "proto": "http"},
                {"name": "command_line", "public_url": "https://abc.ngrok.io", "proto": "https"}
            ],
            "uri": "/api/tunnels"
        }"#;
        let list: TunnelList = serde_json::from_str(payload).unwrap();
        assert_eq!(
            select_public_url(&list.tunnels).unwrap(),
            "https://abc.ngrok.io"
        );
    }
}

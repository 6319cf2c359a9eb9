//! Provisioning orchestration.
//!
//! The ordered sequence lives here behind a seam over the host-mutating
//! steps, so the ordering rules (blacklist veto before any installation,
//! session launch last, exactly one connection URL) are testable without a
//! root host, a tunnel account, or real package installs.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::SessionConfig;
use crate::{desktop, gpu, session, system, tunnel};

/// The host-mutating steps of a provisioning run, in invocation order.
/// [`Host`] is the only implementation outside of tests.
#[async_trait]
pub trait Provisioner {
    /// Query the attached accelerator's product name, if any.
    async fn detect_gpu(&mut self) -> Option<String>;
    /// Base system: packages, unminimize, account, tunnel client.
    async fn provision_system(&mut self, config: &SessionConfig) -> Result<()>;
    /// Bring up the tunnel and return its public URL.
    async fn open_tunnel(&mut self, region: &str) -> Result<String>;
    /// Start the web client the tunnel forwards to.
    async fn serve_web_client(&mut self) -> Result<()>;
    /// VNC stack, desktop environment, extras, GPU acceleration.
    async fn provision_desktop(&mut self, config: &SessionConfig) -> Result<()>;
    /// Start the desktop session and return the logged connection URL.
    async fn launch_session(
        &mut self,
        config: &SessionConfig,
        tunnel_url: &str,
    ) -> Result<String>;
}

/// Run the full sequence once and return the connection URL.
///
/// The blacklist veto fires before any step that installs packages; every
/// later failure aborts the run with no rollback.
pub async fn run(provisioner: &mut impl Provisioner, config: &SessionConfig) -> Result<String> {
    let gpu_name = provisioner.detect_gpu().await;
    gpu::enforce_blacklist(gpu_name.as_deref(), &config.gpu_blacklist)?;

    provisioner.provision_system(config).await?;
    let tunnel_url = provisioner.open_tunnel(&config.region).await?;
    provisioner.serve_web_client().await?;
    provisioner.provision_desktop(config).await?;
    provisioner.launch_session(config, &tunnel_url).await
}

/// Production implementation. Holds the background children (tunnel client,
/// web client) so they live as long as the hosting process.
pub struct Host {
    client: reqwest::Client,
    tunnel: Option<tunnel::TunnelHandle>,
    web_client: Option<tokio::process::Child>,
}

impl Host {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            tunnel: None,
            web_client: None,
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for Host {
    async fn detect_gpu(&mut self) -> Option<String> {
        gpu::detect().await
    }

    async fn provision_system(&mut self, config: &SessionConfig) -> Result<()> {
        system::provision(&self.client, config).await
    }

    async fn open_tunnel(&mut self, region: &str) -> Result<String> {
        let handle = tunnel::open(&self.client, region).await?;
        let url = handle.public_url.clone();
        self.tunnel = Some(handle);
        Ok(url)
    }

    async fn serve_web_client(&mut self) -> Result<()> {
        self.web_client = Some(desktop::serve_web_client().await?);
        Ok(())
    }

    async fn provision_desktop(&mut self, config: &SessionConfig) -> Result<()> {
        desktop::provision(&self.client, config).await
    }

    async fn launch_session(
        &mut self,
        config: &SessionConfig,
        tunnel_url: &str,
    ) -> Result<String> {
        session::launch(config, tunnel_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cli;
    use crate::error::ProvisionError;

    fn config(blacklist: &[&str]) -> SessionConfig {
        SessionConfig::from_cli(Cli {
            region: "us".to_string(),
            token: "a".repeat(49),
            username: "remodesk".to_string(),
            install: Vec::new(),
            gpu_blacklist: blacklist.iter().map(|s| s.to_string()).collect(),
            command: None,
        })
        .unwrap()
    }

    /// Records the step order and answers like a freshly provisioned host.
    struct FakeHost {
        gpu: Option<String>,
        password: String,
        calls: Vec<&'static str>,
    }

    impl FakeHost {
        fn new(gpu: Option<&str>) -> Self {
            Self {
                gpu: gpu.map(str::to_string),
                password: session::generate_password(),
                calls: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Provisioner for FakeHost {
        async fn detect_gpu(&mut self) -> Option<String> {
            self.calls.push("detect-gpu");
            self.gpu.clone()
        }

        async fn provision_system(&mut self, _config: &SessionConfig) -> Result<()> {
            self.calls.push("system");
            Ok(())
        }

        async fn open_tunnel(&mut self, region: &str) -> Result<String> {
            assert_eq!(region, "us");
            self.calls.push("tunnel");
            Ok("https://fake.ngrok.io".to_string())
        }

        async fn serve_web_client(&mut self) -> Result<()> {
            self.calls.push("web-client");
            Ok(())
        }

        async fn provision_desktop(&mut self, _config: &SessionConfig) -> Result<()> {
            self.calls.push("desktop");
            Ok(())
        }

        async fn launch_session(
            &mut self,
            _config: &SessionConfig,
            tunnel_url: &str,
        ) -> Result<String> {
            self.calls.push("session");
            Ok(session::connection_url(tunnel_url, &self.password))
        }
    }

    #[tokio::test]
    async fn full_run_without_gpu_completes_and_yields_one_url() {
        let config = config(&[]);
        let mut host = FakeHost::new(None);

        let url = run(&mut host, &config).await.unwrap();

        assert_eq!(
            host.calls,
            ["detect-gpu", "system", "tunnel", "web-client", "desktop", "session"]
        );
        assert!(url.starts_with("https://fake.ngrok.io/vnc.html?"));
        assert_eq!(url.matches("password=").count(), 1);
        assert!(url.ends_with(&format!("&password={}", host.password)));
        assert_eq!(host.password.len(), 8);
    }

    #[tokio::test]
    async fn blacklisted_gpu_stops_before_any_install_step() {
        let config = config(&["Tesla K80"]);
        let mut host = FakeHost::new(Some("Tesla K80"));

        let err = run(&mut host, &config).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::BlacklistedGpu(_))
        ));
        // The veto fires after detection, before anything mutates the host.
        assert_eq!(host.calls, ["detect-gpu"]);
    }

    #[tokio::test]
    async fn unlisted_gpu_does_not_stop_the_run() {
        let config = config(&["Tesla K80"]);
        let mut host = FakeHost::new(Some("Tesla T4"));

        run(&mut host, &config).await.unwrap();

        assert_eq!(host.calls.len(), 6);
    }
}

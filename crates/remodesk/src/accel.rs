//! GPU acceleration for the headless desktop.
//!
//! The accelerator's kernel module is already loaded by the host and cannot
//! be swapped, but the bundled user-space driver rarely matches it. This
//! module installs the user-space driver version-matched to the loaded
//! module, configures Xorg for headless virtual output on the accelerator's
//! bus address, and starts Xorg under a dedicated seat.

use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::{exec, fetch, gpu};

const DRIVER_INSTALLER: &str = "nvidia.run";
const XORG_CONF: &str = "/etc/X11/xorg.conf";
const VGL_CONFIG_TOOL: &str = "/opt/VirtualGL/bin/vglserver_config";

/// PCI bus address the virtual display binds to on the supported hosts.
const GPU_BUS_ID: &str = "PCI:0:4:0";

fn driver_url(version: &str) -> String {
    format!("https://us.download.nvidia.com/tesla/{version}/NVIDIA-Linux-x86_64-{version}.run")
}

/// Invocation path for the downloaded installer; derived from
/// [`DRIVER_INSTALLER`] so the download target and the command line cannot
/// drift apart.
fn installer_invocation() -> String {
    format!("./{DRIVER_INSTALLER}")
}

/// Install the version-matched user-space driver and start a headless Xorg
/// on the dedicated seat. Only called when an accelerator was detected.
pub async fn configure(client: &reqwest::Client) -> Result<()> {
    let version = gpu::driver_version().await?;
    info!("Installing NVIDIA user-space driver {version}");

    fetch::download(client, &driver_url(&version), Path::new(DRIVER_INSTALLER)).await?;
    fetch::mark_executable(Path::new(DRIVER_INSTALLER))?;
    // --no-kernel-module: the loaded module stays; only the user-space side
    // is overwritten to match it. The "1" answers the installer's prompt.
    exec::run_with_stdin(
        &installer_invocation(),
        &["--no-kernel-module", "--ui=none"],
        "1\n",
    )
    .await?;

    exec::run(
        "nvidia-xconfig",
        &[
            "-a",
            "--allow-empty-initial-configuration",
            "--virtual=1920x1200",
            "--busid",
            GPU_BUS_ID,
        ],
    )
    .await?;

    let conf = std::fs::read_to_string(XORG_CONF)
        .with_context(|| format!("reading {XORG_CONF}"))?;
    std::fs::write(XORG_CONF, bind_device_to_seat(&conf))
        .with_context(|| format!("writing {XORG_CONF}"))?;

    exec::run(VGL_CONFIG_TOOL, &["-config", "+s", "+f"]).await?;

    // Without an explicit seat Xorg tries to open /dev/tty0, which does not
    // exist on these hosts. Launch is fire-and-forget; it is not verified.
    exec::spawn(
        "Xorg",
        &[
            "-seat",
            "seat-1",
            "-allowMouseOpenFail",
            "-novtswitch",
            "-nolisten",
            "tcp",
        ],
    )?;

    Ok(())
}

/// Bind the first Device section of an xorg.conf to seat-1, so the headless
/// server can claim the GPU without a physical console.
pub fn bind_device_to_seat(conf: &str) -> String {
    static DEVICE_SECTION: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"(?s)(Section "Device".*?)(EndSection)"#).unwrap());
    DEVICE_SECTION
        .replace(conf, "${1}    MatchSeat      \"seat-1\"\n${2}")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"Section "ServerLayout"
    Identifier     "Layout0"
EndSection

Section "Device"
    Identifier     "Device0"
    Driver         "nvidia"
    BusID          "PCI:0:4:0"
EndSection

Section "Device"
    Identifier     "Device1"
    Driver         "nvidia"
EndSection
"#;

    #[test]
    fn patches_only_the_first_device_section() {
        let patched = bind_device_to_seat(SAMPLE);
        assert_eq!(patched.matches("MatchSeat").count(), 1);
        let device0 = patched.find("\"Device0\"").unwrap();
        let device1 = patched.find("\"Device1\"").unwrap();
        let seat = patched.find("MatchSeat").unwrap();
        assert!(device0 < seat && seat < device1);
    }

    #[test]
    fn keeps_the_section_well_formed() {
        let patched = bind_device_to_seat(SAMPLE);
        assert!(patched.contains("    MatchSeat      \"seat-1\"\nEndSection"));
    }

    #[test]
    fn leaves_conf_without_device_section_untouched() {
        let conf = "Section \"ServerLayout\"\nEndSection\n";
        assert_eq!(bind_device_to_seat(conf), conf);
    }

    #[test]
    fn installer_is_invoked_from_its_download_path() {
        assert_eq!(installer_invocation(), format!("./{DRIVER_INSTALLER}"));
        assert_eq!(installer_invocation(), "./nvidia.run");
    }

    #[test]
    fn driver_url_embeds_the_version_twice() {
        let url = driver_url("418.67");
        assert_eq!(
            url,
            "https://us.download.nvidia.com/tesla/418.67/NVIDIA-Linux-x86_64-418.67.run"
        );
    }
}

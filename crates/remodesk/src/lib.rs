//! Remote desktop provisioner for ephemeral cloud hosts.
//!
//! `remodesk` turns a root-privileged, short-lived Ubuntu host into a
//! remote-access graphical desktop: it upgrades the base system, creates an
//! unprivileged account, opens an ngrok tunnel in front of a noVNC web
//! client, installs a TurboVNC + VirtualGL + Xfce stack (with NVIDIA
//! acceleration when a GPU is attached) and logs a clickable connection URL.
//!
//! Provisioning is strictly sequential and runs exactly once per host; a
//! failed step aborts the run and leaves the host partially configured.
//! There is no rollback -- retry on a fresh host.

pub mod accel;
pub mod config;
pub mod desktop;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod gpu;
pub mod provision;
pub mod session;
pub mod system;
pub mod tunnel;

//! Starting a reaper when none is listening.
//!
//! The first session on a machine finds nothing at the reaper endpoint and
//! launches one. The reaper is detached from the test process so it outlives
//! it; later sessions, including those of the next test run, connect to the
//! same reaper.

use std::net::SocketAddr;
use std::process::Stdio;

use async_trait::async_trait;
use ephemera_common::{EphemeraError, EphemeraResult, Settings};
use tokio::process::Command;

/// Brings up a reaper listening on an address.
#[async_trait]
pub trait ReaperLauncher: Send + Sync + std::fmt::Debug {
    /// Launch a reaper on `addr`. Returning does not mean it accepts
    /// connections yet; the caller retries the handshake.
    async fn launch(&self, addr: SocketAddr, settings: &Settings) -> EphemeraResult<()>;
}

/// Launches the `ephemera-reaper` executable named by
/// [`Settings::reaper_binary`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    fn command(addr: SocketAddr, settings: &Settings) -> Command {
        let mut cmd = Command::new(&settings.reaper_binary);
        cmd.arg("--listen").arg(addr.to_string());
        if let Some(socket) = &settings.runtime_socket {
            cmd.arg("--socket").arg(socket);
        }
        if settings.verbose {
            cmd.arg("--debug");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        // Own process group: a Ctrl-C aimed at the test run must not reach it.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl ReaperLauncher for ProcessLauncher {
    async fn launch(&self, addr: SocketAddr, settings: &Settings) -> EphemeraResult<()> {
        let binary = settings.reaper_binary.display().to_string();
        let child = Self::command(addr, settings)
            .spawn()
            .map_err(|e| EphemeraError::Reaper {
                message: format!("cannot launch {binary}: {e}"),
            })?;
        tracing::info!(reaper = %addr, %binary, pid = ?child.id(), "Launched reaper");
        Ok(())
    }
}

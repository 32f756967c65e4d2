//! Egress process control
//!
//! The scheduler only sees [`EgressLauncher`]. [`OpenVpnLauncher`] runs the
//! client binary as a child process with the identity's config file and the
//! shared credentials file.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::registry::SECRETS_FILE;
use super::{IdentityError, IdentityResult};
use crate::models::Identity;

/// A running (or once running) egress process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressHandle {
    /// Config file the process was started with
    pub identity_name: String,
    /// OS process id, when known
    pub pid: Option<u32>,
}

#[async_trait]
pub trait EgressLauncher: Send + Sync {
    /// Start the egress for an identity
    async fn start(&self, identity: &Identity) -> IdentityResult<EgressHandle>;

    /// Stop an egress process; stopping one that already exited is not an error
    async fn stop(&self, handle: &EgressHandle) -> IdentityResult<()>;

    /// Whether the process behind the handle is still running
    async fn is_running(&self, handle: &EgressHandle) -> bool;
}

/// [`EgressLauncher`] spawning an OpenVPN-compatible client
pub struct OpenVpnLauncher {
    binary: String,
    config_dir: PathBuf,
    children: Mutex<HashMap<u32, Child>>,
}

impl OpenVpnLauncher {
    pub fn new(binary: impl Into<String>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config_dir: config_dir.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self, identity: &Identity) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--config")
            .arg(self.config_dir.join(&identity.name))
            .arg("--auth-user-pass")
            .arg(self.config_dir.join(SECRETS_FILE))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Signal a process this launcher did not spawn (e.g. left by a previous run)
    async fn kill_pid(pid: u32, probe_only: bool) -> bool {
        let mut command = Command::new("kill");
        if probe_only {
            command.arg("-0");
        }
        command
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl EgressLauncher for OpenVpnLauncher {
    async fn start(&self, identity: &Identity) -> IdentityResult<EgressHandle> {
        let child = self
            .command(identity)
            .spawn()
            .map_err(|e| IdentityError::launch(&identity.name, e))?;

        let pid = child.id();
        tracing::info!(identity = %identity.name, pid = ?pid, "Egress process started");

        if let Some(pid) = pid {
            self.children.lock().await.insert(pid, child);
        }

        Ok(EgressHandle {
            identity_name: identity.name.clone(),
            pid,
        })
    }

    async fn stop(&self, handle: &EgressHandle) -> IdentityResult<()> {
        let Some(pid) = handle.pid else {
            return Ok(());
        };

        let tracked = self.children.lock().await.remove(&pid);
        match tracked {
            Some(mut child) => {
                if let Err(e) = child.kill().await {
                    // Already exited
                    tracing::debug!(pid, error = %e, "Egress process kill failed");
                }
            }
            None => {
                if Self::kill_pid(pid, true).await && !Self::kill_pid(pid, false).await {
                    return Err(IdentityError::launch(
                        &handle.identity_name,
                        format!("could not stop process {pid}"),
                    ));
                }
            }
        }

        tracing::info!(identity = %handle.identity_name, pid, "Egress process stopped");
        Ok(())
    }

    async fn is_running(&self, handle: &EgressHandle) -> bool {
        let Some(pid) = handle.pid else {
            return false;
        };

        let mut children = self.children.lock().await;
        let state = children.get_mut(&pid).map(|child| child.try_wait());
        match state {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                tracing::warn!(pid, %status, "Egress process exited");
                children.remove(&pid);
                false
            }
            Some(Err(_)) => false,
            None => {
                drop(children);
                Self::kill_pid(pid, true).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_a_launch_error() {
        let launcher = OpenVpnLauncher::new("resenha-no-such-binary", "/nonexistent");
        let err = launcher
            .start(&Identity::new("es-01.ovpn", 1.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_handle_without_pid() {
        let launcher = OpenVpnLauncher::new("openvpn", "/etc/openvpn");
        let handle = EgressHandle {
            identity_name: "es-01.ovpn".to_string(),
            pid: None,
        };
        assert!(!launcher.is_running(&handle).await);
        assert!(launcher.stop(&handle).await.is_ok());
    }
}

//! Seams between the slot controller and the host: service restarts,
//! readiness probes and configuration validation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use xraymgr_core::config::SlotConfig;

use crate::cmd::{self, CmdError};

/// Restarts slot services and probes their data-plane port.
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Restart the service backing `slot`. Returns once the supervisor
    /// reports the restart finished.
    async fn restart(&self, slot: &SlotConfig) -> Result<(), CmdError>;

    /// Single readiness probe: does the slot accept connections right now?
    async fn is_healthy(&self, slot: &SlotConfig, timeout: Duration) -> bool;
}

/// Checks a configuration file with the proxy's own validator.
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    async fn validate(&self, config_path: &Path) -> Result<(), CmdError>;
}

/// systemd-managed slots, probed over loopback TCP.
#[derive(Debug, Clone)]
pub struct SystemdController {
    restart_timeout: Duration,
}

impl SystemdController {
    pub const fn new(restart_timeout: Duration) -> Self {
        Self { restart_timeout }
    }
}

#[async_trait]
impl ProcessController for SystemdController {
    async fn restart(&self, slot: &SlotConfig) -> Result<(), CmdError> {
        cmd::run_checked(
            &format!("Restarting {}", slot.unit),
            "systemctl",
            &["restart", slot.unit.as_str()],
            self.restart_timeout,
        )
        .await
        .map(|_| ())
    }

    async fn is_healthy(&self, slot: &SlotConfig, timeout: Duration) -> bool {
        probe_tcp(slot.data_port, timeout).await
    }
}

/// Attempt a TCP connect to `127.0.0.1:port` within `timeout`.
pub async fn probe_tcp(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_sees_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_tcp(port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn probe_fails_on_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe_tcp(port, Duration::from_millis(500)).await);
    }
}

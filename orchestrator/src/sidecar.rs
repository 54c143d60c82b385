//! Sidecar manager (C6): probes the browser-automation sidecar's local HTTP
//! endpoint, launching it if absent.
//!
//! Grounded on `task_manager.py`'s `_mcp_service_check` (via `MCPServiceManager`,
//! not itself part of the distilled corpus) and the teacher's pattern of probing a
//! TCP endpoint before trusting a remote service (`server/src/health_monitor.rs`).

use shared::config::SidecarConfig;
use shared::OrchestratorError;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{info, warn};

pub struct SidecarManager {
    config: SidecarConfig,
    client: reqwest::Client,
}

impl SidecarManager {
    pub fn new(config: SidecarConfig) -> Self {
        SidecarManager {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builds with static config"),
            config,
        }
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    /// The sidecar's working directory, where the cookie courier swaps files in
    /// and out around a run.
    pub fn home_dir(&self) -> std::path::PathBuf {
        self.config.home_dir.clone()
    }

    /// Opens a TCP connection to the configured host:port; if it accepts, probes
    /// the service endpoint with a minimal request and accepts a 200 as "alive".
    pub async fn is_running(&self) -> bool {
        if TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .is_err()
        {
            return false;
        }
        match self.client.get(format!("{}/health", self.base_url())).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Resolves the sidecar binary for `sys_type`, marks it executable, and spawns
    /// it detached with the sidecar's own home directory as its working directory.
    pub async fn start(&self, sys_type: &str, headless: bool) -> shared::Result<()> {
        let binary_name = self.config.binaries.get(sys_type).ok_or_else(|| {
            OrchestratorError::SidecarUnavailable(format!(
                "no sidecar binary registered for sys_type '{sys_type}'"
            ))
        })?;
        let binary_path = self.config.home_dir.join(binary_name);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(&binary_path) {
                let mut perms = meta.permissions();
                perms.set_mode(perms.mode() | 0o111);
                let _ = std::fs::set_permissions(&binary_path, perms);
            }
        }

        let mut cmd = tokio::process::Command::new(&binary_path);
        cmd.current_dir(&self.config.home_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if headless {
            cmd.arg("--headless");
        }
        cmd.spawn().map_err(|e| {
            OrchestratorError::SidecarUnavailable(format!(
                "failed to launch sidecar binary {}: {e}",
                binary_path.display()
            ))
        })?;

        info!(sys_type, binary = %binary_path.display(), "sidecar launched, waiting for readiness");
        let deadline = Duration::from_secs(self.config.ready_timeout_secs);
        let step = Duration::from_millis(200);
        let mut waited = Duration::ZERO;
        while waited < deadline {
            sleep(step).await;
            waited += step;
            if self.is_running().await {
                return Ok(());
            }
        }
        warn!(sys_type, "sidecar did not become ready within timeout");
        Err(OrchestratorError::SidecarUnavailable(
            "sidecar did not become ready within timeout".to_string(),
        )
        .into())
    }

    /// `start` only if not already `is_running`.
    pub async fn ensure_running(&self, sys_type: &str, headless: bool) -> shared::Result<()> {
        if self.is_running().await {
            return Ok(());
        }
        self.start(sys_type, headless).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn is_running_false_when_nothing_listening() {
        let config = SidecarConfig {
            host: "127.0.0.1".to_string(),
            port: 1, // privileged / almost never bound in test sandboxes
            ready_timeout_secs: 1,
            home_dir: std::path::PathBuf::from("."),
            binaries: Default::default(),
        };
        let manager = SidecarManager::new(config);
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn start_fails_fast_for_unknown_sys_type() {
        let config = SidecarConfig {
            host: "127.0.0.1".to_string(),
            port: 18061,
            ready_timeout_secs: 1,
            home_dir: std::path::PathBuf::from("."),
            binaries: Default::default(),
        };
        let manager = SidecarManager::new(config);
        let result = manager.start("unknown_os", true).await;
        assert!(result.is_err());
    }
}

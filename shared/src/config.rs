//! On-disk configuration for the orchestrator process.
//!
//! Grounded on the teacher's `AgentConfig`/`ServerConfig` (`shared::config`): a
//! `serde`-derived struct loaded from TOML with per-field `default = "..."`
//! functions from [`crate::defaults`], plus a `validate()` pass mirroring the
//! teacher's `AgentConfig::validate`/`ServerConfig::validate`.

use crate::defaults::*;
use crate::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration for the orchestrator binary. Loaded once at startup from
/// `<config_dir>/orchestrator.toml`; CLI flags may override individual fields
/// (see `orchestrator::main::CliArgs`), matching the teacher's agent `main.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root of the on-disk layout described in spec §6 ("On-disk layout").
    #[serde(default = "default_app_data_dir_path")]
    pub app_data_dir: PathBuf,

    /// Address the control-plane HTTP API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub license: LicenseConfig,

    #[serde(default)]
    pub sidecar: SidecarConfig,

    #[serde(default = "default_max_sleep_secs")]
    pub scheduler_max_sleep_secs: u64,

    #[serde(default = "default_graceful_shutdown_timeout_secs")]
    pub graceful_shutdown_timeout_secs: u64,

    #[serde(default = "default_remove_task_wait_secs")]
    pub remove_task_wait_secs: u64,

    #[serde(default = "default_loop_error_backoff_secs")]
    pub loop_error_backoff_secs: u64,

    #[serde(default = "default_max_logs_per_file")]
    pub max_logs_per_file: usize,
}

fn default_app_data_dir_path() -> PathBuf {
    PathBuf::from(default_app_data_dir())
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            app_data_dir: default_app_data_dir_path(),
            bind_addr: default_bind_addr(),
            license: LicenseConfig::default(),
            sidecar: SidecarConfig::default(),
            scheduler_max_sleep_secs: default_max_sleep_secs(),
            graceful_shutdown_timeout_secs: default_graceful_shutdown_timeout_secs(),
            remove_task_wait_secs: default_remove_task_wait_secs(),
            loop_error_backoff_secs: default_loop_error_backoff_secs(),
            max_logs_per_file: default_max_logs_per_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    /// The remote activation endpoint (spec §4.4 `activate`). Deliberately a
    /// configuration field, not a literal baked into the source: see DESIGN.md.
    #[serde(default = "default_license_verify_url")]
    pub verify_url: String,

    #[serde(default = "default_product_id")]
    pub product_id: u32,

    #[serde(default = "default_free_max_tasks")]
    pub free_max_tasks: u32,

    #[serde(default = "default_free_interval_limit")]
    pub free_interval_limit_secs: u32,

    #[serde(default = "default_interval_floor")]
    pub interval_floor_secs: u32,

    #[serde(default = "default_interval_ceiling")]
    pub interval_ceiling_secs: u32,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        LicenseConfig {
            verify_url: default_license_verify_url(),
            product_id: default_product_id(),
            free_max_tasks: default_free_max_tasks(),
            free_interval_limit_secs: default_free_interval_limit(),
            interval_floor_secs: default_interval_floor(),
            interval_ceiling_secs: default_interval_ceiling(),
        }
    }
}

/// `(os, arch, sys_type) -> binary_name` lookup table for the sidecar manager (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarConfig {
    #[serde(default = "default_sidecar_host")]
    pub host: String,

    #[serde(default = "default_sidecar_port")]
    pub port: u16,

    #[serde(default = "default_sidecar_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Directory the sidecar binaries live in, and the directory it is launched
    /// with as its working directory (so it finds its sibling asset files).
    #[serde(default = "default_sidecar_home")]
    pub home_dir: PathBuf,

    /// `sys_type` string (e.g. `"mac_intel"`, `"mac_arm"`, `"windows"`, `"linux"`) ->
    /// binary file name, relative to `home_dir`.
    #[serde(default)]
    pub binaries: std::collections::HashMap<String, String>,
}

fn default_sidecar_host() -> String {
    "127.0.0.1".to_string()
}

fn default_sidecar_port() -> u16 {
    18060
}

fn default_sidecar_home() -> PathBuf {
    PathBuf::from("./sidecar")
}

impl Default for SidecarConfig {
    fn default() -> Self {
        SidecarConfig {
            host: default_sidecar_host(),
            port: default_sidecar_port(),
            ready_timeout_secs: default_sidecar_ready_timeout_secs(),
            home_dir: default_sidecar_home(),
            binaries: std::collections::HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load from a TOML file, falling back to defaults for any unset field.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestratorError::Storage(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| OrchestratorError::Validation(format!("invalid config TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.license.interval_floor_secs >= self.license.interval_ceiling_secs {
            return Err(OrchestratorError::Validation(
                "license.interval_floor_secs must be < license.interval_ceiling_secs".to_string(),
            )
            .into());
        }
        if self.scheduler_max_sleep_secs == 0 {
            return Err(OrchestratorError::Validation(
                "scheduler_max_sleep_secs must be > 0".to_string(),
            )
            .into());
        }
        Ok(())
    }

    pub fn dispatcher_store_path(&self) -> PathBuf {
        self.app_data_dir.join("dispatcher").join("dispatch_config.json")
    }

    pub fn task_switch_dir(&self, task_id: &str) -> PathBuf {
        self.app_data_dir
            .join("tasks")
            .join(format!("{task_id}_task_switch"))
    }

    pub fn account_data_dir(&self, account_id: &str) -> PathBuf {
        self.app_data_dir.join("task_data").join(account_id)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.app_data_dir.join("logs")
    }

    pub fn context_store_path(&self, task_id: &str) -> PathBuf {
        self.app_data_dir
            .join("task_context")
            .join(format!("mate_{task_id}.json"))
    }

    pub fn license_config_path(&self) -> PathBuf {
        self.app_data_dir.join("license_config.encrypted")
    }

    pub fn license_key_path(&self) -> PathBuf {
        self.app_data_dir.join("license.key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_interval_bounds() {
        let mut cfg = AppConfig::default();
        cfg.license.interval_floor_secs = 5000;
        cfg.license.interval_ceiling_secs = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn layout_paths_are_rooted_at_app_data_dir() {
        let mut cfg = AppConfig::default();
        cfg.app_data_dir = PathBuf::from("/tmp/xhs-data");
        assert_eq!(
            cfg.dispatcher_store_path(),
            PathBuf::from("/tmp/xhs-data/dispatcher/dispatch_config.json")
        );
        assert_eq!(
            cfg.task_switch_dir("abc"),
            PathBuf::from("/tmp/xhs-data/tasks/abc_task_switch")
        );
    }
}

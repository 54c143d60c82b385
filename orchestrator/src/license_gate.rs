//! License gate (C4): activation over HTTP, encrypted local storage, and the
//! concurrency/cadence limits the control-plane API enforces before creating or
//! running tasks.
//!
//! Grounded on `backend/app/core/license_manager.py`'s `LicenseManager`. The
//! verify endpoint is a configuration value (`shared::config::LicenseConfig::verify_url`),
//! not a literal baked into source, so deployments can point at their own license
//! service; see DESIGN.md.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::config::LicenseConfig;
use shared::license::{self, LicenseDocument, LicenseDocumentConfig};
use shared::OrchestratorError;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Debug, Serialize)]
struct ActivateRequest<'a> {
    product_id: u32,
    license_code: &'a str,
}

#[derive(Debug, Deserialize)]
struct ActivateResponse {
    success: bool,
    config: Option<serde_json::Value>,
    error: Option<String>,
}

pub struct LicenseGate {
    config: LicenseConfig,
    config_path: PathBuf,
    key_path: PathBuf,
    client: reqwest::Client,
    document: RwLock<Option<LicenseDocument>>,
}

impl LicenseGate {
    pub fn new(config: LicenseConfig, config_path: PathBuf, key_path: PathBuf) -> Self {
        let document = try_load(&key_path, &config_path);
        LicenseGate {
            config,
            config_path,
            key_path,
            client: reqwest::Client::new(),
            document: RwLock::new(document),
        }
    }

    pub async fn activate(&self, license_code: &str) -> shared::Result<LicenseDocumentConfig> {
        let response = self
            .client
            .post(&self.config.verify_url)
            .json(&ActivateRequest {
                product_id: self.config.product_id,
                license_code,
            })
            .send()
            .await
            .map_err(|e| {
                OrchestratorError::Validation(format!("license service unavailable: {e}"))
            })?;

        let body: ActivateResponse = response.json().await.map_err(|e| {
            OrchestratorError::Validation(format!("license service unavailable: {e}"))
        })?;

        if !body.success {
            return Err(OrchestratorError::Validation(
                body.error.unwrap_or_else(|| "invalid_license".to_string()),
            )
            .into());
        }
        let raw_config = body
            .config
            .ok_or_else(|| OrchestratorError::Validation("invalid_license".to_string()))?;
        let config: LicenseDocumentConfig = serde_json::from_value(raw_config)?;

        let doc = LicenseDocument {
            product_id: self.config.product_id,
            license_code: license_code.to_string(),
            activated_at: Utc::now(),
            config,
        };
        self.save(&doc)?;
        let result = doc.config.clone();
        *self.document.write().await = Some(doc);
        Ok(result)
    }

    fn save(&self, doc: &LicenseDocument) -> shared::Result<()> {
        let key = license::load_or_create_key(&self.key_path)?;
        license::save_encrypted(doc, &key, &self.config_path)
    }

    pub async fn is_activated(&self) -> bool {
        self.document.read().await.is_some()
    }

    pub async fn is_expired(&self) -> bool {
        match self.document.read().await.as_ref() {
            Some(doc) => doc.is_expired(Utc::now()),
            None => false,
        }
    }

    pub async fn get_max_tasks(&self) -> u32 {
        if self.is_activated().await && !self.is_expired().await {
            self.document
                .read()
                .await
                .as_ref()
                .and_then(|d| d.config.task_num)
                .unwrap_or(0)
        } else {
            self.config.free_max_tasks
        }
    }

    /// `Some(limit)` in free/expired mode, `None` when activated and current.
    pub async fn get_interval_limit(&self) -> Option<u32> {
        if !self.is_activated().await || self.is_expired().await {
            Some(self.config.free_interval_limit_secs)
        } else {
            None
        }
    }

    pub async fn can_execute_immediately(&self) -> bool {
        self.is_activated().await && !self.is_expired().await
    }

    pub fn interval_bounds(&self) -> (u32, u32) {
        (self.config.interval_floor_secs, self.config.interval_ceiling_secs)
    }
}

fn try_load(key_path: &std::path::Path, config_path: &std::path::Path) -> Option<LicenseDocument> {
    if !config_path.exists() {
        return None;
    }
    let key = license::load_or_create_key(key_path).ok()?;
    license::load_encrypted(&key, config_path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gate(dir: &TempDir) -> LicenseGate {
        LicenseGate::new(
            LicenseConfig::default(),
            dir.path().join("license_config.encrypted"),
            dir.path().join("license.key"),
        )
    }

    #[tokio::test]
    async fn free_mode_defaults() {
        let dir = TempDir::new().unwrap();
        let gate = gate(&dir);
        assert!(!gate.is_activated().await);
        assert_eq!(gate.get_max_tasks().await, 1);
        assert_eq!(gate.get_interval_limit().await, Some(7200));
        assert!(!gate.can_execute_immediately().await);
    }

    #[tokio::test]
    async fn activation_persists_across_reconstruction() {
        let dir = TempDir::new().unwrap();
        let doc = LicenseDocument {
            product_id: 1,
            license_code: "X".to_string(),
            activated_at: Utc::now(),
            config: LicenseDocumentConfig {
                task_num: Some(5),
                end_time: Some(Utc::now() + chrono::Duration::days(30)),
                interval_limit: None,
                extra: Default::default(),
            },
        };
        let gate = gate(&dir);
        gate.save(&doc).unwrap();

        let reloaded = gate(&dir);
        assert!(reloaded.is_activated().await);
        assert_eq!(reloaded.get_max_tasks().await, 5);
        assert!(reloaded.can_execute_immediately().await);
    }
}
